//! Image and text encoders.
//!
//! The index only needs two functions: image bytes to vector and text to
//! vector, both landing in the same space. [`EmbeddingProvider`] is that
//! seam; [`ClipEmbedder`] implements it with fastembed's CLIP models:
//! - Lazy model loading on first use (image and text encoders separately)
//! - Models cached under a configurable directory

use std::path::PathBuf;
use std::sync::Mutex;

use fastembed::{ImageEmbedding, ImageInitOptions, InitOptions, TextEmbedding};
use sha2::{Digest, Sha256};

/// Default model pair (CLIP ViT-B/32 image + text towers)
pub const DEFAULT_MODEL: &str = "clip-vit-b-32";

/// Error type for embedding operations
#[derive(Debug, thiserror::Error)]
pub enum EmbeddingError {
    #[error("Model initialization failed: {0}")]
    InitFailed(String),

    #[error("Embedding generation failed: {0}")]
    EmbeddingFailed(String),

    #[error("Invalid model name: {0}")]
    InvalidModel(String),
}

/// Produces vectors in a shared image/text space.
pub trait EmbeddingProvider: Send + Sync {
    /// Stable identity of the image encoder; persisted with the vectors.
    fn model_id(&self) -> [u8; 32];

    /// Embed one encoded image (PNG, JPEG, ...).
    fn embed_image(&self, bytes: &[u8]) -> Result<Vec<f32>, EmbeddingError>;

    /// Embed a text query.
    fn embed_text(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;
}

/// SHA256 of a model name, used to tag persisted vectors.
pub fn model_id_hash(model_name: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(model_name.as_bytes());
    hasher.finalize().into()
}

/// fastembed-backed CLIP encoders.
///
/// Uses Mutexes because fastembed's embed methods require &mut self; each
/// holds `None` until the first call that needs it.
pub struct ClipEmbedder {
    model_name: String,
    image_model: fastembed::ImageEmbeddingModel,
    text_model: fastembed::EmbeddingModel,
    cache_dir: PathBuf,
    image: Mutex<Option<ImageEmbedding>>,
    text: Mutex<Option<TextEmbedding>>,
}

impl ClipEmbedder {
    /// Create an embedder for `model_name`. Nothing is loaded yet.
    ///
    /// # Arguments
    /// * `model_name` - Name of the model pair (e.g., "clip-vit-b-32")
    /// * `cache_dir` - Directory to cache downloaded models
    pub fn new(model_name: &str, cache_dir: PathBuf) -> Result<Self, EmbeddingError> {
        let (image_model, text_model) = Self::parse_model_name(model_name)?;

        Ok(Self {
            model_name: model_name.to_lowercase(),
            image_model,
            text_model,
            cache_dir,
            image: Mutex::new(None),
            text: Mutex::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.model_name
    }

    fn models_dir(&self) -> Result<PathBuf, EmbeddingError> {
        std::fs::create_dir_all(&self.cache_dir).map_err(|e| {
            EmbeddingError::InitFailed(format!("Failed to create models directory: {}", e))
        })?;
        Ok(self.cache_dir.clone())
    }

    fn load_image_model(&self) -> Result<ImageEmbedding, EmbeddingError> {
        log::info!("loading image encoder '{}'", self.model_name);
        let options = ImageInitOptions::new(self.image_model.clone())
            .with_cache_dir(self.models_dir()?)
            .with_show_download_progress(true);

        ImageEmbedding::try_new(options).map_err(|e| EmbeddingError::InitFailed(e.to_string()))
    }

    fn load_text_model(&self) -> Result<TextEmbedding, EmbeddingError> {
        log::info!("loading text encoder '{}'", self.model_name);
        let options = InitOptions::new(self.text_model.clone())
            .with_cache_dir(self.models_dir()?)
            .with_show_download_progress(true);

        TextEmbedding::try_new(options).map_err(|e| EmbeddingError::InitFailed(e.to_string()))
    }

    /// Parse model name string to the fastembed image/text pair.
    fn parse_model_name(
        name: &str,
    ) -> Result<(fastembed::ImageEmbeddingModel, fastembed::EmbeddingModel), EmbeddingError> {
        match name.to_lowercase().as_str() {
            "clip-vit-b-32" | "clipvitb32" => Ok((
                fastembed::ImageEmbeddingModel::ClipVitB32,
                fastembed::EmbeddingModel::ClipVitB32,
            )),
            "nomic-embed-v1.5" | "nomicembedv15" => Ok((
                fastembed::ImageEmbeddingModel::NomicEmbedVisionV15,
                fastembed::EmbeddingModel::NomicEmbedTextV15,
            )),
            _ => Err(EmbeddingError::InvalidModel(format!(
                "Unknown model: {}. Supported models: clip-vit-b-32, nomic-embed-v1.5",
                name
            ))),
        }
    }
}

impl EmbeddingProvider for ClipEmbedder {
    fn model_id(&self) -> [u8; 32] {
        model_id_hash(&self.model_name)
    }

    fn embed_image(&self, bytes: &[u8]) -> Result<Vec<f32>, EmbeddingError> {
        let mut guard = self.image.lock().map_err(|e| {
            EmbeddingError::EmbeddingFailed(format!("Failed to acquire model lock: {}", e))
        })?;

        if guard.is_none() {
            *guard = Some(self.load_image_model()?);
        }
        let model = guard
            .as_mut()
            .ok_or_else(|| EmbeddingError::InitFailed("image encoder unavailable".to_string()))?;

        model
            .embed_bytes(&[bytes], None)
            .map_err(|e| EmbeddingError::EmbeddingFailed(e.to_string()))?
            .into_iter()
            .next()
            .ok_or_else(|| EmbeddingError::EmbeddingFailed("No embedding returned".to_string()))
    }

    fn embed_text(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let mut guard = self.text.lock().map_err(|e| {
            EmbeddingError::EmbeddingFailed(format!("Failed to acquire model lock: {}", e))
        })?;

        if guard.is_none() {
            *guard = Some(self.load_text_model()?);
        }
        let model = guard
            .as_mut()
            .ok_or_else(|| EmbeddingError::InitFailed("text encoder unavailable".to_string()))?;

        model
            .embed(vec![text], None)
            .map_err(|e| EmbeddingError::EmbeddingFailed(e.to_string()))?
            .into_iter()
            .next()
            .ok_or_else(|| EmbeddingError::EmbeddingFailed("No embedding returned".to_string()))
    }
}
