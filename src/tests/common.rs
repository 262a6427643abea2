use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use sha2::{Digest, Sha256};

use crate::semantic::embeddings::{model_id_hash, EmbeddingError, EmbeddingProvider};

/// Deterministic stand-in for the CLIP encoders.
///
/// Vectors are derived from a hash of the input, so identical bytes give
/// identical vectors and every component is positive. Delays simulate slow
/// inference.
#[derive(Default)]
pub struct FakeEmbedder {
    image_delay: Duration,
    text_delay: Duration,
    image_calls: AtomicUsize,
}

impl FakeEmbedder {
    pub fn slow_images(mut self, delay: Duration) -> Self {
        self.image_delay = delay;
        self
    }

    pub fn slow_text(mut self, delay: Duration) -> Self {
        self.text_delay = delay;
        self
    }

    pub fn image_calls(&self) -> usize {
        self.image_calls.load(Ordering::SeqCst)
    }
}

impl EmbeddingProvider for FakeEmbedder {
    fn model_id(&self) -> [u8; 32] {
        model_id_hash("fake-encoder")
    }

    fn embed_image(&self, bytes: &[u8]) -> Result<Vec<f32>, EmbeddingError> {
        std::thread::sleep(self.image_delay);
        self.image_calls.fetch_add(1, Ordering::SeqCst);
        Ok(fake_vector(bytes))
    }

    fn embed_text(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        std::thread::sleep(self.text_delay);
        Ok(fake_vector(text.as_bytes()))
    }
}

pub fn fake_vector(bytes: &[u8]) -> Vec<f32> {
    Sha256::digest(bytes)
        .iter()
        .take(8)
        .map(|b| *b as f32 + 1.0)
        .collect()
}

/// Write a small PNG at `root/rel`; distinct seeds give distinct files.
pub fn write_png(root: &Path, rel: &str, seed: u8) {
    let path = root.join(rel);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    image::RgbImage::from_pixel(4, 4, image::Rgb([seed, 255 - seed, seed / 2]))
        .save(&path)
        .unwrap();
}

/// `count` PNGs named `img_00.png`, `img_01.png`, ...
pub fn write_pngs(root: &Path, count: u8) {
    for i in 0..count {
        write_png(root, &format!("img_{i:02}.png"), i);
    }
}
