use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context};
use homedir::my_home;
use serde::{Deserialize, Serialize};

use crate::semantic::controller::{ControllerSettings, DEFAULT_DEBOUNCE, DEFAULT_SEARCH_TIMEOUT};
use crate::semantic::embeddings::DEFAULT_MODEL;
use crate::semantic::pipeline::DEFAULT_BATCH_SIZE;
use crate::semantic::{DEFAULT_THRESHOLD, DEFAULT_TOP_K};

pub const CONFIG_FILE: &str = "config.yaml";
const MODELS_DIR: &str = "models";

/// Index and search tuning
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IndexConfig {
    /// Minimum cosine similarity for a hit [-1.0, 1.0]
    #[serde(default = "default_threshold")]
    pub similarity_threshold: f32,

    /// Hits returned per search
    #[serde(default = "default_top_k")]
    pub top_k: usize,

    /// Vectors extracted between two index writes
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Quiet period before filesystem changes trigger a build
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,

    #[serde(default = "default_search_timeout_secs")]
    pub search_timeout_secs: u64,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: DEFAULT_THRESHOLD,
            top_k: DEFAULT_TOP_K,
            batch_size: DEFAULT_BATCH_SIZE,
            debounce_ms: default_debounce_ms(),
            search_timeout_secs: default_search_timeout_secs(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Image/text model pair (e.g., "clip-vit-b-32")
    #[serde(default = "default_model")]
    pub name: String,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            name: default_model(),
        }
    }
}

fn default_threshold() -> f32 {
    DEFAULT_THRESHOLD
}

fn default_top_k() -> usize {
    DEFAULT_TOP_K
}

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

fn default_debounce_ms() -> u64 {
    DEFAULT_DEBOUNCE.as_millis() as u64
}

fn default_search_timeout_secs() -> u64 {
    DEFAULT_SEARCH_TIMEOUT.as_secs()
}

fn default_model() -> String {
    DEFAULT_MODEL.to_string()
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Directory to index when `--root` is not given
    #[serde(default)]
    pub root_dir: Option<PathBuf>,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub model: ModelConfig,

    #[serde(skip_serializing, skip_deserializing)]
    base_path: PathBuf,
}

impl Config {
    fn validate(&self) -> anyhow::Result<()> {
        let index = &self.index;
        if !(-1.0..=1.0).contains(&index.similarity_threshold) {
            bail!(
                "index.similarity_threshold must be between -1.0 and 1.0, got {}",
                index.similarity_threshold
            );
        }
        if index.top_k == 0 {
            bail!("index.top_k must be greater than 0");
        }
        if index.batch_size == 0 {
            bail!("index.batch_size must be greater than 0");
        }
        if index.debounce_ms == 0 {
            bail!("index.debounce_ms must be greater than 0");
        }
        if index.search_timeout_secs == 0 {
            bail!("index.search_timeout_secs must be greater than 0");
        }
        if self.model.name.trim().is_empty() {
            bail!("model.name must not be empty");
        }
        Ok(())
    }

    /// Load `config.yaml` from `base_path`, writing defaults if it is missing.
    pub fn load_with(base_path: &Path) -> anyhow::Result<Self> {
        std::fs::create_dir_all(base_path)
            .with_context(|| format!("failed to create {}", base_path.display()))?;
        let path = base_path.join(CONFIG_FILE);

        // create new if does not exist
        if !path.exists() {
            let defaults = serde_yml::to_string(&Self::default())?;
            std::fs::write(&path, defaults)
                .with_context(|| format!("failed to write {}", path.display()))?;
        }

        let config_str = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let mut config: Self = serde_yml::from_str(&config_str)
            .with_context(|| format!("{} is malformed", path.display()))?;

        config.base_path = base_path.to_path_buf();
        config.validate()?;

        // resave in case config version needs an upgrade
        if config_str != serde_yml::to_string(&config)? {
            config.save()?;
        }

        Ok(config)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let path = self.base_path.join(CONFIG_FILE);
        let config_str = serde_yml::to_string(&self)?;
        std::fs::write(&path, config_str)
            .with_context(|| format!("failed to write {}", path.display()))
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Where downloaded models are cached
    pub fn models_dir(&self) -> PathBuf {
        self.base_path.join(MODELS_DIR)
    }

    pub fn controller_settings(&self) -> ControllerSettings {
        ControllerSettings {
            batch_size: self.index.batch_size,
            debounce: Duration::from_millis(self.index.debounce_ms),
            search_timeout: Duration::from_secs(self.index.search_timeout_secs),
            threshold: self.index.similarity_threshold,
        }
    }
}

/// `IMGDEX_BASE_PATH`, or `~/.local/share/imgdex`.
pub fn base_path() -> anyhow::Result<PathBuf> {
    if let Ok(path) = std::env::var("IMGDEX_BASE_PATH") {
        return Ok(PathBuf::from(path));
    }
    let home = my_home()
        .context("could not determine home directory")?
        .context("home directory path is empty")?;
    Ok(home.join(".local/share/imgdex"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_creates_default_config() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_with(dir.path()).unwrap();

        assert!(dir.path().join(CONFIG_FILE).exists());
        assert_eq!(config.index, IndexConfig::default());
        assert_eq!(config.model.name, DEFAULT_MODEL);
        assert_eq!(config.root_dir, None);
        assert_eq!(config.models_dir(), dir.path().join("models"));
    }

    #[test]
    fn test_missing_fields_are_filled_and_resaved() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(CONFIG_FILE),
            "root_dir: /pics\nindex:\n  top_k: 5\n",
        )
        .unwrap();

        let config = Config::load_with(dir.path()).unwrap();
        assert_eq!(config.root_dir, Some(PathBuf::from("/pics")));
        assert_eq!(config.index.top_k, 5);
        assert_eq!(config.index.batch_size, DEFAULT_BATCH_SIZE);

        let saved = std::fs::read_to_string(dir.path().join(CONFIG_FILE)).unwrap();
        assert!(saved.contains("debounce_ms"));
    }

    #[test]
    fn test_invalid_values_rejected() {
        let dir = tempfile::tempdir().unwrap();
        for bad in [
            "index:\n  similarity_threshold: 1.5\n",
            "index:\n  top_k: 0\n",
            "index:\n  batch_size: 0\n",
            "index:\n  search_timeout_secs: 0\n",
            "model:\n  name: ''\n",
        ] {
            std::fs::write(dir.path().join(CONFIG_FILE), bad).unwrap();
            assert!(Config::load_with(dir.path()).is_err(), "accepted: {bad}");
        }
    }

    #[test]
    fn test_malformed_yaml_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE), "index: [not, a, map").unwrap();
        assert!(Config::load_with(dir.path()).is_err());
    }

    #[test]
    fn test_controller_settings() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_with(dir.path()).unwrap();
        let settings = config.controller_settings();

        assert_eq!(settings.debounce, DEFAULT_DEBOUNCE);
        assert_eq!(settings.search_timeout, DEFAULT_SEARCH_TIMEOUT);
        assert_eq!(settings.threshold, DEFAULT_THRESHOLD);
    }
}
