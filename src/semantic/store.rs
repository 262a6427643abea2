//! The loaded index for one root, bound to its storage location.
//!
//! Readers work on an `Arc` snapshot of the current index. Appends build the
//! next index off to the side, persist it, and only then publish it, so a
//! search never sees a half-applied batch and a failed write never changes
//! what is in memory.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use crate::semantic::index::{IndexError, SearchHit, VectorIndex};
use crate::semantic::location::IndexLocation;
use crate::semantic::storage::{VectorStorage, VectorStorageError};

/// Errors that can occur during store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Index directory {} is not writable: {source}", .path.display())]
    StorageUnavailable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Persisted index is corrupt: {0}")]
    CorruptIndex(String),

    #[error("Failed to persist index: {0}")]
    Persist(#[source] VectorStorageError),

    #[error("Failed to read index: {0}")]
    Storage(#[source] VectorStorageError),

    #[error("Index error: {0}")]
    Index(#[from] IndexError),
}

/// Result of [`IndexStore::load`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadState {
    /// Both artifacts were read; carries the entry count.
    Loaded(usize),
    /// Nothing persisted for this location yet.
    NotFound,
}

pub struct IndexStore {
    location: IndexLocation,
    storage: VectorStorage,
    model_id: [u8; 32],
    current: RwLock<Arc<VectorIndex>>,
    /// Serializes writers; readers never take it.
    write_lock: Mutex<()>,
}

impl IndexStore {
    /// Bind an empty store to `location`.
    ///
    /// `model_id` tags persisted vectors so an index built by a different
    /// image model is rejected on load.
    pub fn open(location: IndexLocation, model_id: [u8; 32]) -> Self {
        let storage = VectorStorage::new(location.dir());
        Self {
            location,
            storage,
            model_id,
            current: RwLock::new(Arc::new(VectorIndex::default())),
            write_lock: Mutex::new(()),
        }
    }

    pub fn location(&self) -> &IndexLocation {
        &self.location
    }

    /// True if any persisted artifact exists for this location.
    pub fn has_persisted(&self) -> bool {
        self.storage.exists()
    }

    /// Current immutable view of the index.
    pub fn snapshot(&self) -> Arc<VectorIndex> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }

    pub fn dimensions(&self) -> usize {
        self.snapshot().dimensions()
    }

    /// All identifiers currently indexed.
    pub fn identifiers(&self) -> HashSet<String> {
        self.snapshot().ids().iter().cloned().collect()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.snapshot().contains(id)
    }

    /// Replace the in-memory index with the persisted one.
    ///
    /// Inconsistent artifacts are reported as [`StoreError::CorruptIndex`];
    /// nothing is repaired here, the caller decides to [`reset`](Self::reset)
    /// and rebuild.
    pub fn load(&self) -> Result<LoadState, StoreError> {
        let _writer = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);

        let loaded = self.storage.load(&self.model_id).map_err(|e| {
            if e.is_corruption() {
                StoreError::CorruptIndex(e.to_string())
            } else {
                StoreError::Storage(e)
            }
        })?;

        match loaded {
            Some(index) => {
                let count = index.len();
                self.publish(index);
                log::info!(
                    "loaded {count} vectors from {}",
                    self.location.dir().display()
                );
                Ok(LoadState::Loaded(count))
            }
            None => Ok(LoadState::NotFound),
        }
    }

    /// Delete persisted artifacts and empty the in-memory index.
    pub fn reset(&self) -> Result<(), StoreError> {
        let _writer = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);

        self.storage.delete().map_err(StoreError::Persist)?;
        self.publish(VectorIndex::default());
        Ok(())
    }

    /// Append a batch and persist the combined index.
    ///
    /// All-or-nothing: validation, normalisation and the disk write happen
    /// on a copy, which is published only after both artifacts are written.
    /// Duplicate identifiers are skipped.
    ///
    /// Returns the number of entries actually added.
    pub fn append(&self, vectors: Vec<Vec<f32>>, ids: Vec<String>) -> Result<usize, StoreError> {
        if vectors.len() != ids.len() {
            return Err(IndexError::LengthMismatch {
                vectors: vectors.len(),
                ids: ids.len(),
            }
            .into());
        }

        let _writer = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);

        let mut next = VectorIndex::clone(&self.snapshot());
        let added = next.extend(ids.into_iter().zip(vectors).collect())?;
        if added == 0 {
            return Ok(0);
        }

        self.storage
            .save(&next, &self.model_id)
            .map_err(StoreError::Persist)?;

        log::debug!("persisted {} vectors (+{added})", next.len());
        self.publish(next);
        Ok(added)
    }

    /// Top-`k` identifiers by cosine similarity to `query`.
    ///
    /// Never fails: an empty index, a zero query or a dimension mismatch all
    /// yield an empty list.
    pub fn search(&self, query: &[f32], k: usize, threshold: f32) -> Vec<SearchHit> {
        match self.snapshot().search(query, k, threshold) {
            Ok(hits) => hits,
            Err(e) => {
                log::warn!("search skipped: {e}");
                vec![]
            }
        }
    }

    fn publish(&self, index: VectorIndex) {
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(index);
    }
}
