//! Full and incremental index builds.
//!
//! Both modes share one loop: check the cancel token, extract one file,
//! report progress, and append to the store every `batch_size` vectors.
//! Files that fail to extract are logged and skipped; only storage failures
//! end a build early with an error.

use std::path::Path;
use std::sync::Arc;

use crate::semantic::cancel::CancelToken;
use crate::semantic::embeddings::{EmbeddingError, EmbeddingProvider};
use crate::semantic::index::l2_normalize;
use crate::semantic::scanner;
use crate::semantic::store::{IndexStore, LoadState, StoreError};

/// Default number of extracted vectors appended per store write
pub const DEFAULT_BATCH_SIZE: usize = 16;

/// Build progress for one attempt. `done` and `percent` never decrease.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Progress {
    pub percent: f32,
    pub done: usize,
    pub total: usize,
}

impl Progress {
    pub fn new(done: usize, total: usize) -> Self {
        let percent = if total == 0 {
            100.0
        } else {
            done as f32 * 100.0 / total as f32
        };
        Self {
            percent,
            done,
            total,
        }
    }

    /// Terminal update: 100% with `done == total`.
    pub fn complete(total: usize) -> Self {
        Self {
            percent: 100.0,
            done: total,
            total,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildKind {
    Full,
    Incremental,
}

/// Counters for one pass over candidate files.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BuildReport {
    /// Entries appended (and persisted) by this attempt
    pub added: usize,
    /// Files whose features could not be extracted
    pub skipped: usize,
    /// Candidate files considered
    pub total: usize,
}

/// Terminal, non-error states of a build attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildOutcome {
    /// A persisted index existed and was loaded; nothing was extracted.
    Loaded(usize),
    /// Every candidate file was processed.
    Indexed(BuildReport),
    /// A full build produced no vectors. There is no index, which is fine.
    Empty(BuildReport),
    /// The token was set. Work appended before that point stays indexed.
    Cancelled(BuildReport),
}

impl BuildOutcome {
    /// Entries added by this attempt.
    pub fn added(&self) -> usize {
        match self {
            BuildOutcome::Loaded(_) => 0,
            BuildOutcome::Indexed(r) | BuildOutcome::Empty(r) | BuildOutcome::Cancelled(r) => {
                r.added
            }
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, BuildOutcome::Cancelled(_))
    }
}

/// Errors that end a build attempt.
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("Cannot scan {path}: {source}")]
    Scan {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Persist(#[from] StoreError),
}

/// Why a single file was skipped.
#[derive(Debug, thiserror::Error)]
pub enum ExtractionError {
    #[error("unreadable: {0}")]
    Io(#[from] std::io::Error),

    #[error("not a decodable image: {0}")]
    Format(#[from] image::ImageError),

    #[error(transparent)]
    Embedding(#[from] EmbeddingError),

    #[error("encoder returned a degenerate vector")]
    Degenerate,

    #[error("encoder returned {got} dimensions, index has {expected}")]
    DimensionMismatch { expected: usize, got: usize },
}

/// Drives builds for one store with one embedding provider.
pub struct IndexBuilder {
    store: Arc<IndexStore>,
    embedder: Arc<dyn EmbeddingProvider>,
    batch_size: usize,
}

impl IndexBuilder {
    pub fn new(store: Arc<IndexStore>, embedder: Arc<dyn EmbeddingProvider>, batch_size: usize) -> Self {
        Self {
            store,
            embedder,
            batch_size: batch_size.max(1),
        }
    }

    pub fn store(&self) -> &Arc<IndexStore> {
        &self.store
    }

    pub fn run(
        &self,
        kind: BuildKind,
        cancel: &CancelToken,
        progress: &dyn Fn(Progress),
    ) -> Result<BuildOutcome, BuildError> {
        match kind {
            BuildKind::Full => self.full_build(cancel, progress),
            BuildKind::Incremental => self.incremental_build(cancel, progress),
        }
    }

    /// Load the persisted index, or build one from every image under the root.
    pub fn full_build(
        &self,
        cancel: &CancelToken,
        progress: &dyn Fn(Progress),
    ) -> Result<BuildOutcome, BuildError> {
        if let Some(count) = self.load_persisted()? {
            progress(Progress::complete(count));
            return Ok(BuildOutcome::Loaded(count));
        }

        let root = self.store.location().root();
        log::info!("full build of {}", root.display());
        let files = scan(root)?;

        let report = match self.index_files(&files, cancel, progress)? {
            Pass::Cancelled(report) => return Ok(BuildOutcome::Cancelled(report)),
            Pass::Finished(report) => report,
        };

        if self.store.is_empty() {
            log::warn!("no indexable images found in {}", root.display());
            return Ok(BuildOutcome::Empty(report));
        }

        log::info!(
            "indexed {} of {} images ({} skipped)",
            report.added,
            report.total,
            report.skipped
        );
        Ok(BuildOutcome::Indexed(report))
    }

    /// Index only files whose identifiers are not in the store yet.
    pub fn incremental_build(
        &self,
        cancel: &CancelToken,
        progress: &dyn Fn(Progress),
    ) -> Result<BuildOutcome, BuildError> {
        // never append on top of an unloaded store: the write would replace
        // the persisted index with a partial one
        if self.store.is_empty() {
            self.load_persisted()?;
        }

        let root = self.store.location().root();
        let files = scan(root)?;
        let new_files = scanner::diff(&files, &self.store.identifiers());
        log::debug!("{} new of {} images under {}", new_files.len(), files.len(), root.display());

        match self.index_files(&new_files, cancel, progress)? {
            Pass::Cancelled(report) => Ok(BuildOutcome::Cancelled(report)),
            Pass::Finished(report) => {
                if report.added > 0 {
                    log::info!("added {} new images", report.added);
                }
                Ok(BuildOutcome::Indexed(report))
            }
        }
    }

    /// Load persisted artifacts into the store, resetting corrupt ones.
    fn load_persisted(&self) -> Result<Option<usize>, BuildError> {
        match self.store.load() {
            Ok(LoadState::Loaded(count)) => Ok(Some(count)),
            Ok(LoadState::NotFound) => Ok(None),
            Err(StoreError::CorruptIndex(reason)) => {
                log::warn!(
                    "discarding corrupt index in {}: {reason}",
                    self.store.location().dir().display()
                );
                self.store.reset()?;
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn index_files(
        &self,
        files: &[String],
        cancel: &CancelToken,
        progress: &dyn Fn(Progress),
    ) -> Result<Pass, BuildError> {
        let total = files.len();
        let root = self.store.location().root();
        let mut report = BuildReport {
            total,
            ..Default::default()
        };
        let mut batch = Batch::default();

        for (position, id) in files.iter().enumerate() {
            if cancel.is_cancelled() {
                // files extracted so far are finished work; keep them
                report.added += self.flush(&mut batch)?;
                log::warn!(
                    "indexing cancelled after {position}/{total} files: {}",
                    root.display()
                );
                return Ok(Pass::Cancelled(report));
            }

            match self.extract(&root.join(id)) {
                Ok(vector) => batch.push(id.clone(), vector),
                Err(e) => {
                    report.skipped += 1;
                    log::warn!("skipping {id}: {e}");
                }
            }

            if batch.len() >= self.batch_size {
                report.added += self.flush(&mut batch)?;
            }

            progress(Progress::new(position + 1, total));
        }

        report.added += self.flush(&mut batch)?;
        progress(Progress::complete(total));

        Ok(Pass::Finished(report))
    }

    fn extract(&self, path: &Path) -> Result<Vec<f32>, ExtractionError> {
        let bytes = std::fs::read(path)?;
        image::guess_format(&bytes)?;

        let vector = self.embedder.embed_image(&bytes)?;
        if l2_normalize(&vector).is_none() {
            return Err(ExtractionError::Degenerate);
        }

        let expected = self.store.dimensions();
        if expected != 0 && vector.len() != expected {
            return Err(ExtractionError::DimensionMismatch {
                expected,
                got: vector.len(),
            });
        }

        Ok(vector)
    }

    fn flush(&self, batch: &mut Batch) -> Result<usize, BuildError> {
        if batch.is_empty() {
            return Ok(0);
        }
        let Batch { vectors, ids } = std::mem::take(batch);
        Ok(self.store.append(vectors, ids)?)
    }
}

/// How a pass over candidate files ended.
enum Pass {
    Finished(BuildReport),
    Cancelled(BuildReport),
}

/// Extracted vectors waiting to be appended.
#[derive(Default)]
struct Batch {
    vectors: Vec<Vec<f32>>,
    ids: Vec<String>,
}

impl Batch {
    fn push(&mut self, id: String, vector: Vec<f32>) {
        self.ids.push(id);
        self.vectors.push(vector);
    }

    fn len(&self) -> usize {
        self.ids.len()
    }

    fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

fn scan(root: &Path) -> Result<Vec<String>, BuildError> {
    scanner::scan(root).map_err(|source| BuildError::Scan {
        path: root.display().to_string(),
        source,
    })
}
