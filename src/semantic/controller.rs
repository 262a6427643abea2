//! Single-flight scheduling of builds and searches for one root.
//!
//! All admission decisions go through one mutex-guarded [`BuildState`], so
//! two overlapping build requests can never both start. Builds and searches
//! run on tokio's blocking pool; callers never wait on them. Terminal
//! results and progress are published as [`IndexEvent`]s.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::mpsc;

use crate::semantic::cancel::CancelToken;
use crate::semantic::embeddings::{EmbeddingError, EmbeddingProvider};
use crate::semantic::index::SearchHit;
use crate::semantic::location::IndexLocation;
use crate::semantic::pipeline::{BuildKind, BuildOutcome, IndexBuilder, Progress, DEFAULT_BATCH_SIZE};
use crate::semantic::store::{IndexStore, StoreError};
use crate::semantic::DEFAULT_THRESHOLD;

/// Quiet period after the last filesystem event before an incremental build
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(1200);

/// How long a caller waits for a search before giving up on it
pub const DEFAULT_SEARCH_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct ControllerSettings {
    pub batch_size: usize,
    pub debounce: Duration,
    pub search_timeout: Duration,
    pub threshold: f32,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            debounce: DEFAULT_DEBOUNCE,
            search_timeout: DEFAULT_SEARCH_TIMEOUT,
            threshold: DEFAULT_THRESHOLD,
        }
    }
}

/// Everything the controller reports to its front-end.
#[derive(Debug, Clone, PartialEq)]
pub enum IndexEvent {
    Progress { kind: BuildKind, progress: Progress },
    Status(String),
    Completed { kind: BuildKind, outcome: BuildOutcome },
    Failed { kind: BuildKind, reason: String },
    Cancelled { kind: BuildKind },
    SearchTimedOut,
}

impl IndexEvent {
    /// True for the one event that ends a build attempt.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            IndexEvent::Completed { .. } | IndexEvent::Failed { .. } | IndexEvent::Cancelled { .. }
        )
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error("A search is already running")]
    SearchBusy,

    #[error("Search timed out after {0:?}")]
    SearchTimeout(Duration),

    #[error("Index is still being built")]
    NotReady,

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Embedding(#[from] EmbeddingError),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Point-in-time view of the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerStatus {
    pub indexing_busy: bool,
    pub autoindex_blocked: bool,
    pub active_search: bool,
    pub pending: Option<BuildKind>,
    pub indexed: usize,
    pub root: PathBuf,
}

#[derive(Debug, Default)]
struct BuildState {
    indexing_busy: bool,
    /// Outstanding [`AutoIndexBlock`] guards
    autoindex_blocks: usize,
    active_search: bool,
    cancel: Option<CancelToken>,
    /// Build to start once the current one reaches a terminal state
    pending: Option<BuildKind>,
}

impl BuildState {
    fn autoindex_blocked(&self) -> bool {
        self.autoindex_blocks > 0
    }

    /// Mark a build as started and hand out its token, unless one is
    /// running or builds are blocked.
    fn admit(&mut self) -> Option<CancelToken> {
        if self.indexing_busy || self.autoindex_blocked() {
            return None;
        }
        let token = CancelToken::new();
        self.indexing_busy = true;
        self.cancel = Some(token.clone());
        Some(token)
    }

    /// Queue a follow-up build. A queued full build is never downgraded.
    fn request(&mut self, kind: BuildKind) {
        self.pending = match (self.pending, kind) {
            (Some(BuildKind::Full), _) | (_, BuildKind::Full) => Some(BuildKind::Full),
            _ => Some(BuildKind::Incremental),
        };
    }

    fn cancel_current(&self) {
        if let Some(token) = &self.cancel {
            token.cancel();
        }
    }

    /// Admit the queued build if the controller is idle and unblocked.
    fn take_pending(&mut self) -> Option<(BuildKind, CancelToken)> {
        if self.indexing_busy || self.autoindex_blocked() {
            return None;
        }
        let kind = self.pending.take()?;
        self.admit().map(|token| (kind, token))
    }
}

struct Inner {
    runtime: Handle,
    base_dir: PathBuf,
    embedder: Arc<dyn EmbeddingProvider>,
    settings: ControllerSettings,
    store: RwLock<Arc<IndexStore>>,
    state: Mutex<BuildState>,
    events: mpsc::UnboundedSender<IndexEvent>,
    fs_changes: mpsc::UnboundedSender<()>,
}

impl Inner {
    fn lock_state(&self) -> MutexGuard<'_, BuildState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn current_store(&self) -> Arc<IndexStore> {
        self.store
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn emit(&self, event: IndexEvent) {
        // nobody listening is fine
        let _ = self.events.send(event);
    }
}

/// Cloneable handle to the scheduler for one root.
#[derive(Clone)]
pub struct IndexController {
    inner: Arc<Inner>,
}

impl IndexController {
    /// Bind a controller to `root`, storing its index under `base_dir`.
    ///
    /// The storage directory is resolved and probed here, so an unwritable
    /// location fails before any build starts. Builds, searches and the
    /// debounce task all run on `runtime`.
    pub fn new(
        runtime: Handle,
        base_dir: &Path,
        root: &Path,
        embedder: Arc<dyn EmbeddingProvider>,
        settings: ControllerSettings,
    ) -> Result<(Self, mpsc::UnboundedReceiver<IndexEvent>), StoreError> {
        let location = IndexLocation::resolve(base_dir, root)?;
        let store = Arc::new(IndexStore::open(location, embedder.model_id()));

        let (events, events_rx) = mpsc::unbounded_channel();
        let (fs_changes, fs_changes_rx) = mpsc::unbounded_channel();
        let debounce = settings.debounce;

        let inner = Arc::new(Inner {
            runtime: runtime.clone(),
            base_dir: base_dir.to_path_buf(),
            embedder,
            settings,
            store: RwLock::new(store),
            state: Mutex::new(BuildState::default()),
            events,
            fs_changes,
        });

        runtime.spawn(debounce_changes(
            Arc::downgrade(&inner),
            fs_changes_rx,
            debounce,
        ));

        Ok((Self { inner }, events_rx))
    }

    /// Store currently bound to the controller.
    pub fn store(&self) -> Arc<IndexStore> {
        self.inner.current_store()
    }

    pub fn start_full_build(&self) -> bool {
        self.start(BuildKind::Full)
    }

    pub fn start_incremental_build(&self) -> bool {
        self.start(BuildKind::Incremental)
    }

    /// Start a build of `kind`. Returns false (and does nothing) if a build
    /// is already running or builds are blocked.
    pub fn start(&self, kind: BuildKind) -> bool {
        let token = self.inner.lock_state().admit();
        match token {
            Some(token) => {
                self.spawn_build(kind, token);
                true
            }
            None => {
                log::debug!("{kind:?} build request ignored: controller busy");
                false
            }
        }
    }

    /// Record a filesystem change. Bursts are coalesced into one
    /// incremental build after the debounce window.
    pub fn notify_fs_change(&self) {
        let _ = self.inner.fs_changes.send(());
    }

    /// User-requested reindex: stop the running build and rerun once it
    /// has stopped, or start right away if idle.
    ///
    /// Returns false only while builds are blocked.
    pub fn manual_index(&self) -> bool {
        let token = {
            let mut state = self.inner.lock_state();
            if state.autoindex_blocked() {
                return false;
            }
            if state.indexing_busy {
                state.cancel_current();
                state.request(BuildKind::Incremental);
                log::info!("reindex requested, cancelling running build");
                return true;
            }
            state.admit()
        };

        if let Some(token) = token {
            self.spawn_build(BuildKind::Incremental, token);
        }
        true
    }

    /// Cancel the running build, if any, and drop queued reruns.
    pub fn cancel(&self) {
        let mut state = self.inner.lock_state();
        state.pending = None;
        state.cancel_current();
    }

    /// Cancel running work and refuse new builds until the guard is dropped.
    pub fn block_autoindex(&self) -> AutoIndexBlock {
        let mut state = self.inner.lock_state();
        state.autoindex_blocks += 1;
        state.cancel_current();
        AutoIndexBlock {
            controller: self.clone(),
        }
    }

    /// Point the controller at a different root.
    ///
    /// The new location is resolved before anything is swapped, so an
    /// unwritable directory leaves the current store in place. A full build
    /// of the new root is queued and starts once the old build (if any)
    /// has stopped.
    pub fn set_root(&self, root: &Path) -> Result<(), StoreError> {
        let _block = self.block_autoindex();

        let location = IndexLocation::resolve(&self.inner.base_dir, root)?;
        let store = Arc::new(IndexStore::open(location, self.inner.embedder.model_id()));
        *self.inner.store.write().unwrap_or_else(PoisonError::into_inner) = store;

        self.inner.lock_state().request(BuildKind::Full);
        self.inner
            .emit(IndexEvent::Status(format!("Root changed to {}", root.display())));
        Ok(())
    }

    pub fn status(&self) -> ControllerStatus {
        let store = self.inner.current_store();
        let state = self.inner.lock_state();
        ControllerStatus {
            indexing_busy: state.indexing_busy,
            autoindex_blocked: state.autoindex_blocked(),
            active_search: state.active_search,
            pending: state.pending,
            indexed: store.len(),
            root: store.location().root().to_path_buf(),
        }
    }

    /// Rank indexed images against a text query.
    ///
    /// Only one search runs at a time; a second caller gets
    /// [`ControllerError::SearchBusy`]. A search that outlives the timeout
    /// keeps running on its worker and holds the gate until it finishes,
    /// but the caller gets [`ControllerError::SearchTimeout`] right away.
    pub async fn search(&self, query: &str, k: usize) -> Result<Vec<SearchHit>, ControllerError> {
        let store = self.inner.current_store();
        {
            let mut state = self.inner.lock_state();
            if state.active_search {
                return Err(ControllerError::SearchBusy);
            }
            if state.indexing_busy && store.is_empty() {
                return Err(ControllerError::NotReady);
            }
            state.active_search = true;
        }

        let gate = SearchGate {
            inner: self.inner.clone(),
        };
        let embedder = self.inner.embedder.clone();
        let threshold = self.inner.settings.threshold;
        let query = query.to_string();

        let worker = self.inner.runtime.spawn_blocking(move || {
            let _gate = gate;
            let vector = embedder.embed_text(&query)?;
            Ok::<_, ControllerError>(store.search(&vector, k, threshold))
        });

        let timeout = self.inner.settings.search_timeout;
        match tokio::time::timeout(timeout, worker).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(ControllerError::Internal(format!("search worker failed: {e}"))),
            Err(_) => {
                log::warn!("search exceeded {timeout:?}, result will be discarded");
                self.inner.emit(IndexEvent::SearchTimedOut);
                Err(ControllerError::SearchTimeout(timeout))
            }
        }
    }

    fn spawn_build(&self, kind: BuildKind, token: CancelToken) {
        let store = self.inner.current_store();
        let builder = IndexBuilder::new(
            store.clone(),
            self.inner.embedder.clone(),
            self.inner.settings.batch_size,
        );
        let mut guard = BuildGuard {
            controller: self.clone(),
            kind,
            event: None,
        };

        self.inner.emit(IndexEvent::Status(format!(
            "Indexing {}",
            store.location().root().display()
        )));

        self.inner.runtime.spawn_blocking(move || {
            let events = guard.controller.inner.events.clone();
            let report = |progress| {
                let _ = events.send(IndexEvent::Progress { kind, progress });
            };

            guard.event = Some(match builder.run(kind, &token, &report) {
                Ok(outcome) if outcome.is_cancelled() => IndexEvent::Cancelled { kind },
                Ok(outcome) => IndexEvent::Completed { kind, outcome },
                Err(e) => {
                    log::error!("{kind:?} build failed: {e}");
                    IndexEvent::Failed {
                        kind,
                        reason: e.to_string(),
                    }
                }
            });
        });
    }
}

/// Clears `indexing_busy` when a build ends, however it ends, then reports
/// the terminal event and starts any queued rerun.
///
/// A full build that only loaded the persisted index queues an incremental
/// catch-up, since the persisted data may predate files added since or come
/// from an interrupted build.
struct BuildGuard {
    controller: IndexController,
    kind: BuildKind,
    event: Option<IndexEvent>,
}

impl Drop for BuildGuard {
    fn drop(&mut self) {
        let inner = &self.controller.inner;
        let loaded_only = matches!(
            self.event,
            Some(IndexEvent::Completed {
                kind: BuildKind::Full,
                outcome: BuildOutcome::Loaded(_),
            })
        );
        let next = {
            let mut state = inner.lock_state();
            state.indexing_busy = false;
            state.cancel = None;
            if loaded_only {
                state.request(BuildKind::Incremental);
            }
            state.take_pending()
        };

        let event = self.event.take().unwrap_or_else(|| IndexEvent::Failed {
            kind: self.kind,
            reason: "build worker panicked".to_string(),
        });
        inner.emit(event);

        if let Some((kind, token)) = next {
            self.controller.spawn_build(kind, token);
        }
    }
}

/// Releases the single-search gate when the search worker finishes.
struct SearchGate {
    inner: Arc<Inner>,
}

impl Drop for SearchGate {
    fn drop(&mut self) {
        self.inner.lock_state().active_search = false;
    }
}

/// Keeps builds blocked while held. Dropping the last one starts any build
/// queued in the meantime.
#[must_use = "builds are unblocked as soon as the guard is dropped"]
pub struct AutoIndexBlock {
    controller: IndexController,
}

impl Drop for AutoIndexBlock {
    fn drop(&mut self) {
        let next = {
            let mut state = self.controller.inner.lock_state();
            state.autoindex_blocks = state.autoindex_blocks.saturating_sub(1);
            state.take_pending()
        };
        if let Some((kind, token)) = next {
            self.controller.spawn_build(kind, token);
        }
    }
}

/// Wait for `window` of silence after a change, then request one
/// incremental build. A change arriving mid-build queues a rerun instead
/// of being dropped.
async fn debounce_changes(
    inner: Weak<Inner>,
    mut changes: mpsc::UnboundedReceiver<()>,
    window: Duration,
) {
    while changes.recv().await.is_some() {
        loop {
            tokio::select! {
                more = changes.recv() => {
                    if more.is_none() {
                        return;
                    }
                }
                _ = tokio::time::sleep(window) => break,
            }
        }

        let Some(inner) = inner.upgrade() else {
            return;
        };
        let controller = IndexController { inner };
        let token = {
            let mut state = controller.inner.lock_state();
            if state.indexing_busy {
                state.request(BuildKind::Incremental);
                None
            } else {
                state.admit()
            }
        };
        match token {
            Some(token) => controller.spawn_build(BuildKind::Incremental, token),
            None => log::debug!("filesystem change deferred"),
        }
    }
}
