//! Filesystem watcher feeding the controller's debouncer.

use std::path::Path;

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};

use crate::semantic::controller::IndexController;
use crate::semantic::scanner;

#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    #[error("Not a directory: {0}")]
    NotADirectory(String),

    #[error("Watcher error: {0}")]
    Notify(#[from] notify::Error),
}

/// Keeps the watcher alive; watching stops when this is dropped.
pub struct WatchHandle {
    _watcher: RecommendedWatcher,
}

/// Watch `root` recursively and report image changes to `controller`.
pub fn watch(root: &Path, controller: IndexController) -> Result<WatchHandle, WatchError> {
    if !root.is_dir() {
        return Err(WatchError::NotADirectory(root.display().to_string()));
    }

    let mut watcher = notify::recommended_watcher(move |result: notify::Result<Event>| match result {
        Ok(event) if is_relevant(&event) => controller.notify_fs_change(),
        Ok(_) => {}
        Err(e) => log::warn!("watcher error: {e}"),
    })?;
    watcher.watch(root, RecursiveMode::Recursive)?;

    log::info!("watching {}", root.display());
    Ok(WatchHandle { _watcher: watcher })
}

/// Content changes to image files. Directory events count too, since a
/// moved-in directory may carry images without per-file events.
fn is_relevant(event: &Event) -> bool {
    let content_change = matches!(
        event.kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    );
    content_change
        && event
            .paths
            .iter()
            .any(|path| scanner::is_image(path) || path.is_dir())
}
