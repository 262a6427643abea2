//! Directory scanning and new-file detection.
//!
//! Files are identified purely by their `/`-separated path relative to the
//! root. A rename therefore looks like a new file, and the old identifier
//! stays in the index.

use std::collections::HashSet;
use std::path::Path;

/// Image extensions picked up by the scanner (lower-case, no dot).
pub const IMAGE_EXTENSIONS: &[&str] = &[
    "bmp", "dng", "jpeg", "jpg", "mpo", "png", "tif", "tiff", "webp", "pfm",
];

/// Check whether `path` has an allow-listed image extension.
pub fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            let ext = ext.trim_start_matches('.').to_ascii_lowercase();
            IMAGE_EXTENSIONS.contains(&ext.as_str())
        })
        .unwrap_or(false)
}

/// Walk `root` recursively and return every image as a relative identifier.
///
/// Unreadable directories and entries are skipped. The result is sorted so
/// builds process files in a stable order.
pub fn scan(root: &Path) -> std::io::Result<Vec<String>> {
    if !root.is_dir() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("not a directory: {}", root.display()),
        ));
    }

    let mut files: Vec<String> = image_entries(root)
        .filter_map(|entry| identifier(root, entry.path()))
        .collect();
    files.sort();

    Ok(files)
}

/// Files in `all` that are not in `known`, preserving `all`'s order.
pub fn diff(all: &[String], known: &HashSet<String>) -> Vec<String> {
    all.iter()
        .filter(|id| !known.contains(id.as_str()))
        .cloned()
        .collect()
}

/// Cheap check for at least one image anywhere under `root`.
pub fn has_images(root: &Path) -> bool {
    root.is_dir() && image_entries(root).next().is_some()
}

fn image_entries(root: &Path) -> impl Iterator<Item = walkdir::DirEntry> {
    walkdir::WalkDir::new(root)
        .min_depth(1)
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(e) => {
                log::debug!("skipping unreadable entry: {e}");
                None
            }
        })
        .filter(|entry| entry.file_type().is_file() && is_image(entry.path()))
}

/// Relative, `/`-joined identifier for `path` under `root`.
pub fn identifier(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let parts: Option<Vec<&str>> = relative
        .components()
        .map(|c| c.as_os_str().to_str())
        .collect();

    match parts {
        Some(parts) if !parts.is_empty() => Some(parts.join("/")),
        Some(_) => None,
        None => {
            log::debug!("skipping non UTF-8 path: {}", path.display());
            None
        }
    }
}
