//! Per-root storage directories.
//!
//! Every indexed root gets its own directory under `<base>/indexes/`, named
//! `<slug>__<hash>`: a short, filesystem-safe rendering of the absolute root
//! path followed by a hash of the full path, so two roots whose slugs collide
//! after truncation still land in different directories.

use std::fs;
use std::path::{Component, Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::semantic::store::StoreError;

/// Subdirectory of the base path holding all per-root index directories.
pub const INDEXES_DIR: &str = "indexes";

/// Maximum length of the human-readable part of the directory name.
const SLUG_MAX_LEN: usize = 40;

/// Hex characters of the SHA256 path hash kept in the directory name.
const HASH_HEX_LEN: usize = 16;

const WRITE_PROBE_FILE: &str = ".write_test";

/// Resolved storage location for one root directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexLocation {
    root: PathBuf,
    dir: PathBuf,
}

impl IndexLocation {
    /// Resolve (and create) the storage directory for `root` under `base_dir`.
    ///
    /// The directory is created eagerly and probed with a write-then-delete,
    /// so an unwritable location fails here instead of after a long build.
    pub fn resolve(base_dir: &Path, root: &Path) -> Result<Self, StoreError> {
        let root = normalize_root(root).map_err(|source| StoreError::StorageUnavailable {
            path: root.to_path_buf(),
            source,
        })?;
        let dir = base_dir.join(INDEXES_DIR).join(Self::dir_name(&root));

        Self::probe_writable(&dir).map_err(|source| {
            log::error!("index directory is not writable: {} ({source})", dir.display());
            StoreError::StorageUnavailable {
                path: dir.clone(),
                source,
            }
        })?;

        Ok(Self { root, dir })
    }

    /// Absolute root directory being indexed.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Storage directory for this root's artifacts.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Directory name for an absolute root path. Pure and deterministic.
    ///
    /// The hash covers the raw path bytes; only the slug is lossy.
    pub fn dir_name(root: &Path) -> String {
        format!(
            "{}__{}",
            slugify(&root.to_string_lossy()),
            path_hash(root.as_os_str().as_encoded_bytes())
        )
    }

    fn probe_writable(dir: &Path) -> std::io::Result<()> {
        fs::create_dir_all(dir)?;
        let probe = dir.join(WRITE_PROBE_FILE);
        fs::write(&probe, b"ok")?;
        fs::remove_file(&probe)
    }
}

/// Bounded ASCII rendering of a path.
///
/// Separators and drive colons become `_`, non-ASCII characters are dropped,
/// and any run of characters outside `[A-Za-z0-9._-]` collapses to one `_`.
fn slugify(full: &str) -> String {
    let mut slug = String::with_capacity(full.len());
    let mut last_was_sep = false;

    for c in full.chars().filter(char::is_ascii) {
        if c.is_ascii_alphanumeric() || matches!(c, '.' | '-') {
            slug.push(c);
            last_was_sep = false;
        } else if !last_was_sep {
            slug.push('_');
            last_was_sep = true;
        }
    }

    slug.truncate(SLUG_MAX_LEN);
    let slug = slug.trim_matches('_');
    if slug.is_empty() {
        "root".to_string()
    } else {
        slug.to_string()
    }
}

/// Canonical form of `root`, so every spelling of one directory maps to the
/// same storage directory. Roots that do not exist are made absolute and
/// cleaned lexically instead.
fn normalize_root(root: &Path) -> std::io::Result<PathBuf> {
    fs::canonicalize(root).or_else(|_| std::path::absolute(root).map(|path| lexical_clean(&path)))
}

/// Drop `.` components and fold `..` into its parent. Trailing separators
/// disappear as a side effect of rebuilding from components.
fn lexical_clean(path: &Path) -> PathBuf {
    let mut cleaned = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !matches!(
                    cleaned.components().next_back(),
                    None | Some(Component::RootDir | Component::Prefix(_))
                ) {
                    cleaned.pop();
                }
            }
            other => cleaned.push(other.as_os_str()),
        }
    }
    cleaned
}

fn path_hash(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    digest[..HASH_HEX_LEN / 2]
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slugify_replaces_separators() {
        assert_eq!(slugify("/home/user/Pictures"), "home_user_Pictures");
        assert_eq!(slugify("C:\\Users\\me\\Pictures"), "C_Users_me_Pictures");
        assert_eq!(slugify("/photos/2024 trip/#1"), "photos_2024_trip_1");
    }

    #[test]
    fn test_slugify_drops_non_ascii() {
        assert_eq!(slugify("/사진/여행"), "root");
        assert_eq!(slugify("/data/café"), "data_caf");
    }

    #[test]
    fn test_slugify_is_bounded() {
        let long = format!("/{}", "a".repeat(200));
        assert_eq!(slugify(&long).len(), SLUG_MAX_LEN - 1);
        assert!(slugify(&"/x".repeat(100)).len() <= SLUG_MAX_LEN);
    }

    #[test]
    fn test_dir_name_is_deterministic() {
        let root = Path::new("/home/user/Pictures");
        assert_eq!(IndexLocation::dir_name(root), IndexLocation::dir_name(root));
        assert!(IndexLocation::dir_name(root).starts_with("home_user_Pictures__"));
    }

    #[test]
    fn test_colliding_slugs_get_distinct_dirs() {
        let a = Path::new("/photos/a b");
        let b = Path::new("/photos/a_b");
        assert_eq!(slugify(&a.to_string_lossy()), slugify(&b.to_string_lossy()));
        assert_ne!(IndexLocation::dir_name(a), IndexLocation::dir_name(b));

        let prefix = "/p".repeat(40);
        let c = PathBuf::from(format!("{prefix}/one"));
        let d = PathBuf::from(format!("{prefix}/two"));
        assert_ne!(IndexLocation::dir_name(&c), IndexLocation::dir_name(&d));
    }

    #[test]
    fn test_resolve_creates_directory() {
        let base = tempfile::tempdir().unwrap();
        let root = tempfile::tempdir().unwrap();

        let location = IndexLocation::resolve(base.path(), root.path()).unwrap();

        assert!(location.dir().is_dir());
        assert!(location.dir().starts_with(base.path().join(INDEXES_DIR)));
        assert!(!location.dir().join(WRITE_PROBE_FILE).exists());
        assert_eq!(location.root(), std::fs::canonicalize(root.path()).unwrap());
    }

    #[test]
    fn test_resolve_is_idempotent() {
        let base = tempfile::tempdir().unwrap();
        let root = tempfile::tempdir().unwrap();

        let first = IndexLocation::resolve(base.path(), root.path()).unwrap();
        let second = IndexLocation::resolve(base.path(), root.path()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_resolve_ignores_path_spelling() {
        let base = tempfile::tempdir().unwrap();
        let parent = tempfile::tempdir().unwrap();
        let pics = parent.path().join("pics");
        std::fs::create_dir_all(parent.path().join("y")).unwrap();
        std::fs::create_dir(&pics).unwrap();

        let plain = IndexLocation::resolve(base.path(), &pics).unwrap();
        let trailing =
            IndexLocation::resolve(base.path(), Path::new(&format!("{}/", pics.display()))).unwrap();
        let dotted =
            IndexLocation::resolve(base.path(), &parent.path().join("y/../pics")).unwrap();

        assert_eq!(plain, trailing);
        assert_eq!(plain, dotted);
    }

    #[test]
    fn test_resolve_missing_root_is_cleaned() {
        let base = tempfile::tempdir().unwrap();

        let plain = IndexLocation::resolve(base.path(), Path::new("/x/pics")).unwrap();
        let trailing = IndexLocation::resolve(base.path(), Path::new("/x/pics/")).unwrap();
        let dotted = IndexLocation::resolve(base.path(), Path::new("/x/y/../pics")).unwrap();

        assert_eq!(plain.root(), Path::new("/x/pics"));
        assert_eq!(plain, trailing);
        assert_eq!(plain, dotted);
    }

    #[test]
    fn test_lexical_clean_stops_at_root() {
        assert_eq!(lexical_clean(Path::new("/../a/./b/..")), PathBuf::from("/a"));
    }

    #[cfg(unix)]
    #[test]
    fn test_non_utf8_roots_get_distinct_dirs() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let a = Path::new(OsStr::from_bytes(b"/tmp/pics\xff"));
        let b = Path::new(OsStr::from_bytes(b"/tmp/pics\xfe"));
        assert_eq!(a.to_string_lossy(), b.to_string_lossy());
        assert_ne!(IndexLocation::dir_name(a), IndexLocation::dir_name(b));
    }

    #[test]
    fn test_resolve_unwritable_base_fails() {
        let base = tempfile::tempdir().unwrap();
        let blocker = base.path().join("not-a-dir");
        std::fs::write(&blocker, b"file").unwrap();

        let result = IndexLocation::resolve(&blocker, Path::new("/some/root"));
        assert!(matches!(result, Err(StoreError::StorageUnavailable { .. })));
    }
}
