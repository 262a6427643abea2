//! On-disk artifacts for one vector index.
//!
//! Two files live side by side in the per-root index directory and are
//! always written together:
//!
//! vectors.bin
//!
//! Header (47 bytes):
//! - version: u8 (1)
//! - model_id: [u8; 32] (SHA256 hash of image model name)
//! - dimensions: u16 (little-endian)
//! - row_count: u64 (little-endian)
//! - checksum: u32 (CRC32 of header fields before checksum)
//!
//! Payload: row_count * dimensions f32 (little-endian, row-major)
//!
//! ids.json
//!
//! JSON array of relative image paths, index-aligned with the rows.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::semantic::index::VectorIndex;

/// Current file format version
const FORMAT_VERSION: u8 = 1;

/// Header size in bytes: version(1) + model_id(32) + dimensions(2) + row_count(8) + checksum(4)
const HEADER_SIZE: usize = 47;

pub const VECTORS_FILE: &str = "vectors.bin";
pub const IDS_FILE: &str = "ids.json";

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum VectorStorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid file format: {0}")]
    InvalidFormat(String),

    #[error("Version mismatch: file version {0}, supported version {1}")]
    VersionMismatch(u8, u8),

    #[error("Model mismatch: file uses different model")]
    ModelMismatch,

    #[error("Checksum mismatch: file may be corrupted")]
    ChecksumMismatch,

    #[error("Inconsistent artifacts: {0}")]
    Inconsistent(String),

    #[error("Identifier list is malformed: {0}")]
    Json(#[from] serde_json::Error),
}

impl VectorStorageError {
    /// Whether the error describes bad persisted content rather than an
    /// environment problem (permissions, disk full, ...).
    pub fn is_corruption(&self) -> bool {
        match self {
            VectorStorageError::Io(err) => err.kind() == std::io::ErrorKind::UnexpectedEof,
            _ => true,
        }
    }
}

/// Storage manager for the vectors/identifiers artifact pair.
pub struct VectorStorage {
    vectors_path: PathBuf,
    ids_path: PathBuf,
}

impl VectorStorage {
    /// Create a new storage manager rooted at `dir`.
    pub fn new(dir: &Path) -> Self {
        Self {
            vectors_path: dir.join(VECTORS_FILE),
            ids_path: dir.join(IDS_FILE),
        }
    }

    pub fn vectors_path(&self) -> &Path {
        &self.vectors_path
    }

    pub fn ids_path(&self) -> &Path {
        &self.ids_path
    }

    /// True if at least one artifact is present.
    pub fn exists(&self) -> bool {
        self.vectors_path.exists() || self.ids_path.exists()
    }

    /// Load the persisted index.
    ///
    /// # Returns
    /// `Ok(None)` when neither artifact exists, the index when both exist and
    /// agree, an error otherwise.
    pub fn load(&self, expected_model_id: &[u8; 32]) -> Result<Option<VectorIndex>, VectorStorageError> {
        self.recover_interrupted_commit(expected_model_id);
        self.read_pair(expected_model_id)
    }

    fn read_pair(&self, expected_model_id: &[u8; 32]) -> Result<Option<VectorIndex>, VectorStorageError> {
        match (self.vectors_path.exists(), self.ids_path.exists()) {
            (false, false) => return Ok(None),
            (true, false) => {
                return Err(VectorStorageError::Inconsistent(format!(
                    "{VECTORS_FILE} present without {IDS_FILE}"
                )))
            }
            (false, true) => {
                return Err(VectorStorageError::Inconsistent(format!(
                    "{IDS_FILE} present without {VECTORS_FILE}"
                )))
            }
            (true, true) => {}
        }

        let mut reader = BufReader::new(File::open(&self.vectors_path)?);
        let header = Self::read_header(&mut reader)?;
        if header.model_id != *expected_model_id {
            return Err(VectorStorageError::ModelMismatch);
        }

        let vectors = Self::read_payload(&mut reader, &header)?;

        let ids: Vec<String> = serde_json::from_reader(BufReader::new(File::open(&self.ids_path)?))?;
        if ids.len() as u64 != header.row_count {
            return Err(VectorStorageError::Inconsistent(format!(
                "{} rows but {} identifiers",
                header.row_count,
                ids.len()
            )));
        }

        VectorIndex::from_parts(header.dimensions as usize, vectors, ids)
            .map_err(|e| VectorStorageError::Inconsistent(e.to_string()))
            .map(Some)
    }

    /// Save the index, replacing both artifacts.
    ///
    /// Both files are staged as temp files and fsynced first. The previous
    /// pair is then moved aside, the new pair renamed in, and the old pair
    /// deleted. Any failure restores the previous pair.
    pub fn save(&self, index: &VectorIndex, model_id: &[u8; 32]) -> Result<(), VectorStorageError> {
        let vectors_tmp = tmp_path(&self.vectors_path);
        let ids_tmp = tmp_path(&self.ids_path);

        let staged = self
            .write_vectors(&vectors_tmp, index, model_id)
            .and_then(|_| self.write_ids(&ids_tmp, index));
        if let Err(e) = staged {
            let _ = std::fs::remove_file(&vectors_tmp);
            let _ = std::fs::remove_file(&ids_tmp);
            return Err(e);
        }

        if let Err(e) = self.commit(&vectors_tmp, &ids_tmp) {
            let _ = std::fs::remove_file(&vectors_tmp);
            let _ = std::fs::remove_file(&ids_tmp);
            return Err(e);
        }

        Ok(())
    }

    /// Delete both artifacts if they exist.
    pub fn delete(&self) -> Result<(), VectorStorageError> {
        for path in [&self.vectors_path, &self.ids_path] {
            if path.exists() {
                std::fs::remove_file(path)?;
            }
        }
        for path in [bak_path(&self.vectors_path), bak_path(&self.ids_path)] {
            if path.exists() {
                std::fs::remove_file(path)?;
            }
        }
        Ok(())
    }

    fn commit(&self, vectors_tmp: &Path, ids_tmp: &Path) -> Result<(), VectorStorageError> {
        let vectors_bak = bak_path(&self.vectors_path);
        let ids_bak = bak_path(&self.ids_path);

        let had_previous = self.vectors_path.exists() && self.ids_path.exists();
        if had_previous {
            std::fs::rename(&self.vectors_path, &vectors_bak)?;
            if let Err(e) = std::fs::rename(&self.ids_path, &ids_bak) {
                let _ = std::fs::rename(&vectors_bak, &self.vectors_path);
                return Err(e.into());
            }
        }

        let swapped = std::fs::rename(vectors_tmp, &self.vectors_path)
            .and_then(|_| std::fs::rename(ids_tmp, &self.ids_path));

        match swapped {
            Ok(()) => {
                if had_previous {
                    let _ = std::fs::remove_file(&ids_bak);
                    let _ = std::fs::remove_file(&vectors_bak);
                }
                Ok(())
            }
            Err(e) => {
                let _ = std::fs::remove_file(&self.vectors_path);
                let _ = std::fs::remove_file(&self.ids_path);
                if had_previous {
                    let _ = std::fs::rename(&vectors_bak, &self.vectors_path);
                    let _ = std::fs::rename(&ids_bak, &self.ids_path);
                }
                Err(e.into())
            }
        }
    }

    /// Settle leftovers of a commit that was cut short.
    ///
    /// Backups only win when the primaries are missing or unreadable. A crash
    /// after both renames but before the cleanup leaves a valid new pair,
    /// which is kept.
    fn recover_interrupted_commit(&self, expected_model_id: &[u8; 32]) {
        let vectors_bak = bak_path(&self.vectors_path);
        let ids_bak = bak_path(&self.ids_path);

        match (vectors_bak.exists(), ids_bak.exists()) {
            (false, false) => {}
            (true, true) => {
                if matches!(self.read_pair(expected_model_id), Ok(Some(_))) {
                    log::debug!("discarding backups of a completed index write");
                    let _ = std::fs::remove_file(&ids_bak);
                    let _ = std::fs::remove_file(&vectors_bak);
                    return;
                }

                log::warn!(
                    "restoring index artifacts from interrupted write in {}",
                    self.vectors_path.parent().unwrap_or(Path::new(".")).display()
                );
                let _ = std::fs::remove_file(&self.vectors_path);
                let _ = std::fs::remove_file(&self.ids_path);
                if let Err(e) = std::fs::rename(&vectors_bak, &self.vectors_path)
                    .and_then(|_| std::fs::rename(&ids_bak, &self.ids_path))
                {
                    log::error!("failed to restore index artifacts: {e}");
                }
            }
            // crash between moving the old pair aside
            (true, false) if !self.vectors_path.exists() => {
                if let Err(e) = std::fs::rename(&vectors_bak, &self.vectors_path) {
                    log::error!("failed to restore {VECTORS_FILE}: {e}");
                }
            }
            // cleanup after a completed write was cut short
            (true, false) => {
                let _ = std::fs::remove_file(&vectors_bak);
            }
            (false, true) => {
                let _ = std::fs::remove_file(&ids_bak);
            }
        }
    }

    fn write_vectors(
        &self,
        path: &Path,
        index: &VectorIndex,
        model_id: &[u8; 32],
    ) -> Result<(), VectorStorageError> {
        let dimensions = u16::try_from(index.dimensions()).map_err(|_| {
            VectorStorageError::InvalidFormat(format!(
                "{} dimensions do not fit the header",
                index.dimensions()
            ))
        })?;

        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);

        let header = Header {
            version: FORMAT_VERSION,
            model_id: *model_id,
            dimensions,
            row_count: index.len() as u64,
        };
        Self::write_header(&mut writer, &header)?;

        for &value in index.vectors() {
            writer.write_all(&value.to_le_bytes())?;
        }

        writer.flush()?;
        let file = writer.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;

        Ok(())
    }

    fn write_ids(&self, path: &Path, index: &VectorIndex) -> Result<(), VectorStorageError> {
        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer(&mut writer, index.ids())?;

        writer.flush()?;
        let file = writer.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;

        Ok(())
    }

    fn read_header(reader: &mut impl Read) -> Result<Header, VectorStorageError> {
        let mut header_bytes = [0u8; HEADER_SIZE];
        reader.read_exact(&mut header_bytes)?;

        let version = header_bytes[0];
        if version != FORMAT_VERSION {
            return Err(VectorStorageError::VersionMismatch(version, FORMAT_VERSION));
        }

        let stored_checksum = u32::from_le_bytes([
            header_bytes[43],
            header_bytes[44],
            header_bytes[45],
            header_bytes[46],
        ]);
        if stored_checksum != crc32fast::hash(&header_bytes[0..43]) {
            return Err(VectorStorageError::ChecksumMismatch);
        }

        let mut model_id = [0u8; 32];
        model_id.copy_from_slice(&header_bytes[1..33]);

        let dimensions = u16::from_le_bytes([header_bytes[33], header_bytes[34]]);
        let mut count_bytes = [0u8; 8];
        count_bytes.copy_from_slice(&header_bytes[35..43]);
        let row_count = u64::from_le_bytes(count_bytes);

        Ok(Header {
            version,
            model_id,
            dimensions,
            row_count,
        })
    }

    fn write_header(writer: &mut impl Write, header: &Header) -> Result<(), VectorStorageError> {
        let mut header_bytes = [0u8; HEADER_SIZE];

        header_bytes[0] = header.version;
        header_bytes[1..33].copy_from_slice(&header.model_id);
        header_bytes[33..35].copy_from_slice(&header.dimensions.to_le_bytes());
        header_bytes[35..43].copy_from_slice(&header.row_count.to_le_bytes());

        let checksum = crc32fast::hash(&header_bytes[0..43]);
        header_bytes[43..47].copy_from_slice(&checksum.to_le_bytes());

        writer.write_all(&header_bytes)?;
        Ok(())
    }

    fn read_payload(reader: &mut impl Read, header: &Header) -> Result<Vec<f32>, VectorStorageError> {
        let expected = (header.dimensions as u64)
            .checked_mul(header.row_count)
            .and_then(|n| n.checked_mul(4))
            .ok_or_else(|| VectorStorageError::InvalidFormat("row count overflows".to_string()))?;

        let mut payload = Vec::new();
        reader.read_to_end(&mut payload)?;
        if payload.len() as u64 != expected {
            return Err(VectorStorageError::InvalidFormat(format!(
                "expected {expected} payload bytes, found {}",
                payload.len()
            )));
        }

        Ok(payload
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect())
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    append_extension(path, "tmp")
}

fn bak_path(path: &Path) -> PathBuf {
    append_extension(path, "bak")
}

fn append_extension(path: &Path, ext: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".");
    name.push(ext);
    PathBuf::from(name)
}

/// File header structure.
#[derive(Debug)]
struct Header {
    version: u8,
    model_id: [u8; 32],
    dimensions: u16,
    row_count: u64,
}
