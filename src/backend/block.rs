//! Host block device backend.

use super::last_component;
use crate::error::{Error, Result};
use std::fs::File;
use std::io::{self, Seek, SeekFrom};
use std::os::unix::fs::FileTypeExt;
use std::path::Path;

/// A block device node under `/dev/`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockDevice {
    path: String,
    base: String,
}

impl BlockDevice {
    /// Create a block device backend.
    pub fn new(path: &str) -> Result<Self> {
        let base = last_component(path);
        if base.is_empty() || base == "dev" || path.split('/').any(|c| c == "..") {
            return Err(Error::validation(
                "backend",
                format!("invalid block device path: {}", path),
            ));
        }
        Ok(Self {
            path: path.to_string(),
            base: base.to_string(),
        })
    }

    /// Device node path.
    pub fn full_path(&self) -> &str {
        &self.path
    }

    /// Node name.
    pub fn base_name(&self) -> &str {
        &self.base
    }

    /// Device size in bytes.
    ///
    /// Block devices report a zero length in their metadata, so the size
    /// is taken from the end offset.
    pub fn size(&self) -> Result<u64> {
        let mut file = File::open(&self.path).map_err(|e| not_found_or_io(e, &self.path))?;
        Ok(file.seek(SeekFrom::End(0))?)
    }

    /// Whether the node exists and is a block device.
    pub fn is_available(&self) -> Result<bool> {
        match std::fs::metadata(&self.path) {
            Ok(meta) => Ok(meta.file_type().is_block_device()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

pub(super) fn not_found_or_io(e: io::Error, path: &str) -> Error {
    if e.kind() == io::ErrorKind::NotFound {
        Error::BackendNotFound {
            path: Path::new(path).to_path_buf(),
        }
    } else {
        Error::Io(e)
    }
}
