//! Regular file backend.

use super::block::not_found_or_io;
use super::last_component;
use crate::error::{Error, Result};
use std::io;

/// A disk image or ISO stored as a regular file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalFile {
    path: String,
    base: String,
}

impl LocalFile {
    /// Create a file backend.
    pub fn new(path: &str) -> Result<Self> {
        let base = last_component(path);
        if base.is_empty() || base == "." || base == ".." {
            return Err(Error::validation(
                "backend",
                format!("invalid file path: {}", path),
            ));
        }
        Ok(Self {
            path: path.to_string(),
            base: base.to_string(),
        })
    }

    /// File path.
    pub fn full_path(&self) -> &str {
        &self.path
    }

    /// File name.
    pub fn base_name(&self) -> &str {
        &self.base
    }

    /// File size in bytes.
    pub fn size(&self) -> Result<u64> {
        std::fs::metadata(&self.path)
            .map(|m| m.len())
            .map_err(|e| not_found_or_io(e, &self.path))
    }

    /// Whether the file exists and is a regular file.
    pub fn is_available(&self) -> Result<bool> {
        match std::fs::metadata(&self.path) {
            Ok(meta) => Ok(meta.is_file()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}
