//! Storage and media backends.
//!
//! A [`Backend`] says where the bytes of a disk or removable medium live.
//! The variant is derived once from the path prefix and never changes;
//! switching media builds a new backend value.
//!
//! | Prefix       | Variant                 |
//! |--------------|-------------------------|
//! | `/dev/`      | [`BlockDevice`]         |
//! | `iscsi://`   | [`IscsiTarget`]         |
//! | `nbd://`     | [`NbdExport`]           |
//! | other path   | [`LocalFile`]           |

mod block;
mod file;
mod iscsi;
mod nbd;

pub use block::BlockDevice;
pub use file::LocalFile;
pub use iscsi::IscsiTarget;
pub use nbd::NbdExport;

use crate::error::{Error, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Prefix of every disk device id.
pub const QDEV_PREFIX: &str = "blk_";

/// Kind of a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    /// Host block device.
    Block,
    /// Regular file on the host.
    File,
    /// iSCSI logical unit.
    Iscsi,
    /// NBD export.
    Nbd,
}

impl BackendKind {
    /// Backend kind name.
    pub fn name(&self) -> &'static str {
        match self {
            BackendKind::Block => "block device",
            BackendKind::File => "file",
            BackendKind::Iscsi => "iscsi backend",
            BackendKind::Nbd => "nbd backend",
        }
    }
}

/// Storage backend of a disk or medium.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Backend {
    /// Host block device.
    Block(BlockDevice),
    /// Regular file on the host.
    File(LocalFile),
    /// iSCSI logical unit.
    Iscsi(IscsiTarget),
    /// NBD export.
    Nbd(NbdExport),
}

impl Backend {
    /// Build a backend from a path or URI.
    pub fn new(path: &str) -> Result<Self> {
        let path = path.trim();
        if path.is_empty() {
            return Err(Error::validation("backend", "empty path"));
        }

        if path.starts_with("/dev/") {
            return BlockDevice::new(path).map(Backend::Block);
        }
        if path.starts_with(iscsi::SCHEME) {
            return IscsiTarget::new(path).map(Backend::Iscsi);
        }
        if path.starts_with(nbd::SCHEME) {
            return NbdExport::new(path).map(Backend::Nbd);
        }
        if path.contains("://") {
            return Err(Error::UnknownBackend(path.to_string()));
        }

        LocalFile::new(path).map(Backend::File)
    }

    /// Backend kind.
    pub fn kind(&self) -> BackendKind {
        match self {
            Backend::Block(_) => BackendKind::Block,
            Backend::File(_) => BackendKind::File,
            Backend::Iscsi(_) => BackendKind::Iscsi,
            Backend::Nbd(_) => BackendKind::Nbd,
        }
    }

    /// Full path or URI, as passed to the hypervisor.
    pub fn full_path(&self) -> &str {
        match self {
            Backend::Block(b) => b.full_path(),
            Backend::File(b) => b.full_path(),
            Backend::Iscsi(b) => b.full_path(),
            Backend::Nbd(b) => b.full_path(),
        }
    }

    /// Short name the device ids derive from.
    pub fn base_name(&self) -> &str {
        match self {
            Backend::Block(b) => b.base_name(),
            Backend::File(b) => b.base_name(),
            Backend::Iscsi(b) => b.base_name(),
            Backend::Nbd(b) => b.base_name(),
        }
    }

    /// Hypervisor device id of a disk using this backend.
    pub fn qdev_id(&self) -> String {
        format!("{}{}", QDEV_PREFIX, self.base_name())
    }

    /// Size in bytes.
    pub fn size(&self) -> Result<u64> {
        match self {
            Backend::Block(b) => b.size(),
            Backend::File(b) => b.size(),
            Backend::Iscsi(_) | Backend::Nbd(_) => {
                Err(Error::not_implemented("size", self.kind().name()))
            }
        }
    }

    /// Whether the bytes live on this host.
    pub fn is_local(&self) -> bool {
        matches!(self, Backend::Block(_) | Backend::File(_))
    }

    /// Whether the backend can currently be opened.
    ///
    /// Network backends cannot be checked without opening a session and
    /// always report true.
    pub fn is_available(&self) -> Result<bool> {
        match self {
            Backend::Block(b) => b.is_available(),
            Backend::File(b) => b.is_available(),
            Backend::Iscsi(_) | Backend::Nbd(_) => Ok(true),
        }
    }

    /// Deep copy for concurrent readers.
    pub fn copy(&self) -> Backend {
        self.clone()
    }

    /// Whether this is a host block device that needs a chroot node.
    pub fn is_block_device(&self) -> bool {
        matches!(self, Backend::Block(_))
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.full_path())
    }
}

impl Serialize for Backend {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.full_path())
    }
}

impl<'de> Deserialize<'de> for Backend {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let path = String::deserialize(deserializer)?;
        Backend::new(&path).map_err(serde::de::Error::custom)
    }
}

/// Replace characters the hypervisor rejects in ids with `-`.
fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_') {
                c
            } else {
                '-'
            }
        })
        .collect()
}

/// Last component of a slash separated path.
fn last_component(path: &str) -> &str {
    path.trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(path)
}
