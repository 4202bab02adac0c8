//! Block device nodes inside instance chroots.

use super::{chroot_path, NodeManager};
use crate::error::{Error, Result};
use std::ffi::CString;
use std::fs;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::{Path, PathBuf};

/// Creates nodes with `mknod(2)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChrootNodes;

fn mknod_block(path: &Path, rdev: u64) -> io::Result<()> {
    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    // SAFETY: c_path is a valid NUL-terminated string for the duration of the call.
    let rc = unsafe { libc::mknod(c_path.as_ptr(), libc::S_IFBLK | 0o660, rdev as libc::dev_t) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

impl NodeManager for ChrootNodes {
    fn source_exists(&self, source: &Path) -> Result<bool> {
        match fs::metadata(source) {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(Error::Io(e)),
        }
    }

    fn create_block_node(&self, chroot: &Path, source: &Path, uid: u32) -> Result<PathBuf> {
        let meta = fs::metadata(source).map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                Error::BackendNotFound {
                    path: source.to_path_buf(),
                }
            } else {
                Error::Io(e)
            }
        })?;
        if !meta.file_type().is_block_device() {
            return Err(Error::validation(
                format!("backend '{}'", source.display()),
                "not a block device",
            ));
        }

        let target = chroot_path(chroot, source);
        let host_err = |e: io::Error| Error::host(format!("node {}", target.display()), e.to_string());

        if let Ok(existing) = fs::symlink_metadata(&target) {
            if existing.file_type().is_block_device() && existing.rdev() == meta.rdev() {
                return Ok(target);
            }
            fs::remove_file(&target).map_err(host_err)?;
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(host_err)?;
        }
        mknod_block(&target, meta.rdev()).map_err(host_err)?;
        std::os::unix::fs::chown(&target, Some(uid), Some(uid)).map_err(host_err)?;

        tracing::debug!(node = %target.display(), uid, "block node created");
        Ok(target)
    }

    fn remove_node(&self, chroot: &Path, source: &Path) -> Result<()> {
        let target = chroot_path(chroot, source);
        match fs::remove_file(&target) {
            Ok(()) => {
                tracing::debug!(node = %target.display(), "block node removed");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::host(format!("node {}", target.display()), e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_regular_file_is_not_a_block_device() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("disk.img");
        fs::write(&source, b"").unwrap();

        let err = ChrootNodes
            .create_block_node(&dir.path().join("chroot"), &source, 1000)
            .unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
    }

    #[test]
    fn test_missing_source() {
        let dir = tempfile::tempdir().unwrap();
        let err = ChrootNodes
            .create_block_node(dir.path(), Path::new("/dev/vmplug-missing"), 1000)
            .unwrap_err();
        assert!(matches!(err, Error::BackendNotFound { .. }));
    }

    #[test]
    fn test_remove_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let chroot = dir.path();
        let node = chroot.join("dev/sdb");
        fs::create_dir_all(node.parent().unwrap()).unwrap();
        fs::write(&node, b"").unwrap();

        ChrootNodes.remove_node(chroot, Path::new("/dev/sdb")).unwrap();
        assert!(!node.exists());
        ChrootNodes.remove_node(chroot, Path::new("/dev/sdb")).unwrap();
    }
}
