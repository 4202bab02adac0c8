//! procfs lookups.

use crate::error::{Error, Result};
use std::path::Path;

/// Thread group (process) id owning thread `tid`.
pub fn thread_group_id(proc_root: &Path, tid: u32) -> Result<u32> {
    let path = proc_root.join(tid.to_string()).join("status");
    let status = std::fs::read_to_string(&path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            Error::NotFound(format!("thread {}", tid))
        } else {
            Error::Io(e)
        }
    })?;

    status
        .lines()
        .find_map(|line| line.strip_prefix("Tgid:"))
        .and_then(|v| v.trim().parse().ok())
        .ok_or_else(|| Error::Protocol(format!("no Tgid in {}", path.display())))
}
