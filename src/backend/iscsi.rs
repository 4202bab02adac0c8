//! iSCSI backend.

use super::sanitize;
use crate::error::{Error, Result};

pub(super) const SCHEME: &str = "iscsi://";

/// A logical unit addressed as
/// `iscsi://[user[%password]@]host[:port]/target/lun`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IscsiTarget {
    uri: String,
    host: String,
    target: String,
    lun: u32,
    base: String,
}

impl IscsiTarget {
    /// Parse an iSCSI URI.
    pub fn new(uri: &str) -> Result<Self> {
        let invalid = |why: &str| Error::validation("backend", format!("{}: {}", why, uri));

        let rest = uri.strip_prefix(SCHEME).ok_or_else(|| invalid("not an iscsi uri"))?;
        let (authority, path) = rest
            .split_once('/')
            .ok_or_else(|| invalid("missing target"))?;
        let host = authority.rsplit('@').next().unwrap_or(authority);
        if host.is_empty() {
            return Err(invalid("missing host"));
        }

        let (target, lun) = path
            .trim_end_matches('/')
            .rsplit_once('/')
            .ok_or_else(|| invalid("missing lun"))?;
        if target.is_empty() {
            return Err(invalid("missing target"));
        }
        let lun: u32 = lun.parse().map_err(|_| invalid("lun must be a number"))?;

        Ok(Self {
            uri: uri.to_string(),
            host: host.to_string(),
            target: target.to_string(),
            lun,
            base: format!("{}-{}", sanitize(target), lun),
        })
    }

    /// Full URI.
    pub fn full_path(&self) -> &str {
        &self.uri
    }

    /// Target name and lun joined into an id-safe name.
    pub fn base_name(&self) -> &str {
        &self.base
    }

    /// Portal host (with optional port).
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Target IQN.
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Logical unit number.
    pub fn lun(&self) -> u32 {
        self.lun
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_uri() {
        let t = IscsiTarget::new("iscsi://user%secret@10.0.0.5:3260/iqn.2020-01.com.example:storage/3")
            .unwrap();
        assert_eq!(t.host(), "10.0.0.5:3260");
        assert_eq!(t.target(), "iqn.2020-01.com.example:storage");
        assert_eq!(t.lun(), 3);
        assert_eq!(t.base_name(), "iqn.2020-01.com.example-storage-3");
    }

    #[test]
    fn test_simple_uri() {
        let t = IscsiTarget::new("iscsi://host/target/0").unwrap();
        assert_eq!(t.base_name(), "target-0");
    }

    #[test]
    fn test_rejects_malformed() {
        assert!(IscsiTarget::new("iscsi://host").is_err());
        assert!(IscsiTarget::new("iscsi://host/target").is_err());
        assert!(IscsiTarget::new("iscsi:///target/1").is_err());
        assert!(IscsiTarget::new("iscsi://host/target/x").is_err());
    }
}
