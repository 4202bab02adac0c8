//! NBD backend.

use super::sanitize;
use crate::error::{Error, Result};

pub(super) const SCHEME: &str = "nbd://";

/// An export addressed as `nbd://host[:port]/export`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NbdExport {
    uri: String,
    host: String,
    export: String,
    base: String,
}

impl NbdExport {
    /// Parse an NBD URI.
    pub fn new(uri: &str) -> Result<Self> {
        let invalid = |why: &str| Error::validation("backend", format!("{}: {}", why, uri));

        let rest = uri.strip_prefix(SCHEME).ok_or_else(|| invalid("not an nbd uri"))?;
        let (host, export) = rest
            .split_once('/')
            .ok_or_else(|| invalid("missing export name"))?;
        if host.is_empty() {
            return Err(invalid("missing host"));
        }
        let export = export.trim_matches('/');
        if export.is_empty() {
            return Err(invalid("missing export name"));
        }

        Ok(Self {
            uri: uri.to_string(),
            host: host.to_string(),
            export: export.to_string(),
            base: sanitize(export),
        })
    }

    /// Full URI.
    pub fn full_path(&self) -> &str {
        &self.uri
    }

    /// Export name in id-safe form.
    pub fn base_name(&self) -> &str {
        &self.base
    }

    /// Server host (with optional port).
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Export name.
    pub fn export(&self) -> &str {
        &self.export
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse() {
        let e = NbdExport::new("nbd://192.168.1.10:10809/vm1-root").unwrap();
        assert_eq!(e.host(), "192.168.1.10:10809");
        assert_eq!(e.export(), "vm1-root");
        assert_eq!(e.base_name(), "vm1-root");
    }

    #[test]
    fn test_nested_export_name_is_sanitized() {
        let e = NbdExport::new("nbd://host/pool/disk0").unwrap();
        assert_eq!(e.export(), "pool/disk0");
        assert_eq!(e.base_name(), "pool-disk0");
    }

    #[test]
    fn test_rejects_missing_parts() {
        assert!(NbdExport::new("nbd://host").is_err());
        assert!(NbdExport::new("nbd://host/").is_err());
        assert!(NbdExport::new("nbd:///export").is_err());
    }
}
