//! Machine (chipset) type.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Chipset the hypervisor emulates. Only i440fx is implemented.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MachineType(String);

impl Default for MachineType {
    fn default() -> Self {
        MachineType("pc".to_string())
    }
}

impl MachineType {
    /// Parse a machine type name.
    ///
    /// QOM type names (`pc-i440fx-6.2-machine`) are accepted as well.
    pub fn new(name: &str) -> Result<Self> {
        let name = name.trim();
        let name = name.strip_suffix("-machine").unwrap_or(name);
        if name == "q35" || name.starts_with("pc-q35") {
            return Err(Error::Unsupported(format!("machine type {}", name)));
        }
        if name != "pc" && !name.starts_with("pc-i440fx") {
            return Err(Error::validation(
                "machine type",
                format!("unknown machine type: {}", name),
            ));
        }
        Ok(MachineType(name.to_string()))
    }

    /// Machine type name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MachineType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_i440fx_variants() {
        assert_eq!(MachineType::new("pc").unwrap().as_str(), "pc");
        assert_eq!(
            MachineType::new("pc-i440fx-6.2-machine").unwrap().as_str(),
            "pc-i440fx-6.2"
        );
    }

    #[test]
    fn test_q35_is_unsupported() {
        assert!(matches!(MachineType::new("q35"), Err(Error::Unsupported(_))));
        assert!(matches!(
            MachineType::new("pc-q35-7.1"),
            Err(Error::Unsupported(_))
        ));
        assert!(matches!(
            MachineType::new("virt"),
            Err(Error::Validation { .. })
        ));
    }
}
