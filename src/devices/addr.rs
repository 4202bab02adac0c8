//! Device bus addresses.
//!
//! PCI devices on the root bus take a slot (`0x0a`). SCSI devices take
//! `bus:0xSS/lun`, where `bus` names the virtio-scsi controller, `0xSS`
//! is the controller's slot on the root bus and `lun` is decimal.

use crate::error::{Error, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Controller id used when a SCSI device names no bus.
pub const DEFAULT_SCSI_BUS: &str = "scsi0";

/// Highest device slot on a PCI bus.
const MAX_SLOT: u8 = 0x1f;

/// Address of a device on a SCSI controller.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ScsiAddr {
    /// Controller id.
    pub bus: String,
    /// Controller slot on the root PCI bus.
    pub slot: u8,
    /// Logical unit.
    pub lun: u32,
}

/// Negotiated bus address of a device.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DeviceAddr {
    /// Slot on the root PCI bus.
    Pci(u8),
    /// Position on a SCSI controller.
    Scsi(ScsiAddr),
}

impl DeviceAddr {
    /// PCI slot, if this is a PCI address.
    pub fn pci_slot(&self) -> Option<u8> {
        match self {
            DeviceAddr::Pci(slot) => Some(*slot),
            DeviceAddr::Scsi(_) => None,
        }
    }

    /// SCSI address, if this is one.
    pub fn scsi(&self) -> Option<&ScsiAddr> {
        match self {
            DeviceAddr::Pci(_) => None,
            DeviceAddr::Scsi(addr) => Some(addr),
        }
    }
}

pub(crate) fn parse_slot(s: &str) -> Result<u8> {
    let invalid = || Error::validation("address", format!("invalid pci slot: {}", s));
    let digits = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .ok_or_else(invalid)?;
    let slot = u8::from_str_radix(digits, 16).map_err(|_| invalid())?;
    if slot > MAX_SLOT {
        return Err(invalid());
    }
    Ok(slot)
}

impl FromStr for DeviceAddr {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let Some((bus, rest)) = s.split_once(':') else {
            return parse_slot(s).map(DeviceAddr::Pci);
        };

        let invalid = || Error::validation("address", format!("invalid scsi address: {}", s));
        let (slot, lun) = rest.split_once('/').ok_or_else(invalid)?;
        if bus.is_empty() || !bus.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(invalid());
        }
        Ok(DeviceAddr::Scsi(ScsiAddr {
            bus: bus.to_string(),
            slot: parse_slot(slot)?,
            lun: lun.parse().map_err(|_| invalid())?,
        }))
    }
}

impl fmt::Display for DeviceAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceAddr::Pci(slot) => write!(f, "0x{:02x}", slot),
            DeviceAddr::Scsi(a) => write!(f, "{}:0x{:02x}/{}", a.bus, a.slot, a.lun),
        }
    }
}

impl Serialize for DeviceAddr {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for DeviceAddr {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
