//! vsock device.

use super::{DeviceAddr, DeviceSpec};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Smallest context id a guest may use; 0 to 2 are reserved.
pub const MIN_GUEST_CID: u32 = 3;

/// vhost-vsock device.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct VsockDevice {
    /// Guest context id; 0 picks the owning uid.
    #[serde(default)]
    cid: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    addr: Option<DeviceAddr>,
}

impl VsockDevice {
    /// Create a vsock device.
    pub fn new(cid: u32) -> Result<Self> {
        if cid != 0 && cid < MIN_GUEST_CID {
            return Err(Error::validation(
                "vsock",
                format!("context id {} is reserved", cid),
            ));
        }
        Ok(Self { cid, addr: None })
    }

    /// Configured context id, 0 for automatic.
    pub fn cid(&self) -> u32 {
        self.cid
    }

    /// Bus address, if pinned.
    pub fn addr(&self) -> Option<&DeviceAddr> {
        self.addr.as_ref()
    }

    /// Set the PCI slot.
    pub fn set_addr(&mut self, addr: Option<&str>) -> Result<()> {
        let addr = addr
            .map(str::trim)
            .filter(|a| !a.is_empty())
            .map(str::parse::<DeviceAddr>)
            .transpose()?;
        if let Some(DeviceAddr::Scsi(_)) = addr {
            return Err(Error::validation("vsock", "address must be a pci slot"));
        }
        self.addr = addr;
        Ok(())
    }

    /// Context id the guest gets when owned by `uid`.
    pub fn guest_cid(&self, uid: u32) -> Result<u32> {
        let cid = if self.cid == 0 { uid } else { self.cid };
        if cid < MIN_GUEST_CID {
            return Err(Error::validation(
                "vsock",
                format!("context id {} is reserved", cid),
            ));
        }
        Ok(cid)
    }

    /// Front-end device definition.
    pub fn device_spec(&self, uid: u32) -> Result<DeviceSpec> {
        Ok(DeviceSpec::new("vhost-vsock-pci")
            .prop("id", "vsock0")
            .prop("guest-cid", self.guest_cid(uid)?)
            .opt_prop(
                "addr",
                self.addr
                    .as_ref()
                    .and_then(DeviceAddr::pci_slot)
                    .map(|slot| format!("0x{:02x}", slot)),
            ))
    }
}
