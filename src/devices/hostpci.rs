//! PCI passthrough devices.

use crate::error::{Error, Result};
use crate::pool::Keyed;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// A normalized `domain:bus:device.function` address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PciAddress {
    /// PCI domain (segment).
    pub domain: u16,
    /// Bus number.
    pub bus: u8,
    /// Device number, at most `0x1f`.
    pub device: u8,
    /// Function number, at most 7.
    pub function: u8,
}

impl PciAddress {
    /// Same device, different function.
    pub fn with_function(&self, function: u8) -> Self {
        Self { function, ..*self }
    }

    /// Whether both addresses name functions of one physical device.
    pub fn same_device(&self, other: &PciAddress) -> bool {
        self.domain == other.domain && self.bus == other.bus && self.device == other.device
    }
}

impl FromStr for PciAddress {
    type Err = Error;

    /// Accepts `dddd:bb:dd.f`, a short domain (`1:03:00.0`) or no
    /// domain (`03:00.0`, domain 0).
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let invalid = |why: &str| Error::validation("pci address", format!("{}: {}", why, s));

        let parts: Vec<&str> = s.split(':').collect();
        let (domain, bus, slot) = match parts.as_slice() {
            [domain, bus, slot] => (*domain, *bus, *slot),
            [bus, slot] => ("0", *bus, *slot),
            _ => return Err(invalid("expected [domain:]bus:device.function")),
        };
        let (device, function) = slot
            .split_once('.')
            .ok_or_else(|| invalid("missing function"))?;

        let hex = |field: &str, max: u32, what: &str| -> Result<u32> {
            if field.is_empty() || field.len() > 4 {
                return Err(invalid(what));
            }
            match u32::from_str_radix(field, 16) {
                Ok(v) if v <= max => Ok(v),
                _ => Err(invalid(what)),
            }
        };

        Ok(PciAddress {
            domain: hex(domain, 0xffff, "invalid domain")? as u16,
            bus: hex(bus, 0xff, "invalid bus")? as u8,
            device: hex(device, 0x1f, "invalid device")? as u8,
            function: hex(function, 0x7, "invalid function")? as u8,
        })
    }
}

impl fmt::Display for PciAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04x}:{:02x}:{:02x}.{:x}",
            self.domain, self.bus, self.device, self.function
        )
    }
}

impl Serialize for PciAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for PciAddress {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Host PCI device passed through to the guest.
///
/// This is a reference only; the sysfs device is resolved at use time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostDevice {
    addr: PciAddress,
    #[serde(default)]
    multifunction: bool,
    #[serde(default)]
    primary_gpu: bool,
}

impl Keyed for HostDevice {
    const KIND: &'static str = "host device";

    fn key(&self) -> String {
        self.addr.to_string()
    }
}

impl HostDevice {
    /// Reference the device at `addr`.
    pub fn new(addr: &str) -> Result<Self> {
        Ok(Self {
            addr: addr.parse()?,
            multifunction: false,
            primary_gpu: false,
        })
    }

    /// Host address.
    pub fn addr(&self) -> PciAddress {
        self.addr
    }

    /// Whether sibling functions are passed through with it.
    pub fn multifunction(&self) -> bool {
        self.multifunction
    }

    /// Whether the device is the guest's primary display.
    pub fn primary_gpu(&self) -> bool {
        self.primary_gpu
    }

    /// Pass sibling functions through in the same slot.
    pub fn set_multifunction(&mut self, multifunction: bool) -> Result<()> {
        let previous = self.multifunction;
        self.multifunction = multifunction;
        if let Err(e) = self.validate() {
            self.multifunction = previous;
            return Err(e);
        }
        Ok(())
    }

    /// Check fields read from disk.
    pub fn validate(&self) -> Result<()> {
        if self.multifunction && self.addr.function != 0 {
            return Err(Error::validation(
                format!("host device '{}'", self.addr),
                "multifunction requires function 0",
            ));
        }
        Ok(())
    }

    /// Mark the device as the primary display.
    pub fn set_primary_gpu(&mut self, primary_gpu: bool) {
        self.primary_gpu = primary_gpu;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_domain_is_normalized() {
        let addr: PciAddress = "1:03:00.0".parse().unwrap();
        assert_eq!(addr.to_string(), "0001:03:00.0");

        let addr: PciAddress = "03:00.1".parse().unwrap();
        assert_eq!(addr.to_string(), "0000:03:00.1");
    }

    #[test]
    fn test_device_field_bounds() {
        assert!("0000:03:1f.0".parse::<PciAddress>().is_ok());
        assert!("0000:03:2f.0".parse::<PciAddress>().is_err());
        assert!("0000:03:00.8".parse::<PciAddress>().is_err());
        assert!("0000:100:00.0".parse::<PciAddress>().is_err());
        assert!("0000:03:00".parse::<PciAddress>().is_err());
        assert!("garbage".parse::<PciAddress>().is_err());
    }

    #[test]
    fn test_sibling_functions() {
        let gpu: PciAddress = "0000:01:00.0".parse().unwrap();
        let audio = gpu.with_function(1);
        assert_eq!(audio.to_string(), "0000:01:00.1");
        assert!(gpu.same_device(&audio));
    }

    #[test]
    fn test_key_is_normalized_address() {
        let dev = HostDevice::new("1:03:00.0").unwrap();
        assert_eq!(dev.key(), "0001:03:00.0");
    }

    #[test]
    fn test_multifunction_needs_function_zero() {
        let mut dev = HostDevice::new("0000:01:00.1").unwrap();
        assert!(dev.set_multifunction(true).is_err());
        let mut dev = HostDevice::new("0000:01:00.0").unwrap();
        dev.set_multifunction(true).unwrap();
        dev.set_primary_gpu(true);
        assert!(dev.multifunction() && dev.primary_gpu());
    }
}
