//! PCI devices through sysfs.

use super::{PciBus, PciDevice};
use crate::devices::PciAddress;
use crate::error::{Error, Result};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// PCI access under `{sysfs}/bus/pci`.
#[derive(Debug, Clone)]
pub struct SysfsPci {
    bus_dir: PathBuf,
}

impl SysfsPci {
    /// Use the sysfs mounted at `sysfs_root`.
    pub fn new(sysfs_root: &Path) -> Self {
        Self {
            bus_dir: sysfs_root.join("bus").join("pci"),
        }
    }

    fn device_dir(&self, addr: &PciAddress) -> PathBuf {
        self.bus_dir.join("devices").join(addr.to_string())
    }

    fn addresses(&self) -> Result<Vec<PciAddress>> {
        let mut addrs: Vec<PciAddress> = fs::read_dir(self.bus_dir.join("devices"))?
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.file_name().to_str().and_then(|n| n.parse().ok()))
            .collect();
        addrs.sort();
        Ok(addrs)
    }
}

fn read_hex(path: &Path) -> u16 {
    fs::read_to_string(path)
        .ok()
        .and_then(|s| u16::from_str_radix(s.trim().trim_start_matches("0x"), 16).ok())
        .unwrap_or(0)
}

fn host_err(addr: &PciAddress, e: io::Error) -> Error {
    Error::host(format!("pci device {}", addr), e.to_string())
}

impl PciBus for SysfsPci {
    fn lookup(&self, addr: &PciAddress) -> Result<PciDevice> {
        let dir = self.device_dir(addr);
        if !dir.is_dir() {
            return Err(Error::NotFound(format!("pci device {}", addr)));
        }

        let enabled = fs::read_to_string(dir.join("enable"))
            .map(|s| s.trim() == "1")
            .unwrap_or(false);
        let driver = fs::read_link(dir.join("driver"))
            .ok()
            .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()));

        let subdevices = if addr.function == 0 {
            self.addresses()?
                .into_iter()
                .filter(|other| other.same_device(addr) && other.function != 0)
                .collect()
        } else {
            Vec::new()
        };

        Ok(PciDevice {
            addr: *addr,
            enabled,
            driver,
            subdevices,
            vendor: read_hex(&dir.join("vendor")),
            device: read_hex(&dir.join("device")),
        })
    }

    fn devices(&self) -> Result<Vec<PciDevice>> {
        self.addresses()?.iter().map(|a| self.lookup(a)).collect()
    }

    fn assign_driver(&self, addr: &PciAddress, driver: &str) -> Result<()> {
        let current = self.lookup(addr)?;
        if current.driver.as_deref() == Some(driver) {
            return Ok(());
        }

        let dir = self.device_dir(addr);
        let name = addr.to_string();
        fs::write(dir.join("driver_override"), driver).map_err(|e| host_err(addr, e))?;
        if current.driver.is_some() {
            fs::write(dir.join("driver").join("unbind"), &name).map_err(|e| host_err(addr, e))?;
        }
        fs::write(self.bus_dir.join("drivers_probe"), &name).map_err(|e| host_err(addr, e))?;

        tracing::info!(device = %name, driver, "pci driver assigned");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::symlink;

    fn fake_device(root: &Path, addr: &str, driver: Option<&str>) {
        let dir = root.join("bus/pci/devices").join(addr);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("enable"), "1\n").unwrap();
        fs::write(dir.join("vendor"), "0x10de\n").unwrap();
        fs::write(dir.join("device"), "0x1b80\n").unwrap();
        if let Some(driver) = driver {
            let driver_dir = root.join("bus/pci/drivers").join(driver);
            fs::create_dir_all(&driver_dir).unwrap();
            symlink(&driver_dir, dir.join("driver")).unwrap();
        }
    }

    #[test]
    fn test_lookup_with_subfunctions() {
        let root = tempfile::tempdir().unwrap();
        fake_device(root.path(), "0000:01:00.0", Some("nouveau"));
        fake_device(root.path(), "0000:01:00.1", Some("snd_hda_intel"));
        fake_device(root.path(), "0000:02:00.0", None);

        let pci = SysfsPci::new(root.path());
        let gpu = pci.lookup(&"01:00.0".parse().unwrap()).unwrap();
        assert!(gpu.enabled);
        assert_eq!(gpu.driver.as_deref(), Some("nouveau"));
        assert_eq!(gpu.vendor, 0x10de);
        assert_eq!(gpu.subdevices, vec!["0000:01:00.1".parse::<PciAddress>().unwrap()]);
        assert_eq!(gpu.to_string(), "0000:01:00.0 [10de:1b80] (nouveau)");

        assert_eq!(pci.devices().unwrap().len(), 3);
        assert!(matches!(
            pci.lookup(&"05:00.0".parse().unwrap()),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_assign_driver_writes_override_and_unbinds() {
        let root = tempfile::tempdir().unwrap();
        fake_device(root.path(), "0000:01:00.0", Some("nouveau"));

        let pci = SysfsPci::new(root.path());
        pci.assign_driver(&"01:00.0".parse().unwrap(), "vfio-pci").unwrap();

        let dev = root.path().join("bus/pci/devices/0000:01:00.0");
        assert_eq!(fs::read_to_string(dev.join("driver_override")).unwrap(), "vfio-pci");
        assert_eq!(
            fs::read_to_string(root.path().join("bus/pci/drivers/nouveau/unbind")).unwrap(),
            "0000:01:00.0"
        );
        assert_eq!(
            fs::read_to_string(root.path().join("bus/pci/drivers_probe")).unwrap(),
            "0000:01:00.0"
        );
    }
}
