//! Virtual disks.

use super::{subject, validate_id_part, DeviceAddr, DeviceSpec, DEFAULT_SCSI_BUS};
use crate::backend::Backend;
use crate::error::{Error, Result};
use crate::pool::Keyed;
use serde::{Deserialize, Serialize};

/// Prefix of every drive (block backend) id.
pub const DRIVE_PREFIX: &str = "drive_";

driver_enum! {
    /// Disk front-end driver.
    DiskDriver, "disk" {
        /// virtio block device on the root PCI bus.
        VirtioBlk => "virtio-blk-pci",
        /// Disk on a virtio-scsi controller.
        ScsiHd => "scsi-hd",
        /// Disk on the built-in IDE controller.
        IdeHd => "ide-hd",
    }
}

impl Default for DiskDriver {
    fn default() -> Self {
        DiskDriver::VirtioBlk
    }
}

impl DiskDriver {
    /// Whether the disk sits on a SCSI controller.
    pub fn is_scsi(&self) -> bool {
        matches!(self, DiskDriver::ScsiHd)
    }
}

fn is_zero(v: &u64) -> bool {
    *v == 0
}

/// A virtual disk backed by a [`Backend`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Disk {
    path: Backend,
    #[serde(default)]
    driver: DiskDriver,
    #[serde(default, skip_serializing_if = "is_zero")]
    iops_rd: u64,
    #[serde(default, skip_serializing_if = "is_zero")]
    iops_wr: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    addr: Option<DeviceAddr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    bootindex: Option<u32>,
    #[serde(skip)]
    has_bitmap: bool,
}

impl Keyed for Disk {
    const KIND: &'static str = "disk";

    fn key(&self) -> String {
        self.path.base_name().to_string()
    }
}

impl Disk {
    /// Create a disk with the default driver.
    pub fn new(path: &str) -> Result<Self> {
        let disk = Self {
            path: Backend::new(path)?,
            driver: DiskDriver::default(),
            iops_rd: 0,
            iops_wr: 0,
            addr: None,
            bootindex: None,
            has_bitmap: false,
        };
        disk.validate()?;
        Ok(disk)
    }

    /// Storage backend.
    pub fn backend(&self) -> &Backend {
        &self.path
    }

    /// Front-end driver.
    pub fn driver(&self) -> DiskDriver {
        self.driver
    }

    /// Read IOPS limit, 0 for unlimited.
    pub fn iops_rd(&self) -> u64 {
        self.iops_rd
    }

    /// Write IOPS limit, 0 for unlimited.
    pub fn iops_wr(&self) -> u64 {
        self.iops_wr
    }

    /// Bus address, if pinned.
    pub fn addr(&self) -> Option<&DeviceAddr> {
        self.addr.as_ref()
    }

    /// Boot order.
    pub fn bootindex(&self) -> Option<u32> {
        self.bootindex
    }

    /// Whether a dirty bitmap is attached to the drive.
    pub fn has_bitmap(&self) -> bool {
        self.has_bitmap
    }

    /// Device id, `blk_<basename>`.
    pub fn qdev_id(&self) -> String {
        self.path.qdev_id()
    }

    /// Drive id, `drive_<basename>`.
    pub fn drive_id(&self) -> String {
        format!("{}{}", DRIVE_PREFIX, self.path.base_name())
    }

    fn subject(&self) -> String {
        subject(Self::KIND, self.path.base_name())
    }

    /// Set the driver by name.
    pub fn set_driver(&mut self, driver: &str) -> Result<()> {
        let driver: DiskDriver = driver.parse()?;
        check_addr(&self.subject(), driver, self.addr.as_ref())?;
        self.driver = driver;
        Ok(())
    }

    /// Set the bus address; `None` lets the hypervisor pick.
    pub fn set_addr(&mut self, addr: Option<&str>) -> Result<()> {
        let addr = addr
            .map(str::trim)
            .filter(|a| !a.is_empty())
            .map(str::parse::<DeviceAddr>)
            .transpose()?;
        check_addr(&self.subject(), self.driver, addr.as_ref())?;
        self.addr = addr;
        Ok(())
    }

    /// Set the boot order.
    pub fn set_bootindex(&mut self, bootindex: Option<u32>) {
        self.bootindex = bootindex;
    }

    /// Set both IOPS limits.
    pub fn set_iops(&mut self, rd: u64, wr: u64) {
        self.iops_rd = rd;
        self.iops_wr = wr;
    }

    pub(crate) fn set_has_bitmap(&mut self, has_bitmap: bool) {
        self.has_bitmap = has_bitmap;
    }

    /// Check fields read from disk.
    pub fn validate(&self) -> Result<()> {
        validate_id_part(&self.subject(), self.path.base_name())?;
        check_addr(&self.subject(), self.driver, self.addr.as_ref())
    }

    /// SCSI controller this disk needs: bus id and optional slot.
    pub fn scsi_controller(&self) -> Option<(String, Option<u8>)> {
        scsi_controller(self.driver.is_scsi(), self.addr.as_ref())
    }

    /// `-drive` / `drive_add` options.
    pub fn drive_args(&self) -> String {
        let mut args = format!(
            "file={},if=none,id={},cache=none,aio=native",
            self.path.full_path(),
            self.drive_id()
        );
        if self.path.is_block_device() {
            args.push_str(",format=raw");
        }
        if self.iops_rd > 0 {
            args.push_str(&format!(",throttling.iops-read={}", self.iops_rd));
        }
        if self.iops_wr > 0 {
            args.push_str(&format!(",throttling.iops-write={}", self.iops_wr));
        }
        args
    }

    /// Front-end device definition.
    pub fn device_spec(&self) -> DeviceSpec {
        let spec = DeviceSpec::new(self.driver.as_str())
            .prop("drive", self.drive_id())
            .prop("id", self.qdev_id());
        let spec = place(spec, self.driver.is_scsi(), self.addr.as_ref());
        spec.opt_prop("bootindex", self.bootindex)
    }
}

/// Check that an address suits the bus the driver sits on.
pub(super) fn check_addr(subject: &str, driver: impl BusKind, addr: Option<&DeviceAddr>) -> Result<()> {
    match (addr, driver.bus()) {
        (None, _) => Ok(()),
        (Some(DeviceAddr::Pci(_)), Bus::Pci) | (Some(DeviceAddr::Scsi(_)), Bus::Scsi) => Ok(()),
        (Some(addr), bus) => Err(Error::validation(
            subject,
            format!("address {} does not fit a {} device", addr, bus.name()),
        )),
    }
}

/// Bus a front-end driver attaches to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Bus {
    Pci,
    Scsi,
    Ide,
}

impl Bus {
    fn name(&self) -> &'static str {
        match self {
            Bus::Pci => "pci",
            Bus::Scsi => "scsi",
            Bus::Ide => "ide",
        }
    }
}

pub(super) trait BusKind {
    fn bus(&self) -> Bus;
}

impl BusKind for DiskDriver {
    fn bus(&self) -> Bus {
        match self {
            DiskDriver::VirtioBlk => Bus::Pci,
            DiskDriver::ScsiHd => Bus::Scsi,
            DiskDriver::IdeHd => Bus::Ide,
        }
    }
}

pub(super) fn scsi_controller(is_scsi: bool, addr: Option<&DeviceAddr>) -> Option<(String, Option<u8>)> {
    if !is_scsi {
        return None;
    }
    match addr.and_then(DeviceAddr::scsi) {
        Some(a) => Some((a.bus.clone(), Some(a.slot))),
        None => Some((DEFAULT_SCSI_BUS.to_string(), None)),
    }
}

pub(super) fn place(spec: DeviceSpec, is_scsi: bool, addr: Option<&DeviceAddr>) -> DeviceSpec {
    if is_scsi {
        let bus = addr
            .and_then(DeviceAddr::scsi)
            .map(|a| a.bus.as_str())
            .unwrap_or(DEFAULT_SCSI_BUS);
        let spec = spec.prop("bus", format!("{}.0", bus));
        return spec.opt_prop("lun", addr.and_then(DeviceAddr::scsi).map(|a| a.lun));
    }
    spec.opt_prop(
        "addr",
        addr.and_then(DeviceAddr::pci_slot).map(|slot| format!("0x{:02x}", slot)),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_driver_and_ids() {
        let disk = Disk::new("/data/vm1.img").unwrap();
        assert_eq!(disk.driver(), DiskDriver::VirtioBlk);
        assert_eq!(disk.qdev_id(), "blk_vm1.img");
        assert_eq!(disk.drive_id(), "drive_vm1.img");
        assert_eq!(disk.key(), "vm1.img");
    }

    #[test]
    fn test_unknown_driver_rejected() {
        let mut disk = Disk::new("/data/vm1.img").unwrap();
        let err = disk.set_driver("virtio-foo").unwrap_err();
        assert!(err.to_string().contains("unknown driver: virtio-foo"));
        assert_eq!(disk.driver(), DiskDriver::VirtioBlk);
    }

    #[test]
    fn test_address_must_fit_driver() {
        let mut disk = Disk::new("/dev/vg0/data").unwrap();
        disk.set_addr(Some("0x0a")).unwrap();
        assert!(disk.set_driver("scsi-hd").is_err());

        disk.set_addr(None).unwrap();
        disk.set_driver("scsi-hd").unwrap();
        disk.set_addr(Some("scsi1:0x06/2")).unwrap();
        let err = disk.set_addr(Some("0x0b")).unwrap_err();
        assert!(err.to_string().starts_with("disk 'data' validation error"));
    }

    #[test]
    fn test_scsi_device_spec() {
        let mut disk = Disk::new("/dev/vg0/data").unwrap();
        disk.set_driver("scsi-hd").unwrap();
        assert_eq!(disk.scsi_controller(), Some(("scsi0".to_string(), None)));
        assert_eq!(
            disk.device_spec().to_arg(),
            "scsi-hd,drive=drive_data,id=blk_data,bus=scsi0.0"
        );

        disk.set_addr(Some("scsi1:0x06/2")).unwrap();
        disk.set_bootindex(Some(1));
        assert_eq!(disk.scsi_controller(), Some(("scsi1".to_string(), Some(6))));
        assert_eq!(
            disk.device_spec().to_arg(),
            "scsi-hd,drive=drive_data,id=blk_data,bus=scsi1.0,lun=2,bootindex=1"
        );
    }

    #[test]
    fn test_drive_args() {
        let mut disk = Disk::new("/dev/sdb").unwrap();
        disk.set_iops(100, 50);
        assert_eq!(
            disk.drive_args(),
            "file=/dev/sdb,if=none,id=drive_sdb,cache=none,aio=native,format=raw,\
             throttling.iops-read=100,throttling.iops-write=50"
        );
    }

    #[test]
    fn test_json_skips_runtime_fields() {
        let mut disk = Disk::new("/data/vm1.img").unwrap();
        disk.set_has_bitmap(true);
        let json = serde_json::to_string(&disk).unwrap();
        assert_eq!(json, r#"{"path":"/data/vm1.img","driver":"virtio-blk-pci"}"#);

        let back: Disk = serde_json::from_str(&json).unwrap();
        assert!(!back.has_bitmap());
        assert_eq!(back.backend(), disk.backend());
    }
}
