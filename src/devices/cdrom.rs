//! Removable-media drives.

use super::disk::{check_addr, place, scsi_controller, Bus, BusKind};
use super::{subject, validate_id_part, DeviceAddr, DeviceSpec, DRIVE_PREFIX};
use crate::backend::Backend;
use crate::error::Result;
use crate::pool::Keyed;
use serde::{Deserialize, Serialize};

/// Prefix of every cdrom device id.
pub const CDROM_PREFIX: &str = "cdrom_";

driver_enum! {
    /// Cdrom front-end driver.
    CdromDriver, "cdrom" {
        /// Drive on the built-in IDE controller.
        IdeCd => "ide-cd",
        /// Drive on a virtio-scsi controller.
        ScsiCd => "scsi-cd",
    }
}

impl Default for CdromDriver {
    fn default() -> Self {
        CdromDriver::IdeCd
    }
}

impl CdromDriver {
    /// Whether the drive sits on a SCSI controller.
    pub fn is_scsi(&self) -> bool {
        matches!(self, CdromDriver::ScsiCd)
    }
}

impl BusKind for CdromDriver {
    fn bus(&self) -> Bus {
        match self {
            CdromDriver::IdeCd => Bus::Ide,
            CdromDriver::ScsiCd => Bus::Scsi,
        }
    }
}

/// A named removable-media drive, possibly empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cdrom {
    name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    media: Option<Backend>,
    #[serde(default)]
    driver: CdromDriver,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    addr: Option<DeviceAddr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    bootindex: Option<u32>,
}

impl Keyed for Cdrom {
    const KIND: &'static str = "cdrom";

    fn key(&self) -> String {
        self.name.clone()
    }
}

impl Cdrom {
    /// Create an empty drive with the default driver.
    pub fn new(name: &str) -> Result<Self> {
        let cdrom = Self {
            name: name.trim().to_string(),
            media: None,
            driver: CdromDriver::default(),
            addr: None,
            bootindex: None,
        };
        cdrom.validate()?;
        Ok(cdrom)
    }

    /// Create a drive with media inserted.
    pub fn with_media(name: &str, media: &str) -> Result<Self> {
        let mut cdrom = Self::new(name)?;
        cdrom.set_media(Some(media))?;
        Ok(cdrom)
    }

    /// Drive name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Inserted medium.
    pub fn media(&self) -> Option<&Backend> {
        self.media.as_ref()
    }

    /// Front-end driver.
    pub fn driver(&self) -> CdromDriver {
        self.driver
    }

    /// Bus address, if pinned.
    pub fn addr(&self) -> Option<&DeviceAddr> {
        self.addr.as_ref()
    }

    /// Boot order.
    pub fn bootindex(&self) -> Option<u32> {
        self.bootindex
    }

    /// Device id, `cdrom_<name>`.
    pub fn qdev_id(&self) -> String {
        format!("{}{}", CDROM_PREFIX, self.name)
    }

    /// Drive id, `drive_cdrom_<name>`.
    pub fn drive_id(&self) -> String {
        format!("{}{}", DRIVE_PREFIX, self.qdev_id())
    }

    fn subject(&self) -> String {
        subject(Self::KIND, &self.name)
    }

    /// Replace the medium; `None` ejects it.
    ///
    /// A new backend value is built from the path; the old one is dropped.
    pub fn set_media(&mut self, media: Option<&str>) -> Result<()> {
        self.media = media
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .map(Backend::new)
            .transpose()?;
        Ok(())
    }

    pub(crate) fn replace_media(&mut self, media: Option<Backend>) {
        self.media = media;
    }

    /// Set the driver by name.
    pub fn set_driver(&mut self, driver: &str) -> Result<()> {
        let driver: CdromDriver = driver.parse()?;
        check_addr(&self.subject(), driver, self.addr.as_ref())?;
        self.driver = driver;
        Ok(())
    }

    /// Set the bus address.
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

    /// Check fields read from disk.
    pub fn validate(&self) -> Result<()> {
        validate_id_part(&self.subject(), &self.name)?;
        check_addr(&self.subject(), self.driver, self.addr.as_ref())
    }

    /// SCSI controller this drive needs.
    pub fn scsi_controller(&self) -> Option<(String, Option<u8>)> {
        scsi_controller(self.driver.is_scsi(), self.addr.as_ref())
    }

    /// `-drive` / `drive_add` options.
    pub fn drive_args(&self) -> String {
        match &self.media {
            Some(media) => {
                let mut args = format!(
                    "file={},if=none,id={},media=cdrom,readonly=on",
                    media.full_path(),
                    self.drive_id()
                );
                if media.is_block_device() {
                    args.push_str(",format=raw");
                }
                args
            }
            None => format!("if=none,id={},media=cdrom,readonly=on", self.drive_id()),
        }
    }

    /// Front-end device definition.
    pub fn device_spec(&self) -> DeviceSpec {
        let spec = DeviceSpec::new(self.driver.as_str())
            .prop("drive", self.drive_id())
            .prop("id", self.qdev_id());
        place(spec, self.driver.is_scsi(), self.addr.as_ref()).opt_prop("bootindex", self.bootindex)
    }
}
