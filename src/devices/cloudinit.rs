//! Cloud-init seed drive.

use crate::backend::Backend;
use crate::error::Result;
use serde::{Deserialize, Serialize};

driver_enum! {
    /// How the seed image is presented to the guest.
    CloudInitDriver, "cloud-init drive" {
        /// Read-only IDE cdrom.
        IdeCd => "ide-cd",
        /// Floppy disk.
        Floppy => "floppy",
    }
}

impl Default for CloudInitDriver {
    fn default() -> Self {
        CloudInitDriver::IdeCd
    }
}

/// Seed image a guest provisioning tool reads on first boot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloudInitDrive {
    media: Backend,
    #[serde(default)]
    driver: CloudInitDriver,
}

impl CloudInitDrive {
    /// Drive id.
    pub const DRIVE_ID: &'static str = "drive_cloudinit";

    /// Device id.
    pub const QDEV_ID: &'static str = "cloudinit";

    /// Create a drive for an already resolved backend.
    pub fn new(media: Backend) -> Self {
        Self {
            media,
            driver: CloudInitDriver::default(),
        }
    }

    /// Seed image.
    pub fn media(&self) -> &Backend {
        &self.media
    }

    /// Presentation driver.
    pub fn driver(&self) -> CloudInitDriver {
        self.driver
    }

    /// Set the driver by name.
    pub fn set_driver(&mut self, driver: &str) -> Result<()> {
        self.driver = driver.parse()?;
        Ok(())
    }

    pub(crate) fn set_media(&mut self, media: Backend) {
        self.media = media;
    }

    /// Command-line arguments attaching the drive.
    pub fn args(&self) -> Vec<String> {
        match self.driver {
            CloudInitDriver::IdeCd => vec![
                "-drive".to_string(),
                format!(
                    "file={},if=none,id={},media=cdrom,readonly=on,format=raw",
                    self.media.full_path(),
                    Self::DRIVE_ID
                ),
                "-device".to_string(),
                format!("ide-cd,drive={},id={}", Self::DRIVE_ID, Self::QDEV_ID),
            ],
            CloudInitDriver::Floppy => vec![
                "-drive".to_string(),
                format!(
                    "file={},if=floppy,id={},readonly=on,format=raw",
                    self.media.full_path(),
                    Self::DRIVE_ID
                ),
            ],
        }
    }
}
