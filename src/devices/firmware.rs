//! Boot firmware.

use super::Disk;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Firmware image plus an optional writable flash (NVRAM) image.
///
/// The flash is a [`Disk`] so it reuses the backend machinery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Firmware {
    image: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    flash: Option<Disk>,
}

impl Firmware {
    /// Create a firmware entry.
    pub fn new(image: &str, flash: Option<&str>) -> Result<Self> {
        let image = image.trim();
        if image.is_empty() {
            return Err(Error::validation("firmware", "empty image path"));
        }
        let flash = flash
            .map(str::trim)
            .filter(|f| !f.is_empty())
            .map(Disk::new)
            .transpose()?;
        let firmware = Self {
            image: PathBuf::from(image),
            flash,
        };
        firmware.validate()?;
        Ok(firmware)
    }

    /// Firmware image.
    pub fn image(&self) -> &Path {
        &self.image
    }

    /// Flash image.
    pub fn flash(&self) -> Option<&Disk> {
        self.flash.as_ref()
    }

    /// Check fields read from disk.
    pub fn validate(&self) -> Result<()> {
        if let Some(flash) = &self.flash {
            flash.validate()?;
            if !flash.backend().is_local() {
                return Err(Error::validation(
                    "firmware",
                    format!("flash image {} must be local", flash.backend()),
                ));
            }
        }
        Ok(())
    }

    /// Command-line arguments loading the firmware.
    pub fn args(&self) -> Vec<String> {
        match &self.flash {
            Some(flash) => vec![
                "-drive".to_string(),
                format!(
                    "if=pflash,unit=0,format=raw,readonly=on,file={}",
                    self.image.display()
                ),
                "-drive".to_string(),
                format!(
                    "if=pflash,unit=1,format=raw,file={}",
                    flash.backend().full_path()
                ),
            ],
            None => vec!["-bios".to_string(), self.image.display().to_string()],
        }
    }
}
