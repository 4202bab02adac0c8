//! Direct kernel boot.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// External kernel, initrd and command line.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Kernel {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    initrd: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    cmdline: Option<String>,
}

fn non_empty(s: Option<&str>) -> Option<String> {
    s.map(str::trim).filter(|s| !s.is_empty()).map(String::from)
}

impl Kernel {
    /// Create a kernel configuration; an initrd or command line needs an image.
    pub fn new(image: Option<&str>, initrd: Option<&str>, cmdline: Option<&str>) -> Result<Self> {
        let kernel = Self {
            image: non_empty(image),
            initrd: non_empty(initrd),
            cmdline: non_empty(cmdline),
        };
        kernel.validate()?;
        Ok(kernel)
    }

    /// Kernel image.
    pub fn image(&self) -> Option<&str> {
        self.image.as_deref()
    }

    /// Initial ramdisk.
    pub fn initrd(&self) -> Option<&str> {
        self.initrd.as_deref()
    }

    /// Kernel command line.
    pub fn cmdline(&self) -> Option<&str> {
        self.cmdline.as_deref()
    }

    /// Whether a kernel is configured.
    pub fn is_set(&self) -> bool {
        self.image.is_some()
    }

    /// Check fields read from disk.
    pub fn validate(&self) -> Result<()> {
        if self.image.is_none() && (self.initrd.is_some() || self.cmdline.is_some()) {
            return Err(Error::validation("kernel", "initrd and cmdline need an image"));
        }
        Ok(())
    }

    /// Command-line arguments.
    pub fn args(&self) -> Vec<String> {
        let mut args = Vec::new();
        let Some(image) = &self.image else {
            return args;
        };
        args.extend(["-kernel".to_string(), image.clone()]);
        if let Some(initrd) = &self.initrd {
            args.extend(["-initrd".to_string(), initrd.clone()]);
        }
        if let Some(cmdline) = &self.cmdline {
            args.extend(["-append".to_string(), cmdline.clone()]);
        }
        args
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args() {
        let kernel = Kernel::new(Some("/boot/vmlinuz"), None, Some("console=ttyS0")).unwrap();
        assert_eq!(
            kernel.args(),
            vec!["-kernel", "/boot/vmlinuz", "-append", "console=ttyS0"]
        );
        assert!(Kernel::default().args().is_empty());
    }

    #[test]
    fn test_cmdline_without_image() {
        assert!(Kernel::new(None, None, Some("quiet")).is_err());
        assert!(Kernel::new(Some(" "), Some("/boot/initrd"), None).is_err());
    }
}
