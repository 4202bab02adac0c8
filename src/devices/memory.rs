//! Guest memory configuration.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Guest memory in MiB. `actual` is the balloon target, `total` the
/// amount the machine is started with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Memory {
    actual: u64,
    total: u64,
}

impl Default for Memory {
    fn default() -> Self {
        Self {
            actual: 512,
            total: 512,
        }
    }
}

impl Memory {
    /// Create a memory configuration.
    pub fn new(actual: u64, total: u64) -> Result<Self> {
        let memory = Self { actual, total };
        memory.validate()?;
        Ok(memory)
    }

    /// Balloon target in MiB.
    pub fn actual(&self) -> u64 {
        self.actual
    }

    /// Boot memory in MiB.
    pub fn total(&self) -> u64 {
        self.total
    }

    /// Set the balloon target.
    pub fn set_actual(&mut self, actual: u64) -> Result<()> {
        Self::new(actual, self.total)?;
        self.actual = actual;
        Ok(())
    }

    /// Set the boot memory.
    pub fn set_total(&mut self, total: u64) -> Result<()> {
        Self::new(self.actual, total)?;
        self.total = total;
        Ok(())
    }

    /// Check `0 < actual <= total`.
    pub fn validate(&self) -> Result<()> {
        if self.actual == 0 {
            return Err(Error::validation("memory", "actual must be positive"));
        }
        if self.actual > self.total {
            return Err(Error::validation(
                "memory",
                format!("actual {} MiB exceeds total {} MiB", self.actual, self.total),
            ));
        }
        Ok(())
    }

    pub(crate) fn mirror_actual(&mut self, actual: u64) {
        self.actual = actual;
    }
}
