//! Virtual CPU configuration.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Virtual CPU topology and limits.
///
/// `actual` vCPUs are online out of `total` possible slots. When `sockets`
/// is set, `total` must be a multiple of it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cpu {
    actual: u32,
    total: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    sockets: Option<u32>,
    /// cgroup CPU quota in percent of one host CPU.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    quota: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    model: Option<String>,
}

impl Default for Cpu {
    fn default() -> Self {
        Self {
            actual: 1,
            total: 1,
            sockets: None,
            quota: None,
            model: None,
        }
    }
}

impl Cpu {
    /// Create a CPU configuration with `actual` of `total` vCPUs online.
    pub fn new(actual: u32, total: u32) -> Result<Self> {
        let cpu = Self {
            actual,
            total,
            ..Default::default()
        };
        cpu.validate()?;
        Ok(cpu)
    }

    /// Online vCPUs.
    pub fn actual(&self) -> u32 {
        self.actual
    }

    /// vCPU slots.
    pub fn total(&self) -> u32 {
        self.total
    }

    /// Socket count, if set.
    pub fn sockets(&self) -> Option<u32> {
        self.sockets
    }

    /// Cores per socket, if sockets is set.
    pub fn cores(&self) -> Option<u32> {
        self.sockets.map(|s| self.total / s)
    }

    /// cgroup quota, if set.
    pub fn quota(&self) -> Option<u32> {
        self.quota
    }

    /// CPU model, if set.
    pub fn model(&self) -> Option<&str> {
        self.model.as_deref()
    }

    /// Set the number of online vCPUs.
    pub fn set_actual(&mut self, actual: u32) -> Result<()> {
        if actual == 0 {
            return Err(Error::validation("cpu", "actual must be at least 1"));
        }
        if actual > self.total {
            return Err(Error::validation(
                "cpu",
                format!("actual {} exceeds total {}", actual, self.total),
            ));
        }
        self.actual = actual;
        Ok(())
    }

    /// Set the number of vCPU slots.
    pub fn set_total(&mut self, total: u32) -> Result<()> {
        if total < self.actual {
            return Err(Error::validation(
                "cpu",
                format!("total {} is below actual {}", total, self.actual),
            ));
        }
        if let Some(sockets) = self.sockets {
            if total % sockets != 0 {
                return Err(Error::validation(
                    "cpu",
                    format!("total {} is not divisible by {} sockets", total, sockets),
                ));
            }
        }
        self.total = total;
        Ok(())
    }

    /// Set the socket count; `None` clears it.
    pub fn set_sockets(&mut self, sockets: Option<u32>) -> Result<()> {
        if let Some(s) = sockets {
            if s == 0 || self.total % s != 0 {
                return Err(Error::validation(
                    "cpu",
                    format!("total {} is not divisible by {} sockets", self.total, s),
                ));
            }
        }
        self.sockets = sockets;
        Ok(())
    }

    /// Set the cgroup quota; `None` removes the limit.
    pub fn set_quota(&mut self, quota: Option<u32>) -> Result<()> {
        if quota == Some(0) {
            return Err(Error::validation("cpu", "quota must be positive"));
        }
        self.quota = quota;
        Ok(())
    }

    /// Set the CPU model; an empty string selects the host model.
    pub fn set_model(&mut self, model: &str) -> Result<()> {
        let model = model.trim();
        if model.contains(|c: char| c == ',' || c.is_whitespace()) {
            return Err(Error::validation("cpu", format!("invalid model: {}", model)));
        }
        self.model = (!model.is_empty()).then(|| model.to_string());
        Ok(())
    }

    /// Check every invariant, for values read from disk.
    pub fn validate(&self) -> Result<()> {
        if self.actual == 0 || self.actual > self.total {
            return Err(Error::validation(
                "cpu",
                format!("actual {} must be between 1 and total {}", self.actual, self.total),
            ));
        }
        if let Some(s) = self.sockets {
            if s == 0 || self.total % s != 0 {
                return Err(Error::validation(
                    "cpu",
                    format!("total {} is not divisible by {} sockets", self.total, s),
                ));
            }
        }
        if self.quota == Some(0) {
            return Err(Error::validation("cpu", "quota must be positive"));
        }
        Ok(())
    }

    /// Record the vCPU count a live ramp reached, without range checks.
    pub(crate) fn mirror_actual(&mut self, actual: u32) {
        self.actual = actual;
    }

    pub(crate) fn mirror_quota(&mut self, quota: Option<u32>) {
        self.quota = quota;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_actual_total_bounds() {
        let mut cpu = Cpu::new(2, 4).unwrap();
        cpu.set_actual(4).unwrap();
        assert!(cpu.set_actual(5).is_err());
        assert_eq!(cpu.actual(), 4);

        assert!(cpu.set_total(3).is_err());
        cpu.set_total(8).unwrap();
        assert_eq!(cpu.total(), 8);

        assert!(Cpu::new(5, 4).is_err());
        assert!(Cpu::new(0, 4).is_err());
    }

    #[test]
    fn test_sockets_must_divide_total() {
        for total in 1..=12u32 {
            for sockets in 1..=12u32 {
                let mut cpu = Cpu::new(1, total).unwrap();
                let accepted = cpu.set_sockets(Some(sockets)).is_ok();
                assert_eq!(accepted, total % sockets == 0, "total={} sockets={}", total, sockets);
            }
        }
        let mut cpu = Cpu::new(1, 4).unwrap();
        assert!(cpu.set_sockets(Some(0)).is_err());
    }

    #[test]
    fn test_total_keeps_socket_divisibility() {
        let mut cpu = Cpu::new(2, 4).unwrap();
        cpu.set_sockets(Some(2)).unwrap();
        assert_eq!(cpu.cores(), Some(2));
        assert!(cpu.set_total(5).is_err());
        cpu.set_total(6).unwrap();
        assert_eq!(cpu.cores(), Some(3));
    }

    #[test]
    fn test_model_and_quota() {
        let mut cpu = Cpu::default();
        cpu.set_model("  Skylake-Server ").unwrap();
        assert_eq!(cpu.model(), Some("Skylake-Server"));
        cpu.set_model("").unwrap();
        assert_eq!(cpu.model(), None);
        assert!(cpu.set_model("host,+vmx").is_err());

        assert!(cpu.set_quota(Some(0)).is_err());
        cpu.set_quota(Some(150)).unwrap();
        assert_eq!(cpu.quota(), Some(150));
    }

    #[test]
    fn test_validate_catches_bad_json() {
        let cpu: Cpu = serde_json::from_str(r#"{"actual":4,"total":2}"#).unwrap();
        assert!(cpu.validate().is_err());
        let cpu: Cpu = serde_json::from_str(r#"{"actual":2,"total":6,"sockets":4}"#).unwrap();
        assert!(cpu.validate().is_err());
    }
}
