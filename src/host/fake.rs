//! Recording collaborators for tests.

use super::{
    chroot_path, CgroupLoader, CpuController, Host, NodeManager, PciBus, PciDevice, TapManager,
};
use crate::devices::PciAddress;
use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Records every host call as a line such as `tap.create tap0 queues=2`.
#[derive(Debug, Default)]
pub(crate) struct Recorder {
    pub calls: Mutex<Vec<String>>,
    /// Call prefixes that fail.
    pub failing: Mutex<Vec<String>>,
}

impl Recorder {
    fn record(&self, call: String) -> Result<()> {
        let fail = self.failing.lock().iter().any(|f| call.starts_with(f.as_str()));
        self.calls.lock().push(call.clone());
        if fail {
            return Err(Error::host(call, "injected failure"));
        }
        Ok(())
    }

    pub fn fail(&self, prefix: &str) {
        self.failing.lock().push(prefix.to_string());
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }
}

#[derive(Debug, Default)]
pub(crate) struct FakePci {
    pub devices: Mutex<HashMap<PciAddress, PciDevice>>,
    pub rec: Recorder,
}

impl FakePci {
    pub fn add(&self, addr: &str, subdevices: &[&str]) {
        let addr: PciAddress = addr.parse().unwrap();
        let device = PciDevice {
            addr,
            enabled: true,
            driver: Some("vfio-pci".to_string()),
            subdevices: subdevices.iter().map(|s| s.parse().unwrap()).collect(),
            vendor: 0x10de,
            device: 0x1b80,
        };
        self.devices.lock().insert(addr, device);
    }
}

impl PciBus for FakePci {
    fn lookup(&self, addr: &PciAddress) -> Result<PciDevice> {
        self.devices
            .lock()
            .get(addr)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("pci device {}", addr)))
    }

    fn devices(&self) -> Result<Vec<PciDevice>> {
        Ok(self.devices.lock().values().cloned().collect())
    }

    fn assign_driver(&self, addr: &PciAddress, driver: &str) -> Result<()> {
        self.rec.record(format!("pci.assign {} {}", addr, driver))
    }
}

#[derive(Debug, Default)]
pub(crate) struct FakeCgroups {
    pub quota: Arc<Mutex<Option<u32>>>,
    pub rec: Arc<Recorder>,
}

struct FakeCpu {
    quota: Arc<Mutex<Option<u32>>>,
    rec: Arc<Recorder>,
}

impl CgroupLoader for FakeCgroups {
    fn load(&self, pid: u32) -> Result<Box<dyn CpuController>> {
        self.rec.record(format!("cgroup.load {}", pid))?;
        Ok(Box::new(FakeCpu {
            quota: self.quota.clone(),
            rec: self.rec.clone(),
        }))
    }
}

impl CpuController for FakeCpu {
    fn cpu_quota(&self) -> Result<Option<u32>> {
        Ok(*self.quota.lock())
    }

    fn set_cpu_quota(&self, quota: Option<u32>) -> Result<()> {
        self.rec.record(format!("cgroup.set_quota {:?}", quota))?;
        *self.quota.lock() = quota;
        Ok(())
    }
}

#[derive(Debug, Default)]
pub(crate) struct FakeTaps {
    pub rec: Recorder,
}

impl TapManager for FakeTaps {
    fn create(&self, name: &str, owner: u32, queues: u32) -> Result<()> {
        self.rec
            .record(format!("tap.create {} owner={} queues={}", name, owner, queues))
    }

    fn delete(&self, name: &str) -> Result<()> {
        self.rec.record(format!("tap.delete {}", name))
    }

    fn set_link(&self, name: &str, up: bool) -> Result<()> {
        self.rec
            .record(format!("tap.link {} {}", name, if up { "up" } else { "down" }))
    }
}

#[derive(Debug, Default)]
pub(crate) struct FakeNodes {
    pub rec: Recorder,
    /// Host nodes that exist.
    pub sources: Mutex<HashSet<PathBuf>>,
}

impl FakeNodes {
    pub fn add_source(&self, source: &str) {
        self.sources.lock().insert(PathBuf::from(source));
    }
}

impl NodeManager for FakeNodes {
    fn source_exists(&self, source: &Path) -> Result<bool> {
        Ok(self.sources.lock().contains(source))
    }

    fn create_block_node(&self, chroot: &Path, source: &Path, uid: u32) -> Result<PathBuf> {
        self.rec
            .record(format!("node.create {} uid={}", source.display(), uid))?;
        Ok(chroot_path(chroot, source))
    }

    fn remove_node(&self, _chroot: &Path, source: &Path) -> Result<()> {
        self.rec.record(format!("node.remove {}", source.display()))
    }
}

/// Fakes plus the [`Host`] bundle wired to them.
pub(crate) struct FakeHost {
    pub pci: Arc<FakePci>,
    pub cgroups: Arc<FakeCgroups>,
    pub taps: Arc<FakeTaps>,
    pub nodes: Arc<FakeNodes>,
}

impl FakeHost {
    pub fn new() -> Self {
        Self {
            pci: Arc::new(FakePci::default()),
            cgroups: Arc::new(FakeCgroups::default()),
            taps: Arc::new(FakeTaps::default()),
            nodes: Arc::new(FakeNodes::default()),
        }
    }

    pub fn host(&self) -> Host {
        Host {
            pci: self.pci.clone(),
            cgroups: self.cgroups.clone(),
            taps: self.taps.clone(),
            nodes: self.nodes.clone(),
        }
    }
}
