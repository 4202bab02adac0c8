//! Host-side collaborators.
//!
//! The live engine stages and releases host resources only through these
//! traits: PCI devices in sysfs, cgroup CPU quota, tap interfaces and
//! block device nodes inside the chroot. [`Host::system`] wires the real
//! implementations; tests substitute recording fakes.

mod cgroup;
mod nodes;
mod pci;
mod proc;
mod tap;

#[cfg(test)]
pub(crate) mod fake;

pub use cgroup::Cgroups;
pub use nodes::ChrootNodes;
pub use pci::SysfsPci;
pub use proc::thread_group_id;
pub use tap::KernelTaps;

use crate::devices::PciAddress;
use crate::error::Result;
use crate::layout::Layout;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// A host PCI device as seen in sysfs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PciDevice {
    /// Device address.
    pub addr: PciAddress,
    /// Whether the device is enabled.
    pub enabled: bool,
    /// Bound driver.
    pub driver: Option<String>,
    /// Sibling functions of a function-0 device.
    pub subdevices: Vec<PciAddress>,
    /// Vendor id.
    pub vendor: u16,
    /// Device id.
    pub device: u16,
}

impl fmt::Display for PciDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{:04x}:{:04x}]", self.addr, self.vendor, self.device)?;
        if let Some(driver) = &self.driver {
            write!(f, " ({})", driver)?;
        }
        Ok(())
    }
}

/// PCI device lookup and driver binding.
pub trait PciBus: Send + Sync {
    /// Resolve one device.
    fn lookup(&self, addr: &PciAddress) -> Result<PciDevice>;

    /// Every device on the host.
    fn devices(&self) -> Result<Vec<PciDevice>>;

    /// Rebind the device to `driver`.
    fn assign_driver(&self, addr: &PciAddress, driver: &str) -> Result<()>;
}

/// CPU quota of one process's cgroup.
pub trait CpuController: Send {
    /// Quota in percent of one host CPU; `None` when unlimited.
    fn cpu_quota(&self) -> Result<Option<u32>>;

    /// Set or clear the quota.
    fn set_cpu_quota(&self, quota: Option<u32>) -> Result<()>;
}

/// Resolves the cgroup of a process.
pub trait CgroupLoader: Send + Sync {
    /// Open the CPU controller of `pid`.
    fn load(&self, pid: u32) -> Result<Box<dyn CpuController>>;
}

/// Persistent tap interfaces.
pub trait TapManager: Send + Sync {
    /// Create a tap owned by `owner`, multi-queue when `queues > 1`.
    fn create(&self, name: &str, owner: u32, queues: u32) -> Result<()>;

    /// Delete a tap.
    fn delete(&self, name: &str) -> Result<()>;

    /// Bring the link up or down.
    fn set_link(&self, name: &str, up: bool) -> Result<()>;
}

/// Block device nodes inside a chroot.
pub trait NodeManager: Send + Sync {
    /// Whether the host node `source` exists.
    fn source_exists(&self, source: &Path) -> Result<bool>;

    /// Mirror the host node `source` at the same path under `chroot`,
    /// owned by `uid`. Returns the created path.
    fn create_block_node(&self, chroot: &Path, source: &Path, uid: u32) -> Result<PathBuf>;

    /// Remove the mirror of `source`. A missing node is not an error.
    fn remove_node(&self, chroot: &Path, source: &Path) -> Result<()>;
}

/// The collaborators a live instance uses.
#[derive(Clone)]
pub struct Host {
    /// PCI lookup.
    pub pci: Arc<dyn PciBus>,
    /// cgroup access.
    pub cgroups: Arc<dyn CgroupLoader>,
    /// Tap interfaces.
    pub taps: Arc<dyn TapManager>,
    /// Chroot device nodes.
    pub nodes: Arc<dyn NodeManager>,
}

impl Host {
    /// Real implementations rooted at the layout's mount points.
    pub fn system(layout: &Layout) -> Self {
        Self {
            pci: Arc::new(SysfsPci::new(&layout.sysfs_root)),
            cgroups: Arc::new(Cgroups::new(&layout.proc_root, &layout.cgroup_root)),
            taps: Arc::new(KernelTaps::new()),
            nodes: Arc::new(ChrootNodes),
        }
    }
}

impl fmt::Debug for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Host").finish_non_exhaustive()
    }
}

/// Path of `source` mirrored under `chroot`.
pub(crate) fn chroot_path(chroot: &Path, source: &Path) -> PathBuf {
    chroot.join(source.strip_prefix("/").unwrap_or(source))
}
