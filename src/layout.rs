//! Host filesystem layout.
//!
//! Every path vmplug touches on the host is derived from a [`Layout`]
//! passed to constructors. Nothing reads ambient globals, so tests can
//! re-root the whole tree under a temporary directory.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default location of the layout file.
pub const DEFAULT_LAYOUT_FILE: &str = "/etc/vmplug/layout.toml";

/// Filesystem layout of the management host.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Layout {
    /// Per-instance declared configuration directories.
    pub conf_root: PathBuf,

    /// Per-instance chroot directories the hypervisor runs under.
    pub chroot_root: PathBuf,

    /// Monitor and console sockets.
    pub monitor_dir: PathBuf,

    /// procfs mount point.
    pub proc_root: PathBuf,

    /// sysfs mount point.
    pub sysfs_root: PathBuf,

    /// cgroup filesystem mount point.
    pub cgroup_root: PathBuf,

    /// Script the hypervisor runs to configure a tap interface.
    pub ifup_script: PathBuf,

    /// Hypervisor binary.
    pub qemu_binary: PathBuf,

    /// Bound on a single monitor round-trip.
    #[serde(with = "secs")]
    pub monitor_timeout: Duration,
}

impl Default for Layout {
    fn default() -> Self {
        Self {
            conf_root: PathBuf::from("/etc/vmplug/instances"),
            chroot_root: PathBuf::from("/var/lib/vmplug/chroot"),
            monitor_dir: PathBuf::from("/run/vmplug"),
            proc_root: PathBuf::from("/proc"),
            sysfs_root: PathBuf::from("/sys"),
            cgroup_root: PathBuf::from("/sys/fs/cgroup"),
            ifup_script: PathBuf::from("/usr/lib/vmplug/ifup"),
            qemu_binary: PathBuf::from("/usr/bin/qemu-system-x86_64"),
            monitor_timeout: Duration::from_secs(30),
        }
    }
}

impl Layout {
    /// Load the layout from a TOML file.
    ///
    /// A missing file yields the default layout; missing keys take their
    /// default values.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "layout file not found, using defaults");
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(Error::ConfigLoad {
                    path: path.to_path_buf(),
                    message: e.to_string(),
                })
            }
        };

        toml::from_str(&text).map_err(|e| Error::ConfigLoad {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    /// Re-root every host path under `prefix`.
    pub fn rooted(prefix: impl AsRef<Path>) -> Self {
        let prefix = prefix.as_ref();
        let join = |p: PathBuf| prefix.join(p.strip_prefix("/").unwrap_or(&p));
        let base = Self::default();
        Self {
            conf_root: join(base.conf_root),
            chroot_root: join(base.chroot_root),
            monitor_dir: join(base.monitor_dir),
            proc_root: join(base.proc_root),
            sysfs_root: join(base.sysfs_root),
            cgroup_root: join(base.cgroup_root),
            ifup_script: join(base.ifup_script),
            qemu_binary: base.qemu_binary,
            monitor_timeout: base.monitor_timeout,
        }
    }

    /// Declared configuration directory of an instance.
    pub fn instance_dir(&self, name: &str) -> PathBuf {
        self.conf_root.join(name)
    }

    /// Declared configuration file.
    pub fn config_file(&self, name: &str) -> PathBuf {
        self.instance_dir(name).join("config")
    }

    /// Incoming-migration configuration file.
    pub fn incoming_config_file(&self, name: &str) -> PathBuf {
        self.instance_dir(name).join("config_incoming")
    }

    /// Chroot directory of an instance.
    pub fn chroot_dir(&self, name: &str) -> PathBuf {
        self.chroot_root.join(name)
    }

    /// Startup snapshot written at launch.
    pub fn startup_config_file(&self, name: &str) -> PathBuf {
        self.chroot_dir(name).join("run").join("startup_config")
    }

    /// Directory holding network interface side-car files.
    pub fn netif_dir(&self, name: &str) -> PathBuf {
        self.chroot_dir(name).join("run").join("net")
    }

    /// Side-car file of one network interface.
    pub fn netif_file(&self, name: &str, ifname: &str) -> PathBuf {
        self.netif_dir(name).join(ifname)
    }

    /// Primary monitor socket.
    pub fn monitor_socket(&self, name: &str) -> PathBuf {
        self.monitor_dir.join(format!("{}.qmp", name))
    }

    /// Secondary monitor socket for external tooling.
    pub fn ext_monitor_socket(&self, name: &str) -> PathBuf {
        self.monitor_dir.join(format!("{}.qmp1", name))
    }

    /// Serial console socket.
    pub fn console_socket(&self, name: &str) -> PathBuf {
        self.monitor_dir.join(format!("{}.console", name))
    }

    /// Path of a host file as seen inside an instance's chroot.
    pub fn in_chroot(&self, name: &str, host_path: &Path) -> PathBuf {
        let relative = host_path.strip_prefix("/").unwrap_or(host_path);
        self.chroot_dir(name).join(relative)
    }
}

mod secs {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}
