//! Running instances.
//!
//! A [`LiveInstance`] mirrors the hardware of a running hypervisor. The
//! mirror is rebuilt from monitor queries on connect and only changes
//! after the hypervisor has confirmed an operation. Operations must not
//! run concurrently against one instance.

mod cpu;
mod hydrate;
mod network;
mod storage;

use super::properties::InstanceProperties;
use crate::error::{Error, Result};
use crate::host::Host;
use crate::layout::Layout;
use crate::monitor::{query, Monitor, QmpClient};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use vmplug_qmp::{BlockJobInfo, MigrationInfo, StatusInfo, Version};

const MIB: u64 = 1024 * 1024;

/// View of a running instance.
pub struct LiveInstance {
    props: InstanceProperties,
    layout: Layout,
    monitor: Arc<dyn Monitor>,
    host: Host,
    version: Version,
    pid: u32,
    /// Ids of the devices on the guest's PCI buses.
    pci_ids: HashSet<String>,
    event_timeout: Duration,
}

impl LiveInstance {
    /// Connect to the instance's monitor socket and hydrate.
    pub(crate) async fn connect(name: &str, layout: Layout, host: Host) -> Result<Self> {
        let socket = layout.monitor_socket(name);
        let client = QmpClient::connect(&socket, layout.monitor_timeout).await?;
        Self::attach(name, layout, Arc::new(client), host).await
    }

    /// Hydrate over an already connected monitor.
    pub(crate) async fn attach(
        name: &str,
        layout: Layout,
        monitor: Arc<dyn Monitor>,
        host: Host,
    ) -> Result<Self> {
        hydrate::hydrate(name, layout, monitor, host).await
    }

    /// Mirrored properties.
    pub fn properties(&self) -> &InstanceProperties {
        &self.props
    }

    /// Hypervisor version.
    pub fn version(&self) -> Version {
        self.version
    }

    /// Hypervisor process id.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Monitor this instance talks to.
    pub fn monitor(&self) -> &dyn Monitor {
        self.monitor.as_ref()
    }

    /// Override the deadline for device deletion and tray events.
    pub fn set_event_timeout(&mut self, timeout: Duration) {
        self.event_timeout = timeout;
    }

    fn name(&self) -> &str {
        self.props.name()
    }

    fn chroot(&self) -> PathBuf {
        self.layout.chroot_dir(self.props.name())
    }

    /// Move the balloon target.
    pub async fn set_actual_memory(&mut self, mib: u64) -> Result<()> {
        let mut memory = *self.props.memory();
        memory.set_actual(mib)?;

        query::balloon(self.monitor(), mib * MIB).await?;
        self.props.memory_mut().mirror_actual(mib);
        tracing::info!(vm = %self.name(), mib, "balloon target set");
        Ok(())
    }

    /// Change the cgroup CPU quota of the hypervisor process.
    ///
    /// The mirror is restored when the cgroup write fails.
    pub async fn set_cpu_quota(&mut self, quota: Option<u32>) -> Result<()> {
        let mut cpu = self.props.cpu().clone();
        cpu.set_quota(quota)?;

        let previous = self.props.cpu().quota();
        self.props.cpu_mut().mirror_quota(quota);
        let written = self
            .host
            .cgroups
            .load(self.pid)
            .and_then(|controller| controller.set_cpu_quota(quota));
        if let Err(e) = written {
            self.props.cpu_mut().mirror_quota(previous);
            return Err(e);
        }
        tracing::info!(vm = %self.name(), ?quota, "cpu quota set");
        Ok(())
    }

    /// Change the VNC password.
    pub async fn set_vnc_password(&self, password: &str) -> Result<()> {
        if password.is_empty() {
            return Err(Error::validation("vnc password", "empty password"));
        }
        query::change_vnc_password(self.monitor(), password).await
    }

    /// Run state.
    pub async fn status(&self) -> Result<StatusInfo> {
        query::status(self.monitor()).await
    }

    /// Migration progress.
    pub async fn migration_status(&self) -> Result<MigrationInfo> {
        query::migration(self.monitor()).await
    }

    /// Running block jobs.
    pub async fn block_jobs(&self) -> Result<Vec<BlockJobInfo>> {
        query::block_jobs(self.monitor()).await
    }
}

impl std::fmt::Debug for LiveInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveInstance")
            .field("name", &self.props.name())
            .field("version", &self.version)
            .field("pid", &self.pid)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Shared fixture: a running `vm1` with four vCPU slots, two plugged.

    use super::*;
    use crate::devices::{Cdrom, Disk, NetIface};
    use crate::host::fake::FakeHost;
    use crate::monitor::fake::ScriptedMonitor;
    use serde_json::{json, Value};

    pub struct Fixture {
        pub dir: tempfile::TempDir,
        pub layout: Layout,
        pub monitor: Arc<ScriptedMonitor>,
        pub host: FakeHost,
    }

    pub fn cpu_slot(socket: u32, core: u32, plugged: Option<&str>) -> Value {
        let mut slot = json!({
            "type": "qemu64-x86_64-cpu",
            "vcpus-count": 1,
            "props": {"socket-id": socket, "core-id": core, "thread-id": 0},
        });
        if let Some(path) = plugged {
            slot["qom-path"] = json!(path);
        }
        slot
    }

    impl Fixture {
        /// Startup snapshot with a file disk, a cdrom holding `/dev/sr0`
        /// and a NIC; the monitor reports matching state.
        pub fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let layout = Layout::rooted(dir.path());

            let mut props = InstanceProperties::new("vm1", 1042).unwrap();
            props.memory_mut().set_total(4096).unwrap();
            props.memory_mut().set_actual(4096).unwrap();
            props.cpu_mut().set_total(4).unwrap();
            props.cpu_mut().set_actual(2).unwrap();
            props.disks_mut().append(Disk::new("/data/vm1.img").unwrap()).unwrap();
            props
                .cdroms_mut()
                .append(Cdrom::with_media("install", "/dev/sr0").unwrap())
                .unwrap();
            props.netifs_mut().append(NetIface::new("tap0", None).unwrap()).unwrap();
            props.save(&layout.startup_config_file("vm1")).unwrap();

            let monitor = Arc::new(ScriptedMonitor::new());
            monitor.reply(
                "query-version",
                json!({"qemu": {"major": 6, "minor": 2, "micro": 0}, "package": ""}),
            );
            monitor.reply_when("qom-get", json!({"path": "/machine"}), json!("pc-i440fx-6.2-machine"));
            monitor.reply_when(
                "qom-get",
                json!({"path": "/machine/peripheral/blk_vm1.img", "property": "type"}),
                json!("virtio-blk-pci"),
            );
            monitor.reply_when(
                "qom-get",
                json!({"path": "/machine/peripheral/cdrom_install", "property": "type"}),
                json!("ide-cd"),
            );
            monitor.reply_when("qom-get", json!({"property": "bootindex"}), json!(-1));
            monitor.reply("query-balloon", json!({"actual": 2048u64 * MIB}));
            monitor.reply(
                "query-cpus-fast",
                json!([
                    {"cpu-index": 0, "qom-path": "/machine/unattached/device[0]", "thread-id": 4243},
                    {"cpu-index": 1, "qom-path": "/machine/peripheral/cpu-s0-c1", "thread-id": 4244},
                ]),
            );
            monitor.reply(
                "query-hotpluggable-cpus",
                json!([
                    cpu_slot(1, 1, None),
                    cpu_slot(0, 1, Some("/machine/peripheral/cpu-s0-c1")),
                    cpu_slot(1, 0, None),
                    cpu_slot(0, 0, Some("/machine/unattached/device[0]")),
                ]),
            );
            monitor.reply(
                "query-pci",
                json!([{"bus": 0, "devices": [
                    {"bus": 0, "slot": 4, "function": 0, "qdev_id": "blk_vm1.img"},
                    {"bus": 0, "slot": 5, "function": 0, "qdev_id": "net_tap0"},
                ]}]),
            );
            monitor.reply(
                "query-block",
                json!([
                    {"device": "", "qdev": "/machine/peripheral/blk_vm1.img/virtio-backend",
                     "inserted": {"file": "/data/vm1.img", "iops_rd": 100, "iops_wr": 0}},
                    {"device": "", "qdev": "cdrom_install", "removable": true, "tray_open": false,
                     "inserted": {"file": "/dev/sr0", "ro": true}},
                ]),
            );

            let proc_dir = layout.proc_root.join("4243");
            std::fs::create_dir_all(&proc_dir).unwrap();
            std::fs::write(proc_dir.join("status"), "Name:\tqemu\nTgid:\t4200\nPid:\t4243\n").unwrap();

            Self {
                dir,
                layout,
                monitor,
                host: FakeHost::new(),
            }
        }

        pub async fn live(&self) -> LiveInstance {
            let mut live = LiveInstance::attach(
                "vm1",
                self.layout.clone(),
                self.monitor.clone(),
                self.host.host(),
            )
            .await
            .unwrap();
            live.set_event_timeout(Duration::from_millis(200));
            live
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::Fixture;
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_balloon_in_bytes() {
        let fx = Fixture::new();
        let mut live = fx.live().await;

        live.set_actual_memory(3072).await.unwrap();
        assert_eq!(live.properties().memory().actual(), 3072);
        assert_eq!(fx.monitor.args_of("balloon"), vec![json!({"value": 3072u64 * MIB})]);

        assert!(live.set_actual_memory(8192).await.is_err());
        assert_eq!(live.properties().memory().actual(), 3072);
    }

    #[tokio::test]
    async fn test_quota_restored_when_cgroup_write_fails() {
        let fx = Fixture::new();
        let mut live = fx.live().await;

        live.set_cpu_quota(Some(150)).await.unwrap();
        assert_eq!(live.properties().cpu().quota(), Some(150));

        fx.host.cgroups.rec.fail("cgroup.set_quota");
        assert!(live.set_cpu_quota(Some(50)).await.is_err());
        assert_eq!(live.properties().cpu().quota(), Some(150));
        assert_eq!(*fx.host.cgroups.quota.lock(), Some(150));
    }

    #[tokio::test]
    async fn test_status_and_vnc_password() {
        let fx = Fixture::new();
        fx.monitor
            .reply("query-status", json!({"running": true, "status": "running"}));
        let live = fx.live().await;

        let status = live.status().await.unwrap();
        assert!(status.running);

        live.set_vnc_password("s3cret").await.unwrap();
        assert_eq!(
            fx.monitor.args_of("change-vnc-password"),
            vec![json!({"password": "s3cret"})]
        );
        assert!(live.set_vnc_password("").await.is_err());
    }
}
