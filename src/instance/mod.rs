//! Instances across their lifecycle.
//!
//! One [`Instance`] type covers a declared configuration, an
//! incoming-migration configuration, the startup snapshot of a launched
//! instance and a running instance. Every variant accepts every
//! operation; those a variant cannot perform fail with
//! [`Error::NotImplemented`] naming the variant.

mod declared;
pub mod live;
mod properties;

pub use declared::DeclaredInstance;
pub use live::LiveInstance;
pub use properties::InstanceProperties;

use crate::devices::{
    Cdrom, Disk, Firmware, HostDevice, InputDevice, Kernel, NetIface, VsockDevice,
};
use crate::error::{Error, Result};
use crate::host::Host;
use crate::layout::Layout;
use crate::monitor::Monitor;
use std::sync::Arc;
use vmplug_qmp::{BlockJobInfo, MigrationInfo, StatusInfo};

/// Read-only view of the configuration an instance was launched with.
#[derive(Debug, Clone)]
pub struct StartupInstance {
    props: InstanceProperties,
}

/// An instance in one lifecycle phase.
#[derive(Debug)]
pub enum Instance {
    /// Declared configuration.
    Config(DeclaredInstance),
    /// Configuration of an incoming migration target.
    Incoming(DeclaredInstance),
    /// Snapshot written at launch.
    Startup(StartupInstance),
    /// Running hypervisor.
    Live(LiveInstance),
}

impl Instance {
    /// A new declared configuration, saved to the instance's config file.
    pub fn create(props: InstanceProperties, layout: Layout) -> Result<Self> {
        let path = layout.config_file(props.name());
        DeclaredInstance::new(props, layout, path).map(Instance::Config)
    }

    /// A new incoming-migration configuration.
    pub fn create_incoming(props: InstanceProperties, layout: Layout) -> Result<Self> {
        let path = layout.incoming_config_file(props.name());
        DeclaredInstance::new(props, layout, path).map(Instance::Incoming)
    }

    /// Load the declared configuration of `name`.
    pub fn load_config(name: &str, layout: Layout) -> Result<Self> {
        let path = layout.config_file(name);
        DeclaredInstance::load(path, layout).map(Instance::Config)
    }

    /// Load the incoming-migration configuration of `name`.
    pub fn load_incoming(name: &str, layout: Layout) -> Result<Self> {
        let path = layout.incoming_config_file(name);
        DeclaredInstance::load(path, layout).map(Instance::Incoming)
    }

    /// Load the startup snapshot of `name`.
    pub fn load_startup(name: &str, layout: &Layout) -> Result<Self> {
        let props = InstanceProperties::load(&layout.startup_config_file(name))?;
        Ok(Instance::Startup(StartupInstance { props }))
    }

    /// Connect to the running instance `name`.
    ///
    /// Fails with [`Error::NotRunning`] when the monitor socket cannot be
    /// reached.
    pub async fn connect(name: &str, layout: Layout, host: Host) -> Result<Self> {
        LiveInstance::connect(name, layout, host)
            .await
            .map(Instance::Live)
    }

    /// View a running instance through an existing monitor.
    pub async fn attach(
        name: &str,
        layout: Layout,
        monitor: Arc<dyn Monitor>,
        host: Host,
    ) -> Result<Self> {
        LiveInstance::attach(name, layout, monitor, host)
            .await
            .map(Instance::Live)
    }

    /// Variant name used in errors.
    pub fn variant(&self) -> &'static str {
        match self {
            Instance::Config(_) => "declared config",
            Instance::Incoming(_) => "incoming config",
            Instance::Startup(_) => "startup snapshot",
            Instance::Live(_) => "live instance",
        }
    }

    /// Current properties.
    pub fn properties(&self) -> &InstanceProperties {
        match self {
            Instance::Config(d) | Instance::Incoming(d) => d.properties(),
            Instance::Startup(s) => &s.props,
            Instance::Live(l) => l.properties(),
        }
    }

    /// Instance name.
    pub fn name(&self) -> &str {
        self.properties().name()
    }

    fn declared(&mut self, operation: &'static str) -> Result<&mut DeclaredInstance> {
        let variant = self.variant();
        match self {
            Instance::Config(d) | Instance::Incoming(d) => Ok(d),
            _ => Err(Error::not_implemented(operation, variant)),
        }
    }

    fn live(&self, operation: &'static str) -> Result<&LiveInstance> {
        match self {
            Instance::Live(l) => Ok(l),
            other => Err(Error::not_implemented(operation, other.variant())),
        }
    }

    /// Persist a declared configuration.
    pub async fn save(&mut self) -> Result<()> {
        self.declared("save")?.save()
    }

    /// Balloon target in MiB; live instances resize the balloon.
    pub async fn set_actual_memory(&mut self, mib: u64) -> Result<()> {
        match self {
            Instance::Live(l) => l.set_actual_memory(mib).await,
            other => other.declared("set_actual_memory")?.set_actual_memory(mib),
        }
    }

    /// Boot memory in MiB.
    pub async fn set_total_memory(&mut self, mib: u64) -> Result<()> {
        self.declared("set_total_memory")?.set_total_memory(mib)
    }

    /// Online vCPUs; live instances hot-plug or unplug to reach the count.
    pub async fn set_actual_cpus(&mut self, count: u32) -> Result<()> {
        match self {
            Instance::Live(l) => l.set_actual_cpus(count).await,
            other => other.declared("set_actual_cpus")?.set_actual_cpus(count),
        }
    }

    /// vCPU slots.
    pub async fn set_total_cpus(&mut self, count: u32) -> Result<()> {
        self.declared("set_total_cpus")?.set_total_cpus(count)
    }

    /// Socket count; `None` clears it.
    pub async fn set_cpu_sockets(&mut self, sockets: Option<u32>) -> Result<()> {
        self.declared("set_cpu_sockets")?.set_cpu_sockets(sockets)
    }

    /// cgroup CPU quota in percent of one host CPU.
    pub async fn set_cpu_quota(&mut self, quota: Option<u32>) -> Result<()> {
        match self {
            Instance::Live(l) => l.set_cpu_quota(quota).await,
            other => other.declared("set_cpu_quota")?.set_cpu_quota(quota),
        }
    }

    /// CPU model; empty resets to host passthrough.
    pub async fn set_cpu_model(&mut self, model: &str) -> Result<()> {
        self.declared("set_cpu_model")?.set_cpu_model(model)
    }

    /// Chipset; only i440fx types are accepted.
    pub async fn set_machine_type(&mut self, name: &str) -> Result<()> {
        self.declared("set_machine_type")?.set_machine_type(name)
    }

    /// Boot firmware; `None` uses the built-in BIOS.
    pub async fn set_firmware(&mut self, firmware: Option<Firmware>) -> Result<()> {
        self.declared("set_firmware")?.set_firmware(firmware)
    }

    /// Direct kernel boot parameters.
    pub async fn set_kernel(&mut self, kernel: Kernel) -> Result<()> {
        self.declared("set_kernel")?.set_kernel(kernel)
    }

    /// Attach a disk at the end of the pool.
    pub async fn append_disk(&mut self, disk: Disk) -> Result<()> {
        match self {
            Instance::Live(l) => l.append_disk(disk).await,
            other => other.declared("append_disk")?.append_disk(disk),
        }
    }

    /// Insert a disk at `position`.
    pub async fn insert_disk(&mut self, disk: Disk, position: usize) -> Result<()> {
        self.declared("insert_disk")?.insert_disk(disk, position)
    }

    /// Detach a disk by backend base name.
    pub async fn remove_disk(&mut self, key: &str) -> Result<Disk> {
        match self {
            Instance::Live(l) => l.remove_disk(key).await,
            other => other.declared("remove_disk")?.remove_disk(key),
        }
    }

    /// IOPS limits; 0 is unlimited.
    pub async fn set_disk_iops(&mut self, key: &str, rd: u64, wr: u64) -> Result<()> {
        match self {
            Instance::Live(l) => l.set_disk_iops(key, rd, wr).await,
            other => other.declared("set_disk_iops")?.set_disk_iops(key, rd, wr),
        }
    }

    /// Grow a live disk.
    pub async fn resize_disk(&mut self, key: &str, bytes: u64) -> Result<()> {
        match self {
            Instance::Live(l) => l.resize_disk(key, bytes).await,
            other => Err(Error::not_implemented("resize_disk", other.variant())),
        }
    }

    /// Drop the dirty bitmap of a live disk.
    pub async fn remove_disk_bitmap(&mut self, key: &str) -> Result<()> {
        match self {
            Instance::Live(l) => l.remove_disk_bitmap(key).await,
            other => Err(Error::not_implemented("remove_disk_bitmap", other.variant())),
        }
    }

    /// Attach a cdrom drive.
    pub async fn append_cdrom(&mut self, cdrom: Cdrom) -> Result<()> {
        match self {
            Instance::Live(l) => l.append_cdrom(cdrom).await,
            other => other.declared("append_cdrom")?.append_cdrom(cdrom),
        }
    }

    /// Insert a cdrom drive at `position`.
    pub async fn insert_cdrom(&mut self, cdrom: Cdrom, position: usize) -> Result<()> {
        self.declared("insert_cdrom")?.insert_cdrom(cdrom, position)
    }

    /// Detach a cdrom drive by name.
    pub async fn remove_cdrom(&mut self, name: &str) -> Result<Cdrom> {
        match self {
            Instance::Live(l) => l.remove_cdrom(name).await,
            other => other.declared("remove_cdrom")?.remove_cdrom(name),
        }
    }

    /// Swap the medium; `None` ejects.
    pub async fn change_cdrom_media(&mut self, name: &str, media: Option<&str>) -> Result<()> {
        match self {
            Instance::Live(l) => l.change_cdrom_media(name, media).await,
            other => other
                .declared("change_cdrom_media")?
                .change_cdrom_media(name, media),
        }
    }

    /// Attach a network interface.
    pub async fn append_netif(&mut self, netif: NetIface) -> Result<()> {
        match self {
            Instance::Live(l) => l.append_netif(netif).await,
            other => other.declared("append_netif")?.append_netif(netif),
        }
    }

    /// Insert a network interface at `position`.
    pub async fn insert_netif(&mut self, netif: NetIface, position: usize) -> Result<()> {
        self.declared("insert_netif")?.insert_netif(netif, position)
    }

    /// Detach a network interface by tap name.
    pub async fn remove_netif(&mut self, ifname: &str) -> Result<NetIface> {
        match self {
            Instance::Live(l) => l.remove_netif(ifname).await,
            other => other.declared("remove_netif")?.remove_netif(ifname),
        }
    }

    /// Up and down scripts of an interface.
    pub async fn set_netif_scripts(
        &mut self,
        ifname: &str,
        ifup: Option<&str>,
        ifdown: Option<&str>,
    ) -> Result<()> {
        self.declared("set_netif_scripts")?
            .set_netif_scripts(ifname, ifup, ifdown)
    }

    /// Pass a host PCI device through.
    pub async fn append_hostpci(&mut self, device: HostDevice) -> Result<()> {
        self.declared("append_hostpci")?.append_hostpci(device)
    }

    /// Insert a passthrough device at `position`.
    pub async fn insert_hostpci(&mut self, device: HostDevice, position: usize) -> Result<()> {
        self.declared("insert_hostpci")?
            .insert_hostpci(device, position)
    }

    /// Stop passing a host PCI device through.
    pub async fn remove_hostpci(&mut self, addr: &str) -> Result<HostDevice> {
        self.declared("remove_hostpci")?.remove_hostpci(addr)
    }

    /// Multifunction and primary display flags of a passthrough device.
    pub async fn set_hostpci_flags(
        &mut self,
        addr: &str,
        multifunction: bool,
        primary_gpu: bool,
    ) -> Result<()> {
        self.declared("set_hostpci_flags")?
            .set_hostpci_flags(addr, multifunction, primary_gpu)
    }

    /// Add a USB input device.
    pub async fn append_input(&mut self, input: InputDevice) -> Result<()> {
        self.declared("append_input")?.append_input(input)
    }

    /// Insert a USB input device at `position`.
    pub async fn insert_input(&mut self, input: InputDevice, position: usize) -> Result<()> {
        self.declared("insert_input")?.insert_input(input, position)
    }

    /// Remove a USB input device by model name.
    pub async fn remove_input(&mut self, kind: &str) -> Result<InputDevice> {
        self.declared("remove_input")?.remove_input(kind)
    }

    /// vsock device; `None` removes it.
    pub async fn set_vsock(&mut self, vsock: Option<VsockDevice>) -> Result<()> {
        self.declared("set_vsock")?.set_vsock(vsock)
    }

    /// Seed image; local files resolve under the instance directory.
    pub async fn set_cloudinit_media(&mut self, media: Option<&str>) -> Result<()> {
        self.declared("set_cloudinit_media")?
            .set_cloudinit_media(media)
    }

    /// How the seed image is presented.
    pub async fn set_cloudinit_driver(&mut self, driver: &str) -> Result<()> {
        self.declared("set_cloudinit_driver")?
            .set_cloudinit_driver(driver)
    }

    /// Change the VNC password of a live instance.
    pub async fn set_vnc_password(&self, password: &str) -> Result<()> {
        self.live("set_vnc_password")?
            .set_vnc_password(password)
            .await
    }

    /// Run state of a live instance.
    pub async fn status(&self) -> Result<StatusInfo> {
        self.live("status")?.status().await
    }

    /// Migration state of a live instance.
    pub async fn migration_status(&self) -> Result<MigrationInfo> {
        self.live("migration_status")?.migration_status().await
    }

    /// Block jobs running on a live instance.
    pub async fn block_jobs(&self) -> Result<Vec<BlockJobInfo>> {
        self.live("block_jobs")?.block_jobs().await
    }
}
