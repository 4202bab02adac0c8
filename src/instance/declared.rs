//! Declared and incoming-migration configurations.

use super::properties::InstanceProperties;
use crate::backend::Backend;
use crate::cmdline::{self, LaunchFlags};
use crate::devices::{
    Cdrom, CloudInitDrive, Disk, Firmware, HostDevice, InputDevice, Kernel, MachineType,
    NetIface, VsockDevice,
};
use crate::error::{Error, Result};
use crate::host::PciBus;
use crate::layout::Layout;
use std::path::{Component, Path, PathBuf};

/// A configuration file that is edited offline and persisted with `save`.
#[derive(Debug, Clone)]
pub struct DeclaredInstance {
    props: InstanceProperties,
    layout: Layout,
    path: PathBuf,
}

impl DeclaredInstance {
    pub(crate) fn new(props: InstanceProperties, layout: Layout, path: PathBuf) -> Result<Self> {
        props.validate()?;
        check_cloudinit_placement(&props, &layout)?;
        Ok(Self {
            props,
            layout,
            path,
        })
    }

    pub(crate) fn load(path: PathBuf, layout: Layout) -> Result<Self> {
        let props = InstanceProperties::load(&path)?;
        check_cloudinit_placement(&props, &layout)?;
        tracing::debug!(vm = %props.name(), path = %path.display(), "config loaded");
        Ok(Self {
            props,
            layout,
            path,
        })
    }

    /// Current properties.
    pub fn properties(&self) -> &InstanceProperties {
        &self.props
    }

    /// File this configuration is saved to.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Persist to [`DeclaredInstance::path`].
    pub fn save(&self) -> Result<()> {
        self.props.save(&self.path)
    }

    /// Write the startup snapshot a live view hydrates from.
    pub fn save_startup_snapshot(&self) -> Result<()> {
        self.props
            .save(&self.layout.startup_config_file(self.props.name()))
    }

    /// Hypervisor arguments for launching this configuration.
    pub fn command_line(&self, flags: &LaunchFlags, pci: &dyn PciBus) -> Result<Vec<String>> {
        cmdline::generate(&self.props, &self.layout, flags, pci)
    }

    /// Balloon target in MiB.
    pub fn set_actual_memory(&mut self, mib: u64) -> Result<()> {
        self.props.memory_mut().set_actual(mib)
    }

    /// Boot memory in MiB.
    pub fn set_total_memory(&mut self, mib: u64) -> Result<()> {
        self.props.memory_mut().set_total(mib)
    }

    /// vCPUs online at boot.
    pub fn set_actual_cpus(&mut self, count: u32) -> Result<()> {
        self.props.cpu_mut().set_actual(count)
    }

    /// vCPU slots.
    pub fn set_total_cpus(&mut self, count: u32) -> Result<()> {
        self.props.cpu_mut().set_total(count)
    }

    /// Socket count; `None` clears it.
    pub fn set_cpu_sockets(&mut self, sockets: Option<u32>) -> Result<()> {
        self.props.cpu_mut().set_sockets(sockets)
    }

    /// cgroup CPU quota applied at launch.
    pub fn set_cpu_quota(&mut self, quota: Option<u32>) -> Result<()> {
        self.props.cpu_mut().set_quota(quota)
    }

    /// CPU model; empty selects host passthrough.
    pub fn set_cpu_model(&mut self, model: &str) -> Result<()> {
        self.props.cpu_mut().set_model(model)
    }

    /// Chipset.
    pub fn set_machine_type(&mut self, name: &str) -> Result<()> {
        let machine = MachineType::new(name)?;
        self.props.set_machine_type(machine);
        Ok(())
    }

    /// Set or clear the firmware. A flash image must be a local backend.
    pub fn set_firmware(&mut self, firmware: Option<Firmware>) -> Result<()> {
        if let Some(firmware) = &firmware {
            firmware.validate()?;
        }
        self.props.set_firmware(firmware);
        Ok(())
    }

    /// Direct kernel boot parameters.
    pub fn set_kernel(&mut self, kernel: Kernel) -> Result<()> {
        kernel.validate()?;
        self.props.set_kernel(kernel);
        Ok(())
    }

    /// Append a disk.
    pub fn append_disk(&mut self, disk: Disk) -> Result<()> {
        disk.validate()?;
        self.props.disks_mut().append(disk)
    }

    /// Insert a disk at `position`.
    pub fn insert_disk(&mut self, disk: Disk, position: usize) -> Result<()> {
        disk.validate()?;
        self.props.disks_mut().insert(disk, position)
    }

    /// Remove a disk by backend base name.
    pub fn remove_disk(&mut self, key: &str) -> Result<Disk> {
        self.props.disks_mut().remove(key.trim())
    }

    /// IOPS limits; 0 is unlimited.
    pub fn set_disk_iops(&mut self, key: &str, rd: u64, wr: u64) -> Result<()> {
        self.props.disks_mut().resolve_mut(key.trim())?.set_iops(rd, wr);
        Ok(())
    }

    /// Append a cdrom drive.
    pub fn append_cdrom(&mut self, cdrom: Cdrom) -> Result<()> {
        cdrom.validate()?;
        self.props.cdroms_mut().append(cdrom)
    }

    /// Insert a cdrom drive at `position`.
    pub fn insert_cdrom(&mut self, cdrom: Cdrom, position: usize) -> Result<()> {
        cdrom.validate()?;
        self.props.cdroms_mut().insert(cdrom, position)
    }

    /// Remove a cdrom drive.
    pub fn remove_cdrom(&mut self, name: &str) -> Result<Cdrom> {
        self.props.cdroms_mut().remove(name.trim())
    }

    /// Replace a cdrom's medium; `None` or blank empties the drive.
    pub fn change_cdrom_media(&mut self, name: &str, media: Option<&str>) -> Result<()> {
        self.props.cdroms_mut().resolve_mut(name.trim())?.set_media(media)
    }

    /// Append a network interface.
    pub fn append_netif(&mut self, netif: NetIface) -> Result<()> {
        netif.validate()?;
        self.props.netifs_mut().append(netif)
    }

    /// Insert a network interface at `position`.
    pub fn insert_netif(&mut self, netif: NetIface, position: usize) -> Result<()> {
        netif.validate()?;
        self.props.netifs_mut().insert(netif, position)
    }

    /// Remove a network interface.
    pub fn remove_netif(&mut self, ifname: &str) -> Result<NetIface> {
        self.props.netifs_mut().remove(ifname.trim())
    }

    /// Up and down scripts of an interface.
    pub fn set_netif_scripts(
        &mut self,
        ifname: &str,
        ifup: Option<&str>,
        ifdown: Option<&str>,
    ) -> Result<()> {
        self.props
            .netifs_mut()
            .resolve_mut(ifname.trim())?
            .set_scripts(ifup, ifdown);
        Ok(())
    }

    /// Append a passthrough device.
    pub fn append_hostpci(&mut self, device: HostDevice) -> Result<()> {
        self.props.hostpci_mut().append(device)
    }

    /// Insert a passthrough device at `position`.
    pub fn insert_hostpci(&mut self, device: HostDevice, position: usize) -> Result<()> {
        self.props.hostpci_mut().insert(device, position)
    }

    /// Remove a passthrough device; `addr` is normalized before lookup.
    pub fn remove_hostpci(&mut self, addr: &str) -> Result<HostDevice> {
        let key = HostDevice::new(addr)?.addr().to_string();
        self.props.hostpci_mut().remove(&key)
    }

    /// Multifunction and primary display flags.
    pub fn set_hostpci_flags(
        &mut self,
        addr: &str,
        multifunction: bool,
        primary_gpu: bool,
    ) -> Result<()> {
        let key = HostDevice::new(addr)?.addr().to_string();
        let device = self.props.hostpci_mut().resolve_mut(&key)?;
        device.set_multifunction(multifunction)?;
        device.set_primary_gpu(primary_gpu);
        Ok(())
    }

    /// Append a USB input device.
    pub fn append_input(&mut self, input: InputDevice) -> Result<()> {
        self.props.inputs_mut().append(input)
    }

    /// Insert a USB input device at `position`.
    pub fn insert_input(&mut self, input: InputDevice, position: usize) -> Result<()> {
        self.props.inputs_mut().insert(input, position)
    }

    /// Remove the input device of this model.
    pub fn remove_input(&mut self, kind: &str) -> Result<InputDevice> {
        self.props.inputs_mut().remove(kind.trim())
    }

    /// Set or clear the vsock device.
    pub fn set_vsock(&mut self, vsock: Option<VsockDevice>) -> Result<()> {
        if let Some(vsock) = &vsock {
            vsock.guest_cid(self.props.uid())?;
        }
        self.props.set_vsock(vsock);
        Ok(())
    }

    /// Set or clear the cloud-init medium.
    ///
    /// Local files resolve against the instance's configuration directory
    /// and must stay inside it.
    pub fn set_cloudinit_media(&mut self, media: Option<&str>) -> Result<()> {
        let media = media.map(str::trim).filter(|m| !m.is_empty());
        let Some(media) = media else {
            *self.props.cloudinit_mut() = None;
            return Ok(());
        };

        let backend = self.resolve_cloudinit_media(media)?;
        let slot = self.props.cloudinit_mut();
        match slot {
            Some(drive) => drive.set_media(backend),
            None => *slot = Some(CloudInitDrive::new(backend)),
        }
        Ok(())
    }

    /// Driver of the existing cloud-init drive.
    pub fn set_cloudinit_driver(&mut self, driver: &str) -> Result<()> {
        match self.props.cloudinit_mut() {
            Some(drive) => drive.set_driver(driver),
            None => Err(Error::not_connected("cloud-init drive", "cloudinit")),
        }
    }

    fn resolve_cloudinit_media(&self, media: &str) -> Result<Backend> {
        let backend = Backend::new(media)?;
        let Backend::File(_) = backend else {
            return Ok(backend);
        };

        let base = self.layout.instance_dir(self.props.name());
        let resolved = within(&base, Path::new(media))?;
        let resolved = resolved.to_str().ok_or_else(|| {
            Error::validation("cloud-init drive", format!("{} is not valid UTF-8", media))
        })?;
        Backend::new(resolved)
    }
}

/// `path` resolved against `base`; it must not leave `base`.
fn within(base: &Path, path: &Path) -> Result<PathBuf> {
    let resolved = normalize(&base.join(path));
    if !resolved.starts_with(normalize(base)) {
        return Err(Error::validation(
            "cloud-init drive",
            format!("{} is outside {}", path.display(), base.display()),
        ));
    }
    Ok(resolved)
}

/// A local seed image must live in the instance's own directory.
fn check_cloudinit_placement(props: &InstanceProperties, layout: &Layout) -> Result<()> {
    match props.cloudinit() {
        Some(drive) if drive.media().is_local() => {
            let base = layout.instance_dir(props.name());
            within(&base, Path::new(drive.media().full_path())).map(|_| ())
        }
        _ => Ok(()),
    }
}

/// Resolve `.` and `..` without touching the filesystem.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}
