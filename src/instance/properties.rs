//! Instance properties and their persisted JSON form.

use crate::devices::{
    validate_instance_name, Cdrom, CloudInitDrive, Cpu, Disk, Firmware, HostDevice, InputDevice,
    Kernel, MachineType, Memory, NetIface, VsockDevice,
};
use crate::error::{Error, Result};
use crate::pool::Pool;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::io::Write;
use std::path::Path;

/// First VNC port; an instance's display is its uid.
const VNC_BASE_PORT: u32 = 5900;

/// Highest uid whose VNC port still fits in a TCP port.
pub const MAX_UID: u32 = u16::MAX as u32 - VNC_BASE_PORT;

fn validate_uid(uid: u32) -> Result<()> {
    if uid > MAX_UID {
        return Err(Error::validation(
            "uid",
            format!("{} exceeds {}, its vnc port would overflow", uid, MAX_UID),
        ));
    }
    Ok(())
}

/// Everything that describes an instance's hardware.
///
/// Unknown JSON fields are kept in `extra` and written back unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceProperties {
    name: String,
    uid: u32,
    #[serde(default)]
    machine_type: MachineType,
    #[serde(default)]
    memory: Memory,
    #[serde(default)]
    cpu: Cpu,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    firmware: Option<Firmware>,
    #[serde(default)]
    kernel: Kernel,
    #[serde(default)]
    storage: Pool<Disk>,
    #[serde(default)]
    cdrom: Pool<Cdrom>,
    #[serde(default)]
    network: Pool<NetIface>,
    #[serde(default)]
    hostpci: Pool<HostDevice>,
    #[serde(default)]
    inputs: Pool<InputDevice>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    vsock_device: Option<VsockDevice>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    cloudinit_drive: Option<CloudInitDrive>,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

impl InstanceProperties {
    /// Properties with default hardware for a new instance.
    pub fn new(name: &str, uid: u32) -> Result<Self> {
        validate_instance_name(name)?;
        validate_uid(uid)?;
        Ok(Self {
            name: name.to_string(),
            uid,
            machine_type: MachineType::default(),
            memory: Memory::default(),
            cpu: Cpu::default(),
            firmware: None,
            kernel: Kernel::default(),
            storage: Pool::new(),
            cdrom: Pool::new(),
            network: Pool::new(),
            hostpci: Pool::new(),
            inputs: Pool::new(),
            vsock_device: None,
            cloudinit_drive: None,
            extra: Map::new(),
        })
    }

    /// Instance name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Owning user id.
    pub fn uid(&self) -> u32 {
        self.uid
    }

    /// Chipset.
    pub fn machine_type(&self) -> &MachineType {
        &self.machine_type
    }

    /// Memory.
    pub fn memory(&self) -> &Memory {
        &self.memory
    }

    /// vCPUs.
    pub fn cpu(&self) -> &Cpu {
        &self.cpu
    }

    /// Firmware.
    pub fn firmware(&self) -> Option<&Firmware> {
        self.firmware.as_ref()
    }

    /// Direct kernel boot.
    pub fn kernel(&self) -> &Kernel {
        &self.kernel
    }

    /// Disks in bus order.
    pub fn disks(&self) -> &Pool<Disk> {
        &self.storage
    }

    /// Removable-media drives.
    pub fn cdroms(&self) -> &Pool<Cdrom> {
        &self.cdrom
    }

    /// Network interfaces.
    pub fn netifs(&self) -> &Pool<NetIface> {
        &self.network
    }

    /// Passthrough devices.
    pub fn hostpci(&self) -> &Pool<HostDevice> {
        &self.hostpci
    }

    /// Input devices.
    pub fn inputs(&self) -> &Pool<InputDevice> {
        &self.inputs
    }

    /// vsock device.
    pub fn vsock(&self) -> Option<&VsockDevice> {
        self.vsock_device.as_ref()
    }

    /// Cloud-init drive.
    pub fn cloudinit(&self) -> Option<&CloudInitDrive> {
        self.cloudinit_drive.as_ref()
    }

    /// Fields this version does not know about.
    pub fn extra(&self) -> &Map<String, Value> {
        &self.extra
    }

    pub(crate) fn set_machine_type(&mut self, machine_type: MachineType) {
        self.machine_type = machine_type;
    }

    pub(crate) fn memory_mut(&mut self) -> &mut Memory {
        &mut self.memory
    }

    pub(crate) fn cpu_mut(&mut self) -> &mut Cpu {
        &mut self.cpu
    }

    pub(crate) fn set_firmware(&mut self, firmware: Option<Firmware>) {
        self.firmware = firmware;
    }

    pub(crate) fn set_kernel(&mut self, kernel: Kernel) {
        self.kernel = kernel;
    }

    pub(crate) fn disks_mut(&mut self) -> &mut Pool<Disk> {
        &mut self.storage
    }

    pub(crate) fn cdroms_mut(&mut self) -> &mut Pool<Cdrom> {
        &mut self.cdrom
    }

    pub(crate) fn netifs_mut(&mut self) -> &mut Pool<NetIface> {
        &mut self.network
    }

    pub(crate) fn hostpci_mut(&mut self) -> &mut Pool<HostDevice> {
        &mut self.hostpci
    }

    pub(crate) fn inputs_mut(&mut self) -> &mut Pool<InputDevice> {
        &mut self.inputs
    }

    pub(crate) fn set_vsock(&mut self, vsock: Option<VsockDevice>) {
        self.vsock_device = vsock;
    }

    pub(crate) fn cloudinit_mut(&mut self) -> &mut Option<CloudInitDrive> {
        &mut self.cloudinit_drive
    }

    /// Check every field, for values read from disk.
    pub fn validate(&self) -> Result<()> {
        validate_instance_name(&self.name)?;
        validate_uid(self.uid)?;
        MachineType::new(self.machine_type.as_str())?;
        self.memory.validate()?;
        self.cpu.validate()?;
        if let Some(firmware) = &self.firmware {
            firmware.validate()?;
        }
        self.kernel.validate()?;
        for disk in &self.storage {
            disk.validate()?;
        }
        for cdrom in &self.cdrom {
            cdrom.validate()?;
        }
        for netif in &self.network {
            netif.validate()?;
        }
        for device in &self.hostpci {
            device.validate()?;
        }
        if let Some(drive) = &self.cloudinit_drive {
            if drive.media().is_local() && !Path::new(drive.media().full_path()).is_absolute() {
                return Err(Error::validation(
                    "cloud-init drive",
                    format!("{} is not an absolute path", drive.media()),
                ));
            }
        }
        if let Some(vsock) = &self.vsock_device {
            vsock.guest_cid(self.uid)?;
        }
        Ok(())
    }

    /// Parse and validate the persisted JSON form.
    pub fn from_json(json: &str) -> Result<Self> {
        let props: Self = serde_json::from_str(json)
            .map_err(|e| Error::validation("instance config", e.to_string()))?;
        props.validate()?;
        Ok(props)
    }

    /// Persisted JSON form.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::validation("instance config", e.to_string()))
    }

    /// Load from a file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::NotFound(format!("config {}", path.display())))
            }
            Err(e) => {
                return Err(Error::ConfigLoad {
                    path: path.to_path_buf(),
                    message: e.to_string(),
                })
            }
        };
        Self::from_json(&text).map_err(|e| Error::ConfigLoad {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    /// Write to a file atomically.
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = self.to_json()?;
        write_atomic(path, json.as_bytes())?;
        tracing::debug!(vm = %self.name, path = %path.display(), "config saved");
        Ok(())
    }
}

/// Replace `path` with `data` through a temporary file in the same directory.
pub(crate) fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let save_err = |message: String| Error::ConfigSave {
        path: path.to_path_buf(),
        message,
    };
    let dir = path
        .parent()
        .ok_or_else(|| save_err("path has no parent directory".into()))?;
    std::fs::create_dir_all(dir).map_err(|e| save_err(e.to_string()))?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| save_err(e.to_string()))?;
    tmp.write_all(data).map_err(|e| save_err(e.to_string()))?;
    tmp.as_file().sync_all().map_err(|e| save_err(e.to_string()))?;
    tmp.persist(path).map_err(|e| save_err(e.error.to_string()))?;
    Ok(())
}
