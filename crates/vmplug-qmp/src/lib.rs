//! QEMU Machine Protocol (QMP) message types for vmplug.
//!
//! This crate defines the wire format spoken on a hypervisor's control
//! socket. It performs no I/O; the transport lives in the `vmplug` crate.
//!
//! # Protocol Overview
//!
//! Every message is a single JSON object terminated by a newline.
//!
//! ```text
//! S: {"QMP": {"version": {...}, "capabilities": []}}
//! C: {"execute": "qmp_capabilities", "id": 1}
//! S: {"return": {}, "id": 1}
//! S: {"event": "DEVICE_DELETED", "data": {...}, "timestamp": {...}}
//! ```
//!
//! Replies carry the `id` of the command they answer, which lets a client
//! keep several commands in flight on one connection. Events carry no id.

#![deny(missing_docs)]

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Maximum accepted line length (16 MB).
pub const MAX_LINE_SIZE: usize = 16 * 1024 * 1024;

/// Error classes the management layer branches on.
pub mod class {
    /// The addressed device exists but is not active (e.g. no balloon driver).
    pub const DEVICE_NOT_ACTIVE: &str = "DeviceNotActive";
    /// The addressed device does not exist.
    pub const DEVICE_NOT_FOUND: &str = "DeviceNotFound";
    /// The command is not known to this hypervisor version.
    pub const COMMAND_NOT_FOUND: &str = "CommandNotFound";
    /// Catch-all error class.
    pub const GENERIC_ERROR: &str = "GenericError";
}

/// Asynchronous event names.
pub mod events {
    /// A device finished its unplug sequence.
    pub const DEVICE_DELETED: &str = "DEVICE_DELETED";
    /// A removable-media tray opened or closed.
    pub const DEVICE_TRAY_MOVED: &str = "DEVICE_TRAY_MOVED";
}

/// QOM container holding every device created with an explicit id.
pub const PERIPHERAL_PREFIX: &str = "/machine/peripheral/";

/// Build the QOM path of a device created with `id`.
pub fn peripheral_path(id: &str) -> String {
    format!("{}{}", PERIPHERAL_PREFIX, id)
}

/// Extract the device id from a qdev reference.
///
/// The hypervisor reports devices either by bare id (`blk_vm1`) or by QOM
/// path (`/machine/peripheral/blk_vm1/virtio-backend`). Both yield `blk_vm1`.
pub fn qdev_id(reference: &str) -> &str {
    match reference.strip_prefix(PERIPHERAL_PREFIX) {
        Some(rest) => rest.split('/').next().unwrap_or(rest),
        None => reference,
    }
}

// ============================================================================
// Commands
// ============================================================================

/// A command sent to the hypervisor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Command {
    /// Command name.
    pub execute: String,
    /// Command arguments.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Value>,
    /// Correlation id echoed back in the reply.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
}

impl Command {
    /// Create a command without arguments.
    pub fn new(execute: impl Into<String>) -> Self {
        Self {
            execute: execute.into(),
            arguments: None,
            id: None,
        }
    }

    /// Attach arguments.
    pub fn arguments(mut self, arguments: Value) -> Self {
        self.arguments = Some(arguments);
        self
    }

    /// Attach a correlation id.
    pub fn id(mut self, id: u64) -> Self {
        self.id = Some(id);
        self
    }
}

// ============================================================================
// Messages
// ============================================================================

/// Greeting sent by the server when a client connects.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Greeting {
    /// Server version.
    pub version: VersionInfo,
    /// Advertised capabilities.
    #[serde(default)]
    pub capabilities: Vec<Value>,
}

/// Error payload of a failed command.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorInfo {
    /// Error class (see [`class`]).
    pub class: String,
    /// Human readable description.
    pub desc: String,
}

impl fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.class, self.desc)
    }
}

/// Event timestamp.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Timestamp {
    /// Seconds since the epoch.
    pub seconds: i64,
    /// Microseconds part.
    pub microseconds: i64,
}

/// Asynchronous event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    /// Event name (see [`events`]).
    pub event: String,
    /// Event payload.
    #[serde(default)]
    pub data: Value,
    /// When the event was raised.
    #[serde(default)]
    pub timestamp: Option<Timestamp>,
}

impl Event {
    /// Decode the payload into a typed structure.
    pub fn data_as<T: for<'de> Deserialize<'de>>(&self) -> Option<T> {
        serde_json::from_value(self.data.clone()).ok()
    }
}

/// Any message read from the server.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Connection greeting.
    Greeting(Greeting),
    /// Successful reply.
    Return {
        /// Correlation id.
        id: Option<u64>,
        /// Reply payload.
        value: Value,
    },
    /// Failed reply.
    Error {
        /// Correlation id.
        id: Option<u64>,
        /// Error payload.
        error: ErrorInfo,
    },
    /// Asynchronous event.
    Event(Event),
}

impl Message {
    /// Classify a decoded JSON object.
    pub fn from_value(value: Value) -> Result<Self, DecodeError> {
        let Value::Object(mut obj) = value else {
            return Err(DecodeError::Unrecognized("not a JSON object".into()));
        };

        let id = obj.get("id").and_then(Value::as_u64);

        if let Some(greeting) = obj.remove("QMP") {
            return serde_json::from_value(greeting)
                .map(Message::Greeting)
                .map_err(DecodeError::Json);
        }
        if let Some(value) = obj.remove("return") {
            return Ok(Message::Return { id, value });
        }
        if let Some(error) = obj.remove("error") {
            let error = serde_json::from_value(error).map_err(DecodeError::Json)?;
            return Ok(Message::Error { id, error });
        }
        if obj.contains_key("event") {
            return serde_json::from_value(Value::Object(obj))
                .map(Message::Event)
                .map_err(DecodeError::Json);
        }

        let keys: Vec<&str> = obj.keys().map(String::as_str).collect();
        Err(DecodeError::Unrecognized(format!(
            "unknown message with keys [{}]",
            keys.join(", ")
        )))
    }
}

// ============================================================================
// Event payloads
// ============================================================================

/// Payload of [`events::DEVICE_DELETED`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeviceDeleted {
    /// Device id, absent for devices created without one.
    #[serde(default)]
    pub device: Option<String>,
    /// QOM path of the removed device.
    pub path: String,
}

impl DeviceDeleted {
    /// Check whether this event refers to the device with the given id.
    pub fn is_for(&self, id: &str) -> bool {
        self.device.as_deref() == Some(id) || qdev_id(&self.path) == id
    }
}

/// Payload of [`events::DEVICE_TRAY_MOVED`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TrayMoved {
    /// Block backend name (may be empty on recent versions).
    #[serde(default)]
    pub device: String,
    /// Device id of the drive.
    #[serde(default)]
    pub id: Option<String>,
    /// True when the tray is now open.
    #[serde(rename = "tray-open")]
    pub tray_open: bool,
}

impl TrayMoved {
    /// Check whether this event refers to the device with the given id.
    pub fn is_for(&self, id: &str) -> bool {
        self.id.as_deref().map(qdev_id) == Some(id) || self.device == id
    }
}

// ============================================================================
// Query results
// ============================================================================

/// Three-part hypervisor version.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Version {
    /// Major version.
    pub major: u32,
    /// Minor version.
    pub minor: u32,
    /// Micro version.
    pub micro: u32,
}

impl Version {
    /// Create a version.
    pub const fn new(major: u32, minor: u32, micro: u32) -> Self {
        Self {
            major,
            minor,
            micro,
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.micro)
    }
}

/// Reply of `query-version`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct VersionInfo {
    /// Upstream version.
    pub qemu: Version,
    /// Distribution package string.
    #[serde(default)]
    pub package: String,
}

/// Reply of `query-status`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatusInfo {
    /// Whether guest vCPUs are executing.
    pub running: bool,
    /// Run state name (`running`, `paused`, `inmigrate`, ...).
    pub status: String,
}

/// Topology properties identifying a CPU slot.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub struct CpuProps {
    /// NUMA node.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<u32>,
    /// Socket index.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub socket_id: Option<u32>,
    /// Die index.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub die_id: Option<u32>,
    /// Core index.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub core_id: Option<u32>,
    /// Thread index.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<u32>,
}

/// Element of `query-cpus-fast`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct CpuInfoFast {
    /// Guest CPU index.
    pub cpu_index: u32,
    /// QOM path of the vCPU object.
    pub qom_path: String,
    /// Host thread running this vCPU.
    pub thread_id: u32,
    /// Topology properties.
    #[serde(default)]
    pub props: Option<CpuProps>,
}

/// Element of the legacy `query-cpus`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CpuInfo {
    /// Guest CPU index.
    #[serde(rename = "CPU")]
    pub cpu: u32,
    /// QOM path of the vCPU object.
    #[serde(default)]
    pub qom_path: String,
    /// Host thread running this vCPU.
    pub thread_id: u32,
}

impl From<CpuInfo> for CpuInfoFast {
    fn from(info: CpuInfo) -> Self {
        Self {
            cpu_index: info.cpu,
            qom_path: info.qom_path,
            thread_id: info.thread_id,
            props: None,
        }
    }
}

/// Element of `query-hotpluggable-cpus`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct HotpluggableCpu {
    /// Device driver used to plug this slot.
    #[serde(rename = "type")]
    pub driver: String,
    /// Number of vCPUs the slot provides.
    pub vcpus_count: u32,
    /// Slot topology.
    pub props: CpuProps,
    /// QOM path when the slot is occupied.
    #[serde(default)]
    pub qom_path: Option<String>,
}

impl HotpluggableCpu {
    /// Sort key (socket, core).
    pub fn position(&self) -> (u32, u32) {
        (
            self.props.socket_id.unwrap_or(0),
            self.props.core_id.unwrap_or(0),
        )
    }
}

/// Reply of `query-balloon`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct BalloonInfo {
    /// Current guest memory in bytes.
    pub actual: u64,
}

/// Dirty bitmap attached to a block node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DirtyBitmapInfo {
    /// Bitmap name.
    #[serde(default)]
    pub name: Option<String>,
    /// Number of dirty bytes.
    #[serde(default)]
    pub count: u64,
    /// Tracking granularity in bytes.
    #[serde(default)]
    pub granularity: u64,
}

/// Medium inserted into a block device.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BlockDeviceInfo {
    /// Backing file name as opened by the hypervisor.
    pub file: String,
    /// Read-only flag.
    #[serde(default)]
    pub ro: bool,
    /// Format driver.
    #[serde(default)]
    pub drv: String,
    /// Read IOPS limit.
    #[serde(default)]
    pub iops_rd: u64,
    /// Write IOPS limit.
    #[serde(default)]
    pub iops_wr: u64,
    /// Dirty bitmaps on this node.
    #[serde(default, rename = "dirty-bitmaps")]
    pub dirty_bitmaps: Option<Vec<DirtyBitmapInfo>>,
}

/// Element of `query-block`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BlockInfo {
    /// Drive (backend) name.
    pub device: String,
    /// Attached device id or QOM path.
    #[serde(default)]
    pub qdev: Option<String>,
    /// Whether the medium is removable.
    #[serde(default)]
    pub removable: bool,
    /// Tray state for removable media.
    #[serde(default)]
    pub tray_open: Option<bool>,
    /// Inserted medium.
    #[serde(default)]
    pub inserted: Option<BlockDeviceInfo>,
}

/// Bus range of a PCI bridge.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PciBusInfo {
    /// Secondary bus number.
    pub number: u32,
}

/// Bridge information of a PCI device.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PciBridgeInfo {
    /// Bus behind the bridge.
    pub bus: PciBusInfo,
    /// Devices behind the bridge.
    #[serde(default)]
    pub devices: Option<Vec<PciDeviceInfo>>,
}

/// PCI device as seen by the guest.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PciDeviceInfo {
    /// Bus number.
    pub bus: u32,
    /// Slot number.
    pub slot: u32,
    /// Function number.
    pub function: u32,
    /// Device id (empty for anonymous devices).
    #[serde(default)]
    pub qdev_id: String,
    /// Bridge details.
    #[serde(default)]
    pub pci_bridge: Option<PciBridgeInfo>,
}

/// Element of `query-pci`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PciInfo {
    /// Root bus number.
    pub bus: u32,
    /// Devices on the root bus.
    #[serde(default)]
    pub devices: Vec<PciDeviceInfo>,
}

/// Reply of `query-migrate`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct MigrationInfo {
    /// Migration state, absent when no migration ever started.
    #[serde(default)]
    pub status: Option<String>,
    /// Total time in milliseconds.
    #[serde(default, rename = "total-time")]
    pub total_time: Option<u64>,
}

/// Element of `query-block-jobs`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BlockJobInfo {
    /// Job type (`mirror`, `backup`, ...).
    #[serde(rename = "type")]
    pub job_type: String,
    /// Job id.
    pub device: String,
    /// Estimated total work.
    #[serde(default)]
    pub len: u64,
    /// Work done so far.
    #[serde(default)]
    pub offset: u64,
    /// Whether the job is actively running.
    #[serde(default)]
    pub busy: bool,
    /// Whether the job is ready for completion.
    #[serde(default)]
    pub ready: bool,
}

// ============================================================================
// Wire Format Helpers
// ============================================================================

/// Encode a message as one newline-terminated line.
pub fn encode_line<T: Serialize>(msg: &T) -> Result<Vec<u8>, serde_json::Error> {
    let mut buf = serde_json::to_vec(msg)?;
    buf.push(b'\n');
    Ok(buf)
}

/// Decode one line read from the server.
pub fn decode_line(line: &[u8]) -> Result<Message, DecodeError> {
    if line.len() > MAX_LINE_SIZE {
        return Err(DecodeError::TooLarge(line.len()));
    }
    let value: Value = serde_json::from_slice(line).map_err(DecodeError::Json)?;
    let msg = Message::from_value(value)?;
    tracing::trace!(?msg, "decoded monitor message");
    Ok(msg)
}

/// Error decoding a wire message.
#[derive(Debug)]
pub enum DecodeError {
    /// Line exceeds maximum size.
    TooLarge(usize),
    /// JSON parse error.
    Json(serde_json::Error),
    /// Valid JSON that is not a known message shape.
    Unrecognized(String),
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::TooLarge(size) => write!(f, "line too large: {} bytes", size),
            DecodeError::Json(e) => write!(f, "JSON decode error: {}", e),
            DecodeError::Unrecognized(what) => write!(f, "unrecognized message: {}", what),
        }
    }
}

impl std::error::Error for DecodeError {}
