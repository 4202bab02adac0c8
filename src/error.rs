//! Error types for vmplug.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result type alias using vmplug's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in vmplug operations.
#[derive(Error, Debug)]
pub enum Error {
    // Lookup errors
    /// A file, device or instance does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Local backend path does not exist.
    #[error("backend not found: {}", path.display())]
    BackendNotFound {
        /// Path that was not found.
        path: PathBuf,
    },

    // Pool conflicts
    /// A device with the same key is already attached.
    #[error("{kind} '{key}' is already connected")]
    AlreadyConnected {
        /// Device kind (disk, cdrom, netif, ...).
        kind: &'static str,
        /// Conflicting key.
        key: String,
    },

    /// No device with this key is attached.
    #[error("{kind} '{key}' is not connected")]
    NotConnected {
        /// Device kind (disk, cdrom, netif, ...).
        kind: &'static str,
        /// Missing key.
        key: String,
    },

    // Instance state errors
    /// The hypervisor process is not running (control socket unreachable).
    #[error("instance is not running: {0}")]
    NotRunning(String),

    /// The operation is not available for this instance variant or backend.
    #[error("{operation} is not implemented for {variant}")]
    NotImplemented {
        /// Refused operation.
        operation: &'static str,
        /// Instance variant or backend kind, e.g. `live instance`.
        variant: &'static str,
    },

    /// The operation is not supported by this hypervisor or chipset.
    #[error("not supported: {0}")]
    Unsupported(String),

    // Validation errors
    /// Invalid configuration value.
    #[error("{subject} validation error: {message}")]
    Validation {
        /// Offending field or device, e.g. `disk 'vm1.img'`.
        subject: String,
        /// What is wrong.
        message: String,
    },

    /// Path prefix does not map to any known backend.
    #[error("unknown backend: {0}")]
    UnknownBackend(String),

    // Monitor errors
    /// Hypervisor rejected a command.
    #[error("{command} failed: {class}: {desc}")]
    Monitor {
        /// Command that failed.
        command: String,
        /// Error class reported by the hypervisor.
        class: String,
        /// Error description.
        desc: String,
    },

    /// Malformed or unexpected monitor traffic.
    #[error("monitor protocol error: {0}")]
    Protocol(String),

    /// An event-confirmed step did not complete in time.
    #[error("{operation} failed to complete within {} seconds", timeout.as_secs())]
    Timeout {
        /// Step that timed out.
        operation: String,
        /// Deadline that elapsed.
        timeout: Duration,
    },

    /// CPU ramp stopped before reaching its target.
    #[error("cpu ramp stopped at {reached} of {target} vcpus: {source}")]
    PartialCpuRamp {
        /// vCPU count actually reached and committed.
        reached: u32,
        /// Requested vCPU count.
        target: u32,
        /// Error that stopped the ramp.
        #[source]
        source: Box<Error>,
    },

    // Configuration errors
    /// Failed to load configuration.
    #[error("failed to load config {}: {message}", path.display())]
    ConfigLoad {
        /// File being read.
        path: PathBuf,
        /// Reason.
        message: String,
    },

    /// Failed to save configuration.
    #[error("failed to save config {}: {message}", path.display())]
    ConfigSave {
        /// File being written.
        path: PathBuf,
        /// Reason.
        message: String,
    },

    // Host resource errors
    /// A host-side resource (tap, cgroup, device node) could not be managed.
    #[error("{resource}: {message}")]
    Host {
        /// Resource kind and name.
        resource: String,
        /// Reason.
        message: String,
    },

    // IO errors
    /// IO error wrapper.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a validation error for a subject.
    pub fn validation(subject: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            subject: subject.into(),
            message: message.into(),
        }
    }

    /// Create an already-connected error.
    pub fn already_connected(kind: &'static str, key: impl Into<String>) -> Self {
        Self::AlreadyConnected {
            kind,
            key: key.into(),
        }
    }

    /// Create a not-connected error.
    pub fn not_connected(kind: &'static str, key: impl Into<String>) -> Self {
        Self::NotConnected {
            kind,
            key: key.into(),
        }
    }

    /// Create a not-implemented error.
    pub fn not_implemented(operation: &'static str, variant: &'static str) -> Self {
        Self::NotImplemented { operation, variant }
    }

    /// Create a host resource error.
    pub fn host(resource: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Host {
            resource: resource.into(),
            message: message.into(),
        }
    }

    /// Create a timeout error.
    pub fn timeout(operation: impl Into<String>, timeout: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout,
        }
    }

    /// Check whether this is a monitor error of the given class.
    pub fn is_monitor_class(&self, expected: &str) -> bool {
        matches!(self, Error::Monitor { class, .. } if class == expected)
    }

    /// Check whether the error signals that the hypervisor is gone.
    pub fn is_not_running(&self) -> bool {
        matches!(self, Error::NotRunning(_))
    }
}
