//! vmplug - QEMU/KVM instance configuration and live reconciliation.
//!
//! An instance exists in up to four forms, all behind [`Instance`]:
//!
//! - a declared configuration on disk, edited offline,
//! - an incoming configuration for a migration target,
//! - the startup snapshot written when the hypervisor launched,
//! - a live instance hydrated from the running hypervisor.
//!
//! Offline edits only rewrite properties. Live edits drive the hypervisor
//! through its monitor socket, stage host resources (tap interfaces,
//! device nodes, cgroup quota) and mirror the outcome into the in-memory
//! properties only after the hypervisor confirmed it.

#![warn(missing_docs)]

#[macro_use]
pub mod devices;

pub mod backend;
pub mod cmdline;
pub mod error;
pub mod host;
pub mod instance;
pub mod layout;
pub mod monitor;
pub mod pool;
pub mod rollback;

pub use backend::Backend;
pub use cmdline::LaunchFlags;
pub use error::{Error, Result};
pub use host::Host;
pub use instance::{DeclaredInstance, Instance, InstanceProperties, LiveInstance};
pub use layout::Layout;
pub use monitor::{Monitor, QmpClient};
pub use pool::{Keyed, Pool};

/// vmplug version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
