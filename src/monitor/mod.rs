//! Monitor (QMP) access.
//!
//! [`Monitor`] is the seam between the live engine and a running
//! hypervisor. [`QmpClient`] speaks QMP over the instance's Unix socket;
//! the helpers in [`query`] and [`events`] give the raw commands types.

mod client;
pub mod events;
pub mod query;

#[cfg(test)]
pub(crate) mod fake;

pub use client::QmpClient;
pub use vmplug_qmp::Event;

use crate::error::Result;
use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::broadcast;

/// A command/event channel to one running hypervisor.
#[async_trait]
pub trait Monitor: Send + Sync {
    /// Run a command and return its `return` value.
    async fn execute(&self, command: &str, arguments: Option<Value>) -> Result<Value>;

    /// Receive events emitted from now on.
    fn subscribe(&self) -> broadcast::Receiver<Event>;

    /// Run a legacy line command and return its output.
    async fn human(&self, line: &str) -> Result<String> {
        let output = self
            .execute(
                "human-monitor-command",
                Some(json!({ "command-line": line })),
            )
            .await?;
        Ok(output.as_str().unwrap_or_default().trim().to_string())
    }
}
