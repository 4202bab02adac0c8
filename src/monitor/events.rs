//! Waiting for monitor events.

use crate::error::{Error, Result};
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use vmplug_qmp::{events, DeviceDeleted, Event, TrayMoved};

/// Deadline for device deletion and tray transitions.
pub const EVENT_TIMEOUT: Duration = Duration::from_secs(60);

/// Wait until an event satisfies `matches` or `deadline` elapses.
///
/// Subscribe before issuing the command that triggers the event, or it
/// may be missed.
pub async fn wait_for<F>(
    events: &mut broadcast::Receiver<Event>,
    operation: &str,
    deadline: Duration,
    mut matches: F,
) -> Result<Event>
where
    F: FnMut(&Event) -> bool,
{
    let wait = async {
        loop {
            match events.recv().await {
                Ok(event) if matches(&event) => return Ok(event),
                Ok(_) => continue,
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(operation, skipped, "monitor events dropped while waiting");
                }
                Err(RecvError::Closed) => {
                    return Err(Error::NotRunning("monitor event stream closed".into()))
                }
            }
        }
    };
    tokio::time::timeout(deadline, wait)
        .await
        .map_err(|_| Error::timeout(operation, deadline))?
}

/// Matches `DEVICE_DELETED` for device `id`.
pub fn device_deleted(id: &str) -> impl FnMut(&Event) -> bool + '_ {
    move |event| {
        event.event == events::DEVICE_DELETED
            && event
                .data_as::<DeviceDeleted>()
                .is_some_and(|d| d.is_for(id))
    }
}

/// Matches `DEVICE_TRAY_MOVED` for device `id` reaching the `open` state.
pub fn tray_moved(id: &str, open: bool) -> impl FnMut(&Event) -> bool + '_ {
    move |event| {
        event.event == events::DEVICE_TRAY_MOVED
            && event
                .data_as::<TrayMoved>()
                .is_some_and(|t| t.is_for(id) && t.tray_open == open)
    }
}
