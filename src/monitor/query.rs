//! Typed wrappers around monitor commands.

use super::Monitor;
use crate::devices::DeviceSpec;
use crate::error::{Error, Result};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use vmplug_qmp::{
    class, BalloonInfo, BlockInfo, BlockJobInfo, CpuInfo, CpuInfoFast, HotpluggableCpu,
    MigrationInfo, PciInfo, StatusInfo, Version, VersionInfo,
};

/// First version with `query-cpus-fast`.
pub const CPUS_FAST_VERSION: Version = Version::new(2, 12, 0);

/// Run a command and decode its reply.
pub async fn query<T: DeserializeOwned>(
    monitor: &dyn Monitor,
    command: &str,
    arguments: Option<Value>,
) -> Result<T> {
    let value = monitor.execute(command, arguments).await?;
    serde_json::from_value(value)
        .map_err(|e| Error::Protocol(format!("unexpected {} reply: {}", command, e)))
}

/// Hypervisor version.
pub async fn version(monitor: &dyn Monitor) -> Result<Version> {
    let info: VersionInfo = query(monitor, "query-version", None).await?;
    Ok(info.qemu)
}

/// Read a QOM property.
pub async fn qom_get(monitor: &dyn Monitor, path: &str, property: &str) -> Result<Value> {
    monitor
        .execute("qom-get", Some(json!({ "path": path, "property": property })))
        .await
}

/// Read a string QOM property.
pub async fn qom_get_string(monitor: &dyn Monitor, path: &str, property: &str) -> Result<String> {
    match qom_get(monitor, path, property).await? {
        Value::String(s) => Ok(s),
        other => Err(Error::Protocol(format!(
            "qom-get {} {}: expected string, got {}",
            path, property, other
        ))),
    }
}

/// Run state.
pub async fn status(monitor: &dyn Monitor) -> Result<StatusInfo> {
    query(monitor, "query-status", None).await
}

/// Balloon size in bytes, `None` when no balloon device is active.
pub async fn balloon_actual(monitor: &dyn Monitor) -> Result<Option<u64>> {
    match query::<BalloonInfo>(monitor, "query-balloon", None).await {
        Ok(info) => Ok(Some(info.actual)),
        Err(e) if e.is_monitor_class(class::DEVICE_NOT_ACTIVE) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Set the balloon target in bytes.
pub async fn balloon(monitor: &dyn Monitor, bytes: u64) -> Result<()> {
    monitor
        .execute("balloon", Some(json!({ "value": bytes })))
        .await
        .map(drop)
}

/// Online vCPUs, using the query the version supports.
pub async fn cpus(monitor: &dyn Monitor, version: Version) -> Result<Vec<CpuInfoFast>> {
    if version >= CPUS_FAST_VERSION {
        return query(monitor, "query-cpus-fast", None).await;
    }
    let legacy: Vec<CpuInfo> = query(monitor, "query-cpus", None).await?;
    Ok(legacy.into_iter().map(CpuInfoFast::from).collect())
}

/// vCPU slots, plugged or not.
pub async fn hotpluggable_cpus(monitor: &dyn Monitor) -> Result<Vec<HotpluggableCpu>> {
    query(monitor, "query-hotpluggable-cpus", None).await
}

/// PCI topology.
pub async fn pci(monitor: &dyn Monitor) -> Result<Vec<PciInfo>> {
    query(monitor, "query-pci", None).await
}

/// Block devices.
pub async fn block(monitor: &dyn Monitor) -> Result<Vec<BlockInfo>> {
    query(monitor, "query-block", None).await
}

/// Migration status.
pub async fn migration(monitor: &dyn Monitor) -> Result<MigrationInfo> {
    query(monitor, "query-migrate", None).await
}

/// Running block jobs.
pub async fn block_jobs(monitor: &dyn Monitor) -> Result<Vec<BlockJobInfo>> {
    query(monitor, "query-block-jobs", None).await
}

/// Add a device.
pub async fn device_add(monitor: &dyn Monitor, spec: &DeviceSpec) -> Result<()> {
    monitor
        .execute("device_add", Some(spec.to_qmp()))
        .await
        .map(drop)
}

/// Request device removal; completion is signalled by `DEVICE_DELETED`.
pub async fn device_del(monitor: &dyn Monitor, id: &str) -> Result<()> {
    monitor
        .execute("device_del", Some(json!({ "id": id })))
        .await
        .map(drop)
}

/// Add a network backend.
pub async fn netdev_add(monitor: &dyn Monitor, arguments: Value) -> Result<()> {
    monitor.execute("netdev_add", Some(arguments)).await.map(drop)
}

/// Remove a network backend.
pub async fn netdev_del(monitor: &dyn Monitor, id: &str) -> Result<()> {
    monitor
        .execute("netdev_del", Some(json!({ "id": id })))
        .await
        .map(drop)
}

/// Check the output of a legacy line command; anything but `OK` or
/// silence is an error message.
fn hmp_result(command: &str, output: String) -> Result<()> {
    if output.is_empty() || output == "OK" {
        return Ok(());
    }
    Err(Error::Monitor {
        command: command.to_string(),
        class: class::GENERIC_ERROR.to_string(),
        desc: output,
    })
}

/// Register a drive backend through the legacy `drive_add`.
pub async fn drive_add(monitor: &dyn Monitor, args: &str) -> Result<()> {
    let output = monitor.human(&format!("drive_add 0 {}", args)).await?;
    hmp_result("drive_add", output)
}

/// Remove a drive backend through the legacy `drive_del`.
pub async fn drive_del(monitor: &dyn Monitor, drive_id: &str) -> Result<()> {
    let output = monitor.human(&format!("drive_del {}", drive_id)).await?;
    hmp_result("drive_del", output)
}

/// Set IOPS limits of a disk; 0 means unlimited.
pub async fn set_io_throttle(monitor: &dyn Monitor, qdev_id: &str, rd: u64, wr: u64) -> Result<()> {
    let args = json!({
        "id": qdev_id,
        "bps": 0, "bps_rd": 0, "bps_wr": 0,
        "iops": 0, "iops_rd": rd, "iops_wr": wr,
    });
    monitor
        .execute("block_set_io_throttle", Some(args))
        .await
        .map(drop)
}

/// Grow a drive to `bytes`.
pub async fn block_resize(monitor: &dyn Monitor, drive_id: &str, bytes: u64) -> Result<()> {
    monitor
        .execute("block_resize", Some(json!({ "device": drive_id, "size": bytes })))
        .await
        .map(drop)
}

/// Remove a dirty bitmap from a drive.
pub async fn remove_dirty_bitmap(monitor: &dyn Monitor, drive_id: &str, name: &str) -> Result<()> {
    monitor
        .execute(
            "block-dirty-bitmap-remove",
            Some(json!({ "node": drive_id, "name": name })),
        )
        .await
        .map(drop)
}

/// Open a removable-media tray, ejecting forcibly if locked.
pub async fn open_tray(monitor: &dyn Monitor, qdev_id: &str) -> Result<()> {
    monitor
        .execute(
            "blockdev-open-tray",
            Some(json!({ "id": qdev_id, "force": true })),
        )
        .await
        .map(drop)
}

/// Insert a medium and close the tray.
pub async fn change_medium(monitor: &dyn Monitor, qdev_id: &str, filename: &str) -> Result<()> {
    monitor
        .execute(
            "blockdev-change-medium",
            Some(json!({
                "id": qdev_id,
                "filename": filename,
                "format": "raw",
                "read-only-mode": "read-only",
            })),
        )
        .await
        .map(drop)
}

/// Remove the medium from an open tray.
pub async fn remove_medium(monitor: &dyn Monitor, qdev_id: &str) -> Result<()> {
    monitor
        .execute("blockdev-remove-medium", Some(json!({ "id": qdev_id })))
        .await
        .map(drop)
}

/// Change the VNC password.
pub async fn change_vnc_password(monitor: &dyn Monitor, password: &str) -> Result<()> {
    monitor
        .execute("change-vnc-password", Some(json!({ "password": password })))
        .await
        .map(drop)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::fake::ScriptedMonitor;

    #[tokio::test]
    async fn test_cpu_query_is_version_gated() {
        let mon = ScriptedMonitor::new();
        mon.reply(
            "query-cpus",
            json!([{"CPU": 0, "qom_path": "/machine/unattached/device[0]", "thread_id": 4243}]),
        );
        mon.reply(
            "query-cpus-fast",
            json!([{"cpu-index": 0, "qom-path": "/machine/unattached/device[0]", "thread-id": 4243}]),
        );

        let old = cpus(&mon, Version::new(2, 11, 0)).await.unwrap();
        let new = cpus(&mon, Version::new(6, 2, 0)).await.unwrap();
        assert_eq!(old, new);
        assert_eq!(mon.commands(), vec!["query-cpus", "query-cpus-fast"]);
    }

    #[tokio::test]
    async fn test_inactive_balloon_is_none() {
        let mon = ScriptedMonitor::new();
        mon.fail(
            "query-balloon",
            class::DEVICE_NOT_ACTIVE,
            "No balloon device has been activated",
        );
        assert_eq!(balloon_actual(&mon).await.unwrap(), None);

        let mon = ScriptedMonitor::new();
        mon.fail("query-balloon", class::GENERIC_ERROR, "boom");
        assert!(balloon_actual(&mon).await.is_err());
    }

    #[tokio::test]
    async fn test_drive_add_output_is_checked() {
        let mon = ScriptedMonitor::new();
        mon.reply("hmp drive_add", json!("OK\r\n"));
        drive_add(&mon, "file=/dev/sdb,if=none,id=drive_sdb").await.unwrap();

        mon.reply("hmp drive_add", json!("Duplicate ID 'drive_sdb' for drive\r\n"));
        let err = drive_add(&mon, "file=/dev/sdb,if=none,id=drive_sdb")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Duplicate ID"));

        assert_eq!(
            mon.commands()[0],
            "hmp drive_add 0 file=/dev/sdb,if=none,id=drive_sdb"
        );
    }

    #[tokio::test]
    async fn test_qom_get_string_rejects_other_types() {
        let mon = ScriptedMonitor::new();
        mon.reply("qom-get", json!(3));
        assert!(matches!(
            qom_get_string(&mon, "/machine", "type").await,
            Err(Error::Protocol(_))
        ));
    }
}
