//! vCPU hot-plug.

use super::hydrate::CPU_HOTPLUG_VERSION;
use super::LiveInstance;
use crate::devices::DeviceSpec;
use crate::error::{Error, Result};
use crate::monitor::query;
use vmplug_qmp::{qdev_id, HotpluggableCpu, PERIPHERAL_PREFIX};

/// Device id a hot-plugged vCPU gets.
fn cpu_id(slot: &HotpluggableCpu) -> String {
    let (socket, core) = slot.position();
    format!("cpu-s{}-c{}", socket, core)
}

fn cpu_spec(slot: &HotpluggableCpu) -> DeviceSpec {
    DeviceSpec::new(slot.driver.as_str())
        .prop("id", cpu_id(slot))
        .opt_prop("node-id", slot.props.node_id)
        .opt_prop("socket-id", slot.props.socket_id)
        .opt_prop("die-id", slot.props.die_id)
        .opt_prop("core-id", slot.props.core_id)
        .opt_prop("thread-id", slot.props.thread_id)
}

/// Id of a plugged vCPU that can be unplugged. Boot vCPUs live outside
/// the peripheral container and cannot.
fn removable_id(slot: &HotpluggableCpu) -> Option<&str> {
    slot.qom_path
        .as_deref()
        .filter(|path| path.starts_with(PERIPHERAL_PREFIX))
        .map(qdev_id)
}

fn ramp_error(start: u32, reached: u32, target: u32, source: Error) -> Error {
    if reached == start {
        return source;
    }
    Error::PartialCpuRamp {
        reached,
        target,
        source: Box::new(source),
    }
}

impl LiveInstance {
    /// Plug or unplug vCPUs until `target` are online.
    ///
    /// Free slots are filled in (socket, core) order and emptied from the
    /// other end. Each unit commits on its own: when a later unit fails the
    /// mirror keeps the count reached and the error is
    /// [`Error::PartialCpuRamp`].
    pub async fn set_actual_cpus(&mut self, target: u32) -> Result<()> {
        if self.version < CPU_HOTPLUG_VERSION {
            return Err(Error::Unsupported(format!(
                "cpu hotplug is not supported in this version ({})",
                self.version
            )));
        }
        let mut cpu = self.props.cpu().clone();
        cpu.set_actual(target)?;

        let start = self.props.cpu().actual();
        if target == start {
            return Ok(());
        }

        let mut slots = query::hotpluggable_cpus(self.monitor()).await?;
        slots.sort_by_key(HotpluggableCpu::position);

        let mut reached = start;
        if target > start {
            for slot in slots.iter().filter(|s| s.qom_path.is_none()) {
                if reached + slot.vcpus_count > target {
                    break;
                }
                let spec = cpu_spec(slot);
                if let Err(e) = query::device_add(self.monitor(), &spec).await {
                    return Err(ramp_error(start, reached, target, e));
                }
                reached += slot.vcpus_count;
                self.props.cpu_mut().mirror_actual(reached);
                tracing::debug!(vm = %self.name(), cpu = %cpu_id(slot), reached, "vcpu plugged");
            }
        } else {
            for slot in slots.iter().rev() {
                let Some(id) = removable_id(slot) else {
                    continue;
                };
                if reached < target + slot.vcpus_count {
                    break;
                }
                if let Err(e) = query::device_del(self.monitor(), id).await {
                    return Err(ramp_error(start, reached, target, e));
                }
                reached -= slot.vcpus_count;
                self.props.cpu_mut().mirror_actual(reached);
                tracing::debug!(vm = %self.name(), cpu = id, reached, "vcpu unplugged");
            }
        }

        if reached != target {
            let exhausted = Error::NotFound(format!(
                "{} vcpu slot",
                if target > start { "free" } else { "removable" }
            ));
            return Err(ramp_error(start, reached, target, exhausted));
        }
        tracing::info!(vm = %self.name(), from = start, to = target, "vcpus changed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::Fixture;
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_plug_fills_free_slots_in_order() {
        let fx = Fixture::new();
        let mut live = fx.live().await;

        live.set_actual_cpus(4).await.unwrap();
        assert_eq!(live.properties().cpu().actual(), 4);

        let added = fx.monitor.args_of("device_add");
        assert_eq!(added.len(), 2);
        assert_eq!(added[0]["id"], "cpu-s1-c0");
        assert_eq!(added[0]["driver"], "qemu64-x86_64-cpu");
        assert_eq!(added[0]["socket-id"], 1);
        assert_eq!(added[0]["core-id"], 0);
        assert_eq!(added[1]["id"], "cpu-s1-c1");
    }

    #[tokio::test]
    async fn test_unplug_from_the_tail_skips_boot_cpu() {
        let fx = Fixture::new();
        let mut live = fx.live().await;

        live.set_actual_cpus(1).await.unwrap();
        assert_eq!(live.properties().cpu().actual(), 1);
        assert_eq!(fx.monitor.args_of("device_del"), vec![json!({"id": "cpu-s0-c1"})]);
    }

    #[tokio::test]
    async fn test_partial_ramp_reports_count_reached() {
        let fx = Fixture::new();
        fx.monitor
            .fail_when("device_add", json!({"id": "cpu-s1-c1"}), "GenericError", "no memory");
        let mut live = fx.live().await;

        let err = live.set_actual_cpus(4).await.unwrap_err();
        match err {
            Error::PartialCpuRamp { reached, target, .. } => {
                assert_eq!((reached, target), (3, 4));
            }
            other => panic!("unexpected error: {}", other),
        }
        assert_eq!(live.properties().cpu().actual(), 3);
    }

    #[tokio::test]
    async fn test_first_unit_failure_is_plain_error() {
        let fx = Fixture::new();
        fx.monitor.fail("device_add", "GenericError", "no memory");
        let mut live = fx.live().await;

        let err = live.set_actual_cpus(3).await.unwrap_err();
        assert!(err.is_monitor_class("GenericError"));
        assert_eq!(live.properties().cpu().actual(), 2);
    }

    #[tokio::test]
    async fn test_old_version_rejects_decrease() {
        let fx = Fixture::new();
        fx.monitor.forget("query-version");
        fx.monitor.reply(
            "query-version",
            json!({"qemu": {"major": 2, "minor": 5, "micro": 0}, "package": ""}),
        );
        fx.monitor.reply(
            "query-cpus",
            json!([
                {"CPU": 0, "qom_path": "/machine/unattached/device[0]", "thread_id": 4243},
                {"CPU": 1, "qom_path": "/machine/unattached/device[1]", "thread_id": 4244},
                {"CPU": 2, "qom_path": "/machine/unattached/device[2]", "thread_id": 4245},
                {"CPU": 3, "qom_path": "/machine/unattached/device[3]", "thread_id": 4246},
            ]),
        );
        let mut live = fx.live().await;
        assert_eq!(live.properties().cpu().actual(), 4);

        let err = live.set_actual_cpus(2).await.unwrap_err();
        assert!(matches!(err, Error::Unsupported(_)));
        assert!(err.to_string().contains("not supported in this version"));
        assert_eq!(live.properties().cpu().actual(), 4);
        assert!(fx.monitor.args_of("device_del").is_empty());
    }

    #[tokio::test]
    async fn test_target_above_total_rejected() {
        let fx = Fixture::new();
        let mut live = fx.live().await;
        assert!(matches!(
            live.set_actual_cpus(5).await,
            Err(Error::Validation { .. })
        ));
        assert!(!fx.monitor.commands().contains(&"device_add".to_string()));
    }
}
