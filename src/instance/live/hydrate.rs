//! Rebuilding the mirror of a running instance.

use super::{network, LiveInstance, MIB};
use crate::backend::{Backend, QDEV_PREFIX};
use crate::devices::{validate_instance_name, Cdrom, Disk, MachineType, NetIface, CDROM_PREFIX};
use crate::error::{Error, Result};
use crate::host::{thread_group_id, Host};
use crate::instance::properties::InstanceProperties;
use crate::layout::Layout;
use crate::monitor::events::EVENT_TIMEOUT;
use crate::monitor::{query, Monitor};
use crate::pool::Pool;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use vmplug_qmp::{peripheral_path, qdev_id, BlockInfo, HotpluggableCpu, PciDeviceInfo, PciInfo, Version};

/// First version with `query-hotpluggable-cpus` and CPU `device_add`.
pub(super) const CPU_HOTPLUG_VERSION: Version = Version::new(2, 7, 0);

pub(super) async fn hydrate(
    name: &str,
    layout: Layout,
    monitor: Arc<dyn Monitor>,
    host: Host,
) -> Result<LiveInstance> {
    validate_instance_name(name)?;
    let mon = monitor.as_ref();

    let version = query::version(mon).await?;
    let machine = query::qom_get_string(mon, "/machine", "type").await?;
    let machine = MachineType::new(&machine)?;
    tracing::debug!(vm = name, %version, %machine, "monitor identified");

    let startup = InstanceProperties::load(&layout.startup_config_file(name))?;
    if startup.name() != name {
        return Err(Error::validation(
            "startup config",
            format!("belongs to '{}', not '{}'", startup.name(), name),
        ));
    }

    let (balloon, cpus, slots, pci, block) = tokio::try_join!(
        query::balloon_actual(mon),
        query::cpus(mon, version),
        hotpluggable_cpus(mon, version),
        query::pci(mon),
        query::block(mon),
    )?;

    let mut props = startup.clone();
    props.set_machine_type(machine);

    match balloon {
        Some(bytes) => props.memory_mut().mirror_actual(bytes / MIB),
        None => tracing::debug!(vm = name, "balloon not active, keeping startup memory"),
    }

    let plugged: u32 = slots
        .iter()
        .filter(|s| s.qom_path.is_some())
        .map(|s| s.vcpus_count)
        .sum();
    let online = if slots.is_empty() { cpus.len() as u32 } else { plugged };
    props.cpu_mut().mirror_actual(online);

    let first = cpus
        .first()
        .ok_or_else(|| Error::Protocol("hypervisor reported no vcpus".into()))?;
    let pid = thread_group_id(&layout.proc_root, first.thread_id)?;

    match host.cgroups.load(pid).and_then(|c| c.cpu_quota()) {
        Ok(quota) => props.cpu_mut().mirror_quota(quota),
        Err(e) => tracing::warn!(vm = name, pid, error = %e, "cannot read cpu quota, keeping startup value"),
    }

    let topology = PciTopology::new(&pci);

    let mut disks = Pool::new();
    let mut cdroms = Pool::new();
    for info in &block {
        let Some(reference) = info.qdev.as_deref() else {
            continue;
        };
        let id = qdev_id(reference);
        if id.starts_with(QDEV_PREFIX) {
            if let Some(disk) = live_disk(mon, &startup, id, info, &topology).await? {
                disks.append(disk)?;
            }
        } else if let Some(cdrom_name) = id.strip_prefix(CDROM_PREFIX) {
            cdroms.append(live_cdrom(mon, &startup, cdrom_name, id, info).await?)?;
        }
    }
    *props.disks_mut() = disks;
    *props.cdroms_mut() = cdroms;

    let mut netifs = Pool::new();
    for netif in candidate_netifs(&startup, network::read_sidecars(&layout.netif_dir(name))) {
        let id = netif.qdev_id();
        let Some(slot) = topology.slot_of(&id) else {
            tracing::debug!(vm = name, netif = %netif.ifname(), "interface not present in guest");
            continue;
        };
        let mut netif = netif;
        netif.set_addr(Some(&format!("0x{:02x}", slot)))?;
        netifs.append(netif)?;
    }
    *props.netifs_mut() = netifs;

    tracing::debug!(
        vm = name,
        pid,
        cpus = props.cpu().actual(),
        memory = props.memory().actual(),
        disks = props.disks().len(),
        cdroms = props.cdroms().len(),
        netifs = props.netifs().len(),
        "live instance hydrated"
    );

    Ok(LiveInstance {
        props,
        layout,
        monitor,
        host,
        version,
        pid,
        pci_ids: topology.ids,
        event_timeout: EVENT_TIMEOUT,
    })
}

async fn hotpluggable_cpus(monitor: &dyn Monitor, version: Version) -> Result<Vec<HotpluggableCpu>> {
    if version < CPU_HOTPLUG_VERSION {
        return Ok(Vec::new());
    }
    query::hotpluggable_cpus(monitor).await
}

/// Device ids and root-bus slots from `query-pci`.
struct PciTopology {
    ids: HashSet<String>,
    root_slots: HashMap<String, u8>,
}

impl PciTopology {
    fn new(buses: &[PciInfo]) -> Self {
        let mut topology = Self {
            ids: HashSet::new(),
            root_slots: HashMap::new(),
        };
        for bus in buses {
            topology.visit(&bus.devices);
        }
        topology
    }

    fn visit(&mut self, devices: &[PciDeviceInfo]) {
        for device in devices {
            if !device.qdev_id.is_empty() {
                self.ids.insert(device.qdev_id.clone());
                if device.bus == 0 && device.function == 0 {
                    if let Ok(slot) = u8::try_from(device.slot) {
                        self.root_slots.insert(device.qdev_id.clone(), slot);
                    }
                }
            }
            if let Some(children) = device.pci_bridge.as_ref().and_then(|b| b.devices.as_ref()) {
                self.visit(children);
            }
        }
    }

    fn slot_of(&self, id: &str) -> Option<u8> {
        self.root_slots.get(id).copied()
    }
}

async fn bootindex(monitor: &dyn Monitor, id: &str) -> Option<u32> {
    let value = query::qom_get(monitor, &peripheral_path(id), "bootindex")
        .await
        .ok()?;
    value.as_i64().and_then(|v| u32::try_from(v).ok())
}

/// Disk `id` as the hypervisor runs it. Fields the monitor cannot report
/// come from the startup snapshot.
async fn live_disk(
    monitor: &dyn Monitor,
    startup: &InstanceProperties,
    id: &str,
    info: &BlockInfo,
    topology: &PciTopology,
) -> Result<Option<Disk>> {
    let Some(inserted) = info.inserted.as_ref() else {
        tracing::warn!(disk = id, "disk without a backend, skipped");
        return Ok(None);
    };

    let mut disk = match startup.disks().iter().find(|d| d.qdev_id() == id) {
        Some(disk) => disk.clone(),
        None => match Disk::new(&inserted.file) {
            Ok(disk) if disk.qdev_id() == id => disk,
            _ => {
                tracing::warn!(disk = id, file = %inserted.file, "unrecognized disk backend, skipped");
                return Ok(None);
            }
        },
    };

    let driver = query::qom_get_string(monitor, &peripheral_path(id), "type").await?;
    disk.set_driver(&driver)?;
    if let Some(slot) = topology.slot_of(id) {
        disk.set_addr(Some(&format!("0x{:02x}", slot)))?;
    }
    disk.set_bootindex(bootindex(monitor, id).await);
    disk.set_iops(inserted.iops_rd, inserted.iops_wr);
    disk.set_has_bitmap(
        inserted
            .dirty_bitmaps
            .as_ref()
            .is_some_and(|bitmaps| !bitmaps.is_empty()),
    );
    Ok(Some(disk))
}

async fn live_cdrom(
    monitor: &dyn Monitor,
    startup: &InstanceProperties,
    name: &str,
    id: &str,
    info: &BlockInfo,
) -> Result<Cdrom> {
    let mut cdrom = match startup.cdroms().get(name) {
        Some(cdrom) => cdrom.clone(),
        None => Cdrom::new(name)?,
    };

    let driver = query::qom_get_string(monitor, &peripheral_path(id), "type").await?;
    cdrom.set_driver(&driver)?;
    let media = info
        .inserted
        .as_ref()
        .map(|inserted| Backend::new(&inserted.file))
        .transpose()?;
    cdrom.replace_media(media);
    cdrom.set_bootindex(bootindex(monitor, id).await);
    Ok(cdrom)
}

/// Startup interfaces first, in order, refreshed from their side-cars;
/// then interfaces only known from side-cars.
fn candidate_netifs(startup: &InstanceProperties, sidecars: Vec<NetIface>) -> Vec<NetIface> {
    let mut sidecars: HashMap<String, NetIface> = sidecars
        .into_iter()
        .map(|n| (n.ifname().to_string(), n))
        .collect();

    let mut out: Vec<NetIface> = startup
        .netifs()
        .iter()
        .map(|n| sidecars.remove(n.ifname()).unwrap_or_else(|| n.clone()))
        .collect();

    let mut rest: Vec<NetIface> = sidecars.into_values().collect();
    rest.sort_by(|a, b| a.ifname().cmp(b.ifname()));
    out.extend(rest);
    out
}
