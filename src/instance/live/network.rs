//! NIC hot-plug and interface side-car files.

use super::LiveInstance;
use crate::devices::NetIface;
use crate::error::{Error, Result};
use crate::instance::properties::write_atomic;
use crate::monitor::events::{self, device_deleted};
use crate::monitor::query;
use crate::pool::Keyed;
use crate::rollback::Rollback;
use std::path::Path;

/// Interfaces recorded under `dir`, sorted by file name. Unreadable
/// entries are skipped.
pub(super) fn read_sidecars(dir: &Path) -> Vec<NetIface> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(dir = %dir.display(), error = %e, "cannot list interface side-cars");
            }
            return Vec::new();
        }
    };

    let mut paths: Vec<_> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.is_file())
        .collect();
    paths.sort();

    paths
        .into_iter()
        .filter_map(|path| {
            let parsed = std::fs::read_to_string(&path)
                .map_err(|e| e.to_string())
                .and_then(|text| serde_json::from_str::<NetIface>(&text).map_err(|e| e.to_string()));
            match parsed {
                Ok(netif) => Some(netif),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping bad interface side-car");
                    None
                }
            }
        })
        .collect()
}

pub(super) fn write_sidecar(path: &Path, netif: &NetIface) -> Result<()> {
    let json = serde_json::to_vec_pretty(netif)
        .map_err(|e| Error::validation(format!("netif '{}'", netif.ifname()), e.to_string()))?;
    write_atomic(path, &json)
}

/// Remove a side-car; a missing file is not an error.
fn remove_sidecar(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::ConfigSave {
            path: path.to_path_buf(),
            message: e.to_string(),
        }),
    }
}

impl LiveInstance {
    /// Hot-plug a NIC backed by a new tap interface.
    pub async fn append_netif(&mut self, netif: NetIface) -> Result<()> {
        netif.validate()?;
        if self.props.netifs().contains(&netif.key()) {
            return Err(Error::already_connected(NetIface::KIND, netif.key()));
        }
        let ifname = netif.ifname().to_string();

        let mut rollback = Rollback::new(format!("attach netif {}", ifname));
        self.host
            .taps
            .create(&ifname, self.props.uid(), netif.queues())?;
        let taps = self.host.taps.clone();
        let tap = ifname.clone();
        rollback.push(format!("delete tap {}", ifname), move || taps.delete(&tap));
        self.host.taps.set_link(&ifname, true)?;

        let sidecar = self.layout.netif_file(self.name(), &ifname);
        write_sidecar(&sidecar, &netif)?;
        let written = sidecar.clone();
        rollback.push(format!("remove side-car {}", sidecar.display()), move || {
            remove_sidecar(&written)
        });

        query::netdev_add(self.monitor(), netif.netdev_qmp()).await?;
        if let Err(e) = query::device_add(self.monitor(), &netif.device_spec()).await {
            if let Err(undo) = query::netdev_del(self.monitor(), &ifname).await {
                tracing::warn!(vm = %self.name(), netdev = %ifname, error = %undo, "failed to remove orphaned netdev");
            }
            return Err(e);
        }
        rollback.commit();

        tracing::info!(vm = %self.name(), netif = %ifname, mac = %netif.mac(), "netif attached");
        self.props.netifs_mut().append(netif)
    }

    /// Hot-unplug a NIC. The tap and side-car go only after the guest
    /// released the device.
    pub async fn remove_netif(&mut self, ifname: &str) -> Result<NetIface> {
        let netif = self.props.netifs().resolve(ifname.trim())?.clone();
        let id = netif.qdev_id();

        let mut rx = self.monitor.subscribe();
        query::device_del(self.monitor(), &id).await?;
        events::wait_for(
            &mut rx,
            &format!("device_del {}", id),
            self.event_timeout,
            device_deleted(&id),
        )
        .await?;
        query::netdev_del(self.monitor(), netif.ifname()).await?;

        if let Err(e) = self.host.taps.delete(netif.ifname()) {
            tracing::warn!(vm = %self.name(), netif = %netif.ifname(), error = %e, "failed to delete tap");
        }
        let sidecar = self.layout.netif_file(self.name(), netif.ifname());
        if let Err(e) = remove_sidecar(&sidecar) {
            tracing::warn!(vm = %self.name(), error = %e, "failed to remove interface side-car");
        }

        tracing::info!(vm = %self.name(), netif = %netif.ifname(), "netif detached");
        self.props.netifs_mut().remove(netif.ifname())
    }
}
