//! Disk and cdrom hot-plug.

use super::LiveInstance;
use crate::backend::Backend;
use crate::devices::{Cdrom, CdromDriver, Disk, DiskDriver, DeviceSpec};
use crate::error::{Error, Result};
use crate::monitor::events::{self, device_deleted, tray_moved};
use crate::monitor::query;
use crate::pool::Keyed;
use crate::rollback::Rollback;
use std::path::Path;

impl LiveInstance {
    /// Fail unless a local backend exists. Block devices are looked up
    /// through the node collaborator.
    fn check_available(&self, backend: &Backend) -> Result<()> {
        let available = if backend.is_block_device() {
            self.host.nodes.source_exists(Path::new(backend.full_path()))?
        } else {
            backend.is_available()?
        };
        if !available {
            return Err(Error::BackendNotFound {
                path: backend.full_path().into(),
            });
        }
        Ok(())
    }

    /// Mirror a block device into the chroot, undone by `rollback`.
    fn stage_node(&self, backend: &Backend, rollback: &mut Rollback) -> Result<()> {
        if !backend.is_block_device() {
            return Ok(());
        }
        let chroot = self.chroot();
        let source = Path::new(backend.full_path()).to_path_buf();
        self.host
            .nodes
            .create_block_node(&chroot, &source, self.props.uid())?;

        let nodes = self.host.nodes.clone();
        rollback.push(format!("remove node {}", source.display()), move || {
            nodes.remove_node(&chroot, &source)
        });
        Ok(())
    }

    /// Remove a chroot node after the hypervisor let go of it.
    fn drop_node(&self, backend: Option<&Backend>) {
        let Some(backend) = backend.filter(|b| b.is_block_device()) else {
            return;
        };
        if let Err(e) = self
            .host
            .nodes
            .remove_node(&self.chroot(), Path::new(backend.full_path()))
        {
            tracing::warn!(vm = %self.name(), node = %backend, error = %e, "failed to remove device node");
        }
    }

    /// Create the SCSI controller `bus` unless the guest already has it.
    /// Returns the id of a controller this call added.
    async fn ensure_scsi_controller(
        &mut self,
        controller: Option<(String, Option<u8>)>,
    ) -> Result<Option<String>> {
        let Some((bus, slot)) = controller else {
            return Ok(None);
        };
        if self.pci_ids.contains(&bus) {
            return Ok(None);
        }
        let spec = DeviceSpec::new("virtio-scsi-pci")
            .prop("id", bus.as_str())
            .opt_prop("addr", slot.map(|s| format!("0x{:02x}", s)));
        query::device_add(self.monitor(), &spec).await?;
        tracing::debug!(vm = %self.name(), controller = %bus, "scsi controller added");
        self.pci_ids.insert(bus.clone());
        Ok(Some(bus))
    }

    /// Remove a controller added for a drive that was then refused.
    async fn drop_scsi_controller(&mut self, added: Option<String>) {
        let Some(bus) = added else {
            return;
        };
        match query::device_del(self.monitor(), &bus).await {
            Ok(()) => {
                self.pci_ids.remove(&bus);
            }
            Err(e) => {
                tracing::warn!(vm = %self.name(), controller = %bus, error = %e, "failed to remove scsi controller")
            }
        }
    }

    /// Plug a drive behind its controller. A controller created for it is
    /// removed again when the drive is refused.
    async fn plug_drive_on_bus(
        &mut self,
        controller: Option<(String, Option<u8>)>,
        drive_args: &str,
        drive_id: &str,
        spec: &DeviceSpec,
    ) -> Result<()> {
        let added = self.ensure_scsi_controller(controller).await?;
        if let Err(e) = self.plug_drive(drive_args, drive_id, spec).await {
            self.drop_scsi_controller(added).await;
            return Err(e);
        }
        Ok(())
    }

    /// Register a drive and plug its front-end; the drive is removed
    /// again if the front-end is refused.
    async fn plug_drive(&self, drive_args: &str, drive_id: &str, spec: &DeviceSpec) -> Result<()> {
        query::drive_add(self.monitor(), drive_args).await?;
        if let Err(e) = query::device_add(self.monitor(), spec).await {
            if let Err(undo) = query::drive_del(self.monitor(), drive_id).await {
                tracing::warn!(vm = %self.name(), drive = drive_id, error = %undo, "failed to remove orphaned drive");
            }
            return Err(e);
        }
        Ok(())
    }

    /// Unplug a front-end, wait for the guest to release it, then drop
    /// its drive.
    async fn unplug_drive(&self, qdev_id: &str, drive_id: &str) -> Result<()> {
        let mut rx = self.monitor.subscribe();
        query::device_del(self.monitor(), qdev_id).await?;
        events::wait_for(
            &mut rx,
            &format!("device_del {}", qdev_id),
            self.event_timeout,
            device_deleted(qdev_id),
        )
        .await?;

        // Deleting the device usually takes the drive with it.
        if let Err(e) = query::drive_del(self.monitor(), drive_id).await {
            tracing::debug!(vm = %self.name(), drive = drive_id, error = %e, "drive already gone");
        }
        Ok(())
    }

    /// Whether the tray of removable drive `qdev_id` is open.
    async fn tray_is_open(&self, qdev_id: &str) -> Result<bool> {
        let block = query::block(self.monitor()).await?;
        Ok(block
            .iter()
            .find(|info| info.qdev.as_deref().map(vmplug_qmp::qdev_id) == Some(qdev_id))
            .and_then(|info| info.tray_open)
            .unwrap_or(false))
    }

    /// Hot-plug a disk.
    pub async fn append_disk(&mut self, disk: Disk) -> Result<()> {
        disk.validate()?;
        if self.props.disks().contains(&disk.key()) {
            return Err(Error::already_connected(Disk::KIND, disk.key()));
        }
        if disk.driver() == DiskDriver::IdeHd {
            return Err(Error::Unsupported("ide disks cannot be hot-plugged".into()));
        }
        self.check_available(disk.backend())?;

        let mut rollback = Rollback::new(format!("attach disk {}", disk.qdev_id()));
        self.stage_node(disk.backend(), &mut rollback)?;
        self.plug_drive_on_bus(
            disk.scsi_controller(),
            &disk.drive_args(),
            &disk.drive_id(),
            &disk.device_spec(),
        )
        .await?;
        rollback.commit();

        tracing::info!(vm = %self.name(), disk = %disk.qdev_id(), backend = %disk.backend(), "disk attached");
        self.props.disks_mut().append(disk)
    }

    /// Hot-unplug a disk.
    pub async fn remove_disk(&mut self, key: &str) -> Result<Disk> {
        let disk = self.props.disks().resolve(key.trim())?.clone();
        self.unplug_drive(&disk.qdev_id(), &disk.drive_id()).await?;
        self.drop_node(Some(disk.backend()));

        tracing::info!(vm = %self.name(), disk = %disk.qdev_id(), "disk detached");
        self.props.disks_mut().remove(key.trim())
    }

    /// Change IOPS limits; 0 means unlimited.
    pub async fn set_disk_iops(&mut self, key: &str, rd: u64, wr: u64) -> Result<()> {
        let qdev_id = self.props.disks().resolve(key.trim())?.qdev_id();
        query::set_io_throttle(self.monitor(), &qdev_id, rd, wr).await?;
        self.props.disks_mut().resolve_mut(key.trim())?.set_iops(rd, wr);
        tracing::info!(vm = %self.name(), disk = %qdev_id, rd, wr, "iops limits set");
        Ok(())
    }

    /// Grow a disk. Local backends must already be at least `bytes` long
    /// and are never shrunk.
    pub async fn resize_disk(&mut self, key: &str, bytes: u64) -> Result<()> {
        let disk = self.props.disks().resolve(key.trim())?;
        match disk.backend().size() {
            Ok(size) if bytes < size => {
                return Err(Error::validation(
                    format!("disk '{}'", disk.backend().base_name()),
                    format!("cannot shrink from {} to {} bytes", size, bytes),
                ))
            }
            Ok(_) | Err(Error::NotImplemented { .. }) => {}
            Err(e) => return Err(e),
        }
        let drive_id = disk.drive_id();
        query::block_resize(self.monitor(), &drive_id, bytes).await?;
        tracing::info!(vm = %self.name(), drive = %drive_id, bytes, "disk resized");
        Ok(())
    }

    /// Drop the dirty bitmaps of a disk.
    pub async fn remove_disk_bitmap(&mut self, key: &str) -> Result<()> {
        let disk = self.props.disks().resolve(key.trim())?;
        let (qdev_id, drive_id) = (disk.qdev_id(), disk.drive_id());
        if !disk.has_bitmap() {
            return Err(Error::NotFound(format!("dirty bitmap of {}", qdev_id)));
        }

        let block = query::block(self.monitor()).await?;
        let names: Vec<String> = block
            .iter()
            .filter(|info| info.qdev.as_deref().map(vmplug_qmp::qdev_id) == Some(qdev_id.as_str()))
            .filter_map(|info| info.inserted.as_ref()?.dirty_bitmaps.clone())
            .flatten()
            .filter_map(|bitmap| bitmap.name)
            .collect();
        for name in &names {
            query::remove_dirty_bitmap(self.monitor(), &drive_id, name).await?;
        }

        self.props
            .disks_mut()
            .resolve_mut(key.trim())?
            .set_has_bitmap(false);
        tracing::info!(vm = %self.name(), disk = %qdev_id, count = names.len(), "dirty bitmaps removed");
        Ok(())
    }

    /// Hot-plug a cdrom drive, with or without a medium.
    pub async fn append_cdrom(&mut self, cdrom: Cdrom) -> Result<()> {
        cdrom.validate()?;
        if self.props.cdroms().contains(cdrom.name()) {
            return Err(Error::already_connected(Cdrom::KIND, cdrom.name()));
        }
        if cdrom.driver() == CdromDriver::IdeCd {
            return Err(Error::Unsupported("ide cdroms cannot be hot-plugged".into()));
        }

        let mut rollback = Rollback::new(format!("attach cdrom {}", cdrom.qdev_id()));
        if let Some(media) = cdrom.media() {
            self.check_available(media)?;
            self.stage_node(media, &mut rollback)?;
        }
        self.plug_drive_on_bus(
            cdrom.scsi_controller(),
            &cdrom.drive_args(),
            &cdrom.drive_id(),
            &cdrom.device_spec(),
        )
        .await?;
        rollback.commit();

        tracing::info!(vm = %self.name(), cdrom = %cdrom.qdev_id(), "cdrom attached");
        self.props.cdroms_mut().append(cdrom)
    }

    /// Hot-unplug a cdrom drive.
    pub async fn remove_cdrom(&mut self, name: &str) -> Result<Cdrom> {
        let cdrom = self.props.cdroms().resolve(name.trim())?.clone();
        self.unplug_drive(&cdrom.qdev_id(), &cdrom.drive_id()).await?;
        self.drop_node(cdrom.media());

        tracing::info!(vm = %self.name(), cdrom = %cdrom.qdev_id(), "cdrom detached");
        self.props.cdroms_mut().remove(name.trim())
    }

    /// Swap the medium of a cdrom; `None` ejects it.
    ///
    /// The old device node is removed only after the swap succeeded; a
    /// newly staged node is removed if any step fails.
    pub async fn change_cdrom_media(&mut self, name: &str, media: Option<&str>) -> Result<()> {
        let cdrom = self.props.cdroms().resolve(name.trim())?.clone();
        let media = media
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .map(Backend::new)
            .transpose()?;
        let qdev_id = cdrom.qdev_id();

        let mut rollback = Rollback::new(format!("change media of {}", qdev_id));
        if let Some(media) = &media {
            self.check_available(media)?;
            self.stage_node(media, &mut rollback)?;
        }

        let mut rx = self.monitor.subscribe();
        // An open tray does not move again, so no event would arrive.
        if !self.tray_is_open(&qdev_id).await? {
            query::open_tray(self.monitor(), &qdev_id).await?;
            events::wait_for(
                &mut rx,
                &format!("open tray of {}", qdev_id),
                self.event_timeout,
                tray_moved(&qdev_id, true),
            )
            .await?;
        }

        match &media {
            Some(media) => {
                query::change_medium(self.monitor(), &qdev_id, media.full_path()).await?;
                events::wait_for(
                    &mut rx,
                    &format!("close tray of {}", qdev_id),
                    self.event_timeout,
                    tray_moved(&qdev_id, false),
                )
                .await?;
            }
            None => query::remove_medium(self.monitor(), &qdev_id).await?,
        }
        rollback.commit();

        if cdrom.media() != media.as_ref() {
            self.drop_node(cdrom.media());
        }
        tracing::info!(
            vm = %self.name(),
            cdrom = %qdev_id,
            media = media.as_ref().map(Backend::full_path).unwrap_or("none"),
            "cdrom media changed"
        );
        self.props
            .cdroms_mut()
            .resolve_mut(name.trim())?
            .replace_media(media);
        Ok(())
    }
}
