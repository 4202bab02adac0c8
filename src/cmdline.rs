//! Hypervisor command-line generation.
//!
//! [`generate`] turns validated instance properties into the argument
//! vector passed to the hypervisor binary. The output is deterministic:
//! the same properties and flags always give the same arguments.

use crate::devices::{subject, DeviceSpec};
use crate::error::{Error, Result};
use crate::host::PciBus;
use crate::instance::InstanceProperties;
use crate::layout::Layout;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

/// Secondary bus passthrough devices sit on.
pub const PASSTHROUGH_BUS: &str = "pci.1";

/// Launch-time overrides.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LaunchFlags {
    /// Exit instead of rebooting.
    pub no_reboot: bool,
    /// Listen for an incoming migration.
    pub incoming: Option<SocketAddr>,
    /// Address the VNC server binds; loopback when unset.
    pub vnc_host: Option<IpAddr>,
}

/// Ordered argument list.
#[derive(Debug, Default)]
struct Args(Vec<String>);

impl Args {
    fn flag(&mut self, flag: &str) -> &mut Self {
        self.0.push(flag.to_string());
        self
    }

    fn opt(&mut self, flag: &str, value: impl Into<String>) -> &mut Self {
        self.0.push(flag.to_string());
        self.0.push(value.into());
        self
    }

    fn device(&mut self, spec: &DeviceSpec) -> &mut Self {
        self.opt("-device", spec.to_arg())
    }

    fn extend(&mut self, args: Vec<String>) -> &mut Self {
        self.0.extend(args);
        self
    }
}

/// Tracks root-bus slots and SCSI controllers while devices are emitted.
#[derive(Default)]
struct Placement {
    /// Pinned root-bus slot to the device holding it.
    slots: HashMap<u8, String>,
    /// SCSI controller bus to its pinned slot.
    controllers: HashMap<String, Option<u8>>,
}

impl Placement {
    fn claim_slot(&mut self, who: &str, slot: Option<u8>) -> Result<()> {
        let Some(slot) = slot else {
            return Ok(());
        };
        if let Some(holder) = self.slots.get(&slot) {
            return Err(Error::validation(
                who,
                format!("slot 0x{:02x} is already used by {}", slot, holder),
            ));
        }
        self.slots.insert(slot, who.to_string());
        Ok(())
    }

    /// Emit the controller for `bus` the first time it is referenced.
    fn controller(
        &mut self,
        args: &mut Args,
        who: &str,
        controller: Option<(String, Option<u8>)>,
    ) -> Result<()> {
        let Some((bus, slot)) = controller else {
            return Ok(());
        };
        match self.controllers.get(&bus) {
            None => {
                self.claim_slot(&format!("scsi controller {}", bus), slot)?;
                args.device(
                    &DeviceSpec::new("virtio-scsi-pci")
                        .prop("id", bus.as_str())
                        .opt_prop("addr", slot.map(|s| format!("0x{:02x}", s))),
                );
                self.controllers.insert(bus, slot);
                Ok(())
            }
            Some(existing) if slot.is_none() || *existing == slot => Ok(()),
            Some(existing) => Err(Error::validation(
                who,
                format!(
                    "controller {} is at slot {}, not 0x{:02x}",
                    bus,
                    existing.map_or("auto".to_string(), |s| format!("0x{:02x}", s)),
                    slot.unwrap_or_default()
                ),
            )),
        }
    }
}

/// Build the hypervisor arguments, without the binary itself.
///
/// Errors name the device at fault, e.g. `disk 'vm1.img' validation error`.
pub fn generate(
    props: &InstanceProperties,
    layout: &Layout,
    flags: &LaunchFlags,
    pci: &dyn PciBus,
) -> Result<Vec<String>> {
    props.validate()?;
    let name = props.name();
    let mut args = Args::default();
    let mut placement = Placement::default();

    args.opt("-machine", format!("{},accel=kvm", props.machine_type()))
        .opt("-name", format!("{},debug-threads=on", name))
        .flag("-nodefaults")
        .flag("-no-user-config");

    if let Some(firmware) = props.firmware() {
        args.extend(firmware.args());
    }

    let memory = props.memory();
    let cpu = props.cpu();
    args.opt("-m", memory.total().to_string());
    let smp = match (cpu.sockets(), cpu.cores()) {
        (Some(sockets), Some(cores)) => format!(
            "cpus={},sockets={},cores={},maxcpus={}",
            cpu.actual(),
            sockets,
            cores,
            cpu.total()
        ),
        _ => format!("cpus={},maxcpus={}", cpu.actual(), cpu.total()),
    };
    args.opt("-smp", smp)
        .opt("-cpu", cpu.model().unwrap_or("host"));

    args.device(&DeviceSpec::new("virtio-balloon-pci").prop("id", "balloon0"));
    args.opt(
        "-chardev",
        format!(
            "socket,id=console,path={},server=on,wait=off",
            layout.console_socket(name).display()
        ),
    )
    .opt("-serial", "chardev:console");
    for (id, socket) in [
        ("qmp", layout.monitor_socket(name)),
        ("qmp1", layout.ext_monitor_socket(name)),
    ] {
        args.opt(
            "-chardev",
            format!("socket,id={},path={},server=on,wait=off", id, socket.display()),
        )
        .opt("-mon", format!("chardev={},mode=control", id));
    }

    if props.hostpci().iter().any(|d| d.primary_gpu()) {
        args.opt("-vga", "none").flag("-nographic");
    } else {
        args.opt("-vga", "std");
    }

    if !props.hostpci().is_empty() {
        args.device(
            &DeviceSpec::new("pci-bridge")
                .prop("id", PASSTHROUGH_BUS)
                .prop("chassis_nr", 1),
        );
    }
    for (index, device) in props.hostpci().iter().enumerate() {
        let who = subject("host device", &device.addr().to_string());
        let host = pci
            .lookup(&device.addr())
            .map_err(|e| Error::validation(who.as_str(), e.to_string()))?;
        let slot = index + 1;
        if slot > 0x1f {
            return Err(Error::validation(who, "too many passthrough devices"));
        }
        let id = format!("hostpci{}", index);
        args.device(
            &DeviceSpec::new("vfio-pci")
                .prop("host", device.addr().to_string())
                .prop("id", id.as_str())
                .prop("bus", PASSTHROUGH_BUS)
                .prop("addr", format!("0x{:02x}", slot))
                .opt_prop("multifunction", device.multifunction().then_some(true))
                .opt_prop("x-vga", device.primary_gpu().then_some(true)),
        );
        if device.multifunction() {
            for (function, sub) in host.subdevices.iter().enumerate() {
                args.device(
                    &DeviceSpec::new("vfio-pci")
                        .prop("host", sub.to_string())
                        .prop("id", format!("{}.{}", id, function + 1))
                        .prop("bus", PASSTHROUGH_BUS)
                        .prop("addr", format!("0x{:02x}.{:x}", slot, function + 1)),
                );
            }
        }
    }

    if !props.inputs().is_empty() {
        args.device(&DeviceSpec::new("qemu-xhci").prop("id", "usb"));
    }
    for input in props.inputs() {
        args.device(
            &DeviceSpec::new(input.kind().as_str())
                .prop("id", input.qdev_id())
                .prop("bus", "usb.0"),
        );
    }

    for disk in props.disks() {
        let who = subject("disk", disk.backend().base_name());
        placement.controller(&mut args, &who, disk.scsi_controller())?;
        placement.claim_slot(&who, disk.addr().and_then(|a| a.pci_slot()))?;
        args.opt("-drive", disk.drive_args()).device(&disk.device_spec());
    }
    for cdrom in props.cdroms() {
        let who = subject("cdrom", cdrom.name());
        placement.controller(&mut args, &who, cdrom.scsi_controller())?;
        args.opt("-drive", cdrom.drive_args()).device(&cdrom.device_spec());
    }

    if let Some(drive) = props.cloudinit() {
        args.extend(drive.args());
    }

    let script = layout.ifup_script.display().to_string();
    for netif in props.netifs() {
        let who = subject("netif", netif.ifname());
        placement.claim_slot(&who, netif.addr().and_then(|a| a.pci_slot()))?;
        args.opt("-netdev", netif.netdev_arg(&script))
            .device(&netif.device_spec());
    }

    if let Some(vsock) = props.vsock() {
        placement.claim_slot("vsock", vsock.addr().and_then(|a| a.pci_slot()))?;
        args.device(&vsock.device_spec(props.uid())?);
    }

    args.extend(props.kernel().args());

    let vnc_host = flags.vnc_host.unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST));
    let vnc_host = match vnc_host {
        IpAddr::V6(v6) => format!("[{}]", v6),
        v4 => v4.to_string(),
    };
    args.opt("-vnc", format!("{}:{},password=on", vnc_host, props.uid()));

    if let Some(incoming) = flags.incoming {
        args.opt("-incoming", format!("tcp:{}", incoming));
    }
    if flags.no_reboot {
        args.flag("-no-reboot");
    }

    tracing::debug!(vm = name, count = args.0.len(), "command line generated");
    Ok(args.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::{Cdrom, Disk, HostDevice, InputDevice, InputKind, NetIface, VsockDevice};
    use crate::host::fake::FakePci;
    use regex::Regex;

    fn props() -> InstanceProperties {
        let mut props = InstanceProperties::new("vm1", 1042).unwrap();
        props.memory_mut().set_total(2048).unwrap();
        props.cpu_mut().set_total(4).unwrap();
        props.cpu_mut().set_actual(2).unwrap();
        props
    }

    fn generate_default(props: &InstanceProperties) -> Result<Vec<String>> {
        generate(props, &Layout::default(), &LaunchFlags::default(), &FakePci::default())
    }

    /// Values following every occurrence of `flag`.
    fn values<'a>(args: &'a [String], flag: &str) -> Vec<&'a str> {
        args.windows(2)
            .filter(|w| w[0] == flag)
            .map(|w| w[1].as_str())
            .collect()
    }

    #[test]
    fn test_base_layout() {
        let args = generate_default(&props()).unwrap();
        assert_eq!(&args[..2], ["-machine", "pc,accel=kvm"]);
        assert_eq!(values(&args, "-m"), ["2048"]);
        assert_eq!(values(&args, "-smp"), ["cpus=2,maxcpus=4"]);
        assert_eq!(values(&args, "-cpu"), ["host"]);
        assert_eq!(values(&args, "-vga"), ["std"]);
        assert_eq!(
            values(&args, "-mon"),
            ["chardev=qmp,mode=control", "chardev=qmp1,mode=control"]
        );
        assert!(values(&args, "-chardev")
            .iter()
            .any(|c| c.contains("path=/run/vmplug/vm1.qmp,")));
        assert_eq!(values(&args, "-vnc"), ["127.0.0.1:1042,password=on"]);
        assert!(!args.contains(&"-no-reboot".to_string()));
        assert!(!args.contains(&"-incoming".to_string()));
    }

    #[test]
    fn test_topology_with_sockets() {
        let mut props = props();
        props.cpu_mut().set_sockets(Some(2)).unwrap();
        props.cpu_mut().set_model("Skylake-Server").unwrap();
        let args = generate_default(&props).unwrap();
        assert_eq!(values(&args, "-smp"), ["cpus=2,sockets=2,cores=2,maxcpus=4"]);
        assert_eq!(values(&args, "-cpu"), ["Skylake-Server"]);
    }

    #[test]
    fn test_flags() {
        let flags = LaunchFlags {
            no_reboot: true,
            incoming: Some("10.0.0.9:4444".parse().unwrap()),
            vnc_host: Some("::1".parse().unwrap()),
        };
        let args = generate(&props(), &Layout::default(), &flags, &FakePci::default()).unwrap();
        assert_eq!(values(&args, "-incoming"), ["tcp:10.0.0.9:4444"]);
        assert_eq!(values(&args, "-vnc"), ["[::1]:1042,password=on"]);
        assert_eq!(args.last().map(String::as_str), Some("-no-reboot"));
    }

    #[test]
    fn test_disks_and_lazy_scsi_controllers() {
        let mut props = props();
        props.disks_mut().append(Disk::new("/data/vm1.img").unwrap()).unwrap();
        for (path, addr) in [("/data/a.img", "scsi1:0x06/0"), ("/data/b.img", "scsi1:0x06/1")] {
            let mut disk = Disk::new(path).unwrap();
            disk.set_driver("scsi-hd").unwrap();
            disk.set_addr(Some(addr)).unwrap();
            props.disks_mut().append(disk).unwrap();
        }
        let mut cdrom = Cdrom::with_media("install", "/data/install.iso").unwrap();
        cdrom.set_driver("scsi-cd").unwrap();
        props.cdroms_mut().append(cdrom).unwrap();

        let args = generate_default(&props).unwrap();
        let devices = values(&args, "-device");
        let controllers: Vec<&str> = devices
            .iter()
            .copied()
            .filter(|d| d.starts_with("virtio-scsi-pci"))
            .collect();
        assert_eq!(
            controllers,
            ["virtio-scsi-pci,id=scsi1,addr=0x06", "virtio-scsi-pci,id=scsi0"]
        );

        let scsi1 = devices.iter().position(|d| d.contains("id=scsi1")).unwrap();
        let first_scsi_disk = devices.iter().position(|d| d.contains("id=blk_a.img")).unwrap();
        assert!(scsi1 < first_scsi_disk);
        assert!(devices.contains(&"virtio-blk-pci,drive=drive_vm1.img,id=blk_vm1.img"));
        assert!(devices.contains(&"scsi-hd,drive=drive_b.img,id=blk_b.img,bus=scsi1.0,lun=1"));

        let drive = Regex::new(r"^file=/data/vm1\.img,if=none,id=drive_vm1\.img,cache=none,aio=native$").unwrap();
        assert!(values(&args, "-drive").iter().any(|d| drive.is_match(d)));
    }

    #[test]
    fn test_controller_slot_conflict_names_device() {
        let mut props = props();
        for (path, addr) in [("/data/a.img", "scsi1:0x06/0"), ("/data/b.img", "scsi1:0x07/1")] {
            let mut disk = Disk::new(path).unwrap();
            disk.set_driver("scsi-hd").unwrap();
            disk.set_addr(Some(addr)).unwrap();
            props.disks_mut().append(disk).unwrap();
        }
        let err = generate_default(&props).unwrap_err();
        assert!(err.to_string().starts_with("disk 'b.img' validation error"));
    }

    #[test]
    fn test_pinned_slot_collision() {
        let mut props = props();
        let mut disk = Disk::new("/data/vm1.img").unwrap();
        disk.set_addr(Some("0x05")).unwrap();
        props.disks_mut().append(disk).unwrap();
        let mut netif = NetIface::new("tap0", None).unwrap();
        netif.set_addr(Some("0x05")).unwrap();
        props.netifs_mut().append(netif).unwrap();

        let err = generate_default(&props).unwrap_err();
        assert!(err.to_string().contains("netif 'tap0'"));
        assert!(err.to_string().contains("disk 'vm1.img'"));
    }

    #[test]
    fn test_multiqueue_netif() {
        let mut props = props();
        let mut netif = NetIface::new("tap0", Some("02:11:22:33:44:55")).unwrap();
        netif.set_queues(4).unwrap();
        props.netifs_mut().append(netif).unwrap();

        let args = generate_default(&props).unwrap();
        assert_eq!(
            values(&args, "-netdev"),
            ["tap,id=tap0,ifname=tap0,script=/usr/lib/vmplug/ifup,downscript=no,vhost=on,queues=4"]
        );
        assert!(values(&args, "-device").contains(
            &"virtio-net-pci,netdev=tap0,id=net_tap0,mac=02:11:22:33:44:55,mq=on,vectors=10"
        ));
    }

    #[test]
    fn test_passthrough_with_subfunctions_and_gpu() {
        let pci = FakePci::default();
        pci.add("0000:01:00.0", &["0000:01:00.1", "0000:01:00.2"]);
        pci.add("0000:02:00.0", &[]);

        let mut props = props();
        let mut gpu = HostDevice::new("01:00.0").unwrap();
        gpu.set_multifunction(true).unwrap();
        gpu.set_primary_gpu(true);
        props.hostpci_mut().append(gpu).unwrap();
        props.hostpci_mut().append(HostDevice::new("02:00.0").unwrap()).unwrap();

        let args = generate(&props, &Layout::default(), &LaunchFlags::default(), &pci).unwrap();
        assert_eq!(values(&args, "-vga"), ["none"]);
        assert!(args.contains(&"-nographic".to_string()));

        let vfio: Vec<_> = values(&args, "-device")
            .into_iter()
            .filter(|d| d.starts_with("vfio-pci"))
            .collect();
        assert_eq!(
            vfio,
            [
                "vfio-pci,host=0000:01:00.0,id=hostpci0,bus=pci.1,addr=0x01,multifunction=on,x-vga=on",
                "vfio-pci,host=0000:01:00.1,id=hostpci0.1,bus=pci.1,addr=0x01.1",
                "vfio-pci,host=0000:01:00.2,id=hostpci0.2,bus=pci.1,addr=0x01.2",
                "vfio-pci,host=0000:02:00.0,id=hostpci1,bus=pci.1,addr=0x02",
            ]
        );
        assert!(values(&args, "-device").contains(&"pci-bridge,id=pci.1,chassis_nr=1"));
    }

    #[test]
    fn test_missing_host_device_names_it() {
        let mut props = props();
        props.hostpci_mut().append(HostDevice::new("03:00.0").unwrap()).unwrap();
        let err = generate_default(&props).unwrap_err();
        assert!(err
            .to_string()
            .starts_with("host device '0000:03:00.0' validation error"));
    }

    #[test]
    fn test_inputs_vsock_and_kernel() {
        let mut props = props();
        props.inputs_mut().append(InputDevice::new(InputKind::Tablet)).unwrap();
        props.set_vsock(Some(VsockDevice::new(0).unwrap()));
        props.set_kernel(
            crate::devices::Kernel::new(Some("/boot/vmlinuz"), None, Some("console=ttyS0")).unwrap(),
        );

        let args = generate_default(&props).unwrap();
        let devices = values(&args, "-device");
        assert!(devices.contains(&"qemu-xhci,id=usb"));
        assert!(devices.contains(&"usb-tablet,id=input_usb_tablet,bus=usb.0"));
        assert!(devices.contains(&"vhost-vsock-pci,id=vsock0,guest-cid=1042"));
        assert_eq!(values(&args, "-kernel"), ["/boot/vmlinuz"]);
        assert_eq!(values(&args, "-append"), ["console=ttyS0"]);
    }

    #[test]
    fn test_deterministic() {
        let mut props = props();
        props.disks_mut().append(Disk::new("/data/vm1.img").unwrap()).unwrap();
        props.netifs_mut().append(NetIface::new("tap0", None).unwrap()).unwrap();
        assert_eq!(generate_default(&props).unwrap(), generate_default(&props).unwrap());
    }
}
