//! Network interfaces.

use super::disk::{check_addr, Bus, BusKind};
use super::{subject, DeviceAddr, DeviceSpec};
use crate::error::{Error, Result};
use crate::pool::Keyed;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{json, Value};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Prefix of every network device id.
pub const NETDEV_PREFIX: &str = "net_";

/// Longest host interface name the kernel accepts.
const MAX_IFNAME: usize = 15;

/// Queue pair limit for multi-queue virtio.
const MAX_QUEUES: u32 = 16;

driver_enum! {
    /// NIC model.
    NetDriver, "netif" {
        /// Paravirtual NIC, supports multi-queue.
        VirtioNet => "virtio-net-pci",
        /// Emulated Intel NIC.
        E1000 => "e1000",
        /// Emulated Realtek NIC.
        Rtl8139 => "rtl8139",
    }
}

impl Default for NetDriver {
    fn default() -> Self {
        NetDriver::VirtioNet
    }
}

impl BusKind for NetDriver {
    fn bus(&self) -> Bus {
        Bus::Pci
    }
}

/// Ethernet address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MacAddress([u8; 6]);

impl MacAddress {
    /// Locally administered address derived from an interface name.
    ///
    /// The same name always maps to the same address.
    pub fn derived(name: &str) -> Self {
        // FNV-1a
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        for byte in name.bytes() {
            hash ^= u64::from(byte);
            hash = hash.wrapping_mul(0x0100_0000_01b3);
        }
        let b = hash.to_be_bytes();
        MacAddress([0x02, b[3], b[4], b[5], b[6], b[7]])
    }

    /// Raw octets.
    pub fn octets(&self) -> [u8; 6] {
        self.0
    }
}

impl FromStr for MacAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::validation("mac address", format!("invalid address: {}", s));
        let mut octets = [0u8; 6];
        let mut parts = s.trim().split(':');
        for octet in octets.iter_mut() {
            let part = parts.next().ok_or_else(invalid)?;
            if part.len() != 2 {
                return Err(invalid());
            }
            *octet = u8::from_str_radix(part, 16).map_err(|_| invalid())?;
        }
        if parts.next().is_some() {
            return Err(invalid());
        }
        if octets[0] & 0x01 != 0 {
            return Err(Error::validation(
                "mac address",
                format!("{} is a multicast address", s),
            ));
        }
        Ok(MacAddress(octets))
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let o = self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            o[0], o[1], o[2], o[3], o[4], o[5]
        )
    }
}

impl Serialize for MacAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for MacAddress {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

fn one() -> u32 {
    1
}

fn is_one(v: &u32) -> bool {
    *v == 1
}

/// A NIC backed by a host tap interface of the same name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetIface {
    ifname: String,
    #[serde(default)]
    driver: NetDriver,
    mac: MacAddress,
    #[serde(default = "one", skip_serializing_if = "is_one")]
    queues: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    addr: Option<DeviceAddr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    ifup: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    ifdown: Option<PathBuf>,
}

impl Keyed for NetIface {
    const KIND: &'static str = "netif";

    fn key(&self) -> String {
        self.ifname.clone()
    }
}

impl NetIface {
    /// Create a NIC; without an explicit MAC one is derived from the name.
    pub fn new(ifname: &str, mac: Option<&str>) -> Result<Self> {
        let ifname = ifname.trim();
        let mac = match mac.map(str::trim).filter(|m| !m.is_empty()) {
            Some(m) => m.parse()?,
            None => MacAddress::derived(ifname),
        };
        let netif = Self {
            ifname: ifname.to_string(),
            driver: NetDriver::default(),
            mac,
            queues: 1,
            addr: None,
            ifup: None,
            ifdown: None,
        };
        netif.validate()?;
        Ok(netif)
    }

    /// Host interface name.
    pub fn ifname(&self) -> &str {
        &self.ifname
    }

    /// NIC model.
    pub fn driver(&self) -> NetDriver {
        self.driver
    }

    /// Guest MAC address.
    pub fn mac(&self) -> MacAddress {
        self.mac
    }

    /// Queue pairs.
    pub fn queues(&self) -> u32 {
        self.queues
    }

    /// Bus address, if pinned.
    pub fn addr(&self) -> Option<&DeviceAddr> {
        self.addr.as_ref()
    }

    /// Script run when the interface comes up.
    pub fn ifup(&self) -> Option<&PathBuf> {
        self.ifup.as_ref()
    }

    /// Script run when the interface goes down.
    pub fn ifdown(&self) -> Option<&PathBuf> {
        self.ifdown.as_ref()
    }

    /// Device id, `net_<ifname>`.
    pub fn qdev_id(&self) -> String {
        format!("{}{}", NETDEV_PREFIX, self.ifname)
    }

    fn subject(&self) -> String {
        subject(Self::KIND, &self.ifname)
    }

    /// Set the NIC model by name.
    pub fn set_driver(&mut self, driver: &str) -> Result<()> {
        let driver: NetDriver = driver.parse()?;
        if self.queues > 1 && driver != NetDriver::VirtioNet {
            return Err(Error::validation(
                self.subject(),
                format!("{} does not support multiple queues", driver),
            ));
        }
        self.driver = driver;
        Ok(())
    }

    /// Set the queue pair count.
    pub fn set_queues(&mut self, queues: u32) -> Result<()> {
        if queues == 0 || queues > MAX_QUEUES {
            return Err(Error::validation(
                self.subject(),
                format!("queues must be between 1 and {}", MAX_QUEUES),
            ));
        }
        if queues > 1 && self.driver != NetDriver::VirtioNet {
            return Err(Error::validation(
                self.subject(),
                format!("{} does not support multiple queues", self.driver),
            ));
        }
        self.queues = queues;
        Ok(())
    }

    /// Set the bus address.
    pub fn set_addr(&mut self, addr: Option<&str>) -> Result<()> {
        let addr = addr
            .map(str::trim)
            .filter(|a| !a.is_empty())
            .map(str::parse::<DeviceAddr>)
            .transpose()?;
        check_addr(&self.subject(), self.driver, addr.as_ref())?;
        self.addr = addr;
        Ok(())
    }

    /// Set the up and down scripts; empty paths clear them.
    pub fn set_scripts(&mut self, ifup: Option<&str>, ifdown: Option<&str>) {
        let script = |p: Option<&str>| {
            p.map(str::trim)
                .filter(|p| !p.is_empty())
                .map(PathBuf::from)
        };
        self.ifup = script(ifup);
        self.ifdown = script(ifdown);
    }

    /// Check fields read from disk.
    pub fn validate(&self) -> Result<()> {
        let name_ok = !self.ifname.is_empty()
            && self.ifname.len() <= MAX_IFNAME
            && self
                .ifname
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_'));
        if !name_ok {
            return Err(Error::validation(
                self.subject(),
                format!("interface name must be 1 to {} of [A-Za-z0-9_-]", MAX_IFNAME),
            ));
        }
        if self.queues == 0 || self.queues > MAX_QUEUES {
            return Err(Error::validation(self.subject(), "invalid queue count"));
        }
        if self.queues > 1 && self.driver != NetDriver::VirtioNet {
            return Err(Error::validation(
                self.subject(),
                format!("{} does not support multiple queues", self.driver),
            ));
        }
        check_addr(&self.subject(), self.driver, self.addr.as_ref())
    }

    /// `-netdev` options for a tap the hypervisor configures with `script`.
    pub fn netdev_arg(&self, script: &str) -> String {
        let mut arg = format!(
            "tap,id={0},ifname={0},script={1},downscript=no",
            self.ifname, script
        );
        if self.driver == NetDriver::VirtioNet {
            arg.push_str(",vhost=on");
        }
        if self.queues > 1 {
            arg.push_str(&format!(",queues={}", self.queues));
        }
        arg
    }

    /// `netdev_add` arguments for a tap that already exists and is up.
    pub fn netdev_qmp(&self) -> Value {
        let mut args = json!({
            "type": "tap",
            "id": self.ifname,
            "ifname": self.ifname,
            "script": "no",
            "downscript": "no",
        });
        if self.driver == NetDriver::VirtioNet {
            args["vhost"] = json!(true);
        }
        if self.queues > 1 {
            args["queues"] = json!(self.queues);
        }
        args
    }

    /// Front-end device definition.
    pub fn device_spec(&self) -> DeviceSpec {
        let mut spec = DeviceSpec::new(self.driver.as_str())
            .prop("netdev", self.ifname.clone())
            .prop("id", self.qdev_id())
            .prop("mac", self.mac.to_string());
        if self.queues > 1 {
            spec = spec
                .prop("mq", true)
                .prop("vectors", 2 * self.queues + 2);
        }
        spec.opt_prop(
            "addr",
            self.addr
                .as_ref()
                .and_then(DeviceAddr::pci_slot)
                .map(|slot| format!("0x{:02x}", slot)),
        )
    }
}
