//! Virtual hardware data model.
//!
//! Each device type validates its own fields. Cross-device rules (unique
//! keys, `actual <= total`) live in [`Pool`](crate::pool::Pool) and the
//! instance setters.

/// Declare a device driver enum that parses strictly from its QEMU name.
macro_rules! driver_enum {
    (
        $(#[$meta:meta])*
        $name:ident, $kind:literal {
            $( $(#[$vmeta:meta])* $variant:ident => $text:literal ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $name {
            $( $(#[$vmeta])* $variant ),+
        }

        impl $name {
            /// Every driver of this family.
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            /// QEMU driver name.
            pub fn as_str(&self) -> &'static str {
                match self {
                    $( $name::$variant => $text ),+
                }
            }
        }

        impl std::str::FromStr for $name {
            type Err = crate::error::Error;

            fn from_str(s: &str) -> crate::error::Result<Self> {
                match s.trim() {
                    $( $text => Ok($name::$variant), )+
                    other => Err(crate::error::Error::validation(
                        $kind,
                        format!("unknown driver: {}", other),
                    )),
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl serde::Serialize for $name {
            fn serialize<S: serde::Serializer>(
                &self,
                serializer: S,
            ) -> std::result::Result<S::Ok, S::Error> {
                serializer.serialize_str(self.as_str())
            }
        }

        impl<'de> serde::Deserialize<'de> for $name {
            fn deserialize<D: serde::Deserializer<'de>>(
                deserializer: D,
            ) -> std::result::Result<Self, D::Error> {
                let s = <String as serde::Deserialize>::deserialize(deserializer)?;
                s.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

mod addr;
mod cdrom;
mod cloudinit;
mod cpu;
mod disk;
mod firmware;
mod hostpci;
mod input;
mod kernel;
mod machine;
mod memory;
mod netif;
mod spec;
mod vsock;

pub use addr::{DeviceAddr, ScsiAddr, DEFAULT_SCSI_BUS};
pub use cdrom::{Cdrom, CdromDriver, CDROM_PREFIX};
pub use cloudinit::{CloudInitDrive, CloudInitDriver};
pub use cpu::Cpu;
pub use disk::{Disk, DiskDriver, DRIVE_PREFIX};
pub use firmware::Firmware;
pub use hostpci::{HostDevice, PciAddress};
pub use input::{InputDevice, InputKind};
pub use kernel::Kernel;
pub use machine::MachineType;
pub use memory::Memory;
pub use netif::{MacAddress, NetDriver, NetIface, NETDEV_PREFIX};
pub use spec::DeviceSpec;
pub use vsock::{VsockDevice, MIN_GUEST_CID};

use crate::error::{Error, Result};

/// Check an instance name against `[0-9A-Za-z_]{3,16}`.
pub fn validate_instance_name(name: &str) -> Result<()> {
    let valid_chars = name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if !(3..=16).contains(&name.len()) || !valid_chars {
        return Err(Error::validation(
            "instance name",
            format!("'{}' must match [0-9A-Za-z_]{{3,16}}", name),
        ));
    }
    Ok(())
}

/// Check a device name used as part of a hypervisor id.
fn validate_id_part(subject: &str, name: &str) -> Result<()> {
    if name.is_empty() || name.len() > 32 {
        return Err(Error::validation(subject, "name must be 1 to 32 characters"));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return Err(Error::validation(
            subject,
            format!("name '{}' contains invalid characters", name),
        ));
    }
    Ok(())
}

/// Error subject naming a device, e.g. `disk 'vm1.img'`.
pub(crate) fn subject(kind: &str, key: &str) -> String {
    format!("{} '{}'", kind, key)
}
