//! Tap interfaces through `/dev/net/tun`.

use super::TapManager;
use crate::error::{Error, Result};
use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::path::PathBuf;

const TUNSETIFF: u64 = 0x4004_54ca;
const TUNSETPERSIST: u64 = 0x4004_54cb;
const TUNSETOWNER: u64 = 0x4004_54cc;
const TUNSETGROUP: u64 = 0x4004_54ce;

const IFF_TAP: libc::c_short = 0x0002;
const IFF_NO_PI: libc::c_short = 0x1000;
const IFF_MULTI_QUEUE: libc::c_short = 0x0100;

/// `struct ifreq` with the flags member of the union.
#[repr(C)]
struct IfReq {
    name: [libc::c_char; libc::IFNAMSIZ],
    flags: libc::c_short,
    _pad: [u8; 22],
}

impl IfReq {
    fn new(name: &str) -> io::Result<Self> {
        if name.is_empty() || name.len() >= libc::IFNAMSIZ {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid interface name: {}", name),
            ));
        }
        let mut req = IfReq {
            name: [0; libc::IFNAMSIZ],
            flags: 0,
            _pad: [0; 22],
        };
        for (dst, src) in req.name.iter_mut().zip(name.bytes()) {
            *dst = src as libc::c_char;
        }
        Ok(req)
    }
}

fn ioctl(fd: libc::c_int, request: u64, arg: *mut libc::c_void) -> io::Result<()> {
    // SAFETY: callers pass a request number matching the pointed-to argument.
    let rc = unsafe { libc::ioctl(fd, request as _, arg) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn ioctl_value(fd: libc::c_int, request: u64, value: libc::c_ulong) -> io::Result<()> {
    // SAFETY: the TUNSET* value requests take the argument by value.
    let rc = unsafe { libc::ioctl(fd, request as _, value) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Kernel tap devices.
#[derive(Debug, Clone)]
pub struct KernelTaps {
    tun: PathBuf,
}

impl Default for KernelTaps {
    fn default() -> Self {
        Self::new()
    }
}

impl KernelTaps {
    /// Use `/dev/net/tun`.
    pub fn new() -> Self {
        Self {
            tun: PathBuf::from("/dev/net/tun"),
        }
    }

    fn attach(&self, name: &str, multi_queue: bool) -> io::Result<File> {
        let file = OpenOptions::new().read(true).write(true).open(&self.tun)?;
        let mut req = IfReq::new(name)?;
        req.flags = IFF_TAP | IFF_NO_PI;
        if multi_queue {
            req.flags |= IFF_MULTI_QUEUE;
        }
        ioctl(file.as_raw_fd(), TUNSETIFF, &mut req as *mut IfReq as *mut libc::c_void)?;
        Ok(file)
    }

    fn control_socket() -> io::Result<OwnedFd> {
        // SAFETY: plain socket(2) call; the result is checked before use.
        let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM | libc::SOCK_CLOEXEC, 0) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: fd is a freshly created descriptor we own.
        Ok(unsafe { OwnedFd::from_raw_fd(fd) })
    }
}

fn tap_err(name: &str, e: io::Error) -> Error {
    Error::host(format!("tap {}", name), e.to_string())
}

impl TapManager for KernelTaps {
    fn create(&self, name: &str, owner: u32, queues: u32) -> Result<()> {
        let multi_queue = queues > 1;
        let queues = queues.max(1);
        for _ in 0..queues {
            let file = self.attach(name, multi_queue).map_err(|e| tap_err(name, e))?;
            let fd = file.as_raw_fd();
            ioctl_value(fd, TUNSETOWNER, owner as libc::c_ulong).map_err(|e| tap_err(name, e))?;
            ioctl_value(fd, TUNSETGROUP, owner as libc::c_ulong).map_err(|e| tap_err(name, e))?;
            ioctl_value(fd, TUNSETPERSIST, 1).map_err(|e| tap_err(name, e))?;
        }
        tracing::debug!(tap = %name, owner, queues, "tap created");
        Ok(())
    }

    fn delete(&self, name: &str) -> Result<()> {
        // Attaching with the wrong queue mode fails with EINVAL.
        let file = self
            .attach(name, false)
            .or_else(|_| self.attach(name, true))
            .map_err(|e| tap_err(name, e))?;
        ioctl_value(file.as_raw_fd(), TUNSETPERSIST, 0).map_err(|e| tap_err(name, e))?;
        tracing::debug!(tap = %name, "tap deleted");
        Ok(())
    }

    fn set_link(&self, name: &str, up: bool) -> Result<()> {
        let sock = Self::control_socket().map_err(|e| tap_err(name, e))?;
        let mut req = IfReq::new(name).map_err(|e| tap_err(name, e))?;
        let arg = &mut req as *mut IfReq as *mut libc::c_void;

        ioctl(sock.as_raw_fd(), libc::SIOCGIFFLAGS as u64, arg).map_err(|e| tap_err(name, e))?;
        if up {
            req.flags |= libc::IFF_UP as libc::c_short;
        } else {
            req.flags &= !(libc::IFF_UP as libc::c_short);
        }
        let arg = &mut req as *mut IfReq as *mut libc::c_void;
        ioctl(sock.as_raw_fd(), libc::SIOCSIFFLAGS as u64, arg).map_err(|e| tap_err(name, e))?;
        Ok(())
    }
}
