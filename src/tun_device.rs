//! The tun/tap endpoint (C1): owns the kernel device handle.
//!
//! Opens `/dev/net/tun`, requests a TUN or TAP interface via `TUNSETIFF`, and
//! reads the kernel-assigned interface name back out of the ioctl struct.
//! Address/MTU/MSS-clamp/bridge configuration is delegated to the shell
//! collaborator in [`crate::route`]; this module only owns the byte stream.

use anyhow::{Context, Result};
use std::ffi::CStr;
use std::os::unix::io::{AsRawFd, RawFd};
use tokio::io::unix::AsyncFd;

const TUNSETIFF: libc::c_ulong = 0x4004_54ca;
// Safety: constant byte string, NUL-terminated, no interior NULs.
const CLONE_DEV_PATH: &CStr = unsafe { CStr::from_bytes_with_nul_unchecked(b"/dev/net/tun\0") };

/// Mirrors the kernel's `struct ifreq` as used by `TUNSETIFF`: a 16-byte
/// NUL-padded name followed by a 16-bit flags field (the rest of the union is
/// padding we never read).
#[repr(C)]
struct IfReq {
    name: [u8; libc::IFNAMSIZ],
    flags: libc::c_short,
    _pad: [u8; 64],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Tun,
    Tap,
}

pub struct TunDevice {
    fd: AsyncFd<RawFd>,
    name: String,
    mode: Mode,
}

impl Drop for TunDevice {
    fn drop(&mut self) {
        unsafe { libc::close(self.fd.as_raw_fd()) };
    }
}

impl TunDevice {
    /// Mode selection per spec §4.1: a dotted-quad local IP not asking for
    /// `tap` gets TUN (layer-3); everything else gets TAP (layer-2).
    pub fn select_mode(local_ip: &str, want_tap: bool) -> Mode {
        if !want_tap && local_ip.parse::<std::net::Ipv4Addr>().is_ok() {
            Mode::Tun
        } else {
            Mode::Tap
        }
    }

    pub fn open(requested_name: &str, mode: Mode) -> Result<Self> {
        if requested_name.len() >= libc::IFNAMSIZ {
            anyhow::bail!("interface name {:?} too long", requested_name);
        }

        let fd = unsafe { libc::open(CLONE_DEV_PATH.as_ptr(), libc::O_RDWR) };
        if fd < 0 {
            return Err(std::io::Error::last_os_error()).context("failed to open /dev/net/tun");
        }

        let mut req = IfReq {
            name: [0u8; libc::IFNAMSIZ],
            flags: 0,
            _pad: [0u8; 64],
        };
        req.name[..requested_name.len()].copy_from_slice(requested_name.as_bytes());

        let iff_flags = match mode {
            Mode::Tun => libc::IFF_TUN,
            Mode::Tap => libc::IFF_TAP,
        };
        req.flags = (iff_flags | libc::IFF_NO_PI) as libc::c_short;

        if unsafe { libc::ioctl(fd, TUNSETIFF, &req) } < 0 {
            let err = std::io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(err).context("TUNSETIFF ioctl failed");
        }

        // Kernel may have assigned a different name (e.g. "tun%d" templates);
        // read the real name back out of the struct we just filled in.
        let name = read_ifname(&req.name);

        set_nonblocking(fd).context("failed to set tun fd non-blocking")?;

        Ok(TunDevice {
            fd: AsyncFd::new(fd).context("failed to register tun fd with the reactor")?,
            name,
            mode,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// Produces a single IP packet (TUN) or Ethernet frame (TAP), up to 4096
    /// bytes. Suspends until the device is readable; callers drive this in a
    /// loop to keep draining the device.
    pub async fn read_frame(&self) -> Result<Vec<u8>> {
        loop {
            let mut guard = self.fd.readable().await.context("tun fd readable() failed")?;
            let mut buf = vec![0u8; 4096];
            let res = guard.try_io(|fd| {
                let n = unsafe {
                    libc::read(fd.as_raw_fd(), buf.as_mut_ptr() as *mut libc::c_void, buf.len())
                };
                if n < 0 {
                    Err(std::io::Error::last_os_error())
                } else {
                    Ok(n as usize)
                }
            });
            match res {
                Ok(Ok(n)) => {
                    buf.truncate(n);
                    return Ok(buf);
                }
                Ok(Err(e)) => return Err(e).context("tun read failed"),
                Err(_would_block) => continue,
            }
        }
    }

    /// Writes exactly one frame. A short write is logged, not retried (§4.1).
    pub async fn write_frame(&self, frame: &[u8]) -> Result<()> {
        loop {
            let mut guard = self.fd.writable().await.context("tun fd writable() failed")?;
            let res = guard.try_io(|fd| {
                let n = unsafe {
                    libc::write(fd.as_raw_fd(), frame.as_ptr() as *const libc::c_void, frame.len())
                };
                if n < 0 {
                    Err(std::io::Error::last_os_error())
                } else {
                    Ok(n as usize)
                }
            });
            match res {
                Ok(Ok(n)) => {
                    if n != frame.len() {
                        tracing::warn!(wrote = n, wanted = frame.len(), "tun write: short write");
                    }
                    return Ok(());
                }
                Ok(Err(e)) => return Err(e).context("tun write failed"),
                Err(_would_block) => continue,
            }
        }
    }
}

fn read_ifname(raw: &[u8; libc::IFNAMSIZ]) -> String {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..end]).into_owned()
}

fn set_nonblocking(fd: RawFd) -> std::io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(std::io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn select_mode_picks_tun_for_dotted_quad() {
        assert_eq!(TunDevice::select_mode("10.1.2.1", false), Mode::Tun);
    }

    #[test]
    fn select_mode_picks_tap_when_requested() {
        assert_eq!(TunDevice::select_mode("10.1.2.1", true), Mode::Tap);
    }

    #[test]
    fn select_mode_picks_tap_for_bridge_name() {
        assert_eq!(TunDevice::select_mode("br0", false), Mode::Tap);
    }

    #[test]
    fn read_ifname_stops_at_first_nul() {
        let mut raw = [0u8; libc::IFNAMSIZ];
        raw[..4].copy_from_slice(b"tun3");
        assert_eq!(read_ifname(&raw), "tun3");
    }
}
