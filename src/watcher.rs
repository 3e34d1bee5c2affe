//! Local-address watcher (C6) and, sharing its tick, the announcer (C8).
//!
//! Resolution reads the kernel's interface address table directly via
//! `getifaddrs(3)` rather than shelling out: this runs once per second per
//! link, and a subprocess per link per tick would be wasteful on the hot
//! path (the shell collaborator in [`crate::route`] is reserved for the
//! infrequent, side-effecting operations).

use crate::config::Source;
use std::net::IpAddr;

/// Resolves an interface name to its current primary IPv4 address.
/// Returns `None` if the interface doesn't exist or has no IPv4 address.
pub fn resolve_iface_ipv4(iface: &str) -> Option<IpAddr> {
    unsafe {
        let mut ifaddrs: *mut libc::ifaddrs = std::ptr::null_mut();
        if libc::getifaddrs(&mut ifaddrs) != 0 {
            return None;
        }

        let mut current = ifaddrs;
        let mut result = None;

        while !current.is_null() {
            let ifa = &*current;
            if !ifa.ifa_addr.is_null() {
                let name = std::ffi::CStr::from_ptr(ifa.ifa_name).to_string_lossy();
                if name == iface && (*ifa.ifa_addr).sa_family == libc::AF_INET as u16 {
                    let addr = &*(ifa.ifa_addr as *const libc::sockaddr_in);
                    result = Some(IpAddr::V4(std::net::Ipv4Addr::from(u32::from_be(
                        addr.sin_addr.s_addr,
                    ))));
                    break;
                }
            }
            current = ifa.ifa_next;
        }

        libc::freeifaddrs(ifaddrs);
        result
    }
}

/// Resolves a link's configured `src` to its current address string (§4.6
/// step 1): an interface name is looked up live, a literal address passes
/// through unchanged.
pub fn resolve_source(src: &Source) -> Option<String> {
    match src {
        Source::Literal(addr) => Some(addr.clone()),
        Source::Interface(iface) => resolve_iface_ipv4(iface).map(|ip| ip.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_source_resolves_to_itself() {
        let src = Source::Literal("203.0.113.9".to_string());
        assert_eq!(resolve_source(&src), Some("203.0.113.9".to_string()));
    }

    #[test]
    fn loopback_interface_resolves_to_127_0_0_1() {
        // `lo` is present and configured in essentially every POSIX
        // environment this daemon runs in, including CI containers.
        let src = Source::Interface("lo".to_string());
        assert_eq!(resolve_source(&src), Some("127.0.0.1".to_string()));
    }

    #[test]
    fn nonexistent_interface_resolves_to_none() {
        let src = Source::Interface("definitely-not-a-real-iface0".to_string());
        assert_eq!(resolve_source(&src), None);
    }
}
