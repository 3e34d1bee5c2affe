//! Route/interface shell collaborator (C10).
//!
//! All host-mutating operations funnel through this module as calls to the
//! platform's `ip`/`iptables` tools, mirroring the way the reference stack's
//! own server-side route/NAT setup shells out rather than going through
//! netlink directly (see DESIGN.md). Every call is logged; failures are
//! non-fatal per §7's "external command failure" policy.

use crate::config::RouteConfig;
use std::process::Output;
use tracing::{debug, warn};

fn run(cmd: &str, args: &[&str]) -> std::io::Result<Output> {
    debug!(cmd, ?args, "running external command");
    std::process::Command::new(cmd).args(args).output()
}

fn log_result(label: &str, result: &std::io::Result<Output>) {
    match result {
        Ok(out) if out.status.success() => {}
        Ok(out) => {
            warn!(
                label,
                code = out.status.code(),
                stderr = %String::from_utf8_lossy(&out.stderr).trim(),
                "external command failed"
            );
        }
        Err(e) => warn!(label, error = %e, "failed to spawn external command"),
    }
}

/// Brings the tun/tap interface up with its configured address/mask/peer/MTU.
pub fn configure_interface(
    ifname: &str,
    ip: &str,
    mask: u8,
    peer: Option<&str>,
    mtu: Option<u32>,
) {
    let prefix = format!("{}/{}", ip, mask);
    log_result(
        "addr add",
        &run("ip", &["addr", "add", &prefix, "dev", ifname]),
    );

    if let Some(peer_ip) = peer {
        log_result(
            "addr add peer",
            &run("ip", &["addr", "add", ip, "peer", peer_ip, "dev", ifname]),
        );
    }

    if let Some(mtu) = mtu {
        log_result(
            "link set mtu",
            &run("ip", &["link", "set", "dev", ifname, "mtu", &mtu.to_string()]),
        );
    }

    log_result("link set up", &run("ip", &["link", "set", "dev", ifname, "up"]));

    if let Some(mtu) = mtu {
        mss_clamp(ifname, mtu);
    }
}

/// Installs the forward-chain MSS-clamp rule described in §4.1:
/// `--mss (MTU-40):65495 --clamp-mss-to-pmtu`.
fn mss_clamp(ifname: &str, mtu: u32) {
    let low = mtu.saturating_sub(40);
    let mss_range = format!("{}:65495", low);
    log_result(
        "mss clamp",
        &run(
            "iptables",
            &[
                "-A",
                "FORWARD",
                "-o",
                ifname,
                "-p",
                "tcp",
                "--tcp-flags",
                "SYN,RST",
                "SYN",
                "-m",
                "tcpmss",
                "--mss",
                &mss_range,
                "-j",
                "TCPMSS",
                "--clamp-mss-to-pmtu",
            ],
        ),
    );
}

/// Adds the freshly-created TAP interface to a bridge (C1's "ip field names
/// a bridge" case).
pub fn add_to_bridge(ifname: &str, bridge: &str) {
    log_result(
        "bridge master",
        &run("ip", &["link", "set", "dev", ifname, "master", bridge]),
    );
}

fn route_args(route: &RouteConfig) -> Vec<String> {
    let mut args = vec![
        format!("{}/{}", route.to, route.mask),
        "via".to_string(),
        route.gw.clone(),
    ];
    if let Some(table) = &route.table {
        args.push("table".to_string());
        args.push(table.clone());
    }
    if let Some(metric) = route.metric {
        args.push("metric".to_string());
        args.push(metric.to_string());
    }
    args
}

/// Deletes then adds every configured route (§4.7: delete-then-add on "up").
pub fn routes_up(routes: &[RouteConfig]) {
    for route in routes {
        let args = route_args(route);
        let arg_refs: Vec<&str> = args.iter().map(|s| s.as_str()).collect();

        let mut del = vec!["route", "del"];
        del.extend(arg_refs.iter().copied());
        log_result("route del (pre-up)", &run("ip", &del));

        let mut add = vec!["route", "add"];
        add.extend(arg_refs.iter().copied());
        log_result("route add", &run("ip", &add));
    }
}

/// Deletes every configured route (§4.7: "down" only deletes).
pub fn routes_down(routes: &[RouteConfig]) {
    for route in routes {
        let args = route_args(route);
        let arg_refs: Vec<&str> = args.iter().map(|s| s.as_str()).collect();

        let mut del = vec!["route", "del"];
        del.extend(arg_refs.iter().copied());
        log_result("route del", &run("ip", &del));
    }
}
