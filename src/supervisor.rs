//! Supervisor / runtime (C11): owns every component's shared state and drives
//! the single event loop described in §5 — one tun read future, one inbound
//! channel, and two interval ticks, all polled from the same `tokio::select!`
//! so no lock is ever needed on the link table.

use crate::config::{Config, LinkConfig};
use crate::dispatcher::{self, Candidate};
use crate::filter::FilterChain;
use crate::link::{ClassifyMode, Inbound, InboundEvent, LinkEndpoint};
use crate::peer::{self, LinkState};
use crate::reachability::{self, Reachability};
use crate::route;
use crate::tun_device::{Mode, TunDevice};
use crate::watcher;
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const INBOUND_CHANNEL_DEPTH: usize = 256;
const ONE_SECOND: Duration = Duration::from_secs(1);
const FIVE_SECONDS: Duration = Duration::from_secs(5);

struct Link {
    config: LinkConfig,
    endpoint: Option<LinkEndpoint>,
}

pub struct Supervisor {
    tun: TunDevice,
    links: HashMap<String, Link>,
    link_states: HashMap<String, LinkState>,
    reachability: Reachability,
    filters: FilterChain,
    routes: Vec<crate::config::RouteConfig>,
    known_links: Arc<Vec<String>>,
    classify: ClassifyMode,
    events_tx: mpsc::Sender<InboundEvent>,
    events_rx: mpsc::Receiver<InboundEvent>,
}

impl Supervisor {
    /// Builds every component from a loaded config: opens the tun/tap
    /// endpoint, brings up its interface, and registers (but does not yet
    /// open sockets for) every configured link — sockets come up on the
    /// first 1 Hz tick, same as any later rebuild (§4.6).
    pub async fn build(
        config: Config,
        filters: FilterChain,
        classify: ClassifyMode,
    ) -> Result<Supervisor> {
        let local = config
            .local
            .as_ref()
            .context("config has no `local` record")?;

        let mode = TunDevice::select_mode(&local.ip, local.options.tap);
        let requested_name = match mode {
            Mode::Tun => "tun%d",
            Mode::Tap => "tap%d",
        };
        let tun = TunDevice::open(requested_name, mode).context("failed to open tun/tap device")?;
        info!(name = tun.name(), ?mode, "tun/tap device up");

        bring_up_interface(&tun, local);

        let known_links: Arc<Vec<String>> = Arc::new(config.links.iter().map(|l| l.name.clone()).collect());

        let mut links = HashMap::new();
        let mut link_states = HashMap::new();
        for link in config.links {
            link_states.insert(
                link.name.clone(),
                LinkState::new(link.dstip.clone(), link.dstport),
            );
            links.insert(link.name.clone(), Link { config: link, endpoint: None });
        }

        let (events_tx, events_rx) = mpsc::channel(INBOUND_CHANNEL_DEPTH);

        Ok(Supervisor {
            tun,
            links,
            link_states,
            reachability: Reachability::default(),
            filters,
            routes: config.routes,
            known_links,
            classify,
            events_tx,
            events_rx,
        })
    }

    /// Runs forever (§5, §4.10): the process's only top-level error path is
    /// the tun device itself failing.
    pub async fn run(mut self) -> Result<()> {
        let mut one_second = tokio::time::interval(ONE_SECOND);
        let mut five_second = tokio::time::interval(FIVE_SECONDS);

        loop {
            tokio::select! {
                frame = self.tun.read_frame() => {
                    let frame = frame.context("tun read failed")?;
                    self.dispatch_outbound(&frame).await;
                }
                Some(event) = self.events_rx.recv() => {
                    self.handle_inbound(event).await;
                }
                _ = one_second.tick() => {
                    self.watch_and_announce_tick().await;
                }
                _ = five_second.tick() => {
                    self.reachability_tick();
                }
            }
        }
    }

    /// C5: select the least-used eligible link and send on it. Candidate
    /// construction/selection itself lives in the free function
    /// [`select_winner`] so it can be exercised against an in-memory fixture
    /// without a live tun device.
    async fn dispatch_outbound(&mut self, frame: &[u8]) {
        let Some((name, (ip, port))) = select_winner(&self.links, &mut self.link_states) else {
            debug!("no eligible link for outbound frame, dropping");
            return;
        };

        let Ok(addr) = format!("{}:{}", ip, port).parse::<SocketAddr>() else {
            warn!(link = %name, ip, port, "could not parse destination address");
            return;
        };

        if let Some(endpoint) = self.links.get(&name).and_then(|l| l.endpoint.as_ref()) {
            endpoint.send(addr, frame, &self.filters).await;
        }
    }

    /// Every received datagram, data or announcement, records its sender as
    /// this link's last-observed peer address (§4.2) — this is how a
    /// reply-only link without a configured `dstip` learns where to send.
    /// Data is handed to tun; an announcement additionally updates active
    /// flags and credits `seen` (C4 steps 2-3).
    async fn handle_inbound(&mut self, event: InboundEvent) {
        if let Some(state) = self.link_states.get_mut(&event.link) {
            state.lastdstip = Some(event.from.ip().to_string());
            state.lastdstport = Some(event.from.port());
        }

        match event.payload {
            Inbound::Data(frame) => {
                if let Err(e) = self.tun.write_frame(&frame).await {
                    warn!(error = %e, "tun write failed");
                }
            }
            Inbound::Announcement(ann) => {
                peer::apply_announcement(&ann, &mut self.link_states, &mut self.reachability.seen);
            }
        }
    }

    /// C6 + C8 shared 1 Hz tick: re-resolve each link's source address,
    /// rebuild the endpoint on change, then announce on every link with a
    /// known destination.
    async fn watch_and_announce_tick(&mut self) {
        let names: Vec<String> = self.links.keys().cloned().collect();
        for name in &names {
            self.watch_one_link(name).await;
        }
        self.send_announcements().await;
    }

    async fn watch_one_link(&mut self, name: &str) {
        let src = self.links[name].config.src.clone();
        let Some(new_ip) = watcher::resolve_source(&src) else {
            return;
        };

        let changed = self.link_states.get(name).map(|s| s.curip != new_ip).unwrap_or(true);
        if !changed {
            return;
        }

        let old_port = self.links[name].config.srcport;
        info!(link = name, new_ip = %new_ip, "resolved source address changed, rebuilding endpoint");

        // Terminate before rebuild: the single-endpoint invariant requires
        // the old socket closed before a new one can bind the same srcport.
        self.links.get_mut(name).unwrap().endpoint = None;

        if let Some(state) = self.link_states.get_mut(name) {
            state.curip = new_ip.clone();
        }

        let link_config = self.links[name].config.clone();
        match LinkEndpoint::open(
            name.to_string(),
            &new_ip,
            old_port,
            link_config
                .options
                .bind
                .then(|| link_config.dstip.clone().zip(link_config.dstport))
                .flatten(),
            link_config.options.reuse,
            Arc::clone(&self.known_links),
            self.classify,
            self.filters.clone(),
            self.events_tx.clone(),
        )
        .await
        {
            Ok(endpoint) => {
                self.links.get_mut(name).unwrap().endpoint = Some(endpoint);
            }
            Err(e) => {
                warn!(link = name, error = %e, "failed to bring up link endpoint, will retry next tick");
            }
        }
    }

    async fn send_announcements(&mut self) {
        let lastseen_keys: Vec<String> = self.reachability.lastseen.keys().cloned().collect();
        let names: Vec<String> = self.links.keys().cloned().collect();

        for name in names {
            let Some(link) = self.links.get(&name) else { continue };
            let Some(endpoint) = link.endpoint.as_ref() else { continue };
            let state = &self.link_states[&name];
            let Some((ip, port)) = state.destination(&link.config.dstip, &link.config.dstport) else {
                continue;
            };
            let Ok(addr) = format!("{}:{}", ip, port).parse::<SocketAddr>() else {
                continue;
            };

            let ann = crate::peer::Announcement::new(name.clone(), lastseen_keys.clone());
            endpoint.send(addr, &ann.encode(), &self.filters).await;
        }
    }

    /// C7: 0.2 Hz tick, toggling installed tunnel routes.
    fn reachability_tick(&mut self) {
        let transition = self.reachability.tick();
        reachability::apply_transition(&transition, &self.routes);
    }
}

/// Builds every [`Candidate`] from `link_states`/`links` in a single pass
/// over `link_states.iter_mut()` — rather than repeated `get_mut` calls,
/// which would ask the borrow checker to prove N separate mutable borrows of
/// the same map are disjoint across distinct calls, which it cannot do —
/// asks the dispatcher for a winner, applies the rescale pass (§9), and
/// returns the winning link's name and destination, or `None` if nothing is
/// eligible.
fn select_winner(
    links: &HashMap<String, Link>,
    link_states: &mut HashMap<String, LinkState>,
) -> Option<(String, (String, u16))> {
    let len = link_states.len();
    let mut names: Vec<String> = Vec::with_capacity(len);
    let mut dests: Vec<Option<(String, u16)>> = Vec::with_capacity(len);
    let mut candidates: Vec<Candidate<'_>> = Vec::with_capacity(len);

    for (name, state) in link_states.iter_mut() {
        let link = &links[name];
        let dest = state.destination(&link.config.dstip, &link.config.dstport);
        let eligible = link.endpoint.is_some() && state.active && dest.is_some();
        names.push(name.clone());
        dests.push(dest);
        candidates.push(Candidate {
            factor: link.config.factor,
            tried: &mut state.tried,
            eligible,
        });
    }

    let winner = dispatcher::select(candidates);

    let mut values: Vec<f64> = link_states.values().map(|s| s.tried).collect();
    dispatcher::rescale_if_needed(&mut values);
    for (state, v) in link_states.values_mut().zip(values) {
        state.tried = v;
    }

    let idx = winner?;
    Some((names[idx].clone(), dests[idx].clone()?))
}

fn bring_up_interface(tun: &TunDevice, local: &crate::config::LocalConfig) {
    match tun.mode() {
        Mode::Tun => {
            route::configure_interface(
                tun.name(),
                &local.ip,
                local.mask,
                local.dstip.as_deref(),
                Some(local.mtu),
            );
        }
        Mode::Tap => {
            if local.ip.parse::<std::net::Ipv4Addr>().is_ok() {
                route::configure_interface(
                    tun.name(),
                    &local.ip,
                    local.mask,
                    local.dstip.as_deref(),
                    Some(local.mtu),
                );
            } else {
                // The "ip" field names a bridge to join rather than an
                // address to assign (§4.1).
                route::add_to_bridge(tun.name(), &local.ip);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LinkConfig, LinkOptions, Source};

    fn link_config(name: &str, factor: u32, dstip: Option<&str>, dstport: Option<u16>) -> LinkConfig {
        LinkConfig {
            name: name.to_string(),
            src: Source::Literal("127.0.0.1".to_string()),
            srcport: 0,
            dstip: dstip.map(|s| s.to_string()),
            dstport,
            factor,
            options: LinkOptions::default(),
        }
    }

    /// A real (loopback) UDP socket, same as `link.rs`'s own tests use —
    /// `select_winner` only checks `endpoint.is_some()`, but an in-memory
    /// fixture still needs *some* live endpoint to stand in for "socket up".
    async fn open_loopback_endpoint(name: &str) -> LinkEndpoint {
        let (tx, _rx) = mpsc::channel(8);
        LinkEndpoint::open(
            name.to_string(),
            "127.0.0.1",
            0,
            None,
            false,
            Arc::new(vec![name.to_string()]),
            ClassifyMode::Hardened { max_len: 256 },
            FilterChain::default(),
            tx,
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn select_winner_picks_the_only_eligible_link_and_resolves_its_destination() {
        let endpoint = open_loopback_endpoint("a").await;
        let mut links = HashMap::new();
        links.insert(
            "a".to_string(),
            Link {
                config: link_config("a", 1000, Some("203.0.113.1"), Some(41000)),
                endpoint: Some(endpoint),
            },
        );

        let mut link_states = HashMap::new();
        let mut state = LinkState::new(Some("203.0.113.1".into()), Some(41000));
        state.active = true;
        link_states.insert("a".to_string(), state);

        let (name, (ip, port)) = select_winner(&links, &mut link_states).unwrap();
        assert_eq!(name, "a");
        assert_eq!(ip, "203.0.113.1");
        assert_eq!(port, 41000);
        assert!(link_states["a"].tried > 0.0, "the sent-on link should be charged");
    }

    #[tokio::test]
    async fn select_winner_skips_inactive_link() {
        let endpoint = open_loopback_endpoint("a").await;
        let mut links = HashMap::new();
        links.insert(
            "a".to_string(),
            Link {
                config: link_config("a", 1000, Some("203.0.113.1"), Some(41000)),
                endpoint: Some(endpoint),
            },
        );

        // `active` stays false: dead-peer-detection excludes it (§4.5 step 3).
        let mut link_states = HashMap::new();
        link_states.insert(
            "a".to_string(),
            LinkState::new(Some("203.0.113.1".into()), Some(41000)),
        );

        assert!(select_winner(&links, &mut link_states).is_none());
    }

    #[tokio::test]
    async fn select_winner_skips_link_with_no_endpoint() {
        let mut links = HashMap::new();
        links.insert(
            "a".to_string(),
            Link {
                config: link_config("a", 1000, Some("203.0.113.1"), Some(41000)),
                endpoint: None,
            },
        );

        let mut link_states = HashMap::new();
        let mut state = LinkState::new(Some("203.0.113.1".into()), Some(41000));
        state.active = true;
        link_states.insert("a".to_string(), state);

        assert!(select_winner(&links, &mut link_states).is_none());
    }

    #[tokio::test]
    async fn select_winner_uses_inferred_destination_when_no_dstip_configured() {
        let endpoint = open_loopback_endpoint("c").await;
        let mut links = HashMap::new();
        links.insert(
            "c".to_string(),
            Link {
                config: link_config("c", 1000, None, None),
                endpoint: Some(endpoint),
            },
        );

        let mut link_states = HashMap::new();
        let mut state = LinkState::new(None, None);
        state.active = true;
        state.lastdstip = Some("203.0.113.9".into());
        state.lastdstport = Some(41000);
        link_states.insert("c".to_string(), state);

        let (name, (ip, port)) = select_winner(&links, &mut link_states).unwrap();
        assert_eq!(name, "c");
        assert_eq!(ip, "203.0.113.9");
        assert_eq!(port, 41000);
    }

    #[tokio::test]
    async fn select_winner_prefers_least_tried_among_eligible_links() {
        let a_ep = open_loopback_endpoint("a").await;
        let b_ep = open_loopback_endpoint("b").await;
        let mut links = HashMap::new();
        links.insert(
            "a".to_string(),
            Link {
                config: link_config("a", 1000, Some("203.0.113.1"), Some(41000)),
                endpoint: Some(a_ep),
            },
        );
        links.insert(
            "b".to_string(),
            Link {
                config: link_config("b", 1000, Some("203.0.113.2"), Some(41000)),
                endpoint: Some(b_ep),
            },
        );

        let mut link_states = HashMap::new();
        let mut a_state = LinkState::new(Some("203.0.113.1".into()), Some(41000));
        a_state.active = true;
        a_state.tried = 5.0;
        let mut b_state = LinkState::new(Some("203.0.113.2".into()), Some(41000));
        b_state.active = true;
        b_state.tried = 0.0;
        link_states.insert("a".to_string(), a_state);
        link_states.insert("b".to_string(), b_state);

        let (name, _) = select_winner(&links, &mut link_states).unwrap();
        assert_eq!(name, "b", "link with lower tried should win");
    }
}
