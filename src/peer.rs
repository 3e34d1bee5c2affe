//! Peer view (C4): per-link liveness and announcement wire encoding.

const ANNOUNCE_TAG: &str = "SES:";

/// Parsed form of a `SES:<dstlink>:<link1>,<link2>,...` datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Announcement {
    /// The sender's own label for the link this arrived on.
    pub dstlink: String,
    /// The sender's current view of which of *our* links it hears from.
    pub peerseen: Vec<String>,
}

impl Announcement {
    pub fn new(dstlink: impl Into<String>, peerseen: Vec<String>) -> Self {
        Announcement {
            dstlink: dstlink.into(),
            peerseen,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        format!("{}{}:{}", ANNOUNCE_TAG, self.dstlink, self.peerseen.join(",")).into_bytes()
    }

    /// Unconditioned classification: true iff the post-filter plaintext
    /// starts with the 4-byte tag, exactly as the reference does it. See
    /// `parse_hardened` for the opt-in stricter variant (§9).
    pub fn looks_like_announcement(data: &[u8]) -> bool {
        data.starts_with(ANNOUNCE_TAG.as_bytes())
    }

    pub fn parse(data: &[u8]) -> Option<Announcement> {
        let s = std::str::from_utf8(data).ok()?;
        let rest = s.strip_prefix(ANNOUNCE_TAG)?;
        let (dstlink, list) = rest.split_once(':')?;
        if dstlink.is_empty() {
            return None;
        }
        let peerseen = if list.is_empty() {
            Vec::new()
        } else {
            list.split(',').map(|s| s.to_string()).collect()
        };
        Some(Announcement {
            dstlink: dstlink.to_string(),
            peerseen,
        })
    }

    /// Length-bounded, all-printable-ASCII pre-validator (§9 hardening). Used
    /// when the compatibility flag for the unconditioned classifier is off.
    pub fn parse_hardened(data: &[u8], known_links: &[String], max_len: usize) -> Option<Announcement> {
        if data.len() > max_len || !data.iter().all(|&b| b.is_ascii_graphic() || b == b',' || b == b':') {
            return None;
        }
        let ann = Self::parse(data)?;
        if !known_links.iter().any(|l| l == &ann.dstlink) {
            return None;
        }
        Some(ann)
    }
}

/// Mutable per-link state (§3 `LinkState`), owned by the supervisor.
#[derive(Debug, Clone)]
pub struct LinkState {
    pub curip: String,
    pub lastdstip: Option<String>,
    pub lastdstport: Option<u16>,
    pub active: bool,
    pub tried: f64,
}

impl LinkState {
    pub fn new(seed_dstip: Option<String>, seed_dstport: Option<u16>) -> Self {
        LinkState {
            curip: String::new(),
            lastdstip: seed_dstip,
            lastdstport: seed_dstport,
            active: false,
            tried: 0.0,
        }
    }

    pub fn destination(&self, configured_dstip: &Option<String>, configured_dstport: &Option<u16>) -> Option<(String, u16)> {
        match (configured_dstip, configured_dstport) {
            (Some(ip), Some(port)) => Some((ip.clone(), *port)),
            _ => match (&self.lastdstip, self.lastdstport) {
                (Some(ip), Some(port)) => Some((ip.clone(), port)),
                _ => None,
            },
        }
    }
}

/// Applies one received announcement to the per-link active flags and the
/// 5-second `seen` accumulator (§4.4 steps 2-3). `dstlink_state` is the state
/// of the link the datagram arrived on (for step 1, recording the sender
/// address, which the caller does before invoking this).
pub fn apply_announcement(
    ann: &Announcement,
    link_states: &mut std::collections::HashMap<String, LinkState>,
    seen: &mut std::collections::HashMap<String, u64>,
) {
    for (name, state) in link_states.iter_mut() {
        state.active = ann.peerseen.iter().any(|p| p == name);
    }
    *seen.entry(ann.dstlink.clone()).or_insert(0) += ann.peerseen.len() as u64;
}
