//! Obfuscation filter chain (prepend / byte-rotate / base64). Not encryption.

use base64::Engine;

const ROTATE_WINDOW: usize = 200;
const ROTATE_OUT: u8 = 127;
const ROTATE_IN: u8 = 129;

/// Symmetric pair of transforms applied before send (outbound) and after recv
/// (inbound). Each stage is independently toggled; defaults are all-off.
///
/// Outbound order is fixed: base64-encode -> byte-rotate -> prepend.
/// Inbound is the exact reverse: strip prepend -> byte-unrotate -> base64-decode.
#[derive(Debug, Clone, Default)]
pub struct FilterChain {
    pub prepend: Option<Vec<u8>>,
    pub rotate: bool,
    pub base64: bool,
}

impl FilterChain {
    pub fn outbound(&self, data: &[u8]) -> Vec<u8> {
        let mut buf = if self.base64 {
            base64::engine::general_purpose::STANDARD
                .encode(data)
                .into_bytes()
        } else {
            data.to_vec()
        };

        if self.rotate {
            rotate(&mut buf, ROTATE_OUT);
        }

        if let Some(pfx) = &self.prepend {
            let mut out = Vec::with_capacity(pfx.len() + buf.len());
            out.extend_from_slice(pfx);
            out.extend_from_slice(&buf);
            return out;
        }

        buf
    }

    /// Returns `None` if a required stage fails to undo (missing prepend,
    /// invalid base64) rather than panicking; the caller drops the datagram.
    pub fn inbound(&self, data: &[u8]) -> Option<Vec<u8>> {
        let mut buf = if let Some(pfx) = &self.prepend {
            if data.len() < pfx.len() || &data[..pfx.len()] != pfx.as_slice() {
                return None;
            }
            data[pfx.len()..].to_vec()
        } else {
            data.to_vec()
        };

        if self.rotate {
            rotate(&mut buf, ROTATE_IN);
        }

        if self.base64 {
            base64::engine::general_purpose::STANDARD
                .decode(&buf)
                .ok()
        } else {
            Some(buf)
        }
    }
}

fn rotate(buf: &mut [u8], delta: u8) {
    let n = buf.len().min(ROTATE_WINDOW);
    for b in &mut buf[..n] {
        *b = b.wrapping_add(delta);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rotate_is_involutive_with_matched_deltas() {
        for b in 0u8..=255 {
            let out = b.wrapping_add(ROTATE_OUT).wrapping_add(ROTATE_IN);
            assert_eq!(out, b);
        }
    }

    fn roundtrip(chain: &FilterChain, data: &[u8]) {
        let wire = chain.outbound(data);
        let back = chain.inbound(&wire).expect("inbound should decode what outbound produced");
        assert_eq!(back, data, "chain={:?}", chain);
    }

    #[test]
    fn noop_chain_roundtrips() {
        roundtrip(&FilterChain::default(), b"hello world");
    }

    #[test]
    fn prepend_only_roundtrips() {
        let chain = FilterChain {
            prepend: Some(b"XX".to_vec()),
            ..Default::default()
        };
        roundtrip(&chain, b"some tun frame bytes");
        roundtrip(&chain, b"");
    }

    #[test]
    fn rotate_only_roundtrips() {
        let chain = FilterChain {
            rotate: true,
            ..Default::default()
        };
        roundtrip(&chain, &(0u8..=255).collect::<Vec<u8>>());
    }

    #[test]
    fn base64_only_roundtrips() {
        let chain = FilterChain {
            base64: true,
            ..Default::default()
        };
        roundtrip(&chain, &[0u8, 1, 2, 255, 254, 253]);
    }

    #[test]
    fn all_stages_roundtrip() {
        let chain = FilterChain {
            prepend: Some(b"PFX:".to_vec()),
            rotate: true,
            base64: true,
        };
        let long: Vec<u8> = (0..1600).map(|i| (i % 256) as u8).collect();
        roundtrip(&chain, &long);
    }

    #[test]
    fn missing_prepend_fails_closed() {
        let chain = FilterChain {
            prepend: Some(b"PFX:".to_vec()),
            ..Default::default()
        };
        assert_eq!(chain.inbound(b"not prefixed"), None);
    }

    #[test]
    fn invalid_base64_fails_closed() {
        let chain = FilterChain {
            base64: true,
            ..Default::default()
        };
        assert_eq!(chain.inbound(b"not-base64!!"), None);
    }
}
