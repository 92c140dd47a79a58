//! Header helpers shared by the relay and the client
//!
//! Connection-scoped headers describe a single hop and must not be copied
//! from one connection onto another when a request crosses the tunnel.

const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.iter().any(|h| h.eq_ignore_ascii_case(name))
}

/// Drop hop-by-hop headers plus any extra names the caller wants recomputed
/// (e.g. `content-length`, `host`)
pub fn strip_hop_by_hop(headers: &[(String, String)], extra: &[&str]) -> Vec<(String, String)> {
    headers
        .iter()
        .filter(|(name, _)| {
            !is_hop_by_hop(name) && !extra.iter().any(|e| e.eq_ignore_ascii_case(name))
        })
        .cloned()
        .collect()
}
