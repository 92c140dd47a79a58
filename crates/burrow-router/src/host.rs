//! Host header → routing label

use crate::generator::validate_subdomain;
use std::net::IpAddr;

/// Lowercase a host and strip its port (and IPv6 brackets)
pub fn normalize_host(host: &str) -> String {
    let host = host.trim();

    let without_port = if let Some(rest) = host.strip_prefix('[') {
        // [::1]:8080
        rest.split(']').next().unwrap_or(rest)
    } else {
        host.split(':').next().unwrap_or(host)
    };

    without_port.trim_end_matches('.').to_ascii_lowercase()
}

/// Pull the tunnel subdomain out of a `Host` value
///
/// The label is the part before the first `.`. Without a base domain any
/// dotted host qualifies; with one, the host must be exactly
/// `<label>.<base_domain>`. Bare hosts, IP literals, foreign domains and
/// labels that are not valid subdomains yield `None`.
pub fn extract_subdomain(host: &str, base_domain: Option<&str>) -> Option<String> {
    let host = normalize_host(host);
    if host.parse::<IpAddr>().is_ok() {
        return None;
    }
    let (label, rest) = host.split_once('.')?;

    if let Some(base) = base_domain {
        let base = normalize_host(base);
        if rest != base {
            return None;
        }
    }

    validate_subdomain(label).ok()?;
    Some(label.to_string())
}
