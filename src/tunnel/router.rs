//! Host-header routing.
//!
//! The request host is probed against the registry as-is; on a miss the
//! leftmost DNS label is stripped and the probe repeats, until a match is
//! found or no `.` remains. `www.<label>.<base>` therefore still reaches
//! `<label>.<base>` when only the latter is registered.

use std::sync::Arc;

use super::registry::Registry;
use super::transport::TunnelConn;

/// Canonical routing form of a Host header value: port removed, lowercased,
/// trailing root dot dropped.
pub fn normalize_host(raw: &str) -> String {
    let raw = raw.trim();
    let host = if let Some(rest) = raw.strip_prefix('[') {
        // IPv6 literal, keep the brackets
        match rest.find(']') {
            Some(end) => &raw[..end + 2],
            None => raw,
        }
    } else {
        match raw.rsplit_once(':') {
            Some((host, port)) if port.bytes().all(|b| b.is_ascii_digit()) => host,
            _ => raw,
        }
    };
    host.trim_end_matches('.').to_ascii_lowercase()
}

/// The probe sequence for `host`, most specific first.
///
/// `a.b.example.com` yields `a.b.example.com`, `b.example.com`,
/// `example.com`, `com`.
pub fn candidates(host: &str) -> impl Iterator<Item = &str> {
    std::iter::successors(Some(host), |&h| h.split_once('.').map(|(_, rest)| rest))
}

/// Resolve a normalized host to its tunnel. Returns the registered hostname
/// that matched along with the connection.
pub async fn route(registry: &Registry, host: &str) -> Option<(String, Arc<TunnelConn>)> {
    for candidate in candidates(host) {
        if let Some(conn) = registry.resolve(candidate).await {
            return Some((candidate.to_string(), conn));
        }
    }
    None
}

/// Whether `host` addresses the relay itself (exact match, no stripping).
pub fn is_base_domain(host: &str, domain: &str) -> bool {
    host == domain
}
