//! Client address extraction behind trusted reverse proxies.
//!
//! Forwarding headers are only honored when the connecting socket belongs
//! to a configured proxy. `X-Forwarded-For` is walked right to left past
//! trusted hops, so an attacker prepending fake entries cannot choose the
//! address policy sees.

use std::net::IpAddr;

use http::HeaderMap;

use crate::config::TrustedProxiesConfig;

const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_REAL_IP: &str = "x-real-ip";

/// The client address for policy purposes.
///
/// Without proxy trust configured (the default), this is simply the socket
/// peer. When the peer is a trusted proxy, `X-Forwarded-For` is consulted,
/// then `X-Real-IP`, then the peer again.
pub fn extract_client_ip(
    peer: IpAddr,
    headers: &HeaderMap,
    trusted: &TrustedProxiesConfig,
) -> IpAddr {
    if !trusted.is_configured() || !trusted.is_trusted(peer) {
        if trusted.is_configured() && headers.contains_key(X_FORWARDED_FOR) {
            tracing::debug!(peer = %peer, "ignoring forwarding headers from untrusted peer");
        }
        return peer;
    }

    if let Some(ip) = from_forwarded_for(headers, trusted) {
        return ip;
    }

    if let Some(ip) = headers
        .get(X_REAL_IP)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
    {
        return ip;
    }

    peer
}

/// Right-to-left over `X-Forwarded-For`: skip trusted proxy hops, return the
/// first untrusted entry, the address the outermost trusted proxy actually
/// saw connect.
fn from_forwarded_for(headers: &HeaderMap, trusted: &TrustedProxiesConfig) -> Option<IpAddr> {
    let ips: Vec<IpAddr> = headers
        .get_all(X_FORWARDED_FOR)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|entry| entry.trim().parse().ok())
        .collect();

    if ips.is_empty() {
        return None;
    }
    if trusted.dangerously_trust_all {
        return ips.first().copied();
    }
    ips.into_iter().rev().find(|ip| !trusted.is_trusted(*ip))
}
