//! Header rewriting between client and upstream.
//!
//! Hop-by-hop headers never cross the proxy in either direction. Forwarding
//! headers supplied by the client are dropped so an upstream cannot be fed a
//! spoofed chain. `Host` follows the target authority unless the caller
//! explicitly overrode it.

use http::{
    HeaderMap, HeaderName, HeaderValue,
    header::{self, HOST},
};
use url::Url;

use crate::error::ProxyError;

/// Hop-by-hop headers per RFC 7230 §6.1. `Upgrade` and `Connection` are
/// re-established by the WebSocket handshake machinery when relevant.
fn is_hop_by_hop(name: &HeaderName) -> bool {
    matches!(
        name.as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
    )
}

/// Proxy/forwarding headers the client may have sent; never forwarded.
fn is_forwarding_header(name: &HeaderName) -> bool {
    let name = name.as_str();
    name.starts_with("x-forwarded-") || name == "x-real-ip" || name == "forwarded"
}

/// The authority component for the `Host` header: `host` or `host:port`.
pub fn authority(url: &Url) -> String {
    match (url.host_str(), url.port()) {
        (Some(host), Some(port)) => format!("{host}:{port}"),
        (Some(host), None) => host.to_string(),
        (None, _) => String::new(),
    }
}

/// Build the header set for the upstream request.
///
/// Client headers are copied minus hop-by-hop, forwarding, and `Host`
/// entries, plus any names listed in the client's `Connection` header.
/// `Host` is set from the target authority, and the caller's overrides are
/// applied last so they win over every default, including `Host` itself.
/// `User-Agent` passes through when the client sent one and is never
/// synthesized.
pub fn build_upstream_headers(
    client_headers: &HeaderMap,
    target: &Url,
    overrides: &HeaderMap,
) -> Result<HeaderMap, ProxyError> {
    let connection_named = connection_header_names(client_headers);

    let mut out = HeaderMap::new();
    for (name, value) in client_headers {
        if is_hop_by_hop(name)
            || is_forwarding_header(name)
            || *name == HOST
            || connection_named.contains(name)
        {
            continue;
        }
        out.append(name.clone(), value.clone());
    }

    let authority = authority(target);
    let host_value = HeaderValue::from_str(&authority).map_err(|_| {
        ProxyError::BadTarget(format!("target authority '{authority}' is not a valid Host"))
    })?;
    out.insert(HOST, host_value);

    for (name, value) in overrides {
        out.insert(name.clone(), value.clone());
    }

    Ok(out)
}

/// Headers the client's `Connection` header marked as hop-by-hop.
fn connection_header_names(headers: &HeaderMap) -> Vec<HeaderName> {
    headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect()
}

/// Filter an upstream response's headers for the client: hop-by-hop entries
/// are removed, everything else (including `Content-Length` and cookies)
/// passes through.
pub fn filter_response_headers(upstream: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::new();
    for (name, value) in upstream {
        if is_hop_by_hop(name) {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}
