//! Outbound and inbound admission checks.
//!
//! The outbound check resolves the target host, classifies every candidate
//! address, and hands back a single pinned address for the dialer. The
//! address checked here is the address connected to; nothing re-resolves at
//! connect time.

use std::net::{IpAddr, SocketAddr};

use url::{Host, Url};

use super::{AddressClass, classify, in_cidr_set};
use crate::{
    config::{InstanceConfig, RestrictOut},
    error::ProxyError,
};

/// A target whose address survived policy and is fixed for the dialer.
#[derive(Debug, Clone)]
pub struct PinnedTarget {
    /// Hostname exactly as it appeared in the target URL (drives `Host`
    /// and SNI). For IP-literal targets this is the literal.
    pub host: String,
    /// The classified address the dispatcher must connect to.
    pub addr: SocketAddr,
    /// Whether the URL named an IP literal (no resolution happened).
    pub is_literal: bool,
}

/// Resolve the target URL's host, classify the result, and enforce the
/// instance's outbound restriction.
///
/// IP-literal targets classify directly. Hostnames resolve through the
/// system resolver; every candidate must be admissible (a mixed answer is
/// denied outright), and the first candidate becomes the pinned address.
pub async fn resolve_and_authorize(
    url: &Url,
    instance: &InstanceConfig,
) -> Result<PinnedTarget, ProxyError> {
    let port = url
        .port_or_known_default()
        .ok_or_else(|| ProxyError::BadTarget(format!("no port for target '{url}'")))?;

    match url.host() {
        Some(Host::Ipv4(v4)) => {
            let ip = IpAddr::V4(v4);
            admit(ip, instance).map_err(|()| deny(url))?;
            Ok(PinnedTarget {
                host: v4.to_string(),
                addr: SocketAddr::new(ip, port),
                is_literal: true,
            })
        }
        Some(Host::Ipv6(v6)) => {
            let ip = IpAddr::V6(v6);
            admit(ip, instance).map_err(|()| deny(url))?;
            Ok(PinnedTarget {
                host: v6.to_string(),
                addr: SocketAddr::new(ip, port),
                is_literal: true,
            })
        }
        Some(Host::Domain(domain)) => {
            let candidates: Vec<SocketAddr> = tokio::net::lookup_host((domain, port))
                .await
                .map_err(|e| {
                    ProxyError::UpstreamUnreachable(format!(
                        "DNS resolution of '{domain}' failed: {e}"
                    ))
                })?
                .collect();
            if candidates.is_empty() {
                return Err(ProxyError::UpstreamUnreachable(format!(
                    "'{domain}' did not resolve to any address"
                )));
            }
            for candidate in &candidates {
                admit(candidate.ip(), instance).map_err(|()| deny(url))?;
            }
            Ok(PinnedTarget {
                host: domain.to_string(),
                addr: candidates[0],
                is_literal: false,
            })
        }
        None => Err(ProxyError::BadTarget(format!(
            "target '{url}' has no host"
        ))),
    }
}

/// Evaluate the client address against the instance's inbound allow set.
/// An empty set admits every source.
pub fn authorize_inbound(client_ip: IpAddr, instance: &InstanceConfig) -> Result<(), ProxyError> {
    if instance.restrict_in_cidrs.is_empty()
        || in_cidr_set(client_ip, &instance.restrict_in_cidrs)
    {
        Ok(())
    } else {
        Err(ProxyError::InboundDenied(client_ip))
    }
}

fn admit(ip: IpAddr, instance: &InstanceConfig) -> Result<(), ()> {
    let admitted = match instance.restrict_out {
        RestrictOut::Any => true,
        RestrictOut::External => classify(ip) == AddressClass::Public,
        RestrictOut::Internal => classify(ip).is_internal(),
        RestrictOut::Cidr => in_cidr_set(ip, &instance.restrict_out_cidrs),
    };
    if admitted { Ok(()) } else { Err(()) }
}

fn deny(url: &Url) -> ProxyError {
    ProxyError::OutboundDenied(url.to_string())
}
