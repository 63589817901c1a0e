//! HTTP server configuration.

use std::net::IpAddr;

use ipnet::IpNet;
use serde::{Deserialize, Serialize};

/// HTTP server configuration for the standalone deployment.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// Host address to bind to.
    #[serde(default = "default_host")]
    pub host: IpAddr,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Trusted reverse-proxy configuration for extracting real client IPs.
    #[serde(default)]
    pub trusted_proxies: TrustedProxiesConfig,

    /// Debug endpoint exposing the current instance table.
    #[serde(default)]
    pub debug_endpoint: DebugEndpointConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            trusted_proxies: TrustedProxiesConfig::default(),
            debug_endpoint: DebugEndpointConfig::default(),
        }
    }
}

fn default_host() -> IpAddr {
    IpAddr::from([0, 0, 0, 0])
}

fn default_port() -> u16 {
    8080
}

/// Configuration for trusted reverse proxies in front of the gateway.
///
/// Forwarding headers are spoofable; they are honored only when the
/// connecting socket address is inside one of the configured CIDR ranges
/// (or `dangerously_trust_all` is explicitly enabled for deployments where
/// the gateway is unreachable except through a header-rewriting balancer).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct TrustedProxiesConfig {
    /// Trust forwarding headers from ANY source. Dangerous outside isolated
    /// networks.
    #[serde(default)]
    pub dangerously_trust_all: bool,

    /// Trust forwarding headers only when the connecting IP is inside one
    /// of these CIDRs.
    #[serde(default)]
    pub cidrs: Vec<IpNet>,
}

impl TrustedProxiesConfig {
    /// Whether any proxy trust is configured at all.
    pub fn is_configured(&self) -> bool {
        self.dangerously_trust_all || !self.cidrs.is_empty()
    }

    /// Whether `ip` is a trusted proxy.
    pub fn is_trusted(&self, ip: IpAddr) -> bool {
        self.dangerously_trust_all || crate::policy::in_cidr_set(ip, &self.cidrs)
    }
}

/// Configuration for the `/debug` endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct DebugEndpointConfig {
    /// Serve the current instance table at `/debug`.
    #[serde(default)]
    pub enabled: bool,

    /// Include raw token values in the debug output. When false, tokens
    /// are redacted to their count.
    #[serde(default)]
    pub expose_tokens: bool,
}
