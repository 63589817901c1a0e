//! Per-instance configuration.

use ipnet::IpNet;
use serde::{Deserialize, Serialize};

/// Lower bound for the per-instance default timeout.
pub const MIN_INSTANCE_TIMEOUT_SECS: u64 = 30;
/// Upper bound for any timeout, instance-level or per-request.
pub const MAX_TIMEOUT_SECS: u64 = 3600;

/// Outbound destination restriction for an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RestrictOut {
    /// Any destination.
    #[default]
    Any,
    /// Public addresses only.
    External,
    /// Private and loopback addresses only.
    Internal,
    /// Destinations inside `restrict_out_cidrs` only.
    Cidr,
}

/// Configuration for one named proxy endpoint.
///
/// Immutable after load; reconfiguration replaces the whole registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InstanceConfig {
    /// Accepted authentication tokens. Empty means no token is required.
    #[serde(default)]
    pub tokens: Vec<String>,

    /// Outbound destination restriction.
    #[serde(default)]
    pub restrict_out: RestrictOut,

    /// CIDR allow set for `restrict_out = "cidr"`.
    #[serde(default)]
    pub restrict_out_cidrs: Vec<IpNet>,

    /// Client source allow set. Empty admits any source.
    #[serde(default)]
    pub restrict_in_cidrs: Vec<IpNet>,

    /// Default upstream timeout in seconds, clamped to [30, 3600].
    #[serde(default = "default_timeout")]
    pub timeout: u64,

    /// Whether the embedding host framework's own authentication is also
    /// required. Parsed and preserved for host-framework configs; the
    /// standalone server has no framework verdict to combine with.
    #[serde(default)]
    pub requires_auth: bool,
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            tokens: Vec::new(),
            restrict_out: RestrictOut::Any,
            restrict_out_cidrs: Vec::new(),
            restrict_in_cidrs: Vec::new(),
            timeout: default_timeout(),
            requires_auth: false,
        }
    }
}

fn default_timeout() -> u64 {
    300
}

impl InstanceConfig {
    /// Validate the instance and normalize out-of-range values.
    ///
    /// `restrict_out = "cidr"` without any CIDRs would deny everything
    /// silently, so it is rejected outright. Timeouts outside [30, 3600]
    /// are clamped with a warning.
    pub fn validate(&mut self, name: &str) -> Result<(), String> {
        if self.restrict_out == RestrictOut::Cidr && self.restrict_out_cidrs.is_empty() {
            return Err(format!(
                "instance '{name}': restrict_out = \"cidr\" requires restrict_out_cidrs"
            ));
        }
        let clamped = self
            .timeout
            .clamp(MIN_INSTANCE_TIMEOUT_SECS, MAX_TIMEOUT_SECS);
        if clamped != self.timeout {
            tracing::warn!(
                instance = name,
                configured = self.timeout,
                effective = clamped,
                "instance timeout outside [30, 3600], clamped"
            );
            self.timeout = clamped;
        }
        Ok(())
    }
}
