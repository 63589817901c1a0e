//! Configuration for the proxy gateway.
//!
//! The standalone server is configured via a JSON file holding the server
//! section and the instance table:
//!
//! ```json
//! {
//!   "server": { "host": "0.0.0.0", "port": 8080 },
//!   "instances": {
//!     "home": {
//!       "tokens": ["secret"],
//!       "restrict_out": "external",
//!       "timeout": 300
//!     }
//!   }
//! }
//! ```
//!
//! All instance fields are optional; the table itself may be empty. Unknown
//! fields are rejected so typos fail loudly at startup.

mod instance;
mod server;

use std::{collections::BTreeMap, path::Path};

pub use instance::*;
use serde::{Deserialize, Serialize};
pub use server::*;

/// Errors from loading or validating the configuration file.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Instance names that collide with built-in routes.
const RESERVED_NAMES: &[&str] = &["debug", "health"];

/// Root configuration: server settings plus the instance table.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct GatewayConfig {
    /// HTTP server configuration.
    #[serde(default)]
    pub server: ServerConfig,

    /// Named proxy instances.
    #[serde(default)]
    pub instances: BTreeMap<String, InstanceConfig>,
}

impl GatewayConfig {
    /// Load and validate a configuration file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let mut config: GatewayConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate instance names and per-instance settings, normalizing
    /// out-of-range values.
    pub fn validate(&mut self) -> Result<(), ConfigError> {
        for (name, instance) in &mut self.instances {
            if name.is_empty() {
                return Err(ConfigError::Invalid("instance name is empty".into()));
            }
            if name.contains('/') {
                return Err(ConfigError::Invalid(format!(
                    "instance name '{name}' contains '/'"
                )));
            }
            if RESERVED_NAMES.contains(&name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "instance name '{name}' is reserved"
                )));
            }
            instance.validate(name).map_err(ConfigError::Invalid)?;
        }
        Ok(())
    }
}
