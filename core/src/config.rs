//! Router tunables
//!
//! Read once at startup, either from a serialized config or from the
//! environment (`NETROUTER_<KEY>` overlays the defaults):
//! - Ping timeout and the live/dead router check intervals
//! - Pre-use checking and asymmetric router failure avoidance
//! - Router buffer pool sizes for each size class
//! - Forwarding mode and the checker execution model

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use thiserror::Error;

/// Prefix for environment overrides
pub const ENV_PREFIX: &str = "NETROUTER_";

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Errors that can occur during config parsing and validation
#[derive(Debug, Error, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigError {
    #[error("'dead_router_check_interval' must be set if 'check_routers_before_use' is set")]
    DeadIntervalRequired,

    #[error("{name}={value} invalid when routing enabled")]
    InvalidPoolSize { name: String, value: i64 },

    #[error("'forwarding' not set to either 'enabled' or 'disabled': {0}")]
    InvalidForwarding(String),

    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },

    #[error("Unknown config key: {0}")]
    UnknownKey(String),
}

// ============================================================================
// ENUMS
// ============================================================================

/// Whether this node forwards traffic for other networks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ForwardingMode {
    /// Forward only if the node is configured as a router
    Auto,
    /// Always forward
    Enabled,
    /// Never forward
    Disabled,
}

impl Default for ForwardingMode {
    fn default() -> Self {
        Self::Auto
    }
}

impl std::fmt::Display for ForwardingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Auto => write!(f, "auto"),
            Self::Enabled => write!(f, "enabled"),
            Self::Disabled => write!(f, "disabled"),
        }
    }
}

impl FromStr for ForwardingMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "auto" => Ok(Self::Auto),
            "enabled" => Ok(Self::Enabled),
            "disabled" => Ok(Self::Disabled),
            other => Err(ConfigError::InvalidForwarding(other.to_string())),
        }
    }
}

/// How the router checker loop is driven
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionModel {
    /// A dedicated background task runs the checker once per second
    Threaded,
    /// The host calls `RouterChecker::tick()` from its own poll loop
    Cooperative,
}

impl Default for ExecutionModel {
    fn default() -> Self {
        Self::Threaded
    }
}

impl std::fmt::Display for ExecutionModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Threaded => write!(f, "threaded"),
            Self::Cooperative => write!(f, "cooperative"),
        }
    }
}

impl FromStr for ExecutionModel {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "threaded" => Ok(Self::Threaded),
            "cooperative" => Ok(Self::Cooperative),
            other => Err(ConfigError::InvalidValue {
                key: "execution".to_string(),
                value: other.to_string(),
            }),
        }
    }
}

// ============================================================================
// ROUTER CONFIG
// ============================================================================

/// Router and router-checker tunables
///
/// Intervals are in seconds; a non-positive check interval disables pinging
/// routers in that state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Seconds to wait for a ping reply before declaring a router dead
    pub router_ping_timeout: i64,
    /// Seconds between pings of a live router
    pub live_router_check_interval: i64,
    /// Seconds between pings of a dead router
    pub dead_router_check_interval: i64,
    /// Ping every router before first use; new peers start out dead
    pub check_routers_before_use: bool,
    /// Track per-interface status reported by routers
    pub avoid_asym_router_failure: bool,
    /// Accept "peer down" reports from interface drivers
    pub auto_down: bool,
    /// Number of zero-payload forwarding buffers
    pub tiny_router_buffers: i64,
    /// Number of one-page forwarding buffers
    pub small_router_buffers: i64,
    /// Number of MTU-sized forwarding buffers
    pub large_router_buffers: i64,
    pub forwarding: ForwardingMode,
    pub execution: ExecutionModel,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            router_ping_timeout: 50,
            live_router_check_interval: 60,
            dead_router_check_interval: 60,
            check_routers_before_use: false,
            avoid_asym_router_failure: true,
            auto_down: true,
            tiny_router_buffers: 1024,
            small_router_buffers: 8192,
            large_router_buffers: 512,
            forwarding: ForwardingMode::Auto,
            execution: ExecutionModel::Threaded,
        }
    }
}

/// Every key understood by [`RouterConfig::set`]
pub const CONFIG_KEYS: &[&str] = &[
    "router_ping_timeout",
    "live_router_check_interval",
    "dead_router_check_interval",
    "check_routers_before_use",
    "avoid_asym_router_failure",
    "auto_down",
    "tiny_router_buffers",
    "small_router_buffers",
    "large_router_buffers",
    "forwarding",
    "execution",
];

impl RouterConfig {
    /// Defaults overlaid with `NETROUTER_<KEY>` environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overlaid with values from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        for key in CONFIG_KEYS {
            let var = format!("{}{}", ENV_PREFIX, key.to_ascii_uppercase());
            if let Some(value) = lookup(&var) {
                config.set(key, &value)?;
            }
        }
        Ok(config)
    }

    /// Set a single tunable from its text form
    pub fn set(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        fn int(key: &str, value: &str) -> Result<i64, ConfigError> {
            value.trim().parse().map_err(|_| ConfigError::InvalidValue {
                key: key.to_string(),
                value: value.to_string(),
            })
        }
        fn flag(key: &str, value: &str) -> Result<bool, ConfigError> {
            match value.trim() {
                "1" | "true" | "yes" => Ok(true),
                "0" | "false" | "no" => Ok(false),
                _ => Err(ConfigError::InvalidValue {
                    key: key.to_string(),
                    value: value.to_string(),
                }),
            }
        }

        match key {
            "router_ping_timeout" => self.router_ping_timeout = int(key, value)?,
            "live_router_check_interval" => self.live_router_check_interval = int(key, value)?,
            "dead_router_check_interval" => self.dead_router_check_interval = int(key, value)?,
            "check_routers_before_use" => self.check_routers_before_use = flag(key, value)?,
            "avoid_asym_router_failure" => self.avoid_asym_router_failure = flag(key, value)?,
            "auto_down" => self.auto_down = flag(key, value)?,
            "tiny_router_buffers" => self.tiny_router_buffers = int(key, value)?,
            "small_router_buffers" => self.small_router_buffers = int(key, value)?,
            "large_router_buffers" => self.large_router_buffers = int(key, value)?,
            "forwarding" => self.forwarding = value.trim().parse()?,
            "execution" => self.execution = value.trim().parse()?,
            _ => return Err(ConfigError::UnknownKey(key.to_string())),
        }
        Ok(())
    }

    /// Get a single tunable in text form
    pub fn get(&self, key: &str) -> Option<String> {
        match key {
            "router_ping_timeout" => Some(self.router_ping_timeout.to_string()),
            "live_router_check_interval" => Some(self.live_router_check_interval.to_string()),
            "dead_router_check_interval" => Some(self.dead_router_check_interval.to_string()),
            "check_routers_before_use" => Some(self.check_routers_before_use.to_string()),
            "avoid_asym_router_failure" => Some(self.avoid_asym_router_failure.to_string()),
            "auto_down" => Some(self.auto_down.to_string()),
            "tiny_router_buffers" => Some(self.tiny_router_buffers.to_string()),
            "small_router_buffers" => Some(self.small_router_buffers.to_string()),
            "large_router_buffers" => Some(self.large_router_buffers.to_string()),
            "forwarding" => Some(self.forwarding.to_string()),
            "execution" => Some(self.execution.to_string()),
            _ => None,
        }
    }

    /// Validate checker settings
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.check_routers_before_use && self.dead_router_check_interval <= 0 {
            return Err(ConfigError::DeadIntervalRequired);
        }
        Ok(())
    }

    /// Validate pool sizes; only meaningful once forwarding is on
    pub fn validate_pools(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("tiny_router_buffers", self.tiny_router_buffers),
            ("small_router_buffers", self.small_router_buffers),
            ("large_router_buffers", self.large_router_buffers),
        ] {
            if value <= 0 {
                return Err(ConfigError::InvalidPoolSize {
                    name: name.to_string(),
                    value,
                });
            }
        }
        Ok(())
    }

    /// Timeout after which a silent local interface is reported down
    pub fn interface_timeout(&self) -> i64 {
        self.router_ping_timeout.saturating_add(
            self.live_router_check_interval
                .max(self.dead_router_check_interval),
        )
    }
}
