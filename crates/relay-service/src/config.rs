//! Relay service configuration.
//!
//! Configuration is loaded from environment variables with defaults for
//! everything; there are no required variables.

use std::collections::HashMap;
use std::env;
use std::time::Duration;
use thiserror::Error;

/// Default listen address for WebSocket and HTTP traffic.
pub const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0:8080";

/// Default WebSocket upgrade route.
pub const DEFAULT_WS_PATH: &str = "/ws";

/// Default per-session outbound queue capacity.
pub const DEFAULT_OUTBOUND_QUEUE: usize = 64;

/// Default coordinator mailbox capacity.
pub const DEFAULT_COORDINATOR_QUEUE: usize = 1000;

/// Default maximum inbound WebSocket message size in bytes.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 64 * 1024;

/// Default grace period after signalling shutdown, in seconds.
pub const DEFAULT_SHUTDOWN_GRACE_SECONDS: u64 = 5;

/// Routes served next to the WebSocket endpoint.
const RESERVED_PATHS: [&str; 3] = ["/health", "/ready", "/metrics"];

/// Default relay instance ID prefix.
pub const DEFAULT_RELAY_ID_PREFIX: &str = "relay";

/// Relay service configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Listen address (default: "0.0.0.0:8080").
    pub bind_address: String,

    /// WebSocket upgrade route (default: "/ws").
    pub ws_path: String,

    /// Unique identifier for this relay instance (log correlation only).
    pub relay_id: String,

    /// Capacity of each session's outbound queue. A session whose queue
    /// fills up is disconnected.
    pub outbound_queue: usize,

    /// Capacity of the coordinator mailbox.
    pub coordinator_queue: usize,

    /// Maximum inbound WebSocket message size in bytes.
    pub max_frame_bytes: usize,

    /// How long to wait for connections to close during shutdown.
    pub shutdown_grace_seconds: u64,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let bind_address = vars
            .get("RELAY_BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_BIND_ADDRESS.to_string());

        let ws_path = vars
            .get("RELAY_WS_PATH")
            .cloned()
            .unwrap_or_else(|| DEFAULT_WS_PATH.to_string());
        if !ws_path.starts_with('/') {
            return Err(ConfigError::InvalidValue(format!(
                "RELAY_WS_PATH must start with '/', got {ws_path:?}"
            )));
        }
        if RESERVED_PATHS.contains(&ws_path.as_str()) {
            return Err(ConfigError::InvalidValue(format!(
                "RELAY_WS_PATH must not shadow an operational route, got {ws_path:?}"
            )));
        }

        let outbound_queue =
            parse_positive(vars, "RELAY_OUTBOUND_QUEUE", DEFAULT_OUTBOUND_QUEUE)?;
        let coordinator_queue =
            parse_positive(vars, "RELAY_COORDINATOR_QUEUE", DEFAULT_COORDINATOR_QUEUE)?;
        let max_frame_bytes =
            parse_positive(vars, "RELAY_MAX_FRAME_BYTES", DEFAULT_MAX_FRAME_BYTES)?;

        let shutdown_grace_seconds = match vars.get("RELAY_SHUTDOWN_GRACE_SECONDS") {
            Some(raw) => raw.parse().map_err(|_| {
                ConfigError::InvalidValue(format!(
                    "RELAY_SHUTDOWN_GRACE_SECONDS must be a number of seconds, got {raw:?}"
                ))
            })?,
            None => DEFAULT_SHUTDOWN_GRACE_SECONDS,
        };

        // Generate relay instance ID
        let relay_id = vars.get("RELAY_ID").cloned().unwrap_or_else(|| {
            let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string());
            let uuid_suffix = uuid::Uuid::new_v4().to_string();
            let short_suffix = uuid_suffix.get(..8).unwrap_or("00000000");
            format!("{DEFAULT_RELAY_ID_PREFIX}-{hostname}-{short_suffix}")
        });

        Ok(Config {
            bind_address,
            ws_path,
            relay_id,
            outbound_queue,
            coordinator_queue,
            max_frame_bytes,
            shutdown_grace_seconds,
        })
    }

    /// Shutdown grace period as a `Duration`.
    #[must_use]
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_seconds)
    }
}

/// Parse a strictly positive integer, falling back to `default` when unset.
fn parse_positive(
    vars: &HashMap<String, String>,
    key: &str,
    default: usize,
) -> Result<usize, ConfigError> {
    match vars.get(key) {
        None => Ok(default),
        Some(raw) => match raw.parse::<usize>() {
            Ok(value) if value > 0 => Ok(value),
            _ => Err(ConfigError::InvalidValue(format!(
                "{key} must be a positive integer, got {raw:?}"
            ))),
        },
    }
}
