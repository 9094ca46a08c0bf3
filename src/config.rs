//! Client and relay configuration.
//!
//! Both are loaded from environment variables with defaults for everything
//! except the room to join. ICE credentials are redacted in Debug output.

use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Deserializer};
use std::collections::HashMap;
use std::env;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

use crate::signaling::protocol::ANONYMOUS_DISPLAY_NAME;

/// Default relay WebSocket endpoint.
pub const DEFAULT_SIGNALING_URL: &str = "ws://127.0.0.1:8080/ws";

/// Default STUN server used when no ICE servers are configured.
pub const DEFAULT_STUN_URL: &str = "stun:stun.l.google.com:19302";

/// Default number of reconnect attempts after the signaling channel drops.
pub const DEFAULT_RECONNECT_ATTEMPTS: u32 = 5;

/// Default delay between reconnect attempts, in milliseconds.
pub const DEFAULT_RECONNECT_DELAY_MS: u64 = 1000;

/// Default relay bind address.
pub const DEFAULT_RELAY_BIND_ADDRESS: &str = "0.0.0.0:8080";

/// Default per-session outbound frame buffer on the relay.
pub const DEFAULT_RELAY_OUTBOUND_BUFFER: usize = 256;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

/// One STUN/TURN server entry. `urls` accepts a single string or a list.
#[derive(Clone, PartialEq, Eq, Deserialize)]
pub struct IceServerConfig {
    #[serde(deserialize_with = "one_or_many")]
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub credential: Option<String>,
}

impl IceServerConfig {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }
}

impl fmt::Debug for IceServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IceServerConfig")
            .field("urls", &self.urls)
            .field("username", &self.username)
            .field(
                "credential",
                &self.credential.as_ref().map(|_| "[REDACTED]"),
            )
            .finish()
    }
}

fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Urls {
        One(String),
        Many(Vec<String>),
    }

    Ok(match Urls::deserialize(deserializer)? {
        Urls::One(url) => vec![url],
        Urls::Many(urls) => urls,
    })
}

pub fn default_ice_servers() -> Vec<IceServerConfig> {
    vec![IceServerConfig::stun(DEFAULT_STUN_URL)]
}

/// Parses `ECHO_ICE_SERVERS`. Anything but a JSON array of server entries
/// falls back to the default STUN server.
pub fn parse_ice_servers(raw: &str) -> Vec<IceServerConfig> {
    match serde_json::from_str::<Vec<IceServerConfig>>(raw) {
        Ok(servers) => servers,
        Err(e) => {
            warn!(target: "echo_room.client", error = %e, "Invalid ECHO_ICE_SERVERS, using default STUN server");
            default_ice_servers()
        }
    }
}

/// Generates a fresh identity of the form `u_xxxxxxxx`.
pub fn random_user_id() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(char::from)
        .map(|c| c.to_ascii_lowercase())
        .collect();
    format!("u_{suffix}")
}

/// Room client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Relay WebSocket URL (default: "ws://127.0.0.1:8080/ws").
    pub signaling_url: String,

    /// Room to join; trimmed and lowercased.
    pub room_id: String,

    /// Stable identity reused across reconnects.
    pub user_id: String,

    /// Display name (default: "Anonymous").
    pub display_name: String,

    pub ice_servers: Vec<IceServerConfig>,

    /// Reconnect attempts after the channel drops (default: 5).
    pub reconnect_attempts: u32,

    /// Delay between reconnect attempts (default: 1s).
    pub reconnect_delay: Duration,
}

impl ClientConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let room_id = vars
            .get("ECHO_ROOM_ID")
            .map(|s| s.trim().to_lowercase())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ConfigError::MissingEnvVar("ECHO_ROOM_ID".to_string()))?;

        let signaling_url = vars
            .get("ECHO_SIGNALING_URL")
            .cloned()
            .unwrap_or_else(|| DEFAULT_SIGNALING_URL.to_string());
        if !signaling_url.starts_with("ws://") && !signaling_url.starts_with("wss://") {
            return Err(ConfigError::InvalidValue(format!(
                "ECHO_SIGNALING_URL must be a ws:// or wss:// URL, got {signaling_url}"
            )));
        }

        let user_id = vars
            .get("ECHO_USER_ID")
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(random_user_id);

        let display_name = vars
            .get("ECHO_DISPLAY_NAME")
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| ANONYMOUS_DISPLAY_NAME.to_string());

        let ice_servers = vars
            .get("ECHO_ICE_SERVERS")
            .map(|raw| parse_ice_servers(raw))
            .unwrap_or_else(default_ice_servers);

        let reconnect_attempts = vars
            .get("ECHO_RECONNECT_ATTEMPTS")
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_RECONNECT_ATTEMPTS);

        let reconnect_delay = Duration::from_millis(
            vars.get("ECHO_RECONNECT_DELAY_MS")
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_RECONNECT_DELAY_MS),
        );

        Ok(Self {
            signaling_url,
            room_id,
            user_id,
            display_name,
            ice_servers,
            reconnect_attempts,
            reconnect_delay,
        })
    }
}

/// Relay server configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Listen address (default: "0.0.0.0:8080").
    pub bind_address: String,

    /// Frames buffered per session before the relay drops that session's
    /// slowest traffic (default: 256).
    pub outbound_buffer: usize,
}

impl RelayConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let bind_address = vars
            .get("ECHO_RELAY_BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_RELAY_BIND_ADDRESS.to_string());

        let outbound_buffer = match vars.get("ECHO_RELAY_OUTBOUND_BUFFER") {
            Some(raw) => raw
                .parse::<usize>()
                .ok()
                .filter(|n| *n > 0)
                .ok_or_else(|| {
                    ConfigError::InvalidValue(format!(
                        "ECHO_RELAY_OUTBOUND_BUFFER must be a positive integer, got {raw}"
                    ))
                })?,
            None => DEFAULT_RELAY_OUTBOUND_BUFFER,
        };

        Ok(Self {
            bind_address,
            outbound_buffer,
        })
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_address: DEFAULT_RELAY_BIND_ADDRESS.to_string(),
            outbound_buffer: DEFAULT_RELAY_OUTBOUND_BUFFER,
        }
    }
}
