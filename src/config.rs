//! Runtime configuration loaded from environment variables.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

/// Tuning knobs for the relay server and the embedded client.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address the server binds to.
    pub bind: SocketAddr,
    /// Outbound event queue size per connection. Fan-out drops events for a
    /// connection whose queue is full instead of blocking other recipients.
    pub connection_queue: usize,
    /// First reconnect delay for the client, in milliseconds.
    pub reconnect_base_ms: u64,
    /// Upper bound on the reconnect delay, in milliseconds.
    pub reconnect_max_ms: u64,
    /// Interval between client keepalive pings, in milliseconds.
    pub ping_interval_ms: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 4860),
            connection_queue: 256,
            reconnect_base_ms: 500,
            reconnect_max_ms: 30_000,
            ping_interval_ms: 15_000,
        }
    }
}

impl RelayConfig {
    /// Load config from environment variables, falling back to defaults for
    /// anything unset or unparseable.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let bind = std::env::var("RELAY_BIND")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.bind);

        let config = Self {
            bind,
            connection_queue: env_parse("RELAY_CONNECTION_QUEUE", defaults.connection_queue),
            reconnect_base_ms: env_parse("RELAY_RECONNECT_BASE_MS", defaults.reconnect_base_ms),
            reconnect_max_ms: env_parse("RELAY_RECONNECT_MAX_MS", defaults.reconnect_max_ms),
            ping_interval_ms: env_parse("RELAY_PING_INTERVAL_MS", defaults.ping_interval_ms),
        };

        tracing::info!(
            bind = %config.bind,
            connection_queue = config.connection_queue,
            reconnect_base_ms = config.reconnect_base_ms,
            reconnect_max_ms = config.reconnect_max_ms,
            "Relay config loaded"
        );

        config
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
