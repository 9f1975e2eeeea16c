//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the server.
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Root configuration for the streaming server.
///
/// Immutable once the server has started; the server keeps it behind an `Arc`.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind host (IP literal or resolvable name).
    pub host: String,

    /// Bind port. `0` asks the OS for an ephemeral port.
    pub port: u16,

    /// Maximum concurrent connections, also the request queue capacity.
    pub max_connections: usize,

    /// Deadline from request head arrival to terminal response.
    pub request_timeout_ms: u64,

    /// Idle period after which a connection with no in-flight exchange is closed.
    pub keep_alive_timeout_ms: u64,

    /// Dispatch workers spawned by [`crate::start`].
    pub workers: usize,

    /// How long `stop` waits for connections to drain.
    pub shutdown_grace_ms: u64,

    /// Protocol and buffering limits.
    pub limits: LimitsConfig,

    /// WebSocket settings.
    pub websocket: WebSocketConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 7779,
            max_connections: 100_000,
            request_timeout_ms: 30_000,
            keep_alive_timeout_ms: 60_000,
            workers: 64,
            shutdown_grace_ms: 10_000,
            limits: LimitsConfig::default(),
            websocket: WebSocketConfig::default(),
            observability: ObservabilityConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn keep_alive_timeout(&self) -> Duration {
        Duration::from_millis(self.keep_alive_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    /// `host:port` for logging; IPv6 literals are bracketed.
    pub fn bind_address(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

/// Protocol and buffering limits.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Maximum HTTP/1 read buffer, which bounds the request header block.
    pub max_header_bytes: usize,

    /// Maximum concurrent HTTP/2 streams per connection.
    pub max_concurrent_streams: u32,

    /// Outbound body chunks buffered before `write_chunk` suspends.
    pub response_buffer_chunks: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_header_bytes: 64 * 1024,
            max_concurrent_streams: 256,
            response_buffer_chunks: 8,
        }
    }
}

/// WebSocket settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WebSocketConfig {
    /// Deliver received pings to the application as well as answering them.
    pub surface_pings: bool,

    /// Maximum size of a single message.
    pub max_message_bytes: usize,

    /// How long a close handshake waits for the peer's close frame.
    pub close_timeout_ms: u64,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            surface_pings: false,
            max_message_bytes: 16 * 1024 * 1024,
            close_timeout_ms: 5_000,
        }
    }
}

impl WebSocketConfig {
    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error). `SPARX_LOG` overrides it.
    pub log_level: String,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_enabled: false,
            metrics_address: "127.0.0.1:9090".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = ServerConfig::default();
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 7779);
        assert_eq!(config.max_connections, 100_000);
        assert_eq!(config.request_timeout(), Duration::from_secs(30));
        assert_eq!(config.keep_alive_timeout(), Duration::from_secs(60));
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config: ServerConfig = toml::from_str(
            r#"
            port = 8080
            request_timeout_ms = 500

            [websocket]
            surface_pings = true
            "#,
        )
        .unwrap();

        assert_eq!(config.port, 8080);
        assert_eq!(config.request_timeout_ms, 500);
        assert_eq!(config.keep_alive_timeout_ms, 60_000);
        assert!(config.websocket.surface_pings);
        assert_eq!(config.websocket.close_timeout_ms, 5_000);
    }

    #[test]
    fn ipv6_bind_address_is_bracketed() {
        let config = ServerConfig {
            host: "::1".to_string(),
            port: 9000,
            ..ServerConfig::default()
        };
        assert_eq!(config.bind_address(), "[::1]:9000");
    }
}
