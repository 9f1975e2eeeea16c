//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (timeouts > 0, limits within what the engine accepts)
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ServerConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::net::SocketAddr;

use crate::config::schema::ServerConfig;

/// Smallest HTTP/1 read buffer the parser accepts.
pub const MIN_HEADER_BYTES: usize = 8 * 1024;

/// A single semantic problem with a configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Dotted path of the offending field.
    pub field: &'static str,
    pub message: String,
}

impl ValidationError {
    fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

impl std::error::Error for ValidationError {}

/// Check every field and collect all violations.
pub fn validate_config(config: &ServerConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.host.trim().is_empty() {
        errors.push(ValidationError::new("host", "must not be empty"));
    }
    if config.max_connections == 0 {
        errors.push(ValidationError::new("max_connections", "must be greater than 0"));
    }
    if config.request_timeout_ms == 0 {
        errors.push(ValidationError::new("request_timeout_ms", "must be greater than 0"));
    }
    if config.keep_alive_timeout_ms == 0 {
        errors.push(ValidationError::new("keep_alive_timeout_ms", "must be greater than 0"));
    }
    if config.workers == 0 {
        errors.push(ValidationError::new("workers", "must be greater than 0"));
    }
    if config.limits.max_header_bytes < MIN_HEADER_BYTES {
        errors.push(ValidationError::new(
            "limits.max_header_bytes",
            format!("must be at least {MIN_HEADER_BYTES}"),
        ));
    }
    if config.limits.max_concurrent_streams == 0 {
        errors.push(ValidationError::new(
            "limits.max_concurrent_streams",
            "must be greater than 0",
        ));
    }
    if config.limits.response_buffer_chunks == 0 {
        errors.push(ValidationError::new(
            "limits.response_buffer_chunks",
            "must be greater than 0",
        ));
    }
    if config.websocket.max_message_bytes == 0 {
        errors.push(ValidationError::new(
            "websocket.max_message_bytes",
            "must be greater than 0",
        ));
    }
    if config.observability.metrics_enabled
        && config.observability.metrics_address.parse::<SocketAddr>().is_err()
    {
        errors.push(ValidationError::new(
            "observability.metrics_address",
            format!("{:?} is not a socket address", config.observability.metrics_address),
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(validate_config(&ServerConfig::default()).is_ok());
    }

    #[test]
    fn ephemeral_port_is_valid() {
        let config = ServerConfig {
            port: 0,
            ..ServerConfig::default()
        };
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn reports_every_violation() {
        let mut config = ServerConfig {
            host: " ".to_string(),
            max_connections: 0,
            request_timeout_ms: 0,
            keep_alive_timeout_ms: 0,
            ..ServerConfig::default()
        };
        config.limits.max_header_bytes = 1024;

        let errors = validate_config(&config).unwrap_err();
        let fields: Vec<_> = errors.iter().map(|e| e.field).collect();
        assert_eq!(
            fields,
            vec![
                "host",
                "max_connections",
                "request_timeout_ms",
                "keep_alive_timeout_ms",
                "limits.max_header_bytes",
            ]
        );
    }

    #[test]
    fn metrics_address_checked_only_when_enabled() {
        let mut config = ServerConfig::default();
        config.observability.metrics_address = "nowhere".to_string();
        assert!(validate_config(&config).is_ok());

        config.observability.metrics_enabled = true;
        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors[0].field, "observability.metrics_address");
    }
}
