//! Configuration schema definitions.
//!
//! All types derive Serde traits for deserialization from config files.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::address::AddressOptions;
use crate::bridge::BridgeSettings;
use crate::codec::DEFAULT_MAX_HEADER_BYTES;

/// Root configuration for the gateway.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
#[serde(default)]
pub struct GatewayConfig {
    /// Exchange and pooling defaults.
    pub http: HttpConfig,

    pub listener: ListenerConfig,

    /// Accept → connect pairs.
    pub services: Vec<ServiceConfig>,

    pub observability: ObservabilityConfig,

    pub admin: AdminConfig,
}

/// HTTP exchange defaults, overridable per service where noted.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct HttpConfig {
    /// Bounds idle pooled connections and the wait for a response.
    pub keep_alive_timeout_secs: u64,

    /// Maximum idle pooled connections per destination.
    pub keep_alive_connections: usize,

    pub user_agent_header_enabled: bool,

    pub host_header_enabled: bool,

    pub connect_timeout_secs: u64,

    /// Response bytes buffered before an implicit commit.
    pub write_buffer_limit: u64,

    /// Inbound messages held while reads are suspended.
    pub deferred_read_limit: usize,

    pub max_header_bytes: usize,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            keep_alive_timeout_secs: 30,
            keep_alive_connections: 16,
            user_agent_header_enabled: true,
            host_header_enabled: true,
            connect_timeout_secs: 10,
            write_buffer_limit: 8192,
            deferred_read_limit: 64,
            max_header_bytes: DEFAULT_MAX_HEADER_BYTES,
        }
    }
}

impl HttpConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn bridge_settings(&self) -> BridgeSettings {
        BridgeSettings {
            write_buffer_limit: self.write_buffer_limit,
            deferred_read_limit: self.deferred_read_limit,
            max_header_bytes: self.max_header_bytes,
        }
    }

    /// Address options for `service`, applying its overrides.
    pub fn address_options(&self, service: &ServiceConfig) -> AddressOptions {
        AddressOptions {
            keep_alive_timeout: Duration::from_secs(
                service
                    .keep_alive_timeout_secs
                    .unwrap_or(self.keep_alive_timeout_secs),
            ),
            keep_alive_connections: service
                .keep_alive_connections
                .unwrap_or(self.keep_alive_connections),
            user_agent_header_enabled: self.user_agent_header_enabled,
            host_header_enabled: self.host_header_enabled,
        }
    }
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ListenerConfig {
    /// Maximum concurrent connections per accept authority (backpressure).
    pub max_connections: usize,

    /// Worker labels assigned round-robin to accepted connections.
    pub workers: usize,

    /// How long shutdown waits for open connections to finish.
    pub drain_timeout_secs: u64,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            max_connections: 10_000,
            workers: 4,
            drain_timeout_secs: 30,
        }
    }
}

/// One proxied service.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ServiceConfig {
    /// Unique service identifier for logging.
    pub name: String,

    /// Where clients connect, e.g. `http://0.0.0.0:8080/api`.
    pub accept: String,

    /// Where requests are forwarded, e.g. `http://127.0.0.1:3000/`.
    pub connect: String,

    #[serde(default)]
    pub keep_alive_timeout_secs: Option<u64>,

    #[serde(default)]
    pub keep_alive_connections: Option<usize>,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}

/// Admin surface configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct AdminConfig {
    pub enabled: bool,

    pub bind_address: String,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind_address: "127.0.0.1:8081".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_takes_defaults() {
        let config: GatewayConfig = toml::from_str(
            r#"
            [[services]]
            name = "api"
            accept = "http://127.0.0.1:8080/api"
            connect = "http://127.0.0.1:3000/"
            "#,
        )
        .unwrap();
        assert_eq!(config.http, HttpConfig::default());
        assert_eq!(config.listener.workers, 4);
        assert_eq!(config.services.len(), 1);
        assert_eq!(config.services[0].keep_alive_connections, None);
    }

    #[test]
    fn service_overrides_apply() {
        let http = HttpConfig::default();
        let service = ServiceConfig {
            name: "s".into(),
            accept: "http://a/".into(),
            connect: "http://b/".into(),
            keep_alive_timeout_secs: Some(5),
            keep_alive_connections: Some(2),
        };
        let options = http.address_options(&service);
        assert_eq!(options.keep_alive_timeout, Duration::from_secs(5));
        assert_eq!(options.keep_alive_connections, 2);
        assert!(options.host_header_enabled);
    }
}
