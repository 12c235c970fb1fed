//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Check URIs parse with a supported scheme and a host
//! - Detect duplicate service names and accept URIs
//! - Validate value ranges (timeouts > 0, workers > 0)
//!
//! # Design Decisions
//! - Returns all validation errors, not just the first
//! - Pure function: `&GatewayConfig → Result<(), Vec<ValidationError>>`

use std::collections::HashSet;

use url::Url;

use crate::config::schema::GatewayConfig;

const SCHEMES: [&str; 2] = ["http", "ws"];

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("service {service}: invalid {field} URI {uri:?}: {reason}")]
    InvalidUri {
        service: String,
        field: &'static str,
        uri: String,
        reason: String,
    },

    #[error("duplicate service name {0:?}")]
    DuplicateService(String),

    #[error("accept URI {uri:?} used by more than one service")]
    DuplicateAccept { uri: String },

    #[error("{field} must be greater than zero")]
    NotPositive { field: &'static str },
}

fn check_uri(service: &str, field: &'static str, uri: &str) -> Result<Url, ValidationError> {
    let invalid = |reason: String| ValidationError::InvalidUri {
        service: service.to_string(),
        field,
        uri: uri.to_string(),
        reason,
    };
    let url = Url::parse(uri).map_err(|e| invalid(e.to_string()))?;
    if !SCHEMES.contains(&url.scheme()) {
        return Err(invalid(format!("unsupported scheme {}", url.scheme())));
    }
    if url.host_str().is_none() {
        return Err(invalid("missing host".to_string()));
    }
    Ok(url)
}

pub fn validate_config(config: &GatewayConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.listener.workers == 0 {
        errors.push(ValidationError::NotPositive { field: "listener.workers" });
    }
    if config.listener.max_connections == 0 {
        errors.push(ValidationError::NotPositive { field: "listener.max_connections" });
    }
    if config.http.keep_alive_timeout_secs == 0 {
        errors.push(ValidationError::NotPositive { field: "http.keep_alive_timeout_secs" });
    }
    if config.http.connect_timeout_secs == 0 {
        errors.push(ValidationError::NotPositive { field: "http.connect_timeout_secs" });
    }
    if config.http.max_header_bytes == 0 {
        errors.push(ValidationError::NotPositive { field: "http.max_header_bytes" });
    }

    let mut names = HashSet::new();
    let mut accepts = HashSet::new();
    for service in &config.services {
        if !names.insert(service.name.as_str()) {
            errors.push(ValidationError::DuplicateService(service.name.clone()));
        }
        if service.keep_alive_timeout_secs == Some(0) {
            errors.push(ValidationError::NotPositive { field: "services.keep_alive_timeout_secs" });
        }
        match check_uri(&service.name, "accept", &service.accept) {
            Ok(url) => {
                if !accepts.insert(url.to_string()) {
                    errors.push(ValidationError::DuplicateAccept {
                        uri: service.accept.clone(),
                    });
                }
            }
            Err(e) => errors.push(e),
        }
        if let Err(e) = check_uri(&service.name, "connect", &service.connect) {
            errors.push(e);
        }
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
    use crate::config::schema::ServiceConfig;

    fn service(name: &str, accept: &str, connect: &str) -> ServiceConfig {
        ServiceConfig {
            name: name.to_string(),
            accept: accept.to_string(),
            connect: connect.to_string(),
            keep_alive_timeout_secs: None,
            keep_alive_connections: None,
        }
    }

    #[test]
    fn valid_config_passes() {
        let mut config = GatewayConfig::default();
        config.services.push(service("a", "http://0.0.0.0:8080/a", "http://127.0.0.1:3000/"));
        config.services.push(service("b", "http://0.0.0.0:8080/b", "ws://127.0.0.1:3001/"));
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn collects_every_error() {
        let mut config = GatewayConfig::default();
        config.listener.workers = 0;
        config.services.push(service("a", "http://0.0.0.0:8080/a", "ftp://x/"));
        config.services.push(service("a", "http://0.0.0.0:8080/a", "not a uri"));
        let errors = validate_config(&config).unwrap_err();
        assert!(errors.contains(&ValidationError::NotPositive { field: "listener.workers" }));
        assert!(errors.contains(&ValidationError::DuplicateService("a".into())));
        assert!(errors.iter().any(|e| matches!(e, ValidationError::DuplicateAccept { .. })));
        assert_eq!(
            errors
                .iter()
                .filter(|e| matches!(e, ValidationError::InvalidUri { .. }))
                .count(),
            2
        );
    }
}
