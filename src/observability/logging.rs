//! Structured logging.
//!
//! # Design Decisions
//! - Uses the tracing crate; `RUST_LOG` overrides the configured level
//! - Installing twice is not an error, so tests and embedders can call it

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::ObservabilityConfig;

/// Filter directive for a configured level.
pub fn default_directive(level: &str) -> String {
    format!("bridge_gateway={level},tower_http={level},warn")
}

/// Install the global subscriber. Returns false if one was already set.
pub fn init_logging(config: &ObservabilityConfig) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(&config.log_level)));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directive_scopes_crate() {
        assert_eq!(default_directive("debug"), "bridge_gateway=debug,tower_http=debug,warn");
    }

    #[test]
    fn second_init_is_harmless() {
        let config = ObservabilityConfig::default();
        init_logging(&config);
        assert!(!init_logging(&config));
    }
}
