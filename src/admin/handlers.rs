use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{extract::State, Json};
use serde::Serialize;

use crate::gateway::Gateway;
use crate::pool::PoolStats;

#[derive(Debug, Serialize)]
pub struct HealthStatus {
    pub version: &'static str,
    pub status: &'static str,
    pub connections: usize,
    pub idle_pooled: usize,
    pub services: usize,
}

pub async fn get_health(State(gateway): State<Arc<Gateway>>) -> Json<HealthStatus> {
    let status = if gateway.shutdown_handle().is_triggered() {
        "draining"
    } else {
        "operational"
    };
    Json(HealthStatus {
        version: env!("CARGO_PKG_VERSION"),
        status,
        connections: gateway.tracker().active_count(),
        idle_pooled: gateway.pool().total_idle(),
        services: gateway.config().services.len(),
    })
}

/// Idle pooled connections per worker and destination.
pub async fn get_pool(State(gateway): State<Arc<Gateway>>) -> Json<Vec<PoolStats>> {
    Json(gateway.pool().stats())
}

/// Accept authority → bound paths.
pub async fn get_bindings(State(gateway): State<Arc<Gateway>>) -> Json<BTreeMap<String, Vec<String>>> {
    Json(gateway.bindings().snapshot())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GatewayConfig, ServiceConfig};
    use crate::transport::memory::MemoryConnector;

    fn gateway() -> Arc<Gateway> {
        let config = GatewayConfig {
            services: vec![ServiceConfig {
                name: "api".into(),
                accept: "http://127.0.0.1:0/api".into(),
                connect: "http://127.0.0.1:9/".into(),
                keep_alive_timeout_secs: None,
                keep_alive_connections: None,
            }],
            ..GatewayConfig::default()
        };
        Gateway::with_connector(config, MemoryConnector::new())
    }

    #[tokio::test]
    async fn health_reports_counts() {
        let Json(health) = get_health(State(gateway())).await;
        assert_eq!(health.status, "operational");
        assert_eq!(health.services, 1);
        assert_eq!(health.connections, 0);
    }

    #[tokio::test]
    async fn bindings_list_started_services() {
        let gateway = gateway();
        gateway.start().await.unwrap();
        let Json(bindings) = get_bindings(State(gateway.clone())).await;
        assert_eq!(bindings.get("http://127.0.0.1:0"), Some(&vec!["/api".to_string()]));
        let Json(pool) = get_pool(State(gateway.clone())).await;
        assert!(pool.is_empty());
        gateway.shutdown(std::time::Duration::from_millis(10)).await;
    }
}
