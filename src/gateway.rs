//! Gateway wiring: configuration → bindings → listeners.
//!
//! # Responsibilities
//! - Own the binding table, connection pool and both processors
//! - Bind a `ProxyHandler` for every configured service
//! - Run one bounded listener per accept authority, assigning accepted
//!   connections to workers round-robin
//! - Apply reloaded configuration by diffing services
//! - Drain and close connections on shutdown
//!
//! # Design Decisions
//! - The live config sits in an `ArcSwap` so readers never block a reload
//! - A changed service is unbound and rebound; unchanged ones keep their
//!   handler and in-flight exchanges
//! - A listener stops once the binding table no longer knows its authority
//! - Exchange limits (`BridgeSettings`) are fixed at startup; per-service
//!   address options follow each reload

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use arc_swap::ArcSwap;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::address::ResolvedAddress;
use crate::binding::BindingTable;
use crate::bridge::{AcceptProcessor, BridgeSettings, ConnectProcessor};
use crate::config::{GatewayConfig, HttpConfig, ServiceConfig};
use crate::error::BridgeError;
use crate::lifecycle::Shutdown;
use crate::net::connection::ConnectionTracker;
use crate::net::listener::{ConnectionPermit, Listener, ListenerError};
use crate::net::tcp::{TcpConnector, TcpIo};
use crate::pool::PersistentConnectionPool;
use crate::service::ProxyHandler;
use crate::transport::io::{Connector, IoHandler};
use crate::transport::session::WorkerId;

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error(transparent)]
    Listener(#[from] ListenerError),

    #[error("service {service}: {source}")]
    Service {
        service: String,
        #[source]
        source: BridgeError,
    },
}

/// What a configuration apply changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReloadSummary {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub listeners_started: Vec<String>,
    pub listeners_stopped: Vec<String>,
}

struct BoundService {
    config: ServiceConfig,
    accept: ResolvedAddress,
}

struct ListenerHandle {
    local_addr: SocketAddr,
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl ListenerHandle {
    fn stop(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        drop(self.task);
    }
}

pub struct Gateway {
    config: ArcSwap<GatewayConfig>,
    settings: BridgeSettings,
    bindings: Arc<BindingTable>,
    pool: Arc<PersistentConnectionPool>,
    connect: Arc<ConnectProcessor>,
    services: Mutex<HashMap<String, BoundService>>,
    listeners: Mutex<HashMap<String, ListenerHandle>>,
    tracker: ConnectionTracker,
    shutdown: Shutdown,
    next_worker: AtomicUsize,
}

impl Gateway {
    /// Gateway connecting to backends over TCP.
    pub fn new(config: GatewayConfig) -> Arc<Self> {
        let connector = Arc::new(TcpConnector::new(config.http.connect_timeout()));
        Self::with_connector(config, connector)
    }

    pub fn with_connector(config: GatewayConfig, connector: Arc<dyn Connector>) -> Arc<Self> {
        let settings = config.http.bridge_settings();
        let pool = PersistentConnectionPool::new();
        let connect = ConnectProcessor::new(connector, Arc::clone(&pool), settings.clone());
        Arc::new(Self {
            config: ArcSwap::from_pointee(config),
            settings,
            bindings: Arc::new(BindingTable::new()),
            pool,
            connect,
            services: Mutex::new(HashMap::new()),
            listeners: Mutex::new(HashMap::new()),
            tracker: ConnectionTracker::new(),
            shutdown: Shutdown::new(),
            next_worker: AtomicUsize::new(0),
        })
    }

    pub fn config(&self) -> Arc<GatewayConfig> {
        self.config.load_full()
    }

    pub fn bindings(&self) -> &Arc<BindingTable> {
        &self.bindings
    }

    pub fn pool(&self) -> &Arc<PersistentConnectionPool> {
        &self.pool
    }

    pub fn tracker(&self) -> &ConnectionTracker {
        &self.tracker
    }

    pub fn shutdown_handle(&self) -> Shutdown {
        self.shutdown.clone()
    }

    /// Bound address of the listener for `authority` (`scheme://host:port`
    /// as configured).
    pub fn local_addr(&self, authority: &str) -> Option<SocketAddr> {
        self.listeners
            .lock()
            .expect("listener map mutex poisoned")
            .get(authority)
            .map(|handle| handle.local_addr)
    }

    /// Configured authority → bound address, for every running listener.
    pub fn listener_addrs(&self) -> BTreeMap<String, SocketAddr> {
        self.listeners
            .lock()
            .expect("listener map mutex poisoned")
            .iter()
            .map(|(authority, handle)| (authority.clone(), handle.local_addr))
            .collect()
    }

    /// Bind every configured service and start its listeners.
    pub async fn start(self: &Arc<Self>) -> Result<ReloadSummary, GatewayError> {
        let config = self.config();
        self.reconcile(&config).await
    }

    /// Switch to `config`, binding added services and unbinding removed
    /// ones.
    pub async fn apply(self: &Arc<Self>, config: GatewayConfig) -> Result<ReloadSummary, GatewayError> {
        let config = Arc::new(config);
        self.config.store(Arc::clone(&config));
        let summary = self.reconcile(&config).await?;
        tracing::info!(
            added = ?summary.added,
            removed = ?summary.removed,
            listeners_started = ?summary.listeners_started,
            listeners_stopped = ?summary.listeners_stopped,
            "Configuration applied"
        );
        Ok(summary)
    }

    async fn reconcile(self: &Arc<Self>, config: &GatewayConfig) -> Result<ReloadSummary, GatewayError> {
        let mut summary = ReloadSummary::default();

        let stale: Vec<(String, ResolvedAddress)> = {
            let services = self.services.lock().expect("service map mutex poisoned");
            services
                .iter()
                .filter(|(name, bound)| {
                    !config
                        .services
                        .iter()
                        .any(|s| &s.name == *name && s == &bound.config)
                })
                .map(|(name, bound)| (name.clone(), bound.accept.clone()))
                .collect()
        };
        for (name, accept) in stale {
            if let Err(e) = self.bindings.unbind(&accept) {
                tracing::warn!(service = %name, error = %e, "Unbind failed");
            }
            self.services
                .lock()
                .expect("service map mutex poisoned")
                .remove(&name);
            tracing::info!(service = %name, accept = %accept, "Service unbound");
            summary.removed.push(name);
        }

        for service in &config.services {
            let known = self
                .services
                .lock()
                .expect("service map mutex poisoned")
                .contains_key(&service.name);
            if known {
                continue;
            }
            self.bind_service(&config.http, service)?;
            summary.added.push(service.name.clone());
        }

        let running: Vec<String> = self
            .listeners
            .lock()
            .expect("listener map mutex poisoned")
            .keys()
            .cloned()
            .collect();
        for authority in running {
            if !self.bindings.is_bound(&authority) {
                self.stop_listener(&authority);
                summary.listeners_stopped.push(authority);
            }
        }
        for authority in self.bindings.authorities() {
            let running = self
                .listeners
                .lock()
                .expect("listener map mutex poisoned")
                .contains_key(&authority);
            if !running {
                self.start_listener(&authority, config).await?;
                summary.listeners_started.push(authority);
            }
        }
        Ok(summary)
    }

    fn bind_service(&self, http: &HttpConfig, service: &ServiceConfig) -> Result<(), GatewayError> {
        let invalid = |source| GatewayError::Service {
            service: service.name.clone(),
            source,
        };
        let options = http.address_options(service);
        let accept = ResolvedAddress::parse(&service.accept, options.clone()).map_err(invalid)?;
        let upstream = ResolvedAddress::parse(&service.connect, options).map_err(invalid)?;
        let handler = ProxyHandler::new(&service.name, &accept, upstream, Arc::clone(&self.connect));
        self.bindings.bind(&accept, handler).map_err(invalid)?;
        tracing::info!(service = %service.name, accept = %accept, connect = %service.connect, "Service bound");
        self.services.lock().expect("service map mutex poisoned").insert(
            service.name.clone(),
            BoundService {
                config: service.clone(),
                accept,
            },
        );
        Ok(())
    }

    async fn start_listener(self: &Arc<Self>, authority: &str, config: &GatewayConfig) -> Result<(), GatewayError> {
        let local = ResolvedAddress::parse(authority, Default::default()).map_err(|source| GatewayError::Service {
            service: authority.to_string(),
            source,
        })?;
        let bind_address = format!("{}:{}", local.host(), local.port());
        let listener = Listener::bind(&bind_address, config.listener.max_connections).await?;
        let local_addr = listener.local_addr().map_err(|source| ListenerError::Bind {
            address: bind_address.clone(),
            source,
        })?;
        let processor = AcceptProcessor::new(local, Arc::clone(&self.bindings), self.settings.clone());
        let (stop_tx, stop_rx) = oneshot::channel();
        let workers = config.listener.workers.max(1);
        let gateway = Arc::clone(self);
        let task = tokio::spawn(async move {
            gateway.accept_loop(listener, processor, workers, stop_rx).await;
        });
        tracing::info!(authority = %authority, address = %local_addr, "Accepting connections");
        self.listeners.lock().expect("listener map mutex poisoned").insert(
            authority.to_string(),
            ListenerHandle {
                local_addr,
                stop: Some(stop_tx),
                task,
            },
        );
        Ok(())
    }

    fn stop_listener(&self, authority: &str) {
        let handle = self
            .listeners
            .lock()
            .expect("listener map mutex poisoned")
            .remove(authority);
        if let Some(handle) = handle {
            tracing::info!(authority = %authority, address = %handle.local_addr, "Listener stopped");
            handle.stop();
        }
    }

    async fn accept_loop(
        self: Arc<Self>,
        listener: Listener,
        processor: Arc<AcceptProcessor>,
        workers: usize,
        mut stop: oneshot::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                _ = &mut stop => break,
                _ = self.shutdown.wait() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, remote, permit)) => {
                        self.serve_connection(stream, remote, permit, &processor, workers);
                    }
                    Err(ListenerError::Closed) => break,
                    Err(e) => {
                        tracing::warn!(authority = %processor.local().authority_key(), error = %e, "Accept failed");
                    }
                },
            }
        }
        tracing::debug!(authority = %processor.local().authority_key(), "Accept loop ended");
    }

    fn serve_connection(
        &self,
        stream: TcpStream,
        remote: SocketAddr,
        permit: ConnectionPermit,
        processor: &Arc<AcceptProcessor>,
        workers: usize,
    ) {
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(remote = %remote, error = %e, "Failed to set TCP_NODELAY");
        }
        let worker = WorkerId(self.next_worker.fetch_add(1, Ordering::Relaxed) % workers);
        let transport = TcpIo::spawn(
            stream,
            worker,
            remote.to_string(),
            processor.pipeline(),
            Arc::clone(processor) as Arc<dyn IoHandler>,
        );
        self.tracker.track(&transport);
        let closed = transport.close_future();
        tokio::spawn(async move {
            closed.wait().await;
            drop(permit);
        });
        transport.open();
    }

    /// Apply every configuration received on `updates` until shutdown.
    pub async fn watch(self: Arc<Self>, mut updates: mpsc::UnboundedReceiver<GatewayConfig>) {
        loop {
            tokio::select! {
                _ = self.shutdown.wait() => break,
                update = updates.recv() => match update {
                    Some(config) => {
                        if let Err(e) = self.apply(config).await {
                            tracing::error!(error = %e, "Failed to apply configuration");
                        }
                    }
                    None => break,
                },
            }
        }
    }

    /// Stop accepting, drop pooled connections, wait up to `drain` for the
    /// rest to finish, then close whatever is left.
    pub async fn shutdown(&self, drain: Duration) {
        tracing::info!(connections = self.tracker.active_count(), "Shutting down gateway");
        self.shutdown.trigger();
        let authorities: Vec<String> = self
            .listeners
            .lock()
            .expect("listener map mutex poisoned")
            .keys()
            .cloned()
            .collect();
        for authority in authorities {
            self.stop_listener(&authority);
        }
        self.pool.clear();
        if !self.tracker.wait_drained(drain).await {
            let closed = self.tracker.close_all();
            tracing::warn!(closed, "Drain deadline passed, closed remaining connections");
        }
        tracing::info!("Gateway stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::MemoryConnector;

    fn service(name: &str, accept: &str) -> ServiceConfig {
        ServiceConfig {
            name: name.to_string(),
            accept: accept.to_string(),
            connect: "http://127.0.0.1:9/".to_string(),
            keep_alive_timeout_secs: None,
            keep_alive_connections: None,
        }
    }

    fn config(services: Vec<ServiceConfig>) -> GatewayConfig {
        GatewayConfig {
            services,
            ..GatewayConfig::default()
        }
    }

    #[tokio::test]
    async fn start_binds_and_listens() {
        let gateway = Gateway::with_connector(
            config(vec![
                service("a", "http://127.0.0.1:0/a"),
                service("b", "http://127.0.0.1:0/b"),
            ]),
            MemoryConnector::new(),
        );
        let summary = gateway.start().await.unwrap();
        assert_eq!(summary.added.len(), 2);
        assert_eq!(summary.listeners_started, vec!["http://127.0.0.1:0".to_string()]);
        assert!(gateway.local_addr("http://127.0.0.1:0").is_some());
        assert_eq!(gateway.bindings().paths("http://127.0.0.1:0"), vec!["/a", "/b"]);
        gateway.shutdown(Duration::from_millis(10)).await;
    }

    #[tokio::test]
    async fn accepted_connection_reaches_accept_processor() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let gateway = Gateway::with_connector(config(vec![service("a", "http://127.0.0.1:0/a")]), MemoryConnector::new());
        gateway.start().await.unwrap();
        let addr = gateway.local_addr("http://127.0.0.1:0").unwrap();

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"GET /elsewhere HTTP/1.1\r\nHost: x\r\n\r\n").await.unwrap();
        let mut buf = vec![0u8; 256];
        let n = tokio::time::timeout(Duration::from_secs(5), client.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert!(String::from_utf8_lossy(&buf[..n]).starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert_eq!(gateway.tracker().active_count(), 1);
        gateway.shutdown(Duration::from_millis(10)).await;
    }

    #[tokio::test]
    async fn reload_diffs_services_and_listeners() {
        let gateway = Gateway::with_connector(config(vec![service("a", "http://127.0.0.1:0/a")]), MemoryConnector::new());
        gateway.start().await.unwrap();

        let mut changed = service("a", "http://127.0.0.1:0/a");
        changed.keep_alive_connections = Some(1);
        let summary = gateway
            .apply(config(vec![changed, service("c", "http://localhost:0/c")]))
            .await
            .unwrap();
        assert_eq!(summary.removed, vec!["a".to_string()]);
        assert_eq!(summary.added, vec!["a".to_string(), "c".to_string()]);
        assert_eq!(summary.listeners_started, vec!["http://localhost:0".to_string()]);
        assert_eq!(gateway.config().services.len(), 2);

        let summary = gateway
            .apply(config(vec![service("c", "http://localhost:0/c")]))
            .await
            .unwrap();
        assert_eq!(summary.removed, vec!["a".to_string()]);
        assert_eq!(summary.listeners_stopped, vec!["http://127.0.0.1:0".to_string()]);
        assert!(gateway.local_addr("http://127.0.0.1:0").is_none());
        gateway.shutdown(Duration::from_millis(10)).await;
    }

    #[tokio::test]
    async fn unchanged_reload_is_a_no_op() {
        let cfg = config(vec![service("a", "http://127.0.0.1:0/a")]);
        let gateway = Gateway::with_connector(cfg.clone(), MemoryConnector::new());
        gateway.start().await.unwrap();
        let summary = gateway.apply(cfg).await.unwrap();
        assert_eq!(summary, ReloadSummary::default());
        gateway.shutdown(Duration::from_millis(10)).await;
    }
}
