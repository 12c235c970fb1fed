//! Connection identity and live-connection tracking.
//!
//! # Responsibilities
//! - Generate unique connection IDs for tracing and per-connection state
//! - Track live transports so shutdown can drain or force-close them

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Notify;

use crate::transport::session::TransportSession;

/// Relaxed ordering is enough: only uniqueness matters.
static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a transport connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn new() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

#[derive(Debug, Default)]
struct Live {
    transports: DashMap<ConnectionId, Weak<TransportSession>>,
    drained: Notify,
}

/// Live transports, for graceful shutdown.
#[derive(Debug, Clone, Default)]
pub struct ConnectionTracker {
    live: Arc<Live>,
}

impl ConnectionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track `transport` until it closes.
    pub fn track(&self, transport: &Arc<TransportSession>) {
        let id = transport.id();
        self.live.transports.insert(id, Arc::downgrade(transport));
        let live = Arc::downgrade(&self.live);
        transport.close_future().on_complete(move |_| {
            if let Some(live) = live.upgrade() {
                live.transports.remove(&id);
                tracing::trace!(connection_id = %id, remaining = live.transports.len(), "Connection untracked");
                if live.transports.is_empty() {
                    live.drained.notify_waiters();
                }
            }
        });
    }

    pub fn active_count(&self) -> usize {
        self.live.transports.len()
    }

    /// Wait until every tracked transport has closed. False on timeout.
    pub async fn wait_drained(&self, timeout: Duration) -> bool {
        let wait = async {
            loop {
                let notified = self.live.drained.notified();
                if self.live.transports.is_empty() {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, wait).await.is_ok()
    }

    /// Close everything still tracked.
    pub fn close_all(&self) -> usize {
        let transports: Vec<Arc<TransportSession>> = self
            .live
            .transports
            .iter()
            .filter_map(|entry| entry.value().upgrade())
            .collect();
        let count = transports.len();
        for transport in transports {
            transport.close();
        }
        // Entries whose transport was dropped without closing.
        self.live.transports.retain(|_, weak| weak.strong_count() > 0);
        if self.live.transports.is_empty() {
            self.live.drained.notify_waiters();
        }
        count
    }
}
