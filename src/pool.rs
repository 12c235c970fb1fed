//! Persistent connection pool for outbound transports.
//!
//! # Responsibilities
//! - Park idle, reusable connect-side transports per destination authority
//! - Hand them back only to the worker that created them
//! - Evict on close (any cause) and on idle timeout
//!
//! # Design Decisions
//! - Storage is keyed by `WorkerId`, each worker owning a fixed slot array
//!   per authority sized by `keep_alive_connections`; a full array rejects
//!   the recycle and the caller closes the transport
//! - A transport registers its eviction listener on its close handle the
//!   first time it is pooled; the slot it occupies is recorded on the
//!   transport so eviction is a direct index
//! - The idle guard is the transport's own timer; closing evicts

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;

use crate::address::ResolvedAddress;
use crate::observability::metrics;
use crate::transport::session::{TransportSession, WorkerId};

type Slots = Vec<Option<Arc<TransportSession>>>;

/// Idle connections of one worker for one destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub worker: usize,
    pub address: String,
    pub idle: usize,
    pub capacity: usize,
}

#[derive(Default)]
pub struct PersistentConnectionPool {
    workers: DashMap<WorkerId, HashMap<String, Slots>>,
    idle: AtomicUsize,
}

impl PersistentConnectionPool {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Offer an idle transport for reuse. False means the caller keeps it
    /// (and should close it).
    pub fn recycle(self: &Arc<Self>, transport: &Arc<TransportSession>, address: &ResolvedAddress) -> bool {
        let key = address.authority_key();
        let capacity = address.options().keep_alive_connections;
        if capacity == 0 || transport.is_closing() {
            metrics::record_recycle(false);
            return false;
        }
        let slot = {
            let mut worker = self.workers.entry(transport.worker()).or_default();
            let slots = worker.entry(key.clone()).or_default();
            if slots.len() < capacity {
                slots.resize(capacity, None);
            }
            // Capacity may have dropped since the slots were sized.
            let occupied = slots.iter().filter(|s| s.is_some()).count();
            let free = if occupied < capacity {
                slots.iter().position(Option::is_none)
            } else {
                None
            };
            if let Some(index) = free {
                slots[index] = Some(Arc::clone(transport));
            }
            free
        };
        let Some(index) = slot else {
            tracing::debug!(address = %key, transport = %transport.id(), capacity, "Pool full, not recycling");
            metrics::record_recycle(false);
            return false;
        };
        transport.set_pool_slot(Some((key.clone(), index)));
        metrics::record_pool_idle(self.idle.fetch_add(1, Ordering::SeqCst) + 1);
        metrics::record_recycle(true);

        if transport.arm_pool_listener() {
            let pool = Arc::downgrade(self);
            let weak = Arc::downgrade(transport);
            transport.close_future().on_complete(move |_| {
                if let (Some(pool), Some(transport)) = (pool.upgrade(), weak.upgrade()) {
                    pool.evict(&transport);
                }
            });
        }
        transport.arm_idle_timeout(address.options().keep_alive_timeout);
        tracing::debug!(address = %key, transport = %transport.id(), slot = index, "Recycled connection");
        true
    }

    /// Remove and return an idle transport for `address` owned by `worker`.
    pub fn take(&self, address: &ResolvedAddress, worker: WorkerId) -> Option<Arc<TransportSession>> {
        let key = address.authority_key();
        let found = {
            let mut slots = self.workers.get_mut(&worker)?;
            let slots = slots.get_mut(&key);
            slots.and_then(|slots| {
                slots
                    .iter_mut()
                    .filter(|slot| matches!(slot, Some(t) if !t.is_closing()))
                    .find_map(Option::take)
            })
        };
        match found {
            Some(transport) => {
                transport.set_pool_slot(None);
                transport.cancel_idle_timeout();
                metrics::record_pool_idle(self.idle.fetch_sub(1, Ordering::SeqCst).saturating_sub(1));
                metrics::record_take(true);
                tracing::debug!(address = %key, transport = %transport.id(), "Reusing pooled connection");
                Some(transport)
            }
            None => {
                metrics::record_take(false);
                None
            }
        }
    }

    /// Drop `transport` from whatever slot it occupies.
    fn evict(&self, transport: &Arc<TransportSession>) {
        let Some((key, index)) = transport.pool_slot() else {
            return;
        };
        transport.set_pool_slot(None);
        let removed = self
            .workers
            .get_mut(&transport.worker())
            .and_then(|mut worker| {
                let slot = worker.get_mut(&key)?.get_mut(index)?;
                if matches!(slot, Some(t) if Arc::ptr_eq(t, transport)) {
                    slot.take()
                } else {
                    None
                }
            })
            .is_some();
        if removed {
            metrics::record_pool_idle(self.idle.fetch_sub(1, Ordering::SeqCst).saturating_sub(1));
            tracing::debug!(address = %key, transport = %transport.id(), "Evicted pooled connection");
        }
    }

    /// Idle connections for `address` on `worker`.
    pub fn idle_count(&self, address: &ResolvedAddress, worker: WorkerId) -> usize {
        self.workers
            .get(&worker)
            .and_then(|w| {
                w.get(&address.authority_key())
                    .map(|slots| slots.iter().filter(|s| s.is_some()).count())
            })
            .unwrap_or(0)
    }

    pub fn total_idle(&self) -> usize {
        self.idle.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> Vec<PoolStats> {
        let mut stats: Vec<PoolStats> = self
            .workers
            .iter()
            .flat_map(|entry| {
                let worker = entry.key().0;
                entry
                    .value()
                    .iter()
                    .map(|(address, slots)| PoolStats {
                        worker,
                        address: address.clone(),
                        idle: slots.iter().filter(|s| s.is_some()).count(),
                        capacity: slots.len(),
                    })
                    .collect::<Vec<_>>()
            })
            .collect();
        stats.sort_by(|a, b| (a.worker, &a.address).cmp(&(b.worker, &b.address)));
        stats
    }

    /// Close every pooled connection.
    pub fn clear(&self) {
        let transports: Vec<Arc<TransportSession>> = self
            .workers
            .iter_mut()
            .flat_map(|mut entry| {
                entry
                    .value_mut()
                    .values_mut()
                    .flat_map(|slots| slots.iter_mut().filter_map(Option::take))
                    .collect::<Vec<_>>()
            })
            .collect();
        for transport in transports {
            transport.set_pool_slot(None);
            self.idle.fetch_sub(1, Ordering::SeqCst);
            transport.close();
        }
        metrics::record_pool_idle(self.total_idle());
    }
}

impl std::fmt::Debug for PersistentConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistentConnectionPool")
            .field("idle", &self.total_idle())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::AddressOptions;
    use crate::http::Message;
    use crate::transport::io::IoHandler;
    use crate::transport::memory::MemoryIo;
    use crate::transport::pipeline::Pipeline;
    use std::time::Duration;

    struct Idle;
    impl IoHandler for Idle {
        fn message_received(&self, _t: &Arc<TransportSession>, _m: Message) {}
    }

    fn address(capacity: usize, timeout: Duration) -> ResolvedAddress {
        let options = AddressOptions {
            keep_alive_connections: capacity,
            keep_alive_timeout: timeout,
            ..AddressOptions::default()
        };
        ResolvedAddress::parse("http://backend:9000/", options).unwrap()
    }

    fn transport(worker: usize) -> Arc<TransportSession> {
        TransportSession::new(MemoryIo::new(), WorkerId(worker), "mem", Pipeline::new(), Arc::new(Idle))
    }

    #[tokio::test]
    async fn capacity_is_a_hard_bound() {
        let pool = PersistentConnectionPool::new();
        let addr = address(2, Duration::from_secs(30));
        let transports: Vec<_> = (0..3).map(|_| transport(0)).collect();
        assert!(pool.recycle(&transports[0], &addr));
        assert!(pool.recycle(&transports[1], &addr));
        assert!(!pool.recycle(&transports[2], &addr));
        assert_eq!(pool.idle_count(&addr, WorkerId(0)), 2);
        assert_eq!(pool.total_idle(), 2);
    }

    #[tokio::test]
    async fn lowered_capacity_is_honoured() {
        let pool = PersistentConnectionPool::new();
        let wide = address(4, Duration::from_secs(30));
        let narrow = address(1, Duration::from_secs(30));
        assert!(pool.recycle(&transport(0), &wide));
        for _ in 0..3 {
            assert!(!pool.recycle(&transport(0), &narrow));
        }
        assert_eq!(pool.idle_count(&narrow, WorkerId(0)), 1);
        let taken = pool.take(&narrow, WorkerId(0)).unwrap();
        assert!(pool.recycle(&taken, &narrow));
        assert_eq!(pool.total_idle(), 1);
    }

    #[tokio::test]
    async fn take_is_worker_affine() {
        let pool = PersistentConnectionPool::new();
        let addr = address(4, Duration::from_secs(30));
        let t = transport(1);
        assert!(pool.recycle(&t, &addr));
        assert!(t.has_idle_timeout());
        assert!(pool.take(&addr, WorkerId(0)).is_none());
        let taken = pool.take(&addr, WorkerId(1)).unwrap();
        assert!(Arc::ptr_eq(&taken, &t));
        assert!(!taken.has_idle_timeout());
        assert!(pool.take(&addr, WorkerId(1)).is_none());
    }

    #[tokio::test]
    async fn close_evicts() {
        let pool = PersistentConnectionPool::new();
        let addr = address(1, Duration::from_secs(30));
        let t = transport(0);
        assert!(pool.recycle(&t, &addr));
        t.close();
        assert_eq!(pool.idle_count(&addr, WorkerId(0)), 0);
        assert!(pool.recycle(&transport(0), &addr));
    }

    #[tokio::test]
    async fn idle_timeout_evicts() {
        let pool = PersistentConnectionPool::new();
        let addr = address(1, Duration::from_millis(20));
        let t = transport(0);
        assert!(pool.recycle(&t, &addr));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(t.is_closing());
        assert_eq!(pool.total_idle(), 0);
    }

    #[tokio::test]
    async fn reused_transport_can_be_pooled_again() {
        let pool = PersistentConnectionPool::new();
        let addr = address(1, Duration::from_secs(30));
        let t = transport(0);
        assert!(pool.recycle(&t, &addr));
        let taken = pool.take(&addr, WorkerId(0)).unwrap();
        assert!(pool.recycle(&taken, &addr));
        taken.close();
        assert_eq!(pool.total_idle(), 0);
    }

    #[test]
    fn zero_capacity_never_pools() {
        let pool = PersistentConnectionPool::new();
        assert!(!pool.recycle(&transport(0), &address(0, Duration::from_secs(1))));
        assert!(pool.stats().is_empty());
    }
}
