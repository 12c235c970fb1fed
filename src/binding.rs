//! Binding table: bound address → path-ordered handler registrations.
//!
//! # Design Decisions
//! - One `Binding` per authority (`scheme://host:port`), in a `DashMap`
//! - Paths are stored as segment vectors in a `BTreeMap`, so the longest
//!   registered prefix of a request path is the first prefix met when
//!   scanning downward from the request path itself
//! - A binding is dropped once its last path is unbound; the caller learns
//!   this so it can stop the authority's listener

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use dashmap::DashMap;

use crate::address::ResolvedAddress;
use crate::bridge::handler::BridgeHandler;
use crate::error::BridgeError;

type Segments = Vec<String>;

fn segments(path: &str) -> Segments {
    path.split('/')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn render(segments: &Segments) -> String {
    format!("/{}", segments.join("/"))
}

/// A handler registered under an address.
#[derive(Clone)]
pub struct Registration {
    pub address: ResolvedAddress,
    pub handler: Arc<dyn BridgeHandler>,
}

impl std::fmt::Debug for Registration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registration")
            .field("address", &self.address.to_string())
            .finish()
    }
}

#[derive(Default)]
struct Binding {
    paths: RwLock<BTreeMap<Segments, Registration>>,
    references: AtomicUsize,
}

#[derive(Default)]
pub struct BindingTable {
    bindings: DashMap<String, Arc<Binding>>,
}

impl BindingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under the address's authority and path.
    pub fn bind(&self, address: &ResolvedAddress, handler: Arc<dyn BridgeHandler>) -> Result<(), BridgeError> {
        let key = address.authority_key();
        let path = segments(address.path());
        {
            // The entry guard stays held until the path is counted, so an
            // unbind of the last path cannot drop this binding meanwhile.
            let binding = self.bindings.entry(key.clone()).or_default();
            let mut paths = binding.paths.write().expect("binding paths lock poisoned");
            if paths.contains_key(&path) {
                return Err(BridgeError::AlreadyBound {
                    address: address.to_string(),
                });
            }
            paths.insert(
                path,
                Registration {
                    address: address.clone(),
                    handler,
                },
            );
            binding.references.fetch_add(1, Ordering::SeqCst);
        }
        tracing::debug!(address = %key, path = address.path(), "Bound handler");
        Ok(())
    }

    /// Remove the registration at the address's path. Returns true when
    /// that was the authority's last path.
    pub fn unbind(&self, address: &ResolvedAddress) -> Result<bool, BridgeError> {
        let key = address.authority_key();
        let not_bound = || BridgeError::NotBound {
            address: address.to_string(),
        };
        let remaining = {
            let binding = self.bindings.get(&key).ok_or_else(not_bound)?;
            let mut paths = binding.paths.write().expect("binding paths lock poisoned");
            if paths.remove(&segments(address.path())).is_none() {
                return Err(not_bound());
            }
            let remaining = binding.references.fetch_sub(1, Ordering::SeqCst) - 1;
            remaining
        };
        tracing::debug!(address = %key, path = address.path(), remaining, "Unbound handler");
        if remaining > 0 {
            return Ok(false);
        }
        // A bind that slipped in after the count reached zero keeps the binding.
        let dropped = self
            .bindings
            .remove_if(&key, |_, b| b.references.load(Ordering::SeqCst) == 0)
            .is_some();
        Ok(dropped)
    }

    /// Most specific registration whose path prefixes the address's path.
    pub fn resolve(&self, address: &ResolvedAddress) -> Option<Registration> {
        self.resolve_path(&address.authority_key(), address.path())
    }

    pub fn resolve_path(&self, authority: &str, path: &str) -> Option<Registration> {
        let binding = self.bindings.get(authority).map(|b| Arc::clone(b.value()))?;
        let paths = binding.paths.read().expect("binding paths lock poisoned");
        let request = segments(path);
        paths
            .range(..=request.clone())
            .rev()
            .find(|(registered, _)| request.starts_with(registered))
            .map(|(_, registration)| registration.clone())
    }

    pub fn is_bound(&self, authority: &str) -> bool {
        self.bindings.contains_key(authority)
    }

    pub fn authorities(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.bindings.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }

    /// Registered paths of one authority, in table order.
    pub fn paths(&self, authority: &str) -> Vec<String> {
        self.bindings
            .get(authority)
            .map(|b| {
                b.paths
                    .read()
                    .expect("binding paths lock poisoned")
                    .keys()
                    .map(render)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Authority → paths, for the admin surface.
    pub fn snapshot(&self) -> BTreeMap<String, Vec<String>> {
        self.authorities()
            .into_iter()
            .map(|authority| {
                let paths = self.paths(&authority);
                (authority, paths)
            })
            .collect()
    }
}
