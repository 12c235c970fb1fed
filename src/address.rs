//! Resolved addresses handed to the engine by the service layer.
//!
//! An address is a URI plus the options that govern exchanges on it. Bindings
//! are keyed by the authority part (`scheme://host:port`) and routed by path;
//! pooled connections are keyed by the same authority.

use std::fmt;
use std::time::Duration;

use url::Url;

use crate::error::BridgeError;

/// Per-address options consumed by the bridge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressOptions {
    /// Bounds idle pooled connections and waits for a peer-requested close.
    pub keep_alive_timeout: Duration,
    /// Maximum idle pooled connections for this destination.
    pub keep_alive_connections: usize,
    pub user_agent_header_enabled: bool,
    pub host_header_enabled: bool,
}

impl Default for AddressOptions {
    fn default() -> Self {
        Self {
            keep_alive_timeout: Duration::from_secs(30),
            keep_alive_connections: 16,
            user_agent_header_enabled: true,
            host_header_enabled: true,
        }
    }
}

/// A URI with its resolved options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedAddress {
    location: Url,
    options: AddressOptions,
}

impl ResolvedAddress {
    pub fn new(location: Url, options: AddressOptions) -> Self {
        Self { location, options }
    }

    /// Parse a URI string, rejecting anything without a host.
    pub fn parse(uri: &str, options: AddressOptions) -> Result<Self, BridgeError> {
        let invalid = |reason: String| BridgeError::InvalidAddress {
            address: uri.to_string(),
            reason,
        };
        let location = Url::parse(uri).map_err(|e| invalid(e.to_string()))?;
        if location.host_str().is_none() {
            return Err(invalid("missing host".to_string()));
        }
        Ok(Self { location, options })
    }

    pub fn location(&self) -> &Url {
        &self.location
    }

    pub fn options(&self) -> &AddressOptions {
        &self.options
    }

    pub fn host(&self) -> &str {
        self.location.host_str().unwrap_or("localhost")
    }

    pub fn port(&self) -> u16 {
        self.location.port_or_known_default().unwrap_or(80)
    }

    /// Path component, always starting with `/`.
    pub fn path(&self) -> &str {
        match self.location.path() {
            "" => "/",
            path => path,
        }
    }

    /// `scheme://host:port`, the key for bindings and pooled connections.
    pub fn authority_key(&self) -> String {
        format!("{}://{}:{}", self.location.scheme(), self.host(), self.port())
    }

    /// Value for a `Host` header, omitting default ports.
    pub fn host_header(&self) -> String {
        match self.location.port() {
            Some(port) => format!("{}:{}", self.host(), port),
            None => self.host().to_string(),
        }
    }

    /// Same authority and options, different path.
    pub fn with_path(&self, path: &str) -> Self {
        let mut location = self.location.clone();
        location.set_path(path);
        Self {
            location,
            options: self.options.clone(),
        }
    }
}

impl fmt::Display for ResolvedAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.location)
    }
}
