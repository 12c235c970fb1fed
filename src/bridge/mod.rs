//! Bridge engine: HTTP exchanges layered over transport sessions.
//!
//! # Data Flow
//! ```text
//! accept transport → AcceptProcessor → BindingTable::resolve
//!     → BridgeSession (accept) → BridgeHandler
//!
//! BridgeHandler → ConnectProcessor::create_session / connect
//!     → PersistentConnectionPool::take or Connector::connect
//!     → BridgeSession (connect) → response → recycle / close / upgrade
//! ```
//!
//! # Design Decisions
//! - Both processors are the transport-level `IoHandler` of the transports
//!   they own and the session-level `Processor` of the sessions they create
//! - A status-101 exchange hands its transport to `UpgradeCoordinator`
//!   instead of closing or pooling it

pub mod accept;
pub mod connect;
pub mod handler;
pub mod session;
pub mod upgrade;

pub use accept::{AcceptProcessor, WrappedResponse};
pub use connect::ConnectProcessor;
pub use handler::{BridgeHandler, StatusHandler};
pub use session::{BridgeSession, Direction, Encoding};
pub use upgrade::UpgradeCoordinator;

use crate::codec::DEFAULT_MAX_HEADER_BYTES;

/// Limits shared by both processors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeSettings {
    /// Accept-side body bytes buffered before an implicit commit.
    pub write_buffer_limit: u64,
    /// Inbound messages held while a session's reads are suspended.
    pub deferred_read_limit: usize,
    pub max_header_bytes: usize,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            write_buffer_limit: 8192,
            deferred_read_limit: 64,
            max_header_bytes: DEFAULT_MAX_HEADER_BYTES,
        }
    }
}
