//! Bridge gateway library.
//!
//! HTTP/1.x exchanges bridged over pluggable transports: an accept side
//! that serves requests, a connect side that originates them, a pool of
//! persistent outbound connections, and protocol upgrades that hand a
//! transport to a new handler.

pub mod address;
pub mod binding;
pub mod bridge;
pub mod codec;
pub mod completion;
pub mod error;
pub mod http;
pub mod pool;
pub mod transport;

// Runtime around the engine
pub mod admin;
pub mod config;
pub mod gateway;
pub mod lifecycle;
pub mod net;
pub mod observability;
pub mod service;

pub use address::{AddressOptions, ResolvedAddress};
pub use binding::BindingTable;
pub use bridge::{AcceptProcessor, BridgeHandler, BridgeSession, ConnectProcessor};
pub use completion::Completion;
pub use config::GatewayConfig;
pub use error::BridgeError;
pub use gateway::Gateway;
pub use lifecycle::Shutdown;
pub use pool::PersistentConnectionPool;
