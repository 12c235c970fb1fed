//! Network layer: sockets under the transport abstraction.
//!
//! # Data Flow
//! ```text
//! Incoming TCP connection
//!     → listener.rs (accept loop, connection limits)
//!     → tcp.rs (TcpIo reader/writer tasks → TransportSession)
//!     → connection.rs (live tracking for drain on shutdown)
//!     → AcceptProcessor
//!
//! ConnectProcessor → tcp.rs TcpConnector → TransportSession
//! ```
//!
//! # Design Decisions
//! - Accepted connections per listener are capped by a semaphore permit
//! - Every accepted transport is tracked until its close future completes

pub mod connection;
pub mod listener;
pub mod tcp;
