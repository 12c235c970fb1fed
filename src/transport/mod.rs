//! Transport subsystem: raw connections the bridge runs on.
//!
//! # Data Flow
//! ```text
//! socket bytes → TransportIo → TransportSession::received
//!     → pipeline read stages (head → tail) → IoHandler::message_received
//!
//! IoHandler / bridge → TransportSession::write
//!     → pipeline write stages (tail → head) → TransportIo::write → socket
//! ```
//!
//! # Design Decisions
//! - Socket plumbing is behind `TransportIo`, so the engine runs unchanged
//!   over tokio TCP (`net::tcp`) or in memory (`memory`)
//! - Handlers are swappable at runtime; that is how protocol upgrade works

pub mod io;
pub mod logging;
pub mod memory;
pub mod pipeline;
pub mod session;

pub use io::{ConnectFuture, Connector, IoHandler, TransportIo};
pub use pipeline::{Pipeline, Stage};
pub use session::{TransportSession, WorkerId};
