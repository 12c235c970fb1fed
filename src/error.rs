//! Error taxonomy for the bridge engine.
//!
//! # Design Decisions
//! - One `BridgeError` for the whole engine, `Clone` so a single failure can
//!   satisfy a completion handle and reach every listener
//! - Decode failures carry the HTTP status the accept side answers with
//! - Contract violations (`IllegalState`) are returned synchronously to the
//!   caller; transport failures travel through completion handles

use std::io;
use std::sync::Arc;

/// Errors produced by bridge sessions, processors and transports.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BridgeError {
    /// The session was asked to do something its current state forbids.
    #[error("illegal state on session {session}: {detail}")]
    IllegalState { session: u64, detail: String },

    /// Malformed wire input; `status` is the response to send back.
    #[error("decode error ({status}): {reason}")]
    Decode { status: u16, reason: String },

    /// The transport closed before the exchange completed.
    #[error("session {session} terminated early")]
    EarlyTermination { session: u64 },

    /// Write or commit attempted on a closed transport.
    #[error("transport closed")]
    Closed,

    /// A protocol upgrade could not be completed.
    #[error("upgrade failed: {0}")]
    UpgradeFailed(String),

    /// A message other than raw bytes reached the transport.
    #[error("message reached the transport without being encoded")]
    Unencoded,

    /// More inbound messages arrived while suspended than the queue holds.
    #[error("session {session} deferred read queue overflow (capacity {capacity})")]
    DeferredOverflow { session: u64, capacity: usize },

    /// A URI that cannot name a destination.
    #[error("invalid address {address}: {reason}")]
    InvalidAddress { address: String, reason: String },

    /// A handler is already registered for this address and path.
    #[error("address already bound: {address}")]
    AlreadyBound { address: String },

    /// No handler is registered for this address and path.
    #[error("address not bound: {address}")]
    NotBound { address: String },

    /// Opening an outbound transport failed.
    #[error("connect to {address} failed: {reason}")]
    Connect { address: String, reason: String },

    /// The backend could not be reached in time.
    #[error("gateway timeout")]
    GatewayTimeout,

    /// Underlying socket error.
    #[error("transport i/o: {0}")]
    Io(Arc<io::Error>),
}

impl From<io::Error> for BridgeError {
    fn from(err: io::Error) -> Self {
        BridgeError::Io(Arc::new(err))
    }
}

impl BridgeError {
    pub(crate) fn illegal_state(session: u64, detail: impl Into<String>) -> Self {
        BridgeError::IllegalState {
            session,
            detail: detail.into(),
        }
    }

    pub(crate) fn decode(status: u16, reason: impl Into<String>) -> Self {
        BridgeError::Decode {
            status,
            reason: reason.into(),
        }
    }

    /// Status the accept side should answer with for this failure, if any.
    pub fn response_status(&self) -> u16 {
        match self {
            BridgeError::Decode { status, .. } => *status,
            BridgeError::Connect { .. } => 502,
            BridgeError::EarlyTermination { .. } | BridgeError::GatewayTimeout => 504,
            _ => 500,
        }
    }
}

/// Outcome carried by write, commit and upgrade completion handles.
pub type Outcome = Result<(), BridgeError>;
