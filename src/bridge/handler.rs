//! Exchange-level handler contract and the built-in status responder.

use std::sync::Arc;

use bytes::Bytes;

use crate::bridge::session::BridgeSession;
use crate::error::BridgeError;
use crate::http::head::reason_phrase;
use crate::http::headers;

/// Receives the events of one bridge session.
///
/// On the accept side `session_opened` means a request head arrived; on the
/// connect side it means the response head arrived.
pub trait BridgeHandler: Send + Sync {
    fn session_opened(&self, session: &Arc<BridgeSession>);

    fn message_received(&self, _session: &Arc<BridgeSession>, _data: Bytes) {}

    /// The inbound body has been fully received.
    fn input_complete(&self, _session: &Arc<BridgeSession>) {}

    fn session_closed(&self, _session: &Arc<BridgeSession>) {}

    fn exception_caught(&self, session: &Arc<BridgeSession>, error: &BridgeError) {
        tracing::debug!(session = session.id(), error = %error, "Bridge session error");
    }
}

/// Answers every request with a fixed status and a short text body.
#[derive(Debug, Clone)]
pub struct StatusHandler {
    status: u16,
    close: bool,
}

impl StatusHandler {
    pub fn new(status: u16) -> Self {
        Self { status, close: false }
    }

    /// Same, forcing `Connection: close`.
    pub fn closing(status: u16) -> Self {
        Self { status, close: true }
    }
}

impl BridgeHandler for StatusHandler {
    fn session_opened(&self, session: &Arc<BridgeSession>) {
        let reason = reason_phrase(self.status);
        let result = session
            .set_status(self.status, reason)
            .and_then(|_| session.set_write_header("Content-Type", "text/plain"))
            .and_then(|_| {
                if self.close {
                    session.set_write_header(headers::CONNECTION, "close")
                } else {
                    Ok(())
                }
            });
        if let Err(e) = result {
            tracing::debug!(session = session.id(), error = %e, "Status response already committed");
        } else if session.method() != "HEAD" {
            session.write_bytes(Bytes::from(format!("{} {}\n", self.status, reason)));
        }
        session.close();
    }
}
