//! Raw transport primitives and the handler contract.

use std::sync::Arc;

use bytes::Bytes;

use crate::address::ResolvedAddress;
use crate::completion::{Completion, WriteFuture};
use crate::error::BridgeError;
use crate::http::Message;
use crate::transport::session::{TransportSession, WorkerId};

/// Byte-level socket operations supplied by the transport layer.
pub trait TransportIo: Send + Sync {
    /// Queue bytes for the peer; the handle completes once they are written.
    fn write(&self, bytes: Bytes) -> WriteFuture;

    /// Close the socket. Must be idempotent.
    fn close(&self);

    /// Stop delivering inbound bytes until `resume_read`.
    fn suspend_read(&self) {}

    fn resume_read(&self) {}
}

/// Receives events for one transport session.
pub trait IoHandler: Send + Sync {
    /// Called once the handler owns the transport. An error force-closes it.
    fn session_opened(&self, _transport: &Arc<TransportSession>) -> Result<(), BridgeError> {
        Ok(())
    }

    fn message_received(&self, transport: &Arc<TransportSession>, message: Message);

    fn session_closed(&self, _transport: &Arc<TransportSession>) {}

    fn exception_caught(&self, transport: &Arc<TransportSession>, error: &BridgeError) {
        tracing::warn!(transport = %transport.id(), error = %error, "Unhandled transport error, closing");
        transport.close();
    }
}

/// Result of opening an outbound transport.
pub type ConnectFuture = Completion<Result<Arc<TransportSession>, BridgeError>>;

/// Opens outbound transports with the connect-side pipeline installed.
pub trait Connector: Send + Sync {
    fn connect(
        &self,
        address: &ResolvedAddress,
        worker: WorkerId,
        handler: Arc<dyn IoHandler>,
    ) -> ConnectFuture;
}
