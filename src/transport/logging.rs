//! Pipeline stage that traces every message crossing the transport.

use std::sync::Arc;

use crate::error::BridgeError;
use crate::http::Message;
use crate::transport::pipeline::Stage;
use crate::transport::session::TransportSession;

#[derive(Debug, Default)]
pub struct LoggingStage;

fn describe(message: &Message) -> String {
    match message {
        Message::Head(head) => format!("{:?} {}", head.start, head.version),
        Message::Content(frame) => format!("{} bytes ({})", frame.data().len(), frame.variant()),
        Message::Raw(bytes) => format!("{} bytes", bytes.len()),
    }
}

impl Stage for LoggingStage {
    fn on_read(
        &self,
        transport: &Arc<TransportSession>,
        message: Message,
    ) -> Result<Vec<Message>, BridgeError> {
        tracing::trace!(transport = %transport.id(), kind = message.kind(), detail = %describe(&message), "READ");
        Ok(vec![message])
    }

    fn on_write(&self, transport: &Arc<TransportSession>, message: Message) -> Result<Message, BridgeError> {
        tracing::trace!(transport = %transport.id(), kind = message.kind(), detail = %describe(&message), "WRITE");
        Ok(message)
    }

    fn is_generic(&self) -> bool {
        true
    }
}
