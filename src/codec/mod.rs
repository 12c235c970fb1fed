//! HTTP/1.x codec stage.
//!
//! # Responsibilities
//! - Encode outbound heads and content frames into wire bytes
//! - Decode inbound bytes into heads and content frames
//! - Switch to pass-through once a protocol switch has been exchanged
//!
//! # Design Decisions
//! - Accept transports decode requests; connect transports decode responses
//! - Connect transports remember the methods they sent so a response to
//!   HEAD is framed without a body
//! - Raw messages pass through untouched in both directions

pub mod decoder;
pub mod encoder;

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::error::BridgeError;
use crate::http::Message;
use crate::transport::logging::LoggingStage;
use crate::transport::pipeline::{Pipeline, Stage, CODEC, LOGGING};
use crate::transport::session::TransportSession;

pub use decoder::{DecodeMode, Decoder};
pub use encoder::encode_head;

pub const DEFAULT_MAX_HEADER_BYTES: usize = 16 * 1024;

struct CodecState {
    decoder: Decoder,
    sent_methods: VecDeque<String>,
}

pub struct CodecStage {
    state: Mutex<CodecState>,
}

impl CodecStage {
    pub fn new(mode: DecodeMode, max_header_bytes: usize) -> Self {
        Self {
            state: Mutex::new(CodecState {
                decoder: Decoder::new(mode, max_header_bytes),
                sent_methods: VecDeque::new(),
            }),
        }
    }

    pub fn is_passthrough(&self) -> bool {
        self.state
            .lock()
            .expect("codec mutex poisoned")
            .decoder
            .is_passthrough()
    }
}

impl Stage for CodecStage {
    fn on_read(
        &self,
        _transport: &Arc<TransportSession>,
        message: Message,
    ) -> Result<Vec<Message>, BridgeError> {
        match message {
            Message::Raw(bytes) => {
                let mut state = self.state.lock().expect("codec mutex poisoned");
                let CodecState {
                    decoder,
                    sent_methods,
                } = &mut *state;
                decoder.decode(&bytes, || sent_methods.pop_front())
            }
            other => Ok(vec![other]),
        }
    }

    fn on_write(&self, _transport: &Arc<TransportSession>, message: Message) -> Result<Message, BridgeError> {
        match message {
            Message::Head(head) => {
                let bytes = encode_head(&head)?;
                let mut state = self.state.lock().expect("codec mutex poisoned");
                if let Some(method) = head.method() {
                    state.sent_methods.push_back(method.to_string());
                }
                if head.is_switching_protocols() {
                    state.decoder.switch_to_passthrough();
                }
                Ok(Message::Raw(bytes))
            }
            Message::Content(frame) => Ok(Message::Raw(frame.encoded())),
            raw => Ok(raw),
        }
    }

    // Kept when a connection is parked for reuse.
    fn is_generic(&self) -> bool {
        true
    }
}

fn pipeline(mode: DecodeMode, max_header_bytes: usize) -> Pipeline {
    let mut pipeline = Pipeline::new();
    // Names are distinct, so these cannot fail.
    let _ = pipeline.add_last(LOGGING, Arc::new(LoggingStage));
    let _ = pipeline.add_last(CODEC, Arc::new(CodecStage::new(mode, max_header_bytes)));
    pipeline
}

/// Pipeline for inbound (server-side) transports.
pub fn accept_pipeline(max_header_bytes: usize) -> Pipeline {
    pipeline(DecodeMode::Request, max_header_bytes)
}

/// Pipeline for outbound (client-side) transports.
pub fn connect_pipeline() -> Pipeline {
    pipeline(DecodeMode::Response, DEFAULT_MAX_HEADER_BYTES)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::{ContentFrame, HttpHead, Version};
    use crate::transport::io::IoHandler;
    use crate::transport::memory::MemoryIo;
    use crate::transport::session::WorkerId;
    use bytes::Bytes;

    struct Sink(Mutex<Vec<Message>>);
    impl IoHandler for Sink {
        fn message_received(&self, _t: &Arc<TransportSession>, message: Message) {
            self.0.lock().unwrap().push(message);
        }
    }

    #[test]
    fn encodes_head_and_chunks() {
        let io = MemoryIo::new();
        let sink = Arc::new(Sink(Mutex::new(Vec::new())));
        let t = TransportSession::new(io.clone(), WorkerId(0), "mem", accept_pipeline(DEFAULT_MAX_HEADER_BYTES), sink);
        let mut head = HttpHead::response(200, "OK", Version::Http11);
        head.headers.set("Transfer-Encoding", "chunked");
        t.write(Message::Head(head));
        t.write(Message::Content(Arc::new(ContentFrame::new(Bytes::from_static(b"hi"), true, false))));
        t.write(Message::Content(Arc::new(ContentFrame::terminal(true, false))));
        assert_eq!(
            io.written_string(),
            "HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n2\r\nhi\r\n0\r\n\r\n"
        );
    }

    #[test]
    fn head_request_response_is_bodyless() {
        let io = MemoryIo::new();
        let sink = Arc::new(Sink(Mutex::new(Vec::new())));
        let t = TransportSession::new(io.clone(), WorkerId(0), "mem", connect_pipeline(), sink.clone());
        t.write(Message::Head(HttpHead::request("HEAD", "/", Version::Http11)));
        t.received(Bytes::from_static(b"HTTP/1.1 200 OK\r\nContent-Length: 3\r\n\r\n"));
        let messages = sink.0.lock().unwrap();
        assert!(matches!(&messages[0], Message::Head(h) if h.complete));
    }
}
