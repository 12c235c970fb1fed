//! Raw byte relay between two upgraded transports.
//!
//! Each side of a switched connection gets a `PipeHandler` sharing one
//! `PipeLink`. Bytes read on one side are written to the other; bytes that
//! arrive before the peer side is installed are held and flushed when it
//! opens. Closing either side closes the other once its last write is out.

use std::sync::{Arc, Mutex};

use bytes::Bytes;

use crate::completion::WriteFuture;
use crate::error::BridgeError;
use crate::http::Message;
use crate::transport::io::IoHandler;
use crate::transport::session::TransportSession;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// The transport the client connected on.
    Client,
    /// The transport to the backend.
    Backend,
}

impl Side {
    fn index(self) -> usize {
        match self {
            Side::Client => 0,
            Side::Backend => 1,
        }
    }

    fn peer(self) -> Side {
        match self {
            Side::Client => Side::Backend,
            Side::Backend => Side::Client,
        }
    }
}

#[derive(Default)]
struct Endpoint {
    transport: Option<Arc<TransportSession>>,
    /// Bytes for this side, read before it opened.
    held: Vec<Bytes>,
    last_write: Option<WriteFuture>,
}

#[derive(Default)]
struct LinkState {
    ends: [Endpoint; 2],
    closed: bool,
}

/// Shared state of one relayed connection pair.
#[derive(Default)]
pub struct PipeLink {
    state: Mutex<LinkState>,
}

impl PipeLink {
    /// Handlers for both sides of a new link.
    pub fn pair() -> (Arc<PipeHandler>, Arc<PipeHandler>) {
        let link = Arc::new(PipeLink::default());
        (
            Arc::new(PipeHandler {
                link: Arc::clone(&link),
                side: Side::Client,
            }),
            Arc::new(PipeHandler { link, side: Side::Backend }),
        )
    }

    fn state(&self) -> std::sync::MutexGuard<'_, LinkState> {
        self.state.lock().expect("pipe link mutex poisoned")
    }

    /// Close both sides, e.g. after one of them failed to upgrade.
    pub fn shutdown(&self) {
        let transports: Vec<_> = {
            let mut state = self.state();
            state.closed = true;
            state.ends.iter_mut().filter_map(|end| end.transport.take()).collect()
        };
        for transport in transports {
            transport.close();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state().closed
    }

    fn forward(&self, from: &Arc<TransportSession>, to: Side, bytes: Bytes) {
        let target = {
            let mut state = self.state();
            if state.closed {
                return;
            }
            let end = &mut state.ends[to.index()];
            match &end.transport {
                Some(transport) => Arc::clone(transport),
                None => {
                    end.held.push(bytes);
                    return;
                }
            }
        };
        let write = target.write(Message::Raw(bytes));
        if !write.is_done() {
            // Hold the source until the slow side drains.
            from.suspend_read();
            let source = Arc::clone(from);
            write.on_complete(move |_| source.resume_read());
        }
        self.state().ends[to.index()].last_write = Some(write);
    }
}

/// `IoHandler` for one side of an upgraded connection pair.
pub struct PipeHandler {
    link: Arc<PipeLink>,
    side: Side,
}

impl PipeHandler {
    pub fn side(&self) -> Side {
        self.side
    }

    pub fn link(&self) -> &Arc<PipeLink> {
        &self.link
    }
}

impl IoHandler for PipeHandler {
    fn session_opened(&self, transport: &Arc<TransportSession>) -> Result<(), BridgeError> {
        let held = {
            let mut state = self.link.state();
            if state.closed {
                return Err(BridgeError::Closed);
            }
            let end = &mut state.ends[self.side.index()];
            end.transport = Some(Arc::clone(transport));
            std::mem::take(&mut end.held)
        };
        tracing::debug!(transport = %transport.id(), side = ?self.side, held = held.len(), "Pipe side opened");
        let mut last = None;
        for bytes in held {
            last = Some(transport.write(Message::Raw(bytes)));
        }
        if let Some(last) = last {
            self.link.state().ends[self.side.index()].last_write = Some(last);
        }
        Ok(())
    }

    fn message_received(&self, transport: &Arc<TransportSession>, message: Message) {
        match message {
            Message::Raw(bytes) => self.link.forward(transport, self.side.peer(), bytes),
            other => {
                tracing::debug!(transport = %transport.id(), kind = other.kind(), "Dropping framed message on pipe");
            }
        }
    }

    fn session_closed(&self, transport: &Arc<TransportSession>) {
        let (peer, last_write) = {
            let mut state = self.link.state();
            if state.closed {
                return;
            }
            state.closed = true;
            state.ends[self.side.index()].transport = None;
            let end = &mut state.ends[self.side.peer().index()];
            (end.transport.take(), end.last_write.take())
        };
        tracing::debug!(transport = %transport.id(), side = ?self.side, "Pipe side closed");
        if let Some(peer) = peer {
            match last_write {
                Some(write) => peer.close_after(&write),
                None => {
                    peer.close();
                }
            }
        }
    }

    fn exception_caught(&self, transport: &Arc<TransportSession>, error: &BridgeError) {
        tracing::debug!(transport = %transport.id(), side = ?self.side, error = %error, "Pipe error, closing");
        transport.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::MemoryIo;
    use crate::transport::pipeline::Pipeline;
    use crate::transport::session::WorkerId;

    fn open(handler: Arc<PipeHandler>) -> (Arc<MemoryIo>, Arc<TransportSession>) {
        let io = MemoryIo::new();
        let transport = TransportSession::new(io.clone(), WorkerId(0), "test", Pipeline::new(), handler);
        transport.open();
        (io, transport)
    }

    #[test]
    fn relays_both_ways() {
        let (client, backend) = PipeLink::pair();
        let (client_io, client_t) = open(client);
        let (backend_io, backend_t) = open(backend);

        client_t.received(Bytes::from_static(b"ping"));
        backend_t.received(Bytes::from_static(b"pong"));
        assert_eq!(backend_io.written_string(), "ping");
        assert_eq!(client_io.written_string(), "pong");
    }

    #[test]
    fn early_bytes_wait_for_peer() {
        let (client, backend) = PipeLink::pair();
        let (_client_io, client_t) = open(client);
        client_t.received(Bytes::from_static(b"early"));
        let (backend_io, _backend_t) = open(backend);
        assert_eq!(backend_io.written_string(), "early");
    }

    #[test]
    fn close_propagates_after_pending_write() {
        let (client, backend) = PipeLink::pair();
        let (_client_io, client_t) = open(client);
        let (backend_io, backend_t) = open(backend);
        backend_io.hold_writes();

        client_t.received(Bytes::from_static(b"last"));
        assert!(!client_t.is_closing());
        client_t.close();
        assert!(!backend_t.is_closing());
        backend_io.release_writes();
        assert!(backend_t.is_closing());
    }

    #[test]
    fn slow_peer_suspends_source() {
        let (client, backend) = PipeLink::pair();
        let (client_io, client_t) = open(client);
        let (backend_io, _backend_t) = open(backend);
        backend_io.hold_writes();
        client_t.received(Bytes::from_static(b"data"));
        assert!(client_io.is_read_suspended());
        backend_io.release_writes();
        assert!(!client_io.is_read_suspended());
    }

    #[test]
    fn shutdown_closes_both() {
        let (client, backend) = PipeLink::pair();
        let link = Arc::clone(client.link());
        let (_a, client_t) = open(client);
        let (_b, backend_t) = open(backend);
        link.shutdown();
        assert!(client_t.is_closing());
        assert!(backend_t.is_closing());
    }
}
