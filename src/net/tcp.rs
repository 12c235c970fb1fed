//! Tokio TCP transport.
//!
//! # Responsibilities
//! - Bridge a `TcpStream` to a `TransportSession`
//! - Open outbound connections for the connect side
//!
//! # Design Decisions
//! - The stream is split: a reader task feeds `TransportSession::received`,
//!   a writer task drains an mpsc queue so writes reach the socket in call
//!   order and each write's handle completes once it is on the wire
//! - Read suspension is a watch flag the reader waits on before each read
//! - Closing drops the write queue sender; the writer flushes what was
//!   queued, then shuts the socket down

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};

use crate::address::ResolvedAddress;
use crate::codec;
use crate::completion::{Completion, WriteFuture};
use crate::error::BridgeError;
use crate::transport::io::{ConnectFuture, Connector, IoHandler, TransportIo};
use crate::transport::pipeline::Pipeline;
use crate::transport::session::{TransportSession, WorkerId};

const READ_BUFFER: usize = 16 * 1024;

type WriteRequest = (Bytes, WriteFuture);

pub struct TcpIo {
    writes: Mutex<Option<mpsc::UnboundedSender<WriteRequest>>>,
    suspended: watch::Sender<bool>,
    closed: watch::Sender<bool>,
    closing: AtomicBool,
}

impl TcpIo {
    /// Wrap `stream` in a transport session and start its I/O tasks.
    ///
    /// Must be called from within a tokio runtime. The caller opens the
    /// returned transport once it is ready to receive events.
    pub fn spawn(
        stream: TcpStream,
        worker: WorkerId,
        remote: impl Into<String>,
        pipeline: Pipeline,
        handler: Arc<dyn IoHandler>,
    ) -> Arc<TransportSession> {
        let (reader, writer) = stream.into_split();
        let (write_tx, write_rx) = mpsc::unbounded_channel();
        let (suspended, suspended_rx) = watch::channel(false);
        let (closed, closed_rx) = watch::channel(false);
        let io = Arc::new(Self {
            writes: Mutex::new(Some(write_tx)),
            suspended,
            closed,
            closing: AtomicBool::new(false),
        });
        let transport = TransportSession::new(io, worker, remote, pipeline, handler);
        tokio::spawn(write_loop(writer, write_rx, Arc::downgrade(&transport)));
        tokio::spawn(read_loop(reader, suspended_rx, closed_rx, Arc::downgrade(&transport)));
        transport
    }
}

impl TransportIo for TcpIo {
    fn write(&self, bytes: Bytes) -> WriteFuture {
        let future = Completion::new();
        let sender = self.writes.lock().expect("tcp write queue mutex poisoned");
        match sender.as_ref() {
            Some(tx) if tx.send((bytes, future.clone())).is_ok() => future,
            _ => Completion::completed(Err(BridgeError::Closed)),
        }
    }

    fn close(&self) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        self.writes.lock().expect("tcp write queue mutex poisoned").take();
        let _ = self.closed.send(true);
    }

    fn suspend_read(&self) {
        let _ = self.suspended.send(true);
    }

    fn resume_read(&self) {
        let _ = self.suspended.send(false);
    }
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut queue: mpsc::UnboundedReceiver<WriteRequest>,
    transport: Weak<TransportSession>,
) {
    while let Some((bytes, done)) = queue.recv().await {
        match writer.write_all(&bytes).await {
            Ok(()) => {
                done.complete(Ok(()));
            }
            Err(e) => {
                let error = BridgeError::from(e);
                done.complete(Err(error.clone()));
                // Fail everything still queued behind the broken write.
                queue.close();
                while let Some((_, pending)) = queue.recv().await {
                    pending.complete(Err(error.clone()));
                }
                if let Some(transport) = transport.upgrade() {
                    tracing::debug!(transport = %transport.id(), error = %error, "Write failed, closing");
                    transport.close();
                }
                return;
            }
        }
    }
    let _ = writer.shutdown().await;
}

async fn read_loop(
    mut reader: OwnedReadHalf,
    mut suspended: watch::Receiver<bool>,
    mut closed: watch::Receiver<bool>,
    transport: Weak<TransportSession>,
) {
    let mut buf = BytesMut::with_capacity(READ_BUFFER);
    loop {
        if *closed.borrow() {
            return;
        }
        tokio::select! {
            resumed = until_resumed(&mut suspended) => {
                if !resumed {
                    return;
                }
            }
            _ = closed.changed() => return,
        }
        buf.reserve(READ_BUFFER);
        let read = tokio::select! {
            read = reader.read_buf(&mut buf) => read,
            _ = closed.changed() => return,
        };
        let Some(transport) = transport.upgrade() else {
            return;
        };
        match read {
            Ok(0) => {
                tracing::trace!(transport = %transport.id(), "Peer closed connection");
                transport.close();
                return;
            }
            Ok(_) => transport.received(buf.split().freeze()),
            Err(e) => {
                let error = BridgeError::from(e);
                tracing::debug!(transport = %transport.id(), error = %error, "Read failed");
                transport.fire_exception(&error);
                transport.close();
                return;
            }
        }
    }
}

/// False once the io side is gone.
async fn until_resumed(suspended: &mut watch::Receiver<bool>) -> bool {
    suspended.wait_for(|s| !*s).await.is_ok()
}

/// Opens outbound TCP connections with the connect-side pipeline.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    connect_timeout: Duration,
}

impl TcpConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Connector for TcpConnector {
    fn connect(
        &self,
        address: &ResolvedAddress,
        worker: WorkerId,
        handler: Arc<dyn IoHandler>,
    ) -> ConnectFuture {
        let key = address.authority_key();
        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                return Completion::completed(Err(BridgeError::Connect {
                    address: key,
                    reason: "no async runtime".to_string(),
                }))
            }
        };
        let future = Completion::new();
        let result = future.clone();
        let host = address.host().to_string();
        let port = address.port();
        let timeout = self.connect_timeout;
        runtime.spawn(async move {
            let connected = tokio::time::timeout(timeout, TcpStream::connect((host.as_str(), port))).await;
            let outcome = match connected {
                Ok(Ok(stream)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        tracing::debug!(address = %key, error = %e, "Failed to set TCP_NODELAY");
                    }
                    let transport = TcpIo::spawn(stream, worker, key.clone(), codec::connect_pipeline(), handler);
                    transport.open();
                    Ok(transport)
                }
                Ok(Err(e)) => Err(BridgeError::Connect {
                    address: key,
                    reason: e.to_string(),
                }),
                Err(_) => {
                    tracing::debug!(address = %key, ?timeout, "Connect timed out");
                    Err(BridgeError::GatewayTimeout)
                }
            };
            future.complete(outcome);
        });
        result
    }
}
