//! Transport session: one raw connection with its pipeline and handler.
//!
//! # Responsibilities
//! - Run outbound messages through the pipeline down to the socket
//! - Run inbound bytes through the pipeline up to the current handler
//! - Close exactly once and notify the handler and close listeners
//! - Carry the idle-timeout guard and the bridge-session attachment
//!
//! # Design Decisions
//! - The handler is read afresh for every delivered message, so a handler
//!   swapped mid-batch receives the remainder of that batch
//! - The idle guard is a tokio task aborted on cancel; no runtime, no guard

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::task::JoinHandle;

use crate::bridge::session::BridgeSession;
use crate::completion::{Completion, WriteFuture};
use crate::error::BridgeError;
use crate::http::Message;
use crate::net::connection::ConnectionId;
use crate::transport::io::{IoHandler, TransportIo};
use crate::transport::pipeline::Pipeline;

/// Identity of the worker a transport is affined to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct WorkerId(pub usize);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

/// Slot a pooled transport occupies: authority key and index.
pub(crate) type PoolSlot = (String, usize);

pub struct TransportSession {
    id: ConnectionId,
    worker: WorkerId,
    remote: String,
    io: Arc<dyn TransportIo>,
    pipeline: Mutex<Pipeline>,
    handler: Mutex<Arc<dyn IoHandler>>,
    closing: AtomicBool,
    close_future: Completion<()>,
    idle_guard: Mutex<Option<JoinHandle<()>>>,
    bridge: Mutex<Option<Arc<BridgeSession>>>,
    pool_slot: Mutex<Option<PoolSlot>>,
    pool_listener_armed: AtomicBool,
}

impl TransportSession {
    pub fn new(
        io: Arc<dyn TransportIo>,
        worker: WorkerId,
        remote: impl Into<String>,
        pipeline: Pipeline,
        handler: Arc<dyn IoHandler>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: ConnectionId::new(),
            worker,
            remote: remote.into(),
            io,
            pipeline: Mutex::new(pipeline),
            handler: Mutex::new(handler),
            closing: AtomicBool::new(false),
            close_future: Completion::new(),
            idle_guard: Mutex::new(None),
            bridge: Mutex::new(None),
            pool_slot: Mutex::new(None),
            pool_listener_armed: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn worker(&self) -> WorkerId {
        self.worker
    }

    pub fn remote(&self) -> &str {
        &self.remote
    }

    /// Hand the transport to its handler. A failing handler closes it.
    pub fn open(self: &Arc<Self>) {
        if let Err(e) = self.handler().session_opened(self) {
            tracing::warn!(transport = %self.id, error = %e, "Handler rejected transport");
            self.close();
        }
    }

    pub fn handler(&self) -> Arc<dyn IoHandler> {
        self.handler.lock().expect("transport handler mutex poisoned").clone()
    }

    /// Install a new handler, returning the previous one.
    pub fn set_handler(&self, handler: Arc<dyn IoHandler>) -> Result<Arc<dyn IoHandler>, BridgeError> {
        if self.is_closing() {
            return Err(BridgeError::Closed);
        }
        let mut current = self.handler.lock().expect("transport handler mutex poisoned");
        Ok(std::mem::replace(&mut *current, handler))
    }

    /// Mutate the pipeline. Only the owning worker should call this.
    pub fn with_pipeline<R>(&self, f: impl FnOnce(&mut Pipeline) -> R) -> R {
        let mut pipeline = self.pipeline.lock().expect("pipeline mutex poisoned");
        f(&mut pipeline)
    }

    pub fn pipeline_names(&self) -> Vec<String> {
        self.with_pipeline(|p| p.names())
    }

    /// Send a message through the write stages (tail → head) to the socket.
    pub fn write(self: &Arc<Self>, message: Message) -> WriteFuture {
        if self.is_closing() {
            return Completion::completed(Err(BridgeError::Closed));
        }
        let stages = self.with_pipeline(|p| p.snapshot());
        let mut message = message;
        for stage in stages.iter().rev() {
            message = match stage.on_write(self, message) {
                Ok(m) => m,
                Err(e) => return Completion::completed(Err(e)),
            };
        }
        match message {
            Message::Raw(bytes) => self.io.write(bytes),
            _ => Completion::completed(Err(BridgeError::Unencoded)),
        }
    }

    /// Inbound bytes from the socket.
    pub fn received(self: &Arc<Self>, bytes: Bytes) {
        if self.is_closing() {
            return;
        }
        let stages = self.with_pipeline(|p| p.snapshot());
        let mut messages = vec![Message::Raw(bytes)];
        for stage in &stages {
            let mut next = Vec::with_capacity(messages.len());
            for message in messages {
                match stage.on_read(self, message) {
                    Ok(out) => next.extend(out),
                    Err(e) => {
                        self.fire_exception(&e);
                        return;
                    }
                }
            }
            messages = next;
        }
        for message in messages {
            if self.is_closing() {
                break;
            }
            self.handler().message_received(self, message);
        }
    }

    pub fn fire_exception(self: &Arc<Self>, error: &BridgeError) {
        self.handler().exception_caught(self, error);
    }

    pub fn suspend_read(&self) {
        self.io.suspend_read();
    }

    pub fn resume_read(&self) {
        self.io.resume_read();
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    pub fn close_future(&self) -> Completion<()> {
        self.close_future.clone()
    }

    /// Close the socket once. Later calls return the same handle.
    pub fn close(self: &Arc<Self>) -> Completion<()> {
        if self.closing.swap(true, Ordering::SeqCst) {
            return self.close_future.clone();
        }
        self.cancel_idle_timeout();
        self.io.close();
        tracing::debug!(transport = %self.id, remote = %self.remote, "Transport closed");
        self.handler().session_closed(self);
        self.close_future.complete(());
        self.close_future.clone()
    }

    /// Close after `write` completes, whatever its outcome.
    pub fn close_after(self: &Arc<Self>, write: &WriteFuture) {
        let transport = Arc::clone(self);
        write.on_complete(move |_| {
            transport.close();
        });
    }

    /// Close the transport if it is still idle after `timeout`.
    pub fn arm_idle_timeout(self: &Arc<Self>, timeout: Duration) {
        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                tracing::debug!(transport = %self.id, "No runtime, idle timeout not armed");
                return;
            }
        };
        let weak = Arc::downgrade(self);
        let task = runtime.spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(transport) = weak.upgrade() {
                tracing::debug!(transport = %transport.id, ?timeout, "Idle timeout, closing transport");
                // Clear our own handle first so close() does not abort this task.
                transport.idle_guard.lock().expect("idle guard mutex poisoned").take();
                transport.close();
            }
        });
        let previous = self
            .idle_guard
            .lock()
            .expect("idle guard mutex poisoned")
            .replace(task);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    pub fn cancel_idle_timeout(&self) {
        if let Some(task) = self.idle_guard.lock().expect("idle guard mutex poisoned").take() {
            task.abort();
        }
    }

    pub fn has_idle_timeout(&self) -> bool {
        self.idle_guard
            .lock()
            .expect("idle guard mutex poisoned")
            .is_some()
    }

    pub(crate) fn attach_bridge(&self, session: Arc<BridgeSession>) {
        *self.bridge.lock().expect("bridge attachment mutex poisoned") = Some(session);
    }

    pub(crate) fn bridge(&self) -> Option<Arc<BridgeSession>> {
        self.bridge.lock().expect("bridge attachment mutex poisoned").clone()
    }

    /// Detach `session` if it is the one attached.
    pub(crate) fn detach_bridge(&self, session: &BridgeSession) {
        let mut slot = self.bridge.lock().expect("bridge attachment mutex poisoned");
        if slot.as_ref().is_some_and(|s| std::ptr::eq(s.as_ref(), session)) {
            *slot = None;
        }
    }

    pub(crate) fn set_pool_slot(&self, slot: Option<PoolSlot>) {
        *self.pool_slot.lock().expect("pool slot mutex poisoned") = slot;
    }

    pub(crate) fn pool_slot(&self) -> Option<PoolSlot> {
        self.pool_slot.lock().expect("pool slot mutex poisoned").clone()
    }

    /// True the first time it is called for this transport.
    pub(crate) fn arm_pool_listener(&self) -> bool {
        !self.pool_listener_armed.swap(true, Ordering::SeqCst)
    }
}

impl fmt::Debug for TransportSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportSession")
            .field("id", &self.id)
            .field("worker", &self.worker)
            .field("remote", &self.remote)
            .field("closing", &self.is_closing())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::MemoryIo;
    use crate::transport::pipeline::Stage;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct Recorder {
        messages: Mutex<Vec<String>>,
        closed: AtomicUsize,
    }

    impl IoHandler for Recorder {
        fn message_received(&self, _t: &Arc<TransportSession>, message: Message) {
            if let Message::Raw(bytes) = message {
                self.messages
                    .lock()
                    .unwrap()
                    .push(String::from_utf8_lossy(&bytes).into_owned());
            }
        }

        fn session_closed(&self, _t: &Arc<TransportSession>) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Upper;
    impl Stage for Upper {
        fn on_write(&self, _t: &Arc<TransportSession>, message: Message) -> Result<Message, BridgeError> {
            match message {
                Message::Raw(b) => Ok(Message::Raw(Bytes::from(
                    String::from_utf8_lossy(&b).to_uppercase(),
                ))),
                other => Ok(other),
            }
        }
    }

    fn transport(handler: Arc<dyn IoHandler>, pipeline: Pipeline) -> (Arc<MemoryIo>, Arc<TransportSession>) {
        let io = MemoryIo::new();
        let t = TransportSession::new(io.clone(), WorkerId(0), "mem", pipeline, handler);
        (io, t)
    }

    #[test]
    fn write_runs_stages() {
        let mut pipeline = Pipeline::new();
        pipeline.add_last("upper", Arc::new(Upper)).unwrap();
        let (io, t) = transport(Arc::new(Recorder::default()), pipeline);
        assert!(t.write(Message::Raw(Bytes::from_static(b"abc"))).value().unwrap().is_ok());
        assert_eq!(io.written_string(), "ABC");
    }

    #[test]
    fn close_happens_once() {
        let recorder = Arc::new(Recorder::default());
        let (io, t) = transport(recorder.clone(), Pipeline::new());
        let first = t.close();
        let second = t.close();
        assert!(first.ptr_eq(&second));
        assert!(io.is_closed());
        assert_eq!(recorder.closed.load(Ordering::SeqCst), 1);
        let late = t.write(Message::Raw(Bytes::from_static(b"x")));
        assert!(matches!(late.value(), Some(Err(BridgeError::Closed))));
    }

    #[test]
    fn received_reaches_handler() {
        let recorder = Arc::new(Recorder::default());
        let (_io, t) = transport(recorder.clone(), Pipeline::new());
        t.received(Bytes::from_static(b"ping"));
        assert_eq!(*recorder.messages.lock().unwrap(), vec!["ping".to_string()]);
    }

    #[tokio::test]
    async fn idle_timeout_closes() {
        let (io, t) = transport(Arc::new(Recorder::default()), Pipeline::new());
        t.arm_idle_timeout(Duration::from_millis(20));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(t.is_closing());
        assert!(io.is_closed());
    }

    #[tokio::test]
    async fn cancelled_idle_timeout_keeps_transport() {
        let (_io, t) = transport(Arc::new(Recorder::default()), Pipeline::new());
        t.arm_idle_timeout(Duration::from_millis(20));
        t.cancel_idle_timeout();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(!t.is_closing());
    }
}
