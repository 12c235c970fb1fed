//! Bridge session: the state of one HTTP exchange over a transport.
//!
//! # Responsibilities
//! - Hold request/response state for both sides of the exchange
//! - Gate header mutation on commit and run the commit exactly once
//! - Queue body writes until the head is out, then flush in order
//! - Buffer inbound content while reads are suspended
//! - Record a pending protocol upgrade
//!
//! # Design Decisions
//! - One-time transitions (`committing`, `connection_close`, `write_shutdown`,
//!   `closing`) are atomic swaps, not locks
//! - The framing decision (`Encoding`) lives in a `OnceLock`: it is made once,
//!   by the processor, at commit time
//! - Side-specific behaviour is delegated to a `Processor`; the session only
//!   sequences it

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use bytes::Bytes;

use crate::address::ResolvedAddress;
use crate::bridge::handler::BridgeHandler;
use crate::completion::{Completion, WriteFuture};
use crate::error::{BridgeError, Outcome};
use crate::http::head::{reason_phrase, SWITCHING_PROTOCOLS};
use crate::http::headers::{self, Headers};
use crate::http::{Cookie, HttpHead, Message, SharedBuffer, Version};
use crate::transport::io::IoHandler;
use crate::transport::session::{TransportSession, WorkerId};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Server side: reads a request, writes a response.
    Accept,
    /// Client side: writes a request, reads a response.
    Connect,
}

/// Body framing chosen at commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Encoding {
    pub chunked: bool,
    pub gzipped: bool,
}

/// Side-specific commit, flush and removal logic.
pub(crate) trait Processor: Send + Sync {
    /// Build and send the head. Called once, on the first `commit()`.
    fn commit(&self, session: &Arc<BridgeSession>);

    /// A body write was queued before the head went out.
    fn buffered(&self, session: &Arc<BridgeSession>, total: u64);

    fn shutdown_write(&self, session: &Arc<BridgeSession>);

    /// Queued end-of-body marker reached the front of the write queue.
    fn end_of_body(&self, _session: &Arc<BridgeSession>) {}

    /// Inbound body finished.
    fn input_complete(&self, _session: &Arc<BridgeSession>) {}

    /// `close()` was called.
    fn remove(&self, session: &Arc<BridgeSession>);

    /// Every write has been issued; release the transport.
    fn finish(&self, session: &Arc<BridgeSession>);
}

enum UpgradeState {
    None,
    Pending(Arc<dyn IoHandler>),
    Upgraded,
}

struct Exchange {
    method: String,
    target: String,
    version: Version,
    status: u16,
    reason: String,
    /// Version of the inbound response (connect side).
    peer_version: Option<Version>,
    read_headers: Headers,
    write_headers: Headers,
    read_cookies: Vec<Cookie>,
    write_cookies: Vec<Cookie>,
}

struct DeferredReads {
    queue: VecDeque<Message>,
    /// Raw bytes after a protocol switch, held for the upgraded handler.
    raw: Vec<Bytes>,
    suspended: bool,
    draining: bool,
}

enum PendingWrite {
    Data(Arc<SharedBuffer>, WriteFuture),
    End,
}

struct WriteQueue {
    pending: VecDeque<PendingWrite>,
    buffered: u64,
    draining: bool,
    finish_requested: bool,
    last_write: Option<WriteFuture>,
}

pub struct BridgeSession {
    id: u64,
    direction: Direction,
    worker: WorkerId,
    address: ResolvedAddress,
    handler: Arc<dyn BridgeHandler>,
    processor: Arc<dyn Processor>,
    transport: OnceLock<Arc<TransportSession>>,
    exchange: Mutex<Exchange>,
    encoding: OnceLock<Encoding>,
    compress: AtomicBool,
    committing: AtomicBool,
    connection_close: AtomicBool,
    write_shutdown: AtomicBool,
    closing: AtomicBool,
    input_received: AtomicBool,
    input_complete: AtomicBool,
    output_complete: AtomicBool,
    response_received: AtomicBool,
    commit_future: Completion<Outcome>,
    response_future: Completion<Outcome>,
    upgrade: Mutex<UpgradeState>,
    upgrade_future: Completion<Outcome>,
    close_future: Completion<()>,
    deferred: Mutex<DeferredReads>,
    deferred_capacity: usize,
    writes: Mutex<WriteQueue>,
    redirects_allowed: u32,
}

impl BridgeSession {
    fn build(
        direction: Direction,
        worker: WorkerId,
        address: ResolvedAddress,
        exchange: Exchange,
        handler: Arc<dyn BridgeHandler>,
        processor: Arc<dyn Processor>,
        deferred_capacity: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            direction,
            worker,
            address,
            handler,
            processor,
            transport: OnceLock::new(),
            exchange: Mutex::new(exchange),
            encoding: OnceLock::new(),
            compress: AtomicBool::new(false),
            committing: AtomicBool::new(false),
            connection_close: AtomicBool::new(false),
            write_shutdown: AtomicBool::new(false),
            closing: AtomicBool::new(false),
            input_received: AtomicBool::new(false),
            input_complete: AtomicBool::new(false),
            output_complete: AtomicBool::new(false),
            response_received: AtomicBool::new(false),
            commit_future: Completion::new(),
            response_future: Completion::new(),
            upgrade: Mutex::new(UpgradeState::None),
            upgrade_future: Completion::new(),
            close_future: Completion::new(),
            deferred: Mutex::new(DeferredReads {
                queue: VecDeque::new(),
                raw: Vec::new(),
                suspended: false,
                draining: false,
            }),
            deferred_capacity,
            writes: Mutex::new(WriteQueue {
                pending: VecDeque::new(),
                buffered: 0,
                draining: false,
                finish_requested: false,
                last_write: None,
            }),
            // Redirect following is not implemented; the count stays zero.
            redirects_allowed: 0,
        })
    }

    /// Session for a request that arrived on `transport`.
    pub(crate) fn accept(
        transport: &Arc<TransportSession>,
        address: ResolvedAddress,
        request: HttpHead,
        handler: Arc<dyn BridgeHandler>,
        processor: Arc<dyn Processor>,
        deferred_capacity: usize,
    ) -> Arc<Self> {
        let mut write_headers = Headers::new();
        if request.version == Version::Http10 || request.headers.has_token(headers::CONNECTION, "close") {
            write_headers.set(headers::CONNECTION, "close");
        }
        let method = request.method().unwrap_or("GET").to_string();
        let target = request.target().unwrap_or("/").to_string();
        // Cookies travel separately from the header list.
        let mut read_headers = request.headers;
        read_headers.remove(headers::COOKIE);
        let exchange = Exchange {
            method,
            target,
            version: request.version,
            status: 200,
            reason: reason_phrase(200).to_string(),
            peer_version: Some(request.version),
            read_headers,
            write_headers,
            read_cookies: request.cookies,
            write_cookies: Vec::new(),
        };
        let session = Self::build(
            Direction::Accept,
            transport.worker(),
            address,
            exchange,
            handler,
            processor,
            deferred_capacity,
        );
        let _ = session.transport.set(Arc::clone(transport));
        // Nothing to wait for on the accept side.
        session.response_future.complete(Ok(()));
        session
    }

    /// Session originating a request to `address`; not yet connected.
    pub(crate) fn connect(
        address: ResolvedAddress,
        worker: WorkerId,
        handler: Arc<dyn BridgeHandler>,
        processor: Arc<dyn Processor>,
        deferred_capacity: usize,
    ) -> Arc<Self> {
        let target = match address.location().query() {
            Some(query) => format!("{}?{}", address.path(), query),
            None => address.path().to_string(),
        };
        let exchange = Exchange {
            method: "GET".to_string(),
            target,
            version: Version::Http11,
            status: 0,
            reason: String::new(),
            peer_version: None,
            read_headers: Headers::new(),
            write_headers: Headers::new(),
            read_cookies: Vec::new(),
            write_cookies: Vec::new(),
        };
        Self::build(
            Direction::Connect,
            worker,
            address,
            exchange,
            handler,
            processor,
            deferred_capacity,
        )
    }

    fn exchange(&self) -> std::sync::MutexGuard<'_, Exchange> {
        self.exchange.lock().expect("bridge exchange mutex poisoned")
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn worker(&self) -> WorkerId {
        self.worker
    }

    pub fn address(&self) -> &ResolvedAddress {
        &self.address
    }

    pub fn transport(&self) -> Option<Arc<TransportSession>> {
        self.transport.get().cloned()
    }

    pub fn handler(&self) -> Arc<dyn BridgeHandler> {
        Arc::clone(&self.handler)
    }

    pub fn version(&self) -> Version {
        self.exchange().version
    }

    pub fn method(&self) -> String {
        self.exchange().method.clone()
    }

    /// Request target: path plus query.
    pub fn target(&self) -> String {
        self.exchange().target.clone()
    }

    /// Request path without the query.
    pub fn path(&self) -> String {
        let target = self.target();
        match target.split_once('?') {
            Some((path, _)) => path.to_string(),
            None => target,
        }
    }

    pub fn status(&self) -> u16 {
        self.exchange().status
    }

    pub fn reason(&self) -> String {
        self.exchange().reason.clone()
    }

    /// Version the peer spoke on its last inbound head.
    pub fn peer_version(&self) -> Option<Version> {
        self.exchange().peer_version
    }

    pub fn read_header(&self, name: &str) -> Option<String> {
        self.exchange().read_headers.first(name).map(str::to_string)
    }

    pub fn read_headers(&self) -> Headers {
        self.exchange().read_headers.clone()
    }

    pub fn write_header(&self, name: &str) -> Option<String> {
        self.exchange().write_headers.first(name).map(str::to_string)
    }

    pub fn write_headers(&self) -> Headers {
        self.exchange().write_headers.clone()
    }

    pub fn read_cookies(&self) -> Vec<Cookie> {
        self.exchange().read_cookies.clone()
    }

    pub fn write_cookies(&self) -> Vec<Cookie> {
        self.exchange().write_cookies.clone()
    }

    pub fn redirects_allowed(&self) -> u32 {
        self.redirects_allowed
    }

    fn ensure_mutable(&self, what: &str) -> Result<(), BridgeError> {
        if self.committing.load(Ordering::SeqCst) {
            return Err(BridgeError::illegal_state(
                self.id,
                format!("cannot modify {} after commit", what),
            ));
        }
        Ok(())
    }

    fn ensure_direction(&self, direction: Direction, what: &str) -> Result<(), BridgeError> {
        if self.direction != direction {
            return Err(BridgeError::illegal_state(
                self.id,
                format!("{} is read-only on {:?} sessions", what, self.direction),
            ));
        }
        Ok(())
    }

    pub fn set_method(&self, method: &str) -> Result<(), BridgeError> {
        self.ensure_direction(Direction::Connect, "method")?;
        self.ensure_mutable("method")?;
        self.exchange().method = method.to_ascii_uppercase();
        Ok(())
    }

    pub fn set_target(&self, target: &str) -> Result<(), BridgeError> {
        self.ensure_direction(Direction::Connect, "target")?;
        self.ensure_mutable("target")?;
        self.exchange().target = target.to_string();
        Ok(())
    }

    pub fn set_version(&self, version: Version) -> Result<(), BridgeError> {
        self.ensure_direction(Direction::Connect, "version")?;
        self.ensure_mutable("version")?;
        self.exchange().version = version;
        Ok(())
    }

    pub fn set_status(&self, status: u16, reason: &str) -> Result<(), BridgeError> {
        self.ensure_direction(Direction::Accept, "status")?;
        self.ensure_mutable("status")?;
        let mut exchange = self.exchange();
        exchange.status = status;
        exchange.reason = reason.to_string();
        Ok(())
    }

    pub fn set_write_header(&self, name: &str, value: &str) -> Result<(), BridgeError> {
        self.ensure_mutable(&format!("header {}", name))?;
        self.exchange().write_headers.set(name, value);
        Ok(())
    }

    pub fn add_write_header(&self, name: &str, value: &str) -> Result<(), BridgeError> {
        self.ensure_mutable(&format!("header {}", name))?;
        self.exchange().write_headers.add(name, value);
        Ok(())
    }

    pub fn remove_write_header(&self, name: &str) -> Result<(), BridgeError> {
        self.ensure_mutable(&format!("header {}", name))?;
        self.exchange().write_headers.remove(name);
        Ok(())
    }

    pub fn add_write_cookie(&self, cookie: Cookie) -> Result<(), BridgeError> {
        self.ensure_mutable(&format!("cookie {}", cookie.name))?;
        self.exchange().write_cookies.push(cookie);
        Ok(())
    }

    /// Ask for the body to be gzipped on the wire. A body whose
    /// `Content-Encoding` is already set is sent as written.
    pub fn set_gzipped(&self, gzipped: bool) -> Result<(), BridgeError> {
        self.ensure_mutable("content encoding")?;
        self.compress.store(gzipped, Ordering::SeqCst);
        Ok(())
    }

    /// Settle compression for a head being committed; true when body
    /// frames must be gzipped.
    pub(crate) fn apply_compression(&self, head: &mut HttpHead, bodyless: bool) -> bool {
        if bodyless || !self.compress.load(Ordering::SeqCst) || head.headers.contains(headers::CONTENT_ENCODING) {
            return false;
        }
        head.headers.set(headers::CONTENT_ENCODING, "gzip");
        // The declared length would be the uncompressed one.
        head.headers.remove(headers::CONTENT_LENGTH);
        true
    }

    /// Framing chosen at commit, if commit has happened.
    pub fn encoding(&self) -> Option<Encoding> {
        self.encoding.get().copied()
    }

    pub fn is_chunked(&self) -> bool {
        self.encoding().is_some_and(|e| e.chunked)
    }

    pub fn is_gzipped(&self) -> bool {
        self.encoding().is_some_and(|e| e.gzipped)
    }

    pub fn is_connection_close(&self) -> bool {
        self.connection_close.load(Ordering::SeqCst)
    }

    pub fn is_write_shutdown(&self) -> bool {
        self.write_shutdown.load(Ordering::SeqCst)
    }

    pub fn is_committing(&self) -> bool {
        self.committing.load(Ordering::SeqCst)
    }

    /// The head has been written successfully.
    pub fn is_committed(&self) -> bool {
        matches!(self.commit_future.value(), Some(Ok(())))
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    /// The inbound body has been fully received.
    pub fn is_input_complete(&self) -> bool {
        self.input_received.load(Ordering::SeqCst)
    }

    /// The outbound body has been terminated on the wire.
    pub fn is_output_complete(&self) -> bool {
        self.output_complete.load(Ordering::SeqCst)
    }

    /// The response head has arrived (connect side).
    pub fn is_response_received(&self) -> bool {
        self.response_received.load(Ordering::SeqCst)
    }

    pub fn is_switching_protocols(&self) -> bool {
        self.status() == SWITCHING_PROTOCOLS
    }

    /// Send the head. Repeated calls return the same handle.
    pub fn commit(self: &Arc<Self>) -> Completion<Outcome> {
        if !self.committing.swap(true, Ordering::SeqCst) {
            tracing::trace!(session = self.id, direction = ?self.direction, "Commit requested");
            self.processor.commit(self);
        }
        self.commit_future.clone()
    }

    pub fn commit_future(&self) -> Completion<Outcome> {
        self.commit_future.clone()
    }

    /// Satisfied when the response head arrives, or with the error that
    /// ended the exchange first.
    pub fn response_future(&self) -> Completion<Outcome> {
        self.response_future.clone()
    }

    pub fn close_future(&self) -> Completion<()> {
        self.close_future.clone()
    }

    pub fn upgrade_future(&self) -> Completion<Outcome> {
        self.upgrade_future.clone()
    }

    /// Queue a body write. Writes reach the transport in call order and never
    /// ahead of the head.
    pub fn write(self: &Arc<Self>, buffer: Arc<SharedBuffer>) -> WriteFuture {
        if self.is_write_shutdown() {
            return Completion::completed(Err(BridgeError::illegal_state(
                self.id,
                "write after shutdown",
            )));
        }
        if let Some(Err(e)) = self.commit_future.value() {
            return Completion::completed(Err(e));
        }
        if buffer.is_empty() {
            return Completion::completed(Ok(()));
        }
        let queued = {
            let mut writes = self.writes.lock().expect("bridge write queue mutex poisoned");
            if self.commit_future.is_done() && !writes.draining && writes.pending.is_empty() {
                None
            } else {
                let result = Completion::new();
                writes.buffered += buffer.len() as u64;
                writes
                    .pending
                    .push_back(PendingWrite::Data(Arc::clone(&buffer), result.clone()));
                Some((result, writes.buffered))
            }
        };
        match queued {
            Some((result, total)) => {
                self.processor.buffered(self, total);
                result
            }
            None => self.write_frame(&buffer),
        }
    }

    pub fn write_bytes(self: &Arc<Self>, data: Bytes) -> WriteFuture {
        self.write(SharedBuffer::new(data))
    }

    /// No further body writes will be made.
    pub fn shutdown_write(self: &Arc<Self>) {
        if self.write_shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        self.processor.shutdown_write(self);
    }

    /// Finish the exchange. Later calls return the same handle.
    pub fn close(self: &Arc<Self>) -> Completion<()> {
        if self.closing.swap(true, Ordering::SeqCst) {
            return self.close_future.clone();
        }
        self.write_shutdown.store(true, Ordering::SeqCst);
        {
            let mut deferred = self.deferred.lock().expect("bridge deferred mutex poisoned");
            if !deferred.queue.is_empty() {
                tracing::debug!(session = self.id, dropped = deferred.queue.len(), "Dropping deferred reads on close");
            }
            deferred.queue.clear();
        }
        self.processor.remove(self);
        self.close_future.clone()
    }

    /// Abandon the exchange after a processing failure. Before commit the
    /// peer gets an error status; after commit the transport is dropped.
    pub fn abort(self: &Arc<Self>, error: BridgeError) {
        tracing::warn!(session = self.id, error = %error, "Aborting bridge session");
        if self.direction == Direction::Accept && !self.is_committing() && !self.is_closing() {
            self.fail_pending(&error);
            {
                let status = error.response_status();
                let mut exchange = self.exchange();
                exchange.status = status;
                exchange.reason = reason_phrase(status).to_string();
                exchange.write_headers.remove(headers::CONTENT_LENGTH);
                exchange.write_headers.remove(headers::TRANSFER_ENCODING);
                exchange.write_headers.set(headers::CONNECTION, "close");
            }
            self.close();
        } else {
            let transport = self.transport();
            self.reset(error);
            if let Some(transport) = transport {
                transport.close();
            }
        }
    }

    /// Replace the transport's handler once this exchange has switched
    /// protocols and closed.
    pub fn upgrade(&self, handler: Arc<dyn IoHandler>) -> Result<Completion<Outcome>, BridgeError> {
        let mut state = self.upgrade.lock().expect("bridge upgrade mutex poisoned");
        match *state {
            UpgradeState::None => {
                *state = UpgradeState::Pending(handler);
                Ok(self.upgrade_future.clone())
            }
            _ => Err(BridgeError::illegal_state(self.id, "upgrade already requested")),
        }
    }

    pub fn is_upgrade_pending(&self) -> bool {
        matches!(
            *self.upgrade.lock().expect("bridge upgrade mutex poisoned"),
            UpgradeState::Pending(_)
        )
    }

    pub fn is_upgraded(&self) -> bool {
        matches!(
            *self.upgrade.lock().expect("bridge upgrade mutex poisoned"),
            UpgradeState::Upgraded
        )
    }

    /// Hold inbound content until `resume_read`.
    pub fn suspend_read(&self) {
        let mut deferred = self.deferred.lock().expect("bridge deferred mutex poisoned");
        if deferred.suspended {
            return;
        }
        deferred.suspended = true;
        drop(deferred);
        if let Some(transport) = self.transport() {
            transport.suspend_read();
        }
    }

    /// Deliver deferred content in arrival order, then resume the transport.
    pub fn resume_read(self: &Arc<Self>) {
        {
            let mut deferred = self.deferred.lock().expect("bridge deferred mutex poisoned");
            if !deferred.suspended {
                return;
            }
            deferred.suspended = false;
            if deferred.draining {
                return;
            }
            deferred.draining = true;
        }
        self.drain_deferred();
        if let Some(transport) = self.transport() {
            transport.resume_read();
        }
    }

    pub fn is_read_suspended(&self) -> bool {
        self.deferred
            .lock()
            .expect("bridge deferred mutex poisoned")
            .suspended
    }

    fn drain_deferred(self: &Arc<Self>) {
        loop {
            let next = {
                let mut deferred = self.deferred.lock().expect("bridge deferred mutex poisoned");
                if deferred.suspended {
                    deferred.draining = false;
                    return;
                }
                match deferred.queue.pop_front() {
                    Some(message) => message,
                    None => {
                        deferred.draining = false;
                        return;
                    }
                }
            };
            self.dispatch(next);
        }
    }

    /// Inbound message from the transport for this exchange.
    pub(crate) fn on_inbound(self: &Arc<Self>, message: Message) {
        let deliver = {
            let mut deferred = self.deferred.lock().expect("bridge deferred mutex poisoned");
            if let Message::Raw(bytes) = message {
                deferred.raw.push(bytes);
                return;
            }
            if deferred.suspended || deferred.draining || !deferred.queue.is_empty() {
                if deferred.queue.len() >= self.deferred_capacity {
                    Err(BridgeError::DeferredOverflow {
                        session: self.id,
                        capacity: self.deferred_capacity,
                    })
                } else {
                    deferred.queue.push_back(message);
                    Ok(None)
                }
            } else {
                Ok(Some(message))
            }
        };
        match deliver {
            Ok(Some(message)) => self.dispatch(message),
            Ok(None) => {}
            Err(error) => {
                let transport = self.transport();
                self.reset(error);
                if let Some(transport) = transport {
                    transport.close();
                }
            }
        }
    }

    fn dispatch(self: &Arc<Self>, message: Message) {
        match message {
            Message::Content(frame) if frame.is_terminal() => {
                self.mark_input_complete();
            }
            Message::Content(frame) => {
                self.handler.message_received(self, frame.data().clone());
            }
            Message::Head(head) => {
                tracing::debug!(session = self.id, start = ?head.start, "Ignoring unexpected head");
            }
            Message::Raw(_) => {}
        }
    }

    /// Record that the inbound body has arrived, without notifying.
    pub(crate) fn mark_input_received(&self) {
        self.input_received.store(true, Ordering::SeqCst);
    }

    /// Signal the end of the inbound body, once.
    pub(crate) fn mark_input_complete(self: &Arc<Self>) {
        self.input_received.store(true, Ordering::SeqCst);
        if self.input_complete.swap(true, Ordering::SeqCst) {
            return;
        }
        self.handler.input_complete(self);
        self.processor.input_complete(self);
    }

    pub(crate) fn attach_transport(self: &Arc<Self>, transport: &Arc<TransportSession>) -> bool {
        if self.transport.set(Arc::clone(transport)).is_err() {
            return false;
        }
        transport.attach_bridge(Arc::clone(self));
        true
    }

    /// Record the framing decision. Only the first call has any effect.
    pub(crate) fn set_encoding(&self, encoding: Encoding) -> Encoding {
        *self.encoding.get_or_init(|| encoding)
    }

    /// Current write state rendered as a head.
    pub(crate) fn head_image(&self) -> HttpHead {
        let exchange = self.exchange();
        let mut head = match self.direction {
            Direction::Accept => {
                HttpHead::response(exchange.status, exchange.reason.clone(), exchange.version)
            }
            Direction::Connect => {
                HttpHead::request(exchange.method.clone(), exchange.target.clone(), exchange.version)
            }
        };
        head.headers = exchange.write_headers.clone();
        head.cookies = exchange.write_cookies.clone();
        head
    }

    /// Store the headers as actually committed.
    pub(crate) fn set_committed_headers(&self, headers: Headers) {
        self.exchange().write_headers = headers;
    }

    pub(crate) fn mark_connection_close(&self) {
        self.connection_close.store(true, Ordering::SeqCst);
    }

    /// True the first time the outbound body is marked terminated.
    pub(crate) fn mark_output_complete(&self) -> bool {
        !self.output_complete.swap(true, Ordering::SeqCst)
    }

    pub(crate) fn mark_write_shutdown(&self) {
        self.write_shutdown.store(true, Ordering::SeqCst);
    }

    pub(crate) fn set_read_status(&self, status: u16, reason: &str) {
        let mut exchange = self.exchange();
        exchange.status = status;
        exchange.reason = reason.to_string();
    }

    /// Record the inbound response head (connect side).
    pub(crate) fn set_response(&self, head: &HttpHead) {
        let mut exchange = self.exchange();
        if let Some(status) = head.status() {
            exchange.status = status;
        }
        if let crate::http::StartLine::Response { reason, .. } = &head.start {
            exchange.reason = reason.clone();
        }
        exchange.peer_version = Some(head.version);
        exchange.read_headers = head.headers.clone();
        exchange.read_headers.remove(headers::SET_COOKIE);
        exchange.read_cookies = head.cookies.clone();
        drop(exchange);
        self.response_received.store(true, Ordering::SeqCst);
    }

    pub(crate) fn complete_commit(&self, outcome: Outcome) -> bool {
        self.commit_future.complete(outcome)
    }

    pub(crate) fn complete_response(&self, outcome: Outcome) -> bool {
        self.response_future.complete(outcome)
    }

    /// Body bytes queued and not yet flushed.
    pub(crate) fn buffered_bytes(&self) -> u64 {
        self.writes
            .lock()
            .expect("bridge write queue mutex poisoned")
            .buffered
    }

    pub(crate) fn last_write(&self) -> Option<WriteFuture> {
        self.writes
            .lock()
            .expect("bridge write queue mutex poisoned")
            .last_write
            .clone()
    }

    /// Write one buffer with the committed framing.
    pub(crate) fn write_frame(&self, buffer: &Arc<SharedBuffer>) -> WriteFuture {
        let Some(transport) = self.transport() else {
            return Completion::completed(Err(BridgeError::Closed));
        };
        let encoding = self.encoding().unwrap_or_default();
        let future = if self.is_closing() && !encoding.chunked && !encoding.gzipped {
            transport.write(Message::Raw(buffer.data().clone()))
        } else {
            transport.write(Message::Content(buffer.frame(encoding.chunked, encoding.gzipped)))
        };
        self.record_write(&future);
        future
    }

    pub(crate) fn record_write(&self, future: &WriteFuture) {
        self.writes
            .lock()
            .expect("bridge write queue mutex poisoned")
            .last_write = Some(future.clone());
    }

    /// Flush everything queued behind the head, in order.
    pub(crate) fn drain_writes(self: &Arc<Self>) {
        {
            let mut writes = self.writes.lock().expect("bridge write queue mutex poisoned");
            if writes.draining {
                return;
            }
            writes.draining = true;
        }
        loop {
            let next = {
                let mut writes = self.writes.lock().expect("bridge write queue mutex poisoned");
                match writes.pending.pop_front() {
                    Some(item) => {
                        if let PendingWrite::Data(buffer, _) = &item {
                            writes.buffered = writes.buffered.saturating_sub(buffer.len() as u64);
                        }
                        Some(item)
                    }
                    None => {
                        writes.draining = false;
                        None
                    }
                }
            };
            match next {
                Some(PendingWrite::Data(buffer, result)) => self.write_frame(&buffer).chain(result),
                Some(PendingWrite::End) => self.processor.end_of_body(self),
                None => break,
            }
        }
        let finish = {
            let mut writes = self.writes.lock().expect("bridge write queue mutex poisoned");
            if writes.finish_requested && !writes.draining && writes.pending.is_empty() {
                writes.finish_requested = false;
                true
            } else {
                false
            }
        };
        if finish {
            self.processor.finish(self);
        }
    }

    /// Queue the end-of-body marker behind any pending writes.
    pub(crate) fn push_end_of_body(self: &Arc<Self>) {
        let now = {
            let mut writes = self.writes.lock().expect("bridge write queue mutex poisoned");
            if self.commit_future.is_done() && !writes.draining && writes.pending.is_empty() {
                true
            } else {
                writes.pending.push_back(PendingWrite::End);
                false
            }
        };
        if now {
            self.processor.end_of_body(self);
        }
    }

    /// Run `Processor::finish` once commit is done and the queue is empty.
    pub(crate) fn request_finish(self: &Arc<Self>) {
        let now = {
            let mut writes = self.writes.lock().expect("bridge write queue mutex poisoned");
            if self.commit_future.is_done() && !writes.draining && writes.pending.is_empty() {
                true
            } else {
                writes.finish_requested = true;
                false
            }
        };
        if now {
            self.processor.finish(self);
        }
    }

    /// Fail every queued write with `error`.
    pub(crate) fn fail_pending(&self, error: &BridgeError) {
        let pending = {
            let mut writes = self.writes.lock().expect("bridge write queue mutex poisoned");
            writes.buffered = 0;
            std::mem::take(&mut writes.pending)
        };
        for item in pending {
            if let PendingWrite::Data(_, result) = item {
                result.complete(Err(error.clone()));
            }
        }
    }

    /// Take the pending upgrade handler, marking the session upgraded.
    pub(crate) fn take_pending_upgrade(&self) -> Option<Arc<dyn IoHandler>> {
        let mut state = self.upgrade.lock().expect("bridge upgrade mutex poisoned");
        match std::mem::replace(&mut *state, UpgradeState::Upgraded) {
            UpgradeState::Pending(handler) => Some(handler),
            previous => {
                *state = previous;
                None
            }
        }
    }

    pub(crate) fn complete_upgrade(&self, outcome: Outcome) -> bool {
        self.upgrade_future.complete(outcome)
    }

    /// Raw bytes that followed a protocol switch.
    pub(crate) fn take_deferred_raw(&self) -> Vec<Bytes> {
        std::mem::take(
            &mut self
                .deferred
                .lock()
                .expect("bridge deferred mutex poisoned")
                .raw,
        )
    }

    /// Fire the close event, once.
    pub(crate) fn complete_close(self: &Arc<Self>) {
        if self.close_future.complete(()) {
            tracing::trace!(session = self.id, "Bridge session closed");
            self.handler.session_closed(self);
        }
    }

    /// End the exchange with `error`, failing everything still waiting on it.
    pub(crate) fn reset(self: &Arc<Self>, error: BridgeError) {
        if self.close_future.is_done() {
            return;
        }
        tracing::debug!(session = self.id, error = %error, "Resetting bridge session");
        self.closing.store(true, Ordering::SeqCst);
        self.committing.store(true, Ordering::SeqCst);
        self.write_shutdown.store(true, Ordering::SeqCst);
        self.commit_future.complete(Err(error.clone()));
        self.response_future.complete(Err(error.clone()));
        if self.take_pending_upgrade().is_some() {
            self.upgrade_future.complete(Err(BridgeError::UpgradeFailed(error.to_string())));
        }
        self.fail_pending(&error);
        {
            let mut deferred = self.deferred.lock().expect("bridge deferred mutex poisoned");
            deferred.queue.clear();
            deferred.raw.clear();
        }
        if let Some(transport) = self.transport() {
            transport.detach_bridge(self);
        }
        self.handler.exception_caught(self, &error);
        self.complete_close();
    }
}

impl fmt::Debug for BridgeSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BridgeSession")
            .field("id", &self.id)
            .field("direction", &self.direction)
            .field("address", &self.address.to_string())
            .field("committing", &self.is_committing())
            .field("closing", &self.is_closing())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::AddressOptions;
    use crate::codec;
    use crate::transport::memory::MemoryIo;
    use std::sync::atomic::AtomicUsize;

    /// Writes the head plain and completes the commit with the write.
    #[derive(Default)]
    struct PlainProcessor {
        commits: AtomicUsize,
        finished: AtomicUsize,
    }

    impl Processor for PlainProcessor {
        fn commit(&self, session: &Arc<BridgeSession>) {
            self.commits.fetch_add(1, Ordering::SeqCst);
            session.set_encoding(Encoding::default());
            let transport = session.transport().unwrap();
            let written = transport.write(Message::Head(session.head_image()));
            let session = Arc::clone(session);
            written.on_complete(move |outcome| {
                session.complete_commit(outcome.clone());
                session.drain_writes();
            });
        }

        fn buffered(&self, _session: &Arc<BridgeSession>, _total: u64) {}

        fn shutdown_write(&self, _session: &Arc<BridgeSession>) {}

        fn remove(&self, session: &Arc<BridgeSession>) {
            session.commit();
            session.request_finish();
        }

        fn finish(&self, session: &Arc<BridgeSession>) {
            self.finished.fetch_add(1, Ordering::SeqCst);
            session.complete_close();
        }
    }

    #[derive(Default)]
    struct Collect {
        received: Mutex<Vec<String>>,
        complete: AtomicUsize,
        errors: AtomicUsize,
    }

    impl BridgeHandler for Collect {
        fn session_opened(&self, _session: &Arc<BridgeSession>) {}

        fn message_received(&self, _session: &Arc<BridgeSession>, data: Bytes) {
            self.received
                .lock()
                .unwrap()
                .push(String::from_utf8_lossy(&data).into_owned());
        }

        fn input_complete(&self, _session: &Arc<BridgeSession>) {
            self.complete.fetch_add(1, Ordering::SeqCst);
        }

        fn exception_caught(&self, _session: &Arc<BridgeSession>, _error: &BridgeError) {
            self.errors.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct NoopIo;
    impl IoHandler for NoopIo {
        fn message_received(&self, _t: &Arc<TransportSession>, _m: Message) {}
    }

    fn session(
        processor: Arc<PlainProcessor>,
        handler: Arc<Collect>,
    ) -> (Arc<MemoryIo>, Arc<BridgeSession>) {
        let io = MemoryIo::new();
        let transport = TransportSession::new(
            io.clone(),
            WorkerId(0),
            "mem",
            codec::accept_pipeline(codec::DEFAULT_MAX_HEADER_BYTES),
            Arc::new(NoopIo),
        );
        let address = ResolvedAddress::parse("http://localhost:8080/", AddressOptions::default()).unwrap();
        let request = HttpHead::request("GET", "/a?x=1", Version::Http11);
        let session = BridgeSession::accept(&transport, address, request, handler, processor, 2);
        (io, session)
    }

    fn frame(data: &'static str) -> Message {
        Message::Content(Arc::new(crate::http::ContentFrame::new(
            Bytes::from_static(data.as_bytes()),
            false,
            false,
        )))
    }

    #[test]
    fn commit_is_idempotent() {
        let processor = Arc::new(PlainProcessor::default());
        let (io, session) = session(processor.clone(), Arc::new(Collect::default()));
        let first = session.commit();
        let second = session.commit();
        assert!(first.ptr_eq(&second));
        assert_eq!(processor.commits.load(Ordering::SeqCst), 1);
        assert_eq!(io.written().len(), 1);
        assert!(session.is_committed());
    }

    #[test]
    fn headers_frozen_after_commit() {
        let (_io, session) = session(Arc::new(PlainProcessor::default()), Arc::new(Collect::default()));
        session.set_write_header("X-Before", "1").unwrap();
        session.commit();
        let err = session.set_write_header("X-After", "1").unwrap_err();
        assert!(matches!(err, BridgeError::IllegalState { .. }));
        assert!(err.to_string().contains("X-After"));
        assert!(session.set_status(404, "Not Found").is_err());
    }

    #[test]
    fn accept_method_is_read_only() {
        let (_io, session) = session(Arc::new(PlainProcessor::default()), Arc::new(Collect::default()));
        assert_eq!(session.method(), "GET");
        assert_eq!(session.path(), "/a");
        assert!(session.set_method("POST").is_err());
    }

    #[test]
    fn writes_wait_for_head_and_keep_order() {
        let (io, session) = session(Arc::new(PlainProcessor::default()), Arc::new(Collect::default()));
        io.hold_writes();
        session.write_bytes(Bytes::from_static(b"one"));
        session.commit();
        session.write_bytes(Bytes::from_static(b"two"));
        // Head is out, body still held behind it.
        assert_eq!(io.written().len(), 1);
        io.release_writes();
        assert!(io.written_string().ends_with("onetwo"));
        assert_eq!(session.buffered_bytes(), 0);
    }

    #[test]
    fn deferred_reads_are_fifo() {
        let handler = Arc::new(Collect::default());
        let (_io, session) = session(Arc::new(PlainProcessor::default()), handler.clone());
        session.on_inbound(frame("a"));
        session.suspend_read();
        session.on_inbound(frame("b"));
        session.on_inbound(frame("c"));
        assert_eq!(handler.received.lock().unwrap().len(), 1);
        session.resume_read();
        session.on_inbound(frame("d"));
        assert_eq!(*handler.received.lock().unwrap(), vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn deferred_overflow_resets() {
        let handler = Arc::new(Collect::default());
        let (io, session) = session(Arc::new(PlainProcessor::default()), handler.clone());
        session.suspend_read();
        session.on_inbound(frame("a"));
        session.on_inbound(frame("b"));
        session.on_inbound(frame("c"));
        assert_eq!(handler.errors.load(Ordering::SeqCst), 1);
        assert!(session.close_future().is_done());
        assert!(io.is_closed());
    }

    #[test]
    fn close_drops_deferred_and_finishes_once() {
        let processor = Arc::new(PlainProcessor::default());
        let handler = Arc::new(Collect::default());
        let (_io, session) = session(processor.clone(), handler.clone());
        session.suspend_read();
        session.on_inbound(frame("late"));
        let first = session.close();
        let second = session.close();
        assert!(first.ptr_eq(&second));
        assert!(first.is_done());
        session.resume_read();
        assert!(handler.received.lock().unwrap().is_empty());
        assert_eq!(processor.finished.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn second_upgrade_is_rejected() {
        let (_io, session) = session(Arc::new(PlainProcessor::default()), Arc::new(Collect::default()));
        assert!(session.upgrade(Arc::new(NoopIo)).is_ok());
        assert!(session.is_upgrade_pending());
        assert!(session.upgrade(Arc::new(NoopIo)).is_err());
    }

    #[test]
    fn reset_fails_waiters() {
        let handler = Arc::new(Collect::default());
        let (_io, session) = session(Arc::new(PlainProcessor::default()), handler.clone());
        let upgrade = session.upgrade(Arc::new(NoopIo)).unwrap();
        session.reset(BridgeError::EarlyTermination { session: session.id() });
        assert!(matches!(session.commit().value(), Some(Err(BridgeError::EarlyTermination { .. }))));
        assert!(matches!(upgrade.value(), Some(Err(BridgeError::UpgradeFailed(_)))));
        assert!(session.write_bytes(Bytes::from_static(b"x")).value().unwrap().is_err());
        assert_eq!(handler.errors.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn redirects_are_disabled() {
        let (_io, session) = session(Arc::new(PlainProcessor::default()), Arc::new(Collect::default()));
        assert_eq!(session.redirects_allowed(), 0);
    }
}
