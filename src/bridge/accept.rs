//! Accept processor: server-side commit, flush and removal.
//!
//! # Responsibilities
//! - Turn each inbound request head into a bridge session routed through
//!   the binding table
//! - Decide response framing at commit: non-persistent, keep-alive with
//!   `Content-Length`, keep-alive chunked, or protocol switch
//! - End each response so the connection can carry the next request
//! - Answer malformed input with the decode status and close
//!
//! # Design Decisions
//! - Pipelined requests that arrive while a response is in flight wait in a
//!   per-connection backlog and are replayed once that exchange ends
//! - A panicking `session_opened` is treated as a processing failure:
//!   500 before commit, forced close after

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};

use dashmap::DashMap;

use crate::address::ResolvedAddress;
use crate::binding::BindingTable;
use crate::bridge::handler::{BridgeHandler, StatusHandler};
use crate::bridge::session::{BridgeSession, Encoding, Processor};
use crate::bridge::upgrade::UpgradeCoordinator;
use crate::bridge::BridgeSettings;
use crate::codec;
use crate::error::BridgeError;
use crate::http::head::{is_bodyless_status, SWITCHING_PROTOCOLS};
use crate::http::headers;
use crate::http::{ContentFrame, HttpHead, Message, Version};
use crate::net::connection::ConnectionId;
use crate::observability::metrics;
use crate::transport::io::IoHandler;
use crate::transport::pipeline::{Pipeline, CODEC, LOGGING};
use crate::transport::session::TransportSession;

/// Tells whether a response is being emulated for a legacy transport and
/// must not be chunked.
pub type WrappedResponse = Arc<dyn Fn(&BridgeSession) -> bool + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CommitPath {
    KeepAlive,
    NonPersistent,
    Upgrade,
}

impl CommitPath {
    fn label(self) -> &'static str {
        match self {
            CommitPath::KeepAlive => "keep_alive",
            CommitPath::NonPersistent => "non_persistent",
            CommitPath::Upgrade => "upgrade",
        }
    }
}

pub struct AcceptProcessor {
    local: ResolvedAddress,
    bindings: Arc<BindingTable>,
    settings: BridgeSettings,
    wrapped_response: Option<WrappedResponse>,
    backlog: DashMap<ConnectionId, VecDeque<Message>>,
    this: Weak<AcceptProcessor>,
}

impl AcceptProcessor {
    /// Processor for transports accepted on `local`'s authority.
    pub fn new(local: ResolvedAddress, bindings: Arc<BindingTable>, settings: BridgeSettings) -> Arc<Self> {
        Self::with_wrapped_response(local, bindings, settings, None)
    }

    pub fn with_wrapped_response(
        local: ResolvedAddress,
        bindings: Arc<BindingTable>,
        settings: BridgeSettings,
        wrapped_response: Option<WrappedResponse>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            local,
            bindings,
            settings,
            wrapped_response,
            backlog: DashMap::new(),
            this: this.clone(),
        })
    }

    pub fn local(&self) -> &ResolvedAddress {
        &self.local
    }

    /// Pipeline to install on transports handed to this processor.
    pub fn pipeline(&self) -> Pipeline {
        codec::accept_pipeline(self.settings.max_header_bytes)
    }

    fn processor(&self) -> Option<Arc<dyn Processor>> {
        self.this.upgrade().map(|p| p as Arc<dyn Processor>)
    }

    fn chunking_required(&self, session: &BridgeSession) -> bool {
        !self.wrapped_response.as_ref().is_some_and(|wrapped| wrapped(session))
    }

    /// Start an exchange for a request head.
    fn begin(&self, transport: &Arc<TransportSession>, request: HttpHead) {
        let Some(processor) = self.processor() else {
            return;
        };
        let path = request_path(request.target().unwrap_or("/"));
        let (address, handler): (ResolvedAddress, Arc<dyn BridgeHandler>) =
            match self.bindings.resolve_path(&self.local.authority_key(), &path) {
                Some(registration) => (registration.address.with_path(&path), registration.handler),
                None => {
                    tracing::debug!(authority = %self.local.authority_key(), path = %path, "No binding for request");
                    (self.local.with_path(&path), Arc::new(StatusHandler::new(404)))
                }
            };
        self.open_session(transport, address, request, handler, processor);
    }

    fn open_session(
        &self,
        transport: &Arc<TransportSession>,
        address: ResolvedAddress,
        request: HttpHead,
        handler: Arc<dyn BridgeHandler>,
        processor: Arc<dyn Processor>,
    ) {
        let complete = request.complete;
        let session = BridgeSession::accept(
            transport,
            address,
            request,
            handler.clone(),
            processor,
            self.settings.deferred_read_limit,
        );
        transport.attach_bridge(Arc::clone(&session));
        if complete {
            session.mark_input_received();
        }
        tracing::debug!(
            session = session.id(),
            transport = %transport.id(),
            method = %session.method(),
            target = %session.target(),
            "Request received"
        );
        let opened = catch_unwind(AssertUnwindSafe(|| handler.session_opened(&session)));
        if opened.is_err() {
            session.abort(BridgeError::illegal_state(session.id(), "handler panicked"));
            return;
        }
        if complete && !session.close_future().is_done() {
            session.on_inbound(Message::Content(Arc::new(ContentFrame::terminal(false, false))));
        }
    }

    /// Answer input that could not be decoded, then close.
    fn reject(&self, transport: &Arc<TransportSession>, status: u16) {
        let Some(processor) = self.processor() else {
            transport.close();
            return;
        };
        let mut request = HttpHead::request("GET", "/", Version::Http11);
        request.headers.set(headers::CONNECTION, "close");
        request.complete = true;
        self.open_session(
            transport,
            self.local.clone(),
            request,
            Arc::new(StatusHandler::closing(status)),
            processor,
        );
    }

    /// Replay requests that arrived while the previous exchange was active.
    fn replay_backlog(&self, transport: &Arc<TransportSession>) {
        let Some((_, backlog)) = self.backlog.remove(&transport.id()) else {
            return;
        };
        for message in backlog {
            if transport.is_closing() {
                break;
            }
            self.message_received(transport, message);
        }
    }

    fn write_head(
        &self,
        session: &Arc<BridgeSession>,
        transport: &Arc<TransportSession>,
        head: HttpHead,
        path: CommitPath,
    ) {
        let status = head.status().unwrap_or(200);
        session.set_committed_headers(head.headers.clone());
        let written = transport.write(Message::Head(head));
        session.record_write(&written);
        let session = Arc::clone(session);
        let transport = Arc::clone(transport);
        written.on_complete(move |outcome| match outcome {
            Ok(()) => {
                if path == CommitPath::NonPersistent {
                    transport.with_pipeline(|p| p.retain(|name, _| name == CODEC || name == LOGGING));
                    session.mark_connection_close();
                }
                metrics::record_commit("accept", path.label());
                tracing::debug!(session = session.id(), status, path = path.label(), "Response committed");
                session.complete_commit(Ok(()));
                if path == CommitPath::Upgrade {
                    UpgradeCoordinator::arm(&session);
                }
                session.drain_writes();
            }
            Err(e) => {
                tracing::debug!(session = session.id(), error = %e, "Response head write failed");
                session.complete_commit(Err(e.clone()));
                session.fail_pending(e);
                transport.close();
                session.drain_writes();
            }
        });
    }
}

/// Path of a request target, in origin or absolute form.
fn request_path(target: &str) -> String {
    let path = match target.find("://") {
        Some(scheme_end) => {
            let rest = &target[scheme_end + 3..];
            rest.find('/').map_or("/", |i| &rest[i..])
        }
        None => target,
    };
    let path = path.split(['?', '#']).next().unwrap_or("/");
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{}", path)
    }
}

impl Processor for AcceptProcessor {
    fn commit(&self, session: &Arc<BridgeSession>) {
        let Some(transport) = session.transport() else {
            return;
        };
        let mut head = session.head_image();
        let status = head.status().unwrap_or(200);
        let closing = session.is_closing() || session.is_write_shutdown();
        let scheduled = session.buffered_bytes();
        let bodyless = is_bodyless_status(status) || session.method().eq_ignore_ascii_case("HEAD");
        let gzipped = session.apply_compression(&mut head, bodyless);

        if status == SWITCHING_PROTOCOLS {
            session.set_encoding(Encoding::default());
            head.complete = true;
            session.mark_output_complete();
            self.write_head(session, &transport, head, CommitPath::Upgrade);
            return;
        }

        // A declined upgrade leaves the request stream unparseable.
        if session.read_headers().contains(headers::UPGRADE) {
            head.headers.set(headers::CONNECTION, "close");
        }
        if closing && scheduled == 0 {
            head.complete = true;
        }
        let has_length = head.headers.contains(headers::CONTENT_LENGTH);

        if session.version() == Version::Http10 || head.headers.has_token(headers::CONNECTION, "close") {
            head.headers.remove(headers::TRANSFER_ENCODING);
            if !bodyless && !has_length && closing && !gzipped {
                head.headers.set(headers::CONTENT_LENGTH, &scheduled.to_string());
            }
            session.set_encoding(Encoding { chunked: false, gzipped });
            self.write_head(session, &transport, head, CommitPath::NonPersistent);
            return;
        }

        let mut chunked = head.headers.is_chunked();
        let mut path = CommitPath::KeepAlive;
        if !bodyless && !chunked && !has_length {
            if closing && !gzipped {
                head.headers.set(headers::CONTENT_LENGTH, &scheduled.to_string());
            } else if self.chunking_required(session) {
                head.headers.set(headers::TRANSFER_ENCODING, "chunked");
                chunked = true;
            } else {
                // Length unknown and chunking not allowed: the close delimits the body.
                head.headers.set(headers::CONNECTION, "close");
                path = CommitPath::NonPersistent;
            }
        }
        if bodyless {
            chunked = false;
        }
        session.set_encoding(Encoding { chunked, gzipped });
        self.write_head(session, &transport, head, path);
    }

    fn buffered(&self, session: &Arc<BridgeSession>, total: u64) {
        if total > self.settings.write_buffer_limit {
            session.commit();
        }
    }

    fn shutdown_write(&self, session: &Arc<BridgeSession>) {
        session.commit();
    }

    fn remove(&self, session: &Arc<BridgeSession>) {
        session.commit();
        session.request_finish();
    }

    fn finish(&self, session: &Arc<BridgeSession>) {
        let Some(transport) = session.transport() else {
            session.complete_close();
            return;
        };
        if !session.is_committed() {
            transport.detach_bridge(session);
            session.complete_close();
            return;
        }
        if session.is_switching_protocols() {
            // The upgrade coordinator takes the transport from here.
            session.complete_close();
            return;
        }
        if session.is_connection_close() {
            transport.detach_bridge(session);
            match session.last_write() {
                Some(last) => transport.close_after(&last),
                None => {
                    transport.close();
                }
            }
            session.complete_close();
            return;
        }

        let encoding = session.encoding().unwrap_or_default();
        session.mark_output_complete();
        let end = transport.write(Message::Content(Arc::new(ContentFrame::terminal(
            encoding.chunked,
            encoding.gzipped,
        ))));
        session.record_write(&end);
        transport.detach_bridge(session);
        let request_read = session.is_input_complete();
        session.complete_close();
        if request_read {
            self.replay_backlog(&transport);
        } else {
            tracing::debug!(session = session.id(), "Request body not consumed, closing connection");
            transport.close_after(&end);
        }
    }
}

impl IoHandler for AcceptProcessor {
    fn session_opened(&self, transport: &Arc<TransportSession>) -> Result<(), BridgeError> {
        tracing::debug!(transport = %transport.id(), remote = transport.remote(), "Connection accepted");
        Ok(())
    }

    fn message_received(&self, transport: &Arc<TransportSession>, message: Message) {
        if let Some(mut backlog) = self.backlog.get_mut(&transport.id()) {
            backlog.push_back(message);
            return;
        }
        match transport.bridge() {
            Some(session) if !session.close_future().is_done() => match message {
                Message::Head(_) => {
                    self.backlog.entry(transport.id()).or_default().push_back(message);
                }
                other => session.on_inbound(other),
            },
            _ => match message {
                Message::Head(head) => self.begin(transport, head),
                other => {
                    tracing::trace!(transport = %transport.id(), kind = other.kind(), "Dropping data with no active exchange");
                }
            },
        }
    }

    fn session_closed(&self, transport: &Arc<TransportSession>) {
        self.backlog.remove(&transport.id());
        let Some(session) = transport.bridge() else {
            return;
        };
        transport.detach_bridge(&session);
        if !session.is_closing() {
            metrics::record_early_termination();
            session.reset(BridgeError::EarlyTermination { session: session.id() });
        } else {
            session.fail_pending(&BridgeError::Closed);
            session.complete_close();
        }
    }

    fn exception_caught(&self, transport: &Arc<TransportSession>, error: &BridgeError) {
        match (transport.bridge(), error) {
            (Some(session), _) if session.is_closing() => {
                tracing::debug!(session = session.id(), error = %error, "Error on closing exchange, closing connection");
                transport.close();
            }
            (Some(session), _) => session.abort(error.clone()),
            (None, BridgeError::Decode { status, reason }) => {
                tracing::debug!(transport = %transport.id(), status, reason = %reason, "Rejecting malformed request");
                self.reject(transport, *status);
            }
            (None, _) => {
                tracing::warn!(transport = %transport.id(), error = %error, "Transport error, closing");
                transport.close();
            }
        }
    }
}
