//! Connect processor: client-side send, receive and recycling.
//!
//! # Responsibilities
//! - Create connect sessions and attach them to a pooled or new transport
//! - Frame the outbound request at commit
//! - Deliver the response to the session's handler
//! - Decide, once the exchange ends, whether the transport is pooled,
//!   closed, left for the peer to close, or handed to an upgrade
//!
//! # Design Decisions
//! - A request with no body is committed as soon as the transport is
//!   attached; otherwise the first body write commits
//! - The response timeout reuses the transport's idle guard, armed once the
//!   request has been fully sent
//! - Handlers that want a protocol switch must call `upgrade` from
//!   `session_opened`; the session closes as soon as the 101 head is in

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use crate::address::ResolvedAddress;
use crate::bridge::handler::BridgeHandler;
use crate::bridge::session::{BridgeSession, Direction, Encoding, Processor};
use crate::bridge::upgrade::UpgradeCoordinator;
use crate::bridge::BridgeSettings;
use crate::completion::Completion;
use crate::error::{BridgeError, Outcome};
use crate::http::headers::{self, Headers};
use crate::http::{ContentFrame, HttpHead, Message, Version};
use crate::observability::metrics;
use crate::pool::PersistentConnectionPool;
use crate::transport::io::{Connector, IoHandler};
use crate::transport::session::{TransportSession, WorkerId};

const USER_AGENT: &str = concat!("bridge-gateway/", env!("CARGO_PKG_VERSION"));

pub struct ConnectProcessor {
    connector: Arc<dyn Connector>,
    pool: Arc<PersistentConnectionPool>,
    settings: BridgeSettings,
}

/// A request is bodyless with `Content-Length: 0`, or as GET/HEAD with no
/// framing headers at all.
fn request_has_no_body(headers: &Headers, method: &str) -> bool {
    match headers.content_length() {
        Some(length) => length == 0,
        None => {
            !headers.is_chunked()
                && (method.eq_ignore_ascii_case("GET") || method.eq_ignore_ascii_case("HEAD"))
        }
    }
}

/// The peer will not keep the connection open after this response.
fn peer_requested_close(session: &BridgeSession) -> bool {
    let read = session.read_headers();
    if read.has_token(headers::CONNECTION, "close") {
        return true;
    }
    session.peer_version() == Some(Version::Http10) && !read.has_token(headers::CONNECTION, "keep-alive")
}

impl ConnectProcessor {
    pub fn new(
        connector: Arc<dyn Connector>,
        pool: Arc<PersistentConnectionPool>,
        settings: BridgeSettings,
    ) -> Arc<Self> {
        Arc::new(Self {
            connector,
            pool,
            settings,
        })
    }

    pub fn pool(&self) -> &Arc<PersistentConnectionPool> {
        &self.pool
    }

    /// New session for a request to `address`, with default headers applied.
    pub fn create_session(
        self: &Arc<Self>,
        address: ResolvedAddress,
        worker: WorkerId,
        handler: Arc<dyn BridgeHandler>,
    ) -> Result<Arc<BridgeSession>, BridgeError> {
        let options = address.options().clone();
        let host = address.host_header();
        let session = BridgeSession::connect(
            address,
            worker,
            handler,
            Arc::clone(self) as Arc<dyn Processor>,
            self.settings.deferred_read_limit,
        );
        if options.host_header_enabled {
            session.set_write_header(headers::HOST, &host)?;
        }
        if options.user_agent_header_enabled {
            session.set_write_header(headers::USER_AGENT, USER_AGENT)?;
        }
        Ok(session)
    }

    /// Attach `session` to a transport. The returned handle completes when
    /// the response head arrives or the exchange fails first.
    pub fn connect(self: &Arc<Self>, session: &Arc<BridgeSession>) -> Completion<Outcome> {
        if session.direction() != Direction::Connect {
            return Completion::completed(Err(BridgeError::illegal_state(
                session.id(),
                "connect on an accept session",
            )));
        }
        if let Some(transport) = self.pool.take(session.address(), session.worker()) {
            self.attached(session, &transport);
            return session.response_future();
        }

        let processor = Arc::clone(self);
        let pending = Arc::clone(session);
        tracing::debug!(session = session.id(), address = %session.address().authority_key(), "Opening connection");
        self.connector
            .connect(session.address(), session.worker(), Arc::clone(self) as Arc<dyn IoHandler>)
            .on_complete(move |result| match result {
                Ok(transport) => processor.attached(&pending, transport),
                Err(e) => {
                    tracing::debug!(session = pending.id(), error = %e, "Connect failed");
                    pending.reset(e.clone());
                }
            });
        session.response_future()
    }

    fn attached(&self, session: &Arc<BridgeSession>, transport: &Arc<TransportSession>) {
        if session.is_closing() {
            // Ended before the connection was ready; the connection is unused.
            if !self.pool.recycle(transport, session.address()) {
                transport.close();
            }
            return;
        }
        if transport.is_closing() {
            session.reset(BridgeError::Closed);
            return;
        }
        if !session.attach_transport(transport) {
            tracing::warn!(session = session.id(), transport = %transport.id(), "Session already has a transport");
            transport.close();
            return;
        }
        if session.is_committing() {
            self.send_head(session, transport);
        } else if request_has_no_body(&session.write_headers(), &session.method()) {
            session.commit();
        }
    }

    fn send_head(&self, session: &Arc<BridgeSession>, transport: &Arc<TransportSession>) {
        let mut head = session.head_image();
        let method = session.method();
        let scheduled = session.buffered_bytes();
        let mut gzipped = session.apply_compression(&mut head, false);
        let framed = head.headers.contains(headers::CONTENT_LENGTH) || head.headers.is_chunked();

        let no_body = scheduled == 0
            && !head.headers.is_chunked()
            && (session.is_write_shutdown() || request_has_no_body(&head.headers, &method));
        if no_body {
            head.complete = true;
            if gzipped {
                head.headers.remove(headers::CONTENT_ENCODING);
                gzipped = false;
            }
            let bodyless_method = method.eq_ignore_ascii_case("GET") || method.eq_ignore_ascii_case("HEAD");
            if !framed && !bodyless_method {
                head.headers.set(headers::CONTENT_LENGTH, "0");
            }
        } else if !framed {
            if session.is_write_shutdown() && !gzipped {
                head.headers.set(headers::CONTENT_LENGTH, &scheduled.to_string());
            } else if session.version() == Version::Http11 {
                head.headers.set(headers::TRANSFER_ENCODING, "chunked");
            }
        }
        let chunked = head.headers.is_chunked();
        session.set_encoding(Encoding { chunked, gzipped });
        let label = match (head.complete, chunked) {
            (true, _) => "empty",
            (false, true) => "chunked",
            (false, false) => "length",
        };
        self.write_head(session, transport, head, label);
    }

    fn write_head(
        &self,
        session: &Arc<BridgeSession>,
        transport: &Arc<TransportSession>,
        head: HttpHead,
        label: &'static str,
    ) {
        let complete = head.complete;
        session.set_committed_headers(head.headers.clone());
        let written = transport.write(Message::Head(head));
        session.record_write(&written);
        if complete {
            session.mark_write_shutdown();
            session.mark_output_complete();
            self.arm_response_timeout(session, transport);
        }
        let session = Arc::clone(session);
        let transport = Arc::clone(transport);
        written.on_complete(move |outcome| match outcome {
            Ok(()) => {
                metrics::record_commit("connect", label);
                tracing::debug!(session = session.id(), transport = %transport.id(), framing = label, "Request committed");
                session.complete_commit(Ok(()));
                session.drain_writes();
            }
            Err(e) => {
                tracing::debug!(session = session.id(), error = %e, "Request head write failed");
                session.complete_commit(Err(e.clone()));
                session.fail_pending(e);
                session.reset(e.clone());
                transport.close();
            }
        });
    }

    fn arm_response_timeout(&self, session: &BridgeSession, transport: &Arc<TransportSession>) {
        if !session.is_response_received() {
            transport.arm_idle_timeout(session.address().options().keep_alive_timeout);
        }
    }

    fn response_head(&self, session: &Arc<BridgeSession>, transport: &Arc<TransportSession>, head: HttpHead) {
        let status = head.status().unwrap_or(0);
        if (100..200).contains(&status) && !head.is_switching_protocols() {
            tracing::trace!(session = session.id(), status, "Skipping interim response");
            return;
        }
        if session.is_response_received() {
            tracing::debug!(session = session.id(), status, "Unexpected second response head, closing");
            session.abort(BridgeError::illegal_state(session.id(), "unexpected response head"));
            return;
        }
        transport.cancel_idle_timeout();
        let complete = head.complete;
        session.set_response(&head);
        if session.is_switching_protocols() {
            UpgradeCoordinator::arm(session);
        }
        session.complete_response(Ok(()));
        tracing::debug!(session = session.id(), status, "Response received");

        let handler = session.handler();
        let opened = catch_unwind(AssertUnwindSafe(|| handler.session_opened(session)));
        if opened.is_err() {
            session.abort(BridgeError::illegal_state(session.id(), "handler panicked"));
            return;
        }
        if complete && !session.close_future().is_done() {
            session.on_inbound(Message::Content(Arc::new(ContentFrame::terminal(false, false))));
        }
    }
}

impl Processor for ConnectProcessor {
    fn commit(&self, session: &Arc<BridgeSession>) {
        match session.transport() {
            Some(transport) => self.send_head(session, &transport),
            None => tracing::trace!(session = session.id(), "Commit deferred until connected"),
        }
    }

    fn buffered(&self, session: &Arc<BridgeSession>, _total: u64) {
        session.commit();
    }

    fn shutdown_write(&self, session: &Arc<BridgeSession>) {
        session.commit();
        session.push_end_of_body();
    }

    fn end_of_body(&self, session: &Arc<BridgeSession>) {
        if !session.mark_output_complete() {
            return;
        }
        let Some(transport) = session.transport() else {
            return;
        };
        let encoding = session.encoding().unwrap_or_default();
        if encoding.chunked || encoding.gzipped {
            let end = transport.write(Message::Content(Arc::new(ContentFrame::terminal(
                encoding.chunked,
                encoding.gzipped,
            ))));
            session.record_write(&end);
        }
        self.arm_response_timeout(session, &transport);
    }

    fn input_complete(&self, session: &Arc<BridgeSession>) {
        if !session.is_closing() {
            session.close();
        }
    }

    fn remove(&self, session: &Arc<BridgeSession>) {
        if session.transport().is_none() {
            session.complete_close();
            return;
        }
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
        if session.is_switching_protocols() && session.is_response_received() {
            // The upgrade coordinator takes the transport from here.
            session.complete_close();
            return;
        }

        transport.detach_bridge(session);
        if transport.is_closing() {
            session.complete_close();
            return;
        }
        let address = session.address();
        let gateway_close = session.version() == Version::Http10
            || session.write_headers().has_token(headers::CONNECTION, "close");
        let peer_close = peer_requested_close(session);

        if peer_close && !gateway_close {
            session.mark_connection_close();
            tracing::debug!(session = session.id(), transport = %transport.id(), "Peer requested close, awaiting it");
            transport.arm_idle_timeout(address.options().keep_alive_timeout);
        } else if gateway_close || peer_close {
            session.mark_connection_close();
            match session.last_write() {
                Some(last) => transport.close_after(&last),
                None => {
                    transport.close();
                }
            }
        } else if !session.is_input_complete() || (!session.is_output_complete() && !session.is_chunked()) {
            tracing::debug!(session = session.id(), transport = %transport.id(), "Exchange incomplete, not recycling");
            transport.close();
        } else {
            if session.is_chunked() && session.mark_output_complete() {
                let end = transport.write(Message::Content(Arc::new(ContentFrame::terminal(true, false))));
                session.record_write(&end);
            }
            transport.with_pipeline(|p| p.retain(|_, stage| stage.is_generic()));
            if !self.pool.recycle(&transport, address) {
                transport.close();
            }
        }
        session.complete_close();
    }
}

impl IoHandler for ConnectProcessor {
    fn session_opened(&self, transport: &Arc<TransportSession>) -> Result<(), BridgeError> {
        tracing::debug!(transport = %transport.id(), remote = transport.remote(), "Connection established");
        Ok(())
    }

    fn message_received(&self, transport: &Arc<TransportSession>, message: Message) {
        let Some(session) = transport.bridge() else {
            tracing::debug!(transport = %transport.id(), kind = message.kind(), "Data on idle connection, closing");
            transport.close();
            return;
        };
        match message {
            Message::Head(head) => self.response_head(&session, transport, head),
            other => session.on_inbound(other),
        }
    }

    fn session_closed(&self, transport: &Arc<TransportSession>) {
        let Some(session) = transport.bridge() else {
            return;
        };
        if session.is_closing() {
            transport.detach_bridge(&session);
            session.fail_pending(&BridgeError::Closed);
            session.complete_close();
            return;
        }
        if session.is_response_received() {
            // A body delimited by the connection ends here.
            if !session.is_input_complete() {
                session.on_inbound(Message::Content(Arc::new(ContentFrame::terminal(false, false))));
            }
            return;
        }
        transport.detach_bridge(&session);
        session.set_read_status(504, "Gateway Timeout");
        metrics::record_early_termination();
        tracing::debug!(session = session.id(), transport = %transport.id(), "Connection closed before response");
        session.reset(BridgeError::EarlyTermination { session: session.id() });
    }

    fn exception_caught(&self, transport: &Arc<TransportSession>, error: &BridgeError) {
        if let Some(session) = transport.bridge() {
            session.reset(error.clone());
        } else {
            tracing::debug!(transport = %transport.id(), error = %error, "Error on idle connection");
        }
        transport.close();
    }
}
