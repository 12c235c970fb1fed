//! Reverse proxy service: bridges each accepted request to a backend.
//!
//! # Responsibilities
//! - Originate one connect session per accept session
//! - Map the request target under the service's accept path onto the
//!   backend path
//! - Copy end-to-end headers and cookies both ways, tagging requests with
//!   `X-Request-ID` and `X-Forwarded-For`
//! - Stream bodies in both directions, pausing the faster side while the
//!   slower one drains
//! - Answer 502/504 when the backend cannot produce a response
//! - Relay raw bytes after a protocol switch
//!
//! # Design Decisions
//! - The response head is committed as soon as body data arrives, so
//!   streamed responses are not held back by the accept-side buffer
//! - On a normal end the connect session closes first, so its transport is
//!   pooled before the accept side finishes

use std::sync::{Arc, Weak};

use bytes::Bytes;
use dashmap::DashMap;
use uuid::Uuid;

use crate::address::ResolvedAddress;
use crate::bridge::{BridgeHandler, BridgeSession, ConnectProcessor, StatusHandler};
use crate::error::BridgeError;
use crate::http::headers::{self, is_hop_by_hop};
use crate::service::pipe::PipeLink;

/// Accept-side handler for one configured service.
pub struct ProxyHandler {
    name: String,
    /// Accept path the service is bound under.
    prefix: String,
    upstream: ResolvedAddress,
    connect: Arc<ConnectProcessor>,
    /// Accept session id → its connect session.
    exchanges: DashMap<u64, Arc<BridgeSession>>,
}

impl ProxyHandler {
    pub fn new(
        name: impl Into<String>,
        accept: &ResolvedAddress,
        upstream: ResolvedAddress,
        connect: Arc<ConnectProcessor>,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            prefix: accept.path().trim_end_matches('/').to_string(),
            upstream,
            connect,
            exchanges: DashMap::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn upstream(&self) -> &ResolvedAddress {
        &self.upstream
    }

    /// Exchanges currently in flight.
    pub fn active(&self) -> usize {
        self.exchanges.len()
    }

    /// Backend request target for an accepted `target`.
    fn upstream_target(&self, target: &str) -> String {
        let (path, query) = match target.split_once('?') {
            Some((path, query)) => (path, Some(query)),
            None => (target, self.upstream.location().query()),
        };
        let suffix = path.strip_prefix(self.prefix.as_str()).unwrap_or(path);
        let mut mapped = format!("{}{}", self.upstream.path().trim_end_matches('/'), suffix);
        if mapped.is_empty() {
            mapped.push('/');
        }
        match query {
            Some(query) => format!("{}?{}", mapped, query),
            None => mapped,
        }
    }

    fn prepare(
        &self,
        accept: &Arc<BridgeSession>,
        connect: &Arc<BridgeSession>,
        request_id: &str,
    ) -> Result<(), BridgeError> {
        connect.set_method(&accept.method())?;
        connect.set_target(&self.upstream_target(&accept.target()))?;

        let host_header = self.upstream.options().host_header_enabled;
        let request = accept.read_headers();
        for (name, values) in request.iter() {
            if is_hop_by_hop(name) || (host_header && name.eq_ignore_ascii_case(headers::HOST)) {
                continue;
            }
            connect.remove_write_header(name)?;
            for value in values {
                connect.add_write_header(name, value)?;
            }
        }
        for cookie in accept.read_cookies() {
            connect.add_write_cookie(cookie)?;
        }
        if let Some(protocol) = request.first(headers::UPGRADE) {
            connect.set_write_header(headers::UPGRADE, protocol)?;
            connect.set_write_header(headers::CONNECTION, "Upgrade")?;
        }
        connect.set_write_header(headers::X_REQUEST_ID, request_id)?;
        if let Some(transport) = accept.transport() {
            let forwarded = match request.first(headers::X_FORWARDED_FOR) {
                Some(chain) => format!("{}, {}", chain, transport.remote()),
                None => transport.remote().to_string(),
            };
            connect.set_write_header(headers::X_FORWARDED_FOR, &forwarded)?;
        }
        Ok(())
    }

    fn exchange(&self, accept: &BridgeSession) -> Option<Arc<BridgeSession>> {
        self.exchanges.get(&accept.id()).map(|entry| Arc::clone(entry.value()))
    }
}

impl BridgeHandler for ProxyHandler {
    fn session_opened(&self, accept: &Arc<BridgeSession>) {
        let request_id = accept
            .read_header(headers::X_REQUEST_ID)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let upstream = Arc::new(Upstream {
            accept: Arc::downgrade(accept),
            request_id: request_id.clone(),
        });
        let connect = self
            .connect
            .create_session(self.upstream.clone(), accept.worker(), upstream)
            .and_then(|connect| {
                self.prepare(accept, &connect, &request_id)?;
                Ok(connect)
            });
        let connect = match connect {
            Ok(connect) => connect,
            Err(e) => {
                tracing::warn!(service = %self.name, session = accept.id(), error = %e, "Failed to build backend request");
                accept.abort(e);
                return;
            }
        };
        tracing::debug!(
            service = %self.name,
            session = accept.id(),
            upstream = connect.id(),
            request_id = %request_id,
            target = %connect.target(),
            "Proxying request"
        );
        self.exchanges.insert(accept.id(), Arc::clone(&connect));
        self.connect.connect(&connect);
    }

    fn message_received(&self, accept: &Arc<BridgeSession>, data: Bytes) {
        let Some(connect) = self.exchange(accept) else {
            return;
        };
        let write = connect.write_bytes(data);
        if !write.is_done() {
            accept.suspend_read();
            let accept = Arc::clone(accept);
            write.on_complete(move |_| accept.resume_read());
        }
    }

    fn input_complete(&self, accept: &Arc<BridgeSession>) {
        if let Some(connect) = self.exchange(accept) {
            connect.shutdown_write();
        }
    }

    fn session_closed(&self, accept: &Arc<BridgeSession>) {
        let Some((_, connect)) = self.exchanges.remove(&accept.id()) else {
            return;
        };
        // The backend side of a switched exchange lives on in the pipe.
        if !connect.is_closing() && !connect.is_switching_protocols() {
            tracing::debug!(service = %self.name, session = accept.id(), "Client gone, abandoning backend request");
            connect.abort(BridgeError::Closed);
        }
    }

    fn exception_caught(&self, accept: &Arc<BridgeSession>, error: &BridgeError) {
        tracing::debug!(service = %self.name, session = accept.id(), error = %error, "Client exchange failed");
    }
}

/// Connect-side handler relaying the backend response to the client.
struct Upstream {
    accept: Weak<BridgeSession>,
    request_id: String,
}

impl Upstream {
    fn copy_response(&self, connect: &BridgeSession, accept: &BridgeSession) -> Result<(), BridgeError> {
        accept.set_status(connect.status(), &connect.reason())?;
        for (name, values) in connect.read_headers().iter() {
            if is_hop_by_hop(name) {
                continue;
            }
            for value in values {
                accept.add_write_header(name, value)?;
            }
        }
        for cookie in connect.read_cookies() {
            accept.add_write_cookie(cookie)?;
        }
        if accept.write_header(headers::X_REQUEST_ID).is_none() {
            accept.set_write_header(headers::X_REQUEST_ID, &self.request_id)?;
        }
        Ok(())
    }

    /// Pair both transports through a pipe once the 101 is through.
    fn switch(&self, connect: &Arc<BridgeSession>, accept: &Arc<BridgeSession>) -> Result<(), BridgeError> {
        if let Some(protocol) = connect.read_header(headers::UPGRADE) {
            accept.set_write_header(headers::UPGRADE, &protocol)?;
        }
        accept.set_write_header(headers::CONNECTION, "Upgrade")?;
        let (client, backend) = PipeLink::pair();
        let link = Arc::clone(client.link());
        let client_done = accept.upgrade(client)?;
        let backend_done = connect.upgrade(backend)?;
        for done in [client_done, backend_done] {
            let link = Arc::clone(&link);
            done.on_complete(move |outcome| {
                if outcome.is_err() {
                    link.shutdown();
                }
            });
        }
        accept.close();
        Ok(())
    }
}

impl BridgeHandler for Upstream {
    fn session_opened(&self, connect: &Arc<BridgeSession>) {
        let Some(accept) = self.accept.upgrade() else {
            connect.abort(BridgeError::Closed);
            return;
        };
        tracing::debug!(session = accept.id(), upstream = connect.id(), status = connect.status(), "Backend responded");
        let mut result = self.copy_response(connect, &accept);
        if result.is_ok() && connect.is_switching_protocols() {
            result = self.switch(connect, &accept);
        }
        if let Err(e) = result {
            connect.abort(e.clone());
            accept.abort(e);
        }
    }

    fn message_received(&self, connect: &Arc<BridgeSession>, data: Bytes) {
        let Some(accept) = self.accept.upgrade() else {
            return;
        };
        accept.commit();
        let write = accept.write_bytes(data);
        if !write.is_done() {
            connect.suspend_read();
            let connect = Arc::clone(connect);
            write.on_complete(move |_| connect.resume_read());
        }
    }

    fn input_complete(&self, connect: &Arc<BridgeSession>) {
        connect.close();
        if let Some(accept) = self.accept.upgrade() {
            accept.close();
        }
    }

    fn exception_caught(&self, connect: &Arc<BridgeSession>, error: &BridgeError) {
        let Some(accept) = self.accept.upgrade() else {
            return;
        };
        if accept.is_closing() {
            return;
        }
        tracing::debug!(session = accept.id(), upstream = connect.id(), error = %error, "Backend exchange failed");
        if accept.is_committing() {
            accept.abort(error.clone());
        } else {
            StatusHandler::new(error.response_status()).session_opened(&accept);
        }
    }
}
