//! Protocol upgrade: hands a transport to a new handler after a 101.
//!
//! The coordinator is armed on a bridge session once a switching-protocols
//! head has been sent (accept side) or received (connect side). When that
//! session's close event fires, the transport's old handler is closed, the
//! pending handler installed, and then opened, in that order. Raw bytes
//! that followed the 101 are replayed to the new handler.

use std::sync::Arc;

use crate::bridge::session::BridgeSession;
use crate::error::BridgeError;
use crate::http::Message;
use crate::observability::metrics;
use crate::transport::pipeline::CODEC;
use crate::transport::session::TransportSession;

pub struct UpgradeCoordinator;

impl UpgradeCoordinator {
    /// Swap handlers when `session` closes.
    pub(crate) fn arm(session: &Arc<BridgeSession>) {
        let weak = Arc::downgrade(session);
        session.close_future().on_complete(move |_| {
            if let Some(session) = weak.upgrade() {
                Self::complete(&session);
            }
        });
    }

    fn complete(session: &Arc<BridgeSession>) {
        let Some(transport) = session.transport() else {
            return;
        };
        transport.detach_bridge(session);
        if transport.is_closing() {
            Self::fail(session, &transport, BridgeError::Closed);
            return;
        }
        let Some(handler) = session.take_pending_upgrade() else {
            tracing::debug!(session = session.id(), transport = %transport.id(), "Protocol switched with no upgrade handler, closing");
            transport.close();
            return;
        };

        let previous = transport.handler();
        previous.session_closed(&transport);
        if let Err(e) = transport.set_handler(Arc::clone(&handler)) {
            Self::fail(session, &transport, e);
            return;
        }
        transport.with_pipeline(|p| {
            p.remove(CODEC);
        });
        if let Err(e) = handler.session_opened(&transport) {
            Self::fail(session, &transport, e);
            return;
        }
        for bytes in session.take_deferred_raw() {
            if transport.is_closing() {
                break;
            }
            handler.message_received(&transport, Message::Raw(bytes));
        }

        metrics::record_upgrade(true);
        tracing::debug!(session = session.id(), transport = %transport.id(), "Transport upgraded");
        session.complete_upgrade(Ok(()));
    }

    fn fail(session: &Arc<BridgeSession>, transport: &Arc<TransportSession>, error: BridgeError) {
        tracing::warn!(session = session.id(), transport = %transport.id(), error = %error, "Upgrade failed, closing transport");
        metrics::record_upgrade(false);
        session.take_pending_upgrade();
        transport.close();
        session.complete_upgrade(Err(BridgeError::UpgradeFailed(error.to_string())));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::{AddressOptions, ResolvedAddress};
    use crate::binding::BindingTable;
    use crate::bridge::accept::AcceptProcessor;
    use crate::bridge::handler::BridgeHandler;
    use crate::bridge::BridgeSettings;
    use crate::transport::io::IoHandler;
    use crate::transport::memory::MemoryIo;
    use crate::transport::session::WorkerId;
    use bytes::Bytes;
    use std::sync::Mutex;

    /// Records lifecycle calls into a shared journal.
    struct Journal {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
        inner: Option<Arc<dyn IoHandler>>,
        refuse: bool,
    }

    impl IoHandler for Journal {
        fn session_opened(&self, _t: &Arc<TransportSession>) -> Result<(), BridgeError> {
            self.log.lock().unwrap().push(format!("{} opened", self.name));
            if self.refuse {
                return Err(BridgeError::UpgradeFailed("refused".into()));
            }
            Ok(())
        }

        fn message_received(&self, t: &Arc<TransportSession>, message: Message) {
            match (&self.inner, message) {
                (Some(inner), message) => inner.message_received(t, message),
                (None, Message::Raw(bytes)) => self
                    .log
                    .lock()
                    .unwrap()
                    .push(format!("{} got {}", self.name, String::from_utf8_lossy(&bytes))),
                _ => {}
            }
        }

        fn session_closed(&self, t: &Arc<TransportSession>) {
            self.log.lock().unwrap().push(format!("{} closed", self.name));
            if let Some(inner) = &self.inner {
                inner.session_closed(t);
            }
        }
    }

    /// Answers with 101 and requests an upgrade to `next`.
    struct Switch {
        next: Arc<dyn IoHandler>,
        session: Mutex<Option<Arc<BridgeSession>>>,
    }

    impl BridgeHandler for Switch {
        fn session_opened(&self, session: &Arc<BridgeSession>) {
            session.set_status(101, "Switching Protocols").unwrap();
            session.set_write_header("Upgrade", "echo").unwrap();
            session.set_write_header("Connection", "Upgrade").unwrap();
            session.upgrade(self.next.clone()).unwrap();
            *self.session.lock().unwrap() = Some(session.clone());
        }
    }

    fn setup(next: Arc<dyn IoHandler>, log: Arc<Mutex<Vec<String>>>) -> (Arc<MemoryIo>, Arc<TransportSession>, Arc<Switch>) {
        let local = ResolvedAddress::parse("http://localhost:8080/", AddressOptions::default()).unwrap();
        let bindings = Arc::new(BindingTable::new());
        let switch = Arc::new(Switch {
            next,
            session: Mutex::new(None),
        });
        bindings.bind(&local, switch.clone()).unwrap();
        let processor = AcceptProcessor::new(local, bindings, BridgeSettings::default());
        let pipeline = processor.pipeline();
        let old = Arc::new(Journal {
            name: "old",
            log,
            inner: Some(processor),
            refuse: false,
        });
        let io = MemoryIo::new();
        let transport = TransportSession::new(io.clone(), WorkerId(0), "client", pipeline, old);
        (io, transport, switch)
    }

    const UPGRADE_REQUEST: &str = "GET /ws HTTP/1.1\r\nConnection: Upgrade\r\nUpgrade: echo\r\n\r\n";

    #[test]
    fn old_handler_closes_before_new_opens() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let next = Arc::new(Journal {
            name: "new",
            log: log.clone(),
            inner: None,
            refuse: false,
        });
        let (io, transport, switch) = setup(next.clone(), log.clone());
        transport.received(Bytes::from(format!("{}early", UPGRADE_REQUEST)));
        let session = switch.session.lock().unwrap().clone().unwrap();
        let upgraded = session.upgrade_future();
        session.close();

        assert!(io.written_string().starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
        assert_eq!(
            *log.lock().unwrap(),
            vec!["old closed".to_string(), "new opened".to_string(), "new got early".to_string()]
        );
        assert!(matches!(upgraded.value(), Some(Ok(()))));
        assert!(session.is_upgraded());
        assert!(!transport.is_closing());
        assert!(!transport.pipeline_names().contains(&CODEC.to_string()));

        transport.received(Bytes::from_static(b"later"));
        assert_eq!(log.lock().unwrap().last().unwrap(), "new got later");
    }

    #[test]
    fn failed_open_force_closes() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let next = Arc::new(Journal {
            name: "new",
            log: log.clone(),
            inner: None,
            refuse: true,
        });
        let (_io, transport, switch) = setup(next, log.clone());
        transport.received(Bytes::from_static(UPGRADE_REQUEST.as_bytes()));
        let session = switch.session.lock().unwrap().clone().unwrap();
        session.close();
        assert!(transport.is_closing());
        assert!(matches!(
            session.upgrade_future().value(),
            Some(Err(BridgeError::UpgradeFailed(_)))
        ));
        let log = log.lock().unwrap();
        assert_eq!(log.iter().filter(|l| l.as_str() == "old closed").count(), 1);
    }
}
