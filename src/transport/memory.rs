//! In-memory transport.
//!
//! Records everything written and lets the caller decide when writes
//! complete. Used to drive the bridge without sockets.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;

use crate::address::ResolvedAddress;
use crate::codec;
use crate::completion::{Completion, WriteFuture};
use crate::error::BridgeError;
use crate::transport::io::{ConnectFuture, Connector, IoHandler, TransportIo};
use crate::transport::session::{TransportSession, WorkerId};

#[derive(Debug, Default)]
pub struct MemoryIo {
    written: Mutex<Vec<Bytes>>,
    held: Mutex<Option<Vec<WriteFuture>>>,
    closed: AtomicBool,
    read_suspended: AtomicBool,
}

impl MemoryIo {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Leave write handles pending until `release_writes`.
    pub fn hold_writes(&self) {
        let mut held = self.held.lock().expect("memory io mutex poisoned");
        if held.is_none() {
            *held = Some(Vec::new());
        }
    }

    /// Complete every held write, in order, and stop holding.
    pub fn release_writes(&self) {
        let pending = self.held.lock().expect("memory io mutex poisoned").take();
        for write in pending.into_iter().flatten() {
            write.complete(Ok(()));
        }
    }

    pub fn written(&self) -> Vec<Bytes> {
        self.written.lock().expect("memory io mutex poisoned").clone()
    }

    /// Everything written so far, concatenated and decoded lossily.
    pub fn written_string(&self) -> String {
        let written = self.written.lock().expect("memory io mutex poisoned");
        written
            .iter()
            .map(|b| String::from_utf8_lossy(b).into_owned())
            .collect()
    }

    pub fn clear(&self) {
        self.written.lock().expect("memory io mutex poisoned").clear();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn is_read_suspended(&self) -> bool {
        self.read_suspended.load(Ordering::SeqCst)
    }
}

impl TransportIo for MemoryIo {
    fn write(&self, bytes: Bytes) -> WriteFuture {
        if self.is_closed() {
            return Completion::completed(Err(BridgeError::Closed));
        }
        self.written.lock().expect("memory io mutex poisoned").push(bytes);
        let mut held = self.held.lock().expect("memory io mutex poisoned");
        match held.as_mut() {
            Some(pending) => {
                let write = Completion::new();
                pending.push(write.clone());
                write
            }
            None => Completion::completed(Ok(())),
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn suspend_read(&self) {
        self.read_suspended.store(true, Ordering::SeqCst);
    }

    fn resume_read(&self) {
        self.read_suspended.store(false, Ordering::SeqCst);
    }
}

/// Connector producing in-memory transports with the connect-side pipeline.
#[derive(Debug, Default)]
pub struct MemoryConnector {
    opened: Mutex<Vec<(Arc<MemoryIo>, Arc<TransportSession>)>>,
    refuse: AtomicBool,
}

impl MemoryConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make subsequent connects fail.
    pub fn refuse(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    pub fn connections(&self) -> usize {
        self.opened.lock().expect("memory connector mutex poisoned").len()
    }

    /// The most recently opened transport and its io.
    pub fn last(&self) -> Option<(Arc<MemoryIo>, Arc<TransportSession>)> {
        self.opened
            .lock()
            .expect("memory connector mutex poisoned")
            .last()
            .cloned()
    }
}

impl Connector for MemoryConnector {
    fn connect(
        &self,
        address: &ResolvedAddress,
        worker: WorkerId,
        handler: Arc<dyn IoHandler>,
    ) -> ConnectFuture {
        if self.refuse.load(Ordering::SeqCst) {
            return Completion::completed(Err(BridgeError::Connect {
                address: address.authority_key(),
                reason: "connection refused".to_string(),
            }));
        }
        let io = MemoryIo::new();
        let transport = TransportSession::new(
            io.clone(),
            worker,
            address.authority_key(),
            codec::connect_pipeline(),
            handler,
        );
        transport.open();
        self.opened
            .lock()
            .expect("memory connector mutex poisoned")
            .push((io, transport.clone()));
        Completion::completed(Ok(transport))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn held_writes_complete_on_release() {
        let io = MemoryIo::new();
        io.hold_writes();
        let first = io.write(Bytes::from_static(b"a"));
        let second = io.write(Bytes::from_static(b"b"));
        assert!(!first.is_done());
        io.release_writes();
        assert!(first.is_done() && second.is_done());
        assert_eq!(io.written_string(), "ab");
    }
}
