//! Ordered, mutable processing pipeline attached to a transport session.
//!
//! # Responsibilities
//! - Keep named stages in order, head (wire side) to tail (handler side)
//! - Support splicing stages in and out mid-connection
//!
//! # Design Decisions
//! - Reads run head → tail, writes run tail → head
//! - Each traversal works on a snapshot of the stage list, so a splice
//!   never drops a message already in flight
//! - Stage names are unique within a pipeline

use std::fmt;
use std::sync::Arc;

use crate::error::BridgeError;
use crate::http::Message;
use crate::transport::session::TransportSession;

/// Name of the HTTP codec stage.
pub const CODEC: &str = "http#codec";
/// Name of the message logging stage.
pub const LOGGING: &str = "log";

/// One protocol-handling step.
pub trait Stage: Send + Sync {
    /// Transform an inbound message into zero or more messages.
    fn on_read(
        &self,
        _transport: &Arc<TransportSession>,
        message: Message,
    ) -> Result<Vec<Message>, BridgeError> {
        Ok(vec![message])
    }

    /// Transform an outbound message.
    fn on_write(
        &self,
        _transport: &Arc<TransportSession>,
        message: Message,
    ) -> Result<Message, BridgeError> {
        Ok(message)
    }

    /// Generic stages survive when protocol stages are stripped for reuse.
    fn is_generic(&self) -> bool {
        false
    }
}

#[derive(Clone, Default)]
pub struct Pipeline {
    stages: Vec<(String, Arc<dyn Stage>)>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    fn index(&self, name: &str) -> Option<usize> {
        self.stages.iter().position(|(n, _)| n == name)
    }

    fn insert(&mut self, at: usize, name: &str, stage: Arc<dyn Stage>) -> Result<(), BridgeError> {
        if self.contains(name) {
            return Err(BridgeError::illegal_state(0, format!("duplicate pipeline stage {}", name)));
        }
        self.stages.insert(at, (name.to_string(), stage));
        Ok(())
    }

    pub fn add_first(&mut self, name: &str, stage: Arc<dyn Stage>) -> Result<(), BridgeError> {
        self.insert(0, name, stage)
    }

    pub fn add_last(&mut self, name: &str, stage: Arc<dyn Stage>) -> Result<(), BridgeError> {
        let at = self.stages.len();
        self.insert(at, name, stage)
    }

    pub fn add_before(&mut self, base: &str, name: &str, stage: Arc<dyn Stage>) -> Result<(), BridgeError> {
        let at = self
            .index(base)
            .ok_or_else(|| BridgeError::illegal_state(0, format!("no pipeline stage {}", base)))?;
        self.insert(at, name, stage)
    }

    pub fn add_after(&mut self, base: &str, name: &str, stage: Arc<dyn Stage>) -> Result<(), BridgeError> {
        let at = self
            .index(base)
            .ok_or_else(|| BridgeError::illegal_state(0, format!("no pipeline stage {}", base)))?;
        self.insert(at + 1, name, stage)
    }

    pub fn remove(&mut self, name: &str) -> Option<Arc<dyn Stage>> {
        self.index(name).map(|i| self.stages.remove(i).1)
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Stage>> {
        self.index(name).map(|i| self.stages[i].1.clone())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index(name).is_some()
    }

    /// Keep only the stages for which `keep` returns true.
    pub fn retain<F>(&mut self, mut keep: F)
    where
        F: FnMut(&str, &Arc<dyn Stage>) -> bool,
    {
        self.stages.retain(|(name, stage)| keep(name, stage));
    }

    pub fn names(&self) -> Vec<String> {
        self.stages.iter().map(|(n, _)| n.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Stages in head → tail order.
    pub(crate) fn snapshot(&self) -> Vec<Arc<dyn Stage>> {
        self.stages.iter().map(|(_, s)| s.clone()).collect()
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.stages.iter().map(|(n, _)| n)).finish()
    }
}
