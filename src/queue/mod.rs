//! Admission queue — counting queue used as the processing-slot signal.
//!
//! Only depth matters to the gate: depth 0 means the slot is FREE, anything
//! else means OCCUPIED. Entries are never consumed one by one; a finished
//! pass purges the whole queue.

pub mod memory;

pub use memory::InMemoryQueue;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::QueueError;
use crate::pipeline::types::InboundMessage;

/// Result of an atomic publish-if-empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// Queue was empty and now holds our entry.
    Claimed,
    /// Queue already held entries. Nothing was published.
    Occupied { depth: u64 },
}

/// Backend-agnostic admission queue.
///
/// `depth`, `publish`, `purge_all` and `try_claim` declare the queue
/// implicitly. `declare` is idempotent.
#[async_trait]
pub trait AdmissionQueue: Send + Sync {
    /// Declare a named queue.
    async fn declare(&self, name: &str) -> Result<(), QueueError>;

    /// Current number of entries.
    async fn depth(&self, name: &str) -> Result<u64, QueueError>;

    /// Append an entry.
    async fn publish(&self, name: &str, payload: &QueueEntry) -> Result<(), QueueError>;

    /// Remove every entry. Returns how many were removed.
    async fn purge_all(&self, name: &str) -> Result<u64, QueueError>;

    /// Publish `payload` only if the queue is empty, as one atomic step.
    async fn try_claim(&self, name: &str, payload: &QueueEntry)
    -> Result<ClaimOutcome, QueueError>;
}

/// Why an entry sits in the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    /// Held by an admission pass while it persists and analyzes.
    Claim,
    /// Held until a deferred dispatch fires.
    Deferred,
}

/// JSON payload published to the admission queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub kind: EntryKind,
    pub from: String,
    pub to: String,
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl QueueEntry {
    pub fn for_message(kind: EntryKind, message: &InboundMessage) -> Self {
        Self {
            kind,
            from: message.sender.clone(),
            to: message.recipient.clone(),
            body: message.body.clone(),
            correlation_id: message.correlation_id.clone(),
        }
    }

    pub fn to_json(&self) -> Result<String, QueueError> {
        Ok(serde_json::to_string(self)?)
    }
}
