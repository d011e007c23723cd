//! `MessageLog` trait — append-only durable record of inbound messages.

use async_trait::async_trait;

use crate::error::DatabaseError;
use crate::pipeline::types::{InboundMessage, MessageRecord};

/// Backend-agnostic message log.
///
/// Records are immutable once appended. The only removal is `clear_all`.
#[async_trait]
pub trait MessageLog: Send + Sync {
    /// Insert one record. The log assigns `id` and `received_at`.
    async fn append(&self, message: &InboundMessage) -> Result<MessageRecord, DatabaseError>;

    /// Every record, in insertion order.
    async fn read_all(&self) -> Result<Vec<MessageRecord>, DatabaseError>;

    /// Number of records.
    async fn count(&self) -> Result<u64, DatabaseError>;

    /// Delete every record. Returns how many were deleted.
    async fn clear_all(&self) -> Result<u64, DatabaseError>;
}
