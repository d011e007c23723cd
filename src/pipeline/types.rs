//! Shared types for the admission pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::FailureKind;
use crate::pipeline::decision::Decision;

// ── Inbound message ─────────────────────────────────────────────────

/// One inbound SMS event, as handed over by the webhook.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    /// Sender phone number.
    pub sender: String,
    /// Recipient phone number (our provider number).
    pub recipient: String,
    /// Message text. May be empty.
    pub body: String,
    /// Provider message id (e.g. Twilio `MessageSid`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// Provider account id (e.g. Twilio `AccountSid`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
}

impl InboundMessage {
    pub fn new(
        sender: impl Into<String>,
        recipient: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            sender: sender.into(),
            recipient: recipient.into(),
            body: body.into(),
            correlation_id: None,
            account_id: None,
        }
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn with_account_id(mut self, id: impl Into<String>) -> Self {
        self.account_id = Some(id.into());
        self
    }
}

// ── Durable log record ──────────────────────────────────────────────

/// A message as persisted in the durable log. Immutable once inserted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: String,
    pub sender: String,
    pub recipient: String,
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
    /// Assigned by the log at insertion. Non-decreasing across inserts.
    pub received_at: DateTime<Utc>,
}

/// A single turn of the transcript handed to the analyzer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptTurn {
    pub role: String,
    pub from: String,
    pub to: String,
    pub content: String,
    pub timestamp: String,
}

impl From<&MessageRecord> for TranscriptTurn {
    fn from(record: &MessageRecord) -> Self {
        Self {
            role: "user".to_string(),
            from: record.sender.clone(),
            to: record.recipient.clone(),
            content: record.body.clone(),
            timestamp: record.received_at.to_rfc3339(),
        }
    }
}

// ── Admission result ────────────────────────────────────────────────

/// Outcome of an admission attempt.
///
/// Serializes as an externally tagged union:
/// `{"Claimed":{"totalInLog":1,"decision":{"delay":"0"}}}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AdmissionResult {
    /// Slot was free. Message persisted, analyzer ran over the full log.
    #[serde(rename_all = "camelCase")]
    Claimed { total_in_log: u64, decision: Decision },
    /// Slot was occupied. Nothing persisted.
    #[serde(rename_all = "camelCase")]
    Skipped { current_depth: u64 },
    /// Queue check or persistence failed. Nothing persisted.
    #[serde(rename_all = "camelCase")]
    Failed { cause: FailureKind, detail: String },
}

impl AdmissionResult {
    /// Short label for logging.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Claimed { .. } => "claimed",
            Self::Skipped { .. } => "skipped",
            Self::Failed { .. } => "failed",
        }
    }
}

// ── Processing outcome ──────────────────────────────────────────────

/// What the processor did with a message, returned to the webhook.
#[derive(Debug, Clone)]
pub struct ProcessedMessage {
    pub admission: AdmissionResult,
    /// Text to return inline to the sender, if any.
    pub reply: Option<String>,
    /// Set when a deferred dispatch was armed for this message.
    pub deferred: Option<DeferredInfo>,
    pub processed_at: DateTime<Utc>,
}

/// Summary of an armed deferred dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeferredInfo {
    pub dispatch_id: uuid::Uuid,
    pub destination: String,
    pub after: std::time::Duration,
}
