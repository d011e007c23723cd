//! Error types for Pigeon.

use serde::{Deserialize, Serialize};

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Durable log errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),
}

/// Admission queue errors.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Queue backend unreachable: {0}")]
    Unavailable(String),

    #[error("Queue {queue} operation {op} failed: {reason}")]
    OperationFailed {
        queue: String,
        op: &'static str,
        reason: String,
    },

    #[error("Invalid queue payload: {0}")]
    Payload(#[from] serde_json::Error),
}

/// Outbound channel errors.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Failed to send on channel {name}: {reason}")]
    SendFailed { name: String, reason: String },

    #[error("Channel {name} rejected request with status {status}: {body}")]
    Rejected {
        name: String,
        status: u16,
        body: String,
    },
}

/// LLM provider errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },
}

/// Pipeline errors.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Queue check failed: {0}")]
    QueueCheck(#[source] QueueError),

    #[error("Slot marking failed: {0}")]
    SlotMark(#[source] QueueError),

    #[error("Persistence failed: {0}")]
    Persistence(#[from] DatabaseError),

    #[error("Dispatch failed: {0}")]
    Dispatch(#[from] ChannelError),
}

impl PipelineError {
    /// Classify this error for reporting across the admission boundary.
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::QueueCheck(_) | Self::SlotMark(_) => FailureKind::TransportError,
            Self::Persistence(_) => FailureKind::PersistenceError,
            Self::Dispatch(_) => FailureKind::DispatchError,
        }
    }
}

/// Failure classes reported by the admission core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    /// Queue or store unreachable. Caller falls back to an immediate reply.
    TransportError,
    /// Insert or read failed after the store was reached.
    PersistenceError,
    /// Decision extraction exhausted every tier. Recovered as `delay = 0`.
    AnalysisParseError,
    /// A deferred send failed. The slot is still released.
    DispatchError,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::TransportError => "TransportError",
            Self::PersistenceError => "PersistenceError",
            Self::AnalysisParseError => "AnalysisParseError",
            Self::DispatchError => "DispatchError",
        };
        f.write_str(s)
    }
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;
