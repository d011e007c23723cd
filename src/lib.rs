//! Pigeon — queue-gated SMS admission with delayed replies.

pub mod channels;
pub mod config;
pub mod error;
pub mod llm;
pub mod pipeline;
pub mod queue;
pub mod store;
