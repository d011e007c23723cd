//! Inbound SMS pipeline.
//!
//! Every webhook message flows through:
//! 1. `AdmissionController::admit()` — slot gate, log append, analysis
//! 2. `extract_delay()` — analyzer text → `Decision`
//! 3. `DeferredDispatcher` — held replies, slot release
//! 4. `FallbackReplier` — immediate answer when not admitted

pub mod admission;
pub mod analyzer;
pub mod decision;
pub mod dispatch;
pub mod fallback;
pub mod processor;
pub mod types;

pub use admission::{AdmissionController, GateMode};
pub use analyzer::{Analyzer, LlmAnalyzer};
pub use decision::{Decision, extract_delay};
pub use dispatch::{DeferredDispatcher, PendingDispatchInfo};
pub use fallback::FallbackReplier;
pub use processor::MessageProcessor;
pub use types::{AdmissionResult, InboundMessage, MessageRecord, ProcessedMessage};
