//! Channel abstraction for SMS I/O.
//!
//! Inbound arrives through the webhook router; outbound goes through a
//! `Responder`.

pub mod log;
pub mod twilio;
pub mod webhook;

pub use log::LogResponder;
pub use twilio::{TwilioConfig, TwilioResponder};

use async_trait::async_trait;

use crate::error::ChannelError;

/// Outbound SMS transport.
#[async_trait]
pub trait Responder: Send + Sync {
    /// Channel name used in logs and errors.
    fn name(&self) -> &str;

    /// Send `text` to `destination` from `origin`.
    async fn send(&self, destination: &str, origin: &str, text: &str)
    -> Result<(), ChannelError>;
}
