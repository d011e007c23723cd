//! Responder that only logs. Used when no SMS provider is configured.

use async_trait::async_trait;
use tracing::info;

use super::Responder;
use crate::error::ChannelError;

#[derive(Debug, Default)]
pub struct LogResponder;

#[async_trait]
impl Responder for LogResponder {
    fn name(&self) -> &str {
        "log"
    }

    async fn send(
        &self,
        destination: &str,
        origin: &str,
        text: &str,
    ) -> Result<(), ChannelError> {
        info!(
            to = destination,
            from = origin,
            chars = text.chars().count(),
            "Outbound SMS (log only)"
        );
        Ok(())
    }
}
