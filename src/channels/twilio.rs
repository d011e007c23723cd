//! Twilio SMS responder — Programmable Messaging REST API.

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};

use super::Responder;
use crate::error::ChannelError;

const TWILIO_API_BASE: &str = "https://api.twilio.com";

// ── Configuration ───────────────────────────────────────────────────

/// Twilio configuration, built from environment variables.
#[derive(Debug, Clone)]
pub struct TwilioConfig {
    pub account_sid: String,
    pub auth_token: SecretString,
    /// Sender number used when the caller gives no origin.
    pub from_number: String,
    pub api_base: String,
}

impl TwilioConfig {
    /// Build config from any key lookup.
    /// Returns `None` if `TWILIO_ACCOUNT_SID` or `TWILIO_AUTH_TOKEN` is not set.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Option<Self> {
        let account_sid = lookup("TWILIO_ACCOUNT_SID").filter(|s| !s.is_empty())?;
        let auth_token = lookup("TWILIO_AUTH_TOKEN").filter(|s| !s.is_empty())?;
        let from_number = lookup("TWILIO_FROM_NUMBER").unwrap_or_default();
        let api_base = lookup("TWILIO_API_BASE").unwrap_or_else(|| TWILIO_API_BASE.to_string());

        Some(Self {
            account_sid,
            auth_token: SecretString::from(auth_token),
            from_number,
            api_base,
        })
    }
}

// ── Responder ───────────────────────────────────────────────────────

pub struct TwilioResponder {
    config: TwilioConfig,
    client: reqwest::Client,
}

impl TwilioResponder {
    pub fn new(config: TwilioConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    fn messages_url(&self) -> String {
        format!(
            "{}/2010-04-01/Accounts/{}/Messages.json",
            self.config.api_base.trim_end_matches('/'),
            self.config.account_sid
        )
    }
}

#[async_trait]
impl Responder for TwilioResponder {
    fn name(&self) -> &str {
        "twilio"
    }

    async fn send(
        &self,
        destination: &str,
        origin: &str,
        text: &str,
    ) -> Result<(), ChannelError> {
        let from = if origin.is_empty() {
            self.config.from_number.as_str()
        } else {
            origin
        };

        let resp = self
            .client
            .post(self.messages_url())
            .basic_auth(
                &self.config.account_sid,
                Some(self.config.auth_token.expose_secret()),
            )
            .form(&[("To", destination), ("From", from), ("Body", text)])
            .send()
            .await
            .map_err(|e| ChannelError::SendFailed {
                name: "twilio".into(),
                reason: e.to_string(),
            })?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ChannelError::Rejected {
                name: "twilio".into(),
                status: status.as_u16(),
                body,
            });
        }

        tracing::info!(to = destination, from = from, "SMS sent via Twilio");
        Ok(())
    }
}
