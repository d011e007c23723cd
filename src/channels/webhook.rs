//! HTTP webhook — Twilio posts inbound SMS here and reads TwiML back.
//!
//! - `POST /message` — form-encoded Twilio fields, answers `application/xml`
//! - `GET /health` — liveness check

use std::sync::Arc;

use axum::extract::{Form, State};
use axum::http::header;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use tower_http::trace::TraceLayer;

use crate::pipeline::processor::MessageProcessor;
use crate::pipeline::types::InboundMessage;

/// Shared state for webhook routes.
#[derive(Clone)]
pub struct WebhookState {
    pub processor: Arc<MessageProcessor>,
}

/// Inbound SMS form as posted by Twilio. Extra fields are ignored.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SmsForm {
    pub from: String,
    pub to: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub message_sid: Option<String>,
    #[serde(default)]
    pub account_sid: Option<String>,
}

impl From<SmsForm> for InboundMessage {
    fn from(form: SmsForm) -> Self {
        let mut message = InboundMessage::new(form.from, form.to, form.body);
        message.correlation_id = form.message_sid.filter(|s| !s.is_empty());
        message.account_id = form.account_sid.filter(|s| !s.is_empty());
        message
    }
}

/// POST /message
async fn receive_message(
    State(state): State<WebhookState>,
    Form(form): Form<SmsForm>,
) -> impl IntoResponse {
    let processed = state.processor.process(form.into()).await;
    (
        [(header::CONTENT_TYPE, "application/xml")],
        twiml(processed.reply.as_deref()),
    )
}

/// GET /health
async fn health() -> impl IntoResponse {
    Json(serde_json::json!({"status": "ok"}))
}

/// Render a TwiML response, with a `<Message>` only for a non-empty reply.
pub fn twiml(reply: Option<&str>) -> String {
    match reply.filter(|r| !r.is_empty()) {
        Some(text) => format!(
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?><Response><Message>{}</Message></Response>",
            xml_escape(text)
        ),
        None => "<?xml version=\"1.0\" encoding=\"UTF-8\"?><Response></Response>".to_string(),
    }
}

fn xml_escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            c => out.push(c),
        }
    }
    out
}

/// Build the webhook routes.
pub fn webhook_routes(state: WebhookState) -> Router {
    Router::new()
        .route("/message", post(receive_message))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
