//! Fallback replier — the immediate answer when a message is not admitted.
//!
//! The sender either asks about a reply that is still held back, or sends a
//! new message before the held one went out. An LLM writes a short, blunt
//! reply for either case; canned text covers the rest.

use std::sync::Arc;

use crate::llm::provider::{ChatMessage, CompletionRequest, LlmProvider};

pub const NOT_CONFIGURED_REPLY: &str =
    "Sorry, Grok is not configured properly. Please contact support.";
pub const UNAVAILABLE_REPLY: &str =
    "Sorry, I'm having trouble processing your message right now. Please try again later.";

const FALLBACK_MAX_TOKENS: u32 = 50;
const FALLBACK_TEMPERATURE: f32 = 0.9;

const FALLBACK_SYSTEM_PROMPT: &str = "You are Grok, a blunt, no-nonsense SMS chatbot. \
     Every user message is one of two cases. Write a fresh reply every time:\n\
     - Case 1: they are asking about the status of an earlier message. Tell them, with \
     attitude, that it goes out when it goes out and they should relax.\n\
     - Case 2: anything else means they sent another message before the last one was \
     delivered. Tease them for being impatient and tell them to wait for the last one.\n\
     Keep it short and cheeky. No poetry.";

pub struct FallbackReplier {
    llm: Option<Arc<dyn LlmProvider>>,
}

impl FallbackReplier {
    pub fn new(llm: Option<Arc<dyn LlmProvider>>) -> Self {
        Self { llm }
    }

    /// Reply text for `body`. Never fails.
    pub async fn reply(&self, body: &str) -> String {
        let Some(llm) = &self.llm else {
            tracing::warn!("Fallback LLM not configured");
            return NOT_CONFIGURED_REPLY.to_string();
        };

        let request = CompletionRequest::new(vec![
            ChatMessage::system(FALLBACK_SYSTEM_PROMPT),
            ChatMessage::user(format!("User message: {body}")),
        ])
        .with_max_tokens(FALLBACK_MAX_TOKENS)
        .with_temperature(FALLBACK_TEMPERATURE);

        match llm.complete(request).await {
            Ok(response) => {
                let text = response.content.trim();
                if text.is_empty() {
                    UNAVAILABLE_REPLY.to_string()
                } else {
                    text.to_string()
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Fallback reply failed");
                UNAVAILABLE_REPLY.to_string()
            }
        }
    }
}
