//! Conversation analyzer — asks an LLM how long to hold the reply back.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::LlmError;
use crate::llm::provider::{ChatMessage, CompletionRequest, LlmProvider};
use crate::pipeline::types::{MessageRecord, TranscriptTurn};

/// Max tokens for the analysis call. The answer is a one-field JSON object.
const ANALYSIS_MAX_TOKENS: u32 = 150;

const ANALYSIS_TEMPERATURE: f32 = 0.3;

const ANALYSIS_SYSTEM_PROMPT: &str = "You are an expert at analyzing conversations for \
     time-sensitive content. Always respond with valid JSON format.";

/// Transcript in, raw decision text out.
#[async_trait]
pub trait Analyzer: Send + Sync {
    async fn analyze(&self, transcript: &[MessageRecord]) -> Result<String, LlmError>;
}

/// Analyzer backed by an LLM provider.
pub struct LlmAnalyzer {
    llm: Arc<dyn LlmProvider>,
}

impl LlmAnalyzer {
    pub fn new(llm: Arc<dyn LlmProvider>) -> Self {
        Self { llm }
    }
}

#[async_trait]
impl Analyzer for LlmAnalyzer {
    async fn analyze(&self, transcript: &[MessageRecord]) -> Result<String, LlmError> {
        let request = CompletionRequest::new(vec![
            ChatMessage::system(ANALYSIS_SYSTEM_PROMPT),
            ChatMessage::user(build_analysis_prompt(transcript)?),
        ])
        .with_max_tokens(ANALYSIS_MAX_TOKENS)
        .with_temperature(ANALYSIS_TEMPERATURE);

        tracing::debug!(
            turns = transcript.len(),
            model = self.llm.model_name(),
            "Analyzing conversation"
        );
        let response = self.llm.complete(request).await?;
        Ok(response.content.trim().to_string())
    }
}

/// Build the time-sensitivity prompt around the transcript as pretty JSON.
fn build_analysis_prompt(transcript: &[MessageRecord]) -> Result<String, LlmError> {
    let turns: Vec<TranscriptTurn> = transcript.iter().map(TranscriptTurn::from).collect();
    let conversation = serde_json::to_string_pretty(&turns)?;

    Ok(format!(
        "Read the multi-turn conversation below and decide whether it is time-sensitive. \
         If it is, answer with the worst possible time to reply, i.e. the delay after which \
         the reply is too late and the plan falls through.\n\n\
         Output exactly `{{\"delay\": \"\"}}`.\n\n\
         Greetings and casual chat get delay 0 until a plan appears. \
         A plan that is only being proposed or started also gets 0. \
         Once the plan is on, delay the reply when ETA or other time-sensitive messages arrive.\n\n\
         Typical delays:\n\
         - movie plan: 2 hours\n\
         - dinner plan: 1 hour\n\
         - lunch plan: 30 mins\n\
         - breakfast plan: 15 mins\n\
         - brunch plan: 1 hour\n\
         - death message: 1 month\n\n\
         Conversation:\n\n\"\"\"\n{conversation}\n\"\"\"\n"
    ))
}
