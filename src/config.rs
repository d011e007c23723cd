//! Configuration types.

use std::path::PathBuf;
use std::str::FromStr;

use secrecy::SecretString;

use crate::channels::TwilioConfig;
use crate::error::ConfigError;
use crate::llm::{LlmBackend, LlmConfig};
use crate::pipeline::GateMode;

/// Which admission queue implementation to run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum QueueBackend {
    /// Durable queue in the libSQL database file.
    #[default]
    Sqlite,
    /// In-process queue. Lost on restart.
    Memory,
}

impl FromStr for QueueBackend {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sqlite" | "libsql" => Ok(Self::Sqlite),
            "memory" => Ok(Self::Memory),
            other => Err(ConfigError::InvalidValue {
                key: "PIGEON_QUEUE_BACKEND".to_string(),
                message: format!("expected 'sqlite' or 'memory', got '{other}'"),
            }),
        }
    }
}

/// Service configuration.
#[derive(Debug, Clone)]
pub struct PigeonConfig {
    /// HTTP port for the webhook.
    pub port: u16,
    pub db_path: PathBuf,
    pub queue_name: String,
    /// Log collection the message records live in.
    pub collection: String,
    pub gate: GateMode,
    pub queue_backend: QueueBackend,
    /// Purge the admission queue at startup.
    pub reset_on_start: bool,
    /// Clear the message log at startup.
    pub clear_log_on_start: bool,
    pub analyzer: LlmConfig,
    /// `None` → canned fallback replies.
    pub fallback: Option<LlmConfig>,
    /// `None` → deferred replies are only logged.
    pub twilio: Option<TwilioConfig>,
}

impl PigeonConfig {
    /// Build config from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build config from any key lookup. Empty values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let port: u16 = match get("PIGEON_PORT") {
            Some(v) => v.trim().parse().map_err(|e| ConfigError::InvalidValue {
                key: "PIGEON_PORT".to_string(),
                message: format!("{e}"),
            })?,
            None => 8000,
        };

        let gate = get("PIGEON_GATE_MODE")
            .map(|v| v.parse::<GateMode>())
            .transpose()?
            .unwrap_or_default();
        let queue_backend = get("PIGEON_QUEUE_BACKEND")
            .map(|v| v.parse::<QueueBackend>())
            .transpose()?
            .unwrap_or_default();

        let openai_key = get("OPENAI_API_KEY")
            .ok_or_else(|| ConfigError::MissingEnvVar("OPENAI_API_KEY".to_string()))?;
        let analyzer = LlmConfig {
            backend: LlmBackend::OpenAi,
            api_key: SecretString::from(openai_key),
            model: get("PIGEON_ANALYZER_MODEL").unwrap_or_else(|| "gpt-4".to_string()),
        };

        let fallback = get("XAI_API_KEY").map(|key| LlmConfig {
            backend: LlmBackend::Xai,
            api_key: SecretString::from(key),
            model: get("PIGEON_FALLBACK_MODEL").unwrap_or_else(|| "grok-3".to_string()),
        });

        Ok(Self {
            port,
            db_path: PathBuf::from(
                get("PIGEON_DB_PATH").unwrap_or_else(|| "./data/pigeon.db".to_string()),
            ),
            queue_name: get("PIGEON_QUEUE_NAME").unwrap_or_else(|| "sms_messages".to_string()),
            collection: get("PIGEON_COLLECTION").unwrap_or_else(|| "sms_messages".to_string()),
            gate,
            queue_backend,
            reset_on_start: parse_flag("PIGEON_RESET_ON_START", get("PIGEON_RESET_ON_START"), true)?,
            clear_log_on_start: parse_flag(
                "PIGEON_CLEAR_LOG_ON_START",
                get("PIGEON_CLEAR_LOG_ON_START"),
                false,
            )?,
            analyzer,
            fallback,
            twilio: TwilioConfig::from_lookup(&lookup),
        })
    }
}

fn parse_flag(key: &str, value: Option<String>, default: bool) -> Result<bool, ConfigError> {
    let Some(value) = value else {
        return Ok(default);
    };
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected a boolean, got '{other}'"),
        }),
    }
}
