//! Process configuration, read once from the environment at start-up.

use std::{env, time::Duration};

use secrecy::SecretString;

pub const DEFAULT_PRE_SERVICE_QUEUE: &str = "pré-atendimento";

#[derive(Debug)]
pub struct AppConfig {
    pub port: u16,
    /// Name of the queue that receives first contacts when no queue is hinted.
    pub pre_service_queue_name: String,
    pub openai_api_key: Option<SecretString>,
    pub openai_base_url: String,
    pub openai_chat_model: String,
    pub ai_timeout: Duration,
    pub whatsapp_verify_token: Option<String>,
    pub seed_directory: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            port: 4000,
            pre_service_queue_name: DEFAULT_PRE_SERVICE_QUEUE.to_string(),
            openai_api_key: None,
            openai_base_url: "https://api.openai.com/v1".to_string(),
            openai_chat_model: "gpt-4.1".to_string(),
            ai_timeout: Duration::from_millis(8000),
            whatsapp_verify_token: None,
            seed_directory: true,
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the config from any key lookup; unparsable values keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let text = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        Self {
            port: text("PORT")
                .and_then(|v| v.parse::<u16>().ok())
                .unwrap_or(defaults.port),
            pre_service_queue_name: text("PRE_SERVICE_QUEUE_NAME")
                .unwrap_or(defaults.pre_service_queue_name),
            openai_api_key: text("OPENAI_API_KEY").map(SecretString::from),
            openai_base_url: text("OPENAI_BASE_URL")
                .map(|v| v.trim_end_matches('/').to_string())
                .unwrap_or(defaults.openai_base_url),
            openai_chat_model: text("OPENAI_CHAT_MODEL").unwrap_or(defaults.openai_chat_model),
            ai_timeout: text("AI_TIMEOUT_MS")
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.ai_timeout),
            whatsapp_verify_token: text("WHATSAPP_VERIFY_TOKEN"),
            seed_directory: text("SEED_DIRECTORY")
                .map(|v| !matches!(v.to_ascii_lowercase().as_str(), "0" | "false" | "no"))
                .unwrap_or(defaults.seed_directory),
        }
    }
}
