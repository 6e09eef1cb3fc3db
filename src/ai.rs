//! AI-assisted flows: sentiment scoring, article suggestions and the Oracle.
//!
//! The console only ever calls the `*_soft` wrappers. They bound every call
//! with a timeout and turn failures into neutral defaults, so no AI outage can
//! block or fail a chat operation.

use std::{collections::HashSet, time::Duration};

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde_json::{json, Value};

use crate::{
    config::AppConfig,
    error::{ConsoleError, Result},
    prompting::{
        render_oracle_prompt, render_sentiment_prompt, render_suggestions_prompt, MAX_SUGGESTIONS,
    },
    types::{AiAnalysis, Article, ArticleSuggestion},
};

pub const ORACLE_FALLBACK_ANSWER: &str = "Sorry, I could not process your question right now.";

#[async_trait]
pub trait AiFlows: Send + Sync {
    async fn score_sentiment(&self, text: &str) -> Result<AiAnalysis>;

    async fn suggest_articles(
        &self,
        conversation: &str,
        articles: &[Article],
    ) -> Result<Vec<ArticleSuggestion>>;

    async fn answer_from_knowledge_base(&self, question: &str, corpus: &str) -> Result<String>;
}

/// OpenAI-compatible chat-completions client.
pub struct OpenAiFlows {
    client: reqwest::Client,
    base_url: String,
    model: String,
    api_key: SecretString,
}

impl OpenAiFlows {
    pub fn new(
        base_url: impl Into<String>,
        model: impl Into<String>,
        api_key: SecretString,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            model: model.into(),
            api_key,
        }
    }

    /// `None` when no API key is configured.
    pub fn from_config(config: &AppConfig) -> Option<Self> {
        let key = config.openai_api_key.as_ref()?;
        Some(Self::new(
            config.openai_base_url.clone(),
            config.openai_chat_model.clone(),
            SecretString::from(key.expose_secret().to_owned()),
        ))
    }

    async fn chat_completion_text(&self, system: &str, user: &str) -> Result<String> {
        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(self.api_key.expose_secret())
            .json(&json!({
                "model": self.model,
                "messages": [
                    { "role": "system", "content": system },
                    { "role": "user", "content": user }
                ],
                "temperature": 0.1
            }))
            .send()
            .await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ConsoleError::ExternalService(format!(
                "completion returned {status}: {body}"
            )));
        }
        let payload = response.json::<Value>().await?;
        let text = payload
            .get("choices")
            .and_then(Value::as_array)
            .and_then(|choices| choices.first())
            .and_then(|choice| choice.get("message"))
            .and_then(|msg| msg.get("content"))
            .and_then(Value::as_str)
            .map(str::trim)
            .unwrap_or("")
            .to_string();
        if text.is_empty() {
            return Err(ConsoleError::ExternalService(
                "completion had empty content".to_string(),
            ));
        }
        Ok(text)
    }
}

#[async_trait]
impl AiFlows for OpenAiFlows {
    async fn score_sentiment(&self, text: &str) -> Result<AiAnalysis> {
        let reply = self
            .chat_completion_text(&render_sentiment_prompt(), text)
            .await?;
        parse_sentiment_reply(&reply)
    }

    async fn suggest_articles(
        &self,
        conversation: &str,
        articles: &[Article],
    ) -> Result<Vec<ArticleSuggestion>> {
        if articles.is_empty() {
            return Ok(Vec::new());
        }
        let reply = self
            .chat_completion_text(&render_suggestions_prompt(articles), conversation)
            .await?;
        parse_suggestions_reply(&reply)
    }

    async fn answer_from_knowledge_base(&self, question: &str, corpus: &str) -> Result<String> {
        self.chat_completion_text(&render_oracle_prompt(corpus), question)
            .await
    }
}

/// Pulls the first JSON document out of a model reply, tolerating code fences
/// and surrounding prose.
pub fn extract_json(reply: &str) -> Option<Value> {
    let trimmed = reply.trim();
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return Some(value);
    }
    let start = trimmed.find(|c: char| c == '{' || c == '[')?;
    let end = trimmed.rfind(|c: char| c == '}' || c == ']')?;
    if end <= start {
        return None;
    }
    serde_json::from_str::<Value>(&trimmed[start..=end]).ok()
}

fn number_field(value: &Value, keys: &[&str]) -> Option<f64> {
    keys.iter().find_map(|key| {
        let field = value.get(*key)?;
        field
            .as_f64()
            .or_else(|| field.as_str().and_then(|s| s.trim().parse::<f64>().ok()))
    })
}

pub fn parse_sentiment_reply(reply: &str) -> Result<AiAnalysis> {
    let value = extract_json(reply).ok_or_else(|| {
        ConsoleError::ExternalService("sentiment reply was not JSON".to_string())
    })?;
    let score = number_field(&value, &["sentimentScore", "sentiment_score", "score"])
        .filter(|s| s.is_finite())
        .ok_or_else(|| {
            ConsoleError::ExternalService("sentiment reply had no score".to_string())
        })?;
    let confidence = number_field(&value, &["confidenceIndex", "confidence_index", "confidence"])
        .filter(|c| c.is_finite())
        .unwrap_or(0.5);
    Ok(AiAnalysis::clamped(score, confidence))
}

pub fn parse_suggestions_reply(reply: &str) -> Result<Vec<ArticleSuggestion>> {
    let value = extract_json(reply).ok_or_else(|| {
        ConsoleError::ExternalService("suggestion reply was not JSON".to_string())
    })?;
    let items = value
        .get("suggestions")
        .and_then(Value::as_array)
        .or_else(|| value.as_array())
        .cloned()
        .unwrap_or_default();
    Ok(items
        .iter()
        .filter_map(|item| {
            let id = item.get("id").and_then(Value::as_str)?.trim().to_string();
            if id.is_empty() {
                return None;
            }
            let relevance_score = number_field(item, &["relevanceScore", "relevance_score", "score"])
                .filter(|s| s.is_finite())
                .unwrap_or(0.0)
                .clamp(0.0, 1.0);
            Some(ArticleSuggestion { id, relevance_score })
        })
        .collect())
}

pub async fn score_sentiment_soft(
    ai: &dyn AiFlows,
    text: &str,
    timeout: Duration,
) -> Option<AiAnalysis> {
    match tokio::time::timeout(timeout, ai.score_sentiment(text)).await {
        Ok(Ok(analysis)) => Some(analysis),
        Ok(Err(err)) => {
            tracing::warn!(error = %err, "sentiment scoring failed");
            None
        }
        Err(_) => {
            tracing::warn!(timeout_ms = timeout.as_millis() as u64, "sentiment scoring timed out");
            None
        }
    }
}

/// Suggestions restricted to known articles, best first.
pub async fn suggest_articles_soft(
    ai: &dyn AiFlows,
    conversation: &str,
    articles: &[Article],
    timeout: Duration,
) -> Vec<ArticleSuggestion> {
    let raw = match tokio::time::timeout(timeout, ai.suggest_articles(conversation, articles)).await
    {
        Ok(Ok(list)) => list,
        Ok(Err(err)) => {
            tracing::warn!(error = %err, "article suggestion failed");
            return Vec::new();
        }
        Err(_) => {
            tracing::warn!(timeout_ms = timeout.as_millis() as u64, "article suggestion timed out");
            return Vec::new();
        }
    };

    let known = articles.iter().map(|a| a.id.as_str()).collect::<HashSet<_>>();
    let mut seen = HashSet::new();
    let mut list = raw
        .into_iter()
        .filter(|s| known.contains(s.id.as_str()) && seen.insert(s.id.clone()))
        .collect::<Vec<_>>();
    list.sort_by(|a, b| b.relevance_score.total_cmp(&a.relevance_score));
    list.truncate(MAX_SUGGESTIONS);
    list
}

pub async fn answer_soft(
    ai: &dyn AiFlows,
    question: &str,
    corpus: &str,
    timeout: Duration,
) -> String {
    match tokio::time::timeout(timeout, ai.answer_from_knowledge_base(question, corpus)).await {
        Ok(Ok(answer)) if !answer.trim().is_empty() => answer,
        Ok(Ok(_)) => ORACLE_FALLBACK_ANSWER.to_string(),
        Ok(Err(err)) => {
            tracing::warn!(error = %err, "oracle answer failed");
            ORACLE_FALLBACK_ANSWER.to_string()
        }
        Err(_) => {
            tracing::warn!(timeout_ms = timeout.as_millis() as u64, "oracle answer timed out");
            ORACLE_FALLBACK_ANSWER.to_string()
        }
    }
}
