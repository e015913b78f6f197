use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

/// Provider-agnostic LLM capability.
///
/// The router decides *which* model; this trait decides *how* to reach it.
/// Timeouts and retry counts belong to the provider, not the caller.
#[async_trait]
pub trait LLMProvider: Send + Sync {
    /// Generate a completion for `prompt`, optionally under a system prompt.
    async fn generate(
        &self,
        model: &str,
        prompt: String,
        system: Option<String>,
    ) -> Result<String>;

    /// Generate output expected to conform to a JSON schema.
    ///
    /// Default implementation folds the schema into the system prompt;
    /// providers with native structured output can override.
    async fn generate_structured(
        &self,
        model: &str,
        system: &str,
        user: &str,
        schema: &serde_json::Value,
    ) -> Result<serde_json::Value> {
        let wrapped_system = format!(
            "{}\n\nReturn ONLY valid JSON matching this schema, no markdown:\n{}",
            system, schema
        );
        let raw = self
            .generate(model, user.to_string(), Some(wrapped_system))
            .await?;
        crate::agent::parse_json_output(&raw)
            .ok_or_else(|| anyhow!("structured output was not valid JSON"))
    }
}

/// Provider for any OpenAI-compatible chat completions endpoint.
pub struct OpenAICompatibleProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    max_retries: usize,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

impl OpenAICompatibleProvider {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .unwrap_or_default();
        Self {
            client,
            base_url: base_url.into(),
            api_key,
            max_retries: 2,
        }
    }

    pub fn with_max_retries(mut self, retries: usize) -> Self {
        self.max_retries = retries;
        self
    }

    async fn request_once(
        &self,
        model: &str,
        prompt: &str,
        system: Option<&str>,
    ) -> Result<String> {
        let mut messages = Vec::new();
        if let Some(sys) = system {
            messages.push(json!({"role": "system", "content": sys}));
        }
        messages.push(json!({"role": "user", "content": prompt}));

        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        let mut req = self.client.post(&url).json(&json!({
            "model": model,
            "messages": messages,
        }));
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }

        let resp = req.send().await.context("LLM request failed")?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(anyhow!("LLM endpoint returned {}: {}", status, body));
        }

        let parsed: ChatResponse = resp.json().await.context("invalid LLM response body")?;
        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| anyhow!("LLM response contained no choices"))
    }
}

#[async_trait]
impl LLMProvider for OpenAICompatibleProvider {
    async fn generate(
        &self,
        model: &str,
        prompt: String,
        system: Option<String>,
    ) -> Result<String> {
        let mut last_err = None;
        for attempt in 0..=self.max_retries {
            match self.request_once(model, &prompt, system.as_deref()).await {
                Ok(text) => return Ok(text),
                Err(e) => {
                    debug!("LLM attempt {} failed: {}", attempt + 1, e);
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow!("LLM request failed")))
    }
}

/// Scripted provider replaying a queue of canned responses.
///
/// Used in tests and anywhere a deterministic executor is needed; the
/// last response repeats once the queue drains.
pub struct ScriptedProvider {
    responses: Arc<Mutex<VecDeque<String>>>,
    fallback: String,
}

impl ScriptedProvider {
    pub fn new<I, S>(responses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            responses: Arc::new(Mutex::new(
                responses.into_iter().map(Into::into).collect(),
            )),
            fallback: "ok".to_string(),
        }
    }

    pub fn with_fallback(mut self, fallback: impl Into<String>) -> Self {
        self.fallback = fallback.into();
        self
    }
}

#[async_trait]
impl LLMProvider for ScriptedProvider {
    async fn generate(
        &self,
        _model: &str,
        _prompt: String,
        _system: Option<String>,
    ) -> Result<String> {
        let mut queue = self.responses.lock().await;
        Ok(queue.pop_front().unwrap_or_else(|| self.fallback.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_provider_replays_then_falls_back() {
        let provider = ScriptedProvider::new(["first", "second"]).with_fallback("done");
        assert_eq!(provider.generate("m", "p".into(), None).await.unwrap(), "first");
        assert_eq!(provider.generate("m", "p".into(), None).await.unwrap(), "second");
        assert_eq!(provider.generate("m", "p".into(), None).await.unwrap(), "done");
    }

    #[tokio::test]
    async fn test_structured_default_parses_json() {
        let provider = ScriptedProvider::new([r#"{"score": 0.9}"#]);
        let value = provider
            .generate_structured("m", "sys", "user", &serde_json::json!({"type": "object"}))
            .await
            .unwrap();
        assert_eq!(value["score"], 0.9);
    }
}
