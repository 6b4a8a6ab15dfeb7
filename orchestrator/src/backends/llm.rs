// Generative text backends: OpenAI-compatible chat completions, and an
// offline stand-in that always reports itself unavailable.

use std::num::NonZeroU32;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use tracing::{debug, warn};

use super::{Message, TextGenerator};
use crate::config::LlmConfig;
use crate::error::BackendError;

const SERVICE: &str = "llm";

/// Used when no model is configured. Every stage falls back to its template.
pub struct OfflineGenerator;

#[async_trait]
impl TextGenerator for OfflineGenerator {
    async fn generate(&self, _messages: &[Message], _max_tokens: u32) -> Result<String, BackendError> {
        Err(BackendError::Unavailable(SERVICE.to_string()))
    }
}

pub struct OpenAiCompatClient {
    client: reqwest::Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
    temperature: f32,
}

impl OpenAiCompatClient {
    pub fn new(config: &LlmConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: config.base_url.clone(),
            model: config.model.clone(),
            api_key: config.api_key.clone().filter(|k| !k.is_empty()),
            temperature: config.temperature,
        })
    }

    /// Resolve the chat completions endpoint from the base URL.
    fn endpoint(&self) -> String {
        let base = self.base_url.trim_end_matches('/');
        if base.ends_with("/chat/completions") {
            base.to_string()
        } else if base.ends_with("/v1") {
            format!("{}/chat/completions", base)
        } else {
            format!("{}/v1/chat/completions", base)
        }
    }
}

#[async_trait]
impl TextGenerator for OpenAiCompatClient {
    async fn generate(&self, messages: &[Message], max_tokens: u32) -> Result<String, BackendError> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": messages,
            "temperature": self.temperature,
            "max_tokens": max_tokens,
        });

        let mut req = self.client.post(self.endpoint()).json(&body);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| BackendError::from_reqwest(SERVICE, e))?;

        let status = resp.status();
        if !status.is_success() {
            let retry_after = resp
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok());
            let text = resp.text().await.unwrap_or_default();
            return Err(BackendError::from_status(SERVICE, status.as_u16(), text, retry_after));
        }

        let json: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| BackendError::from_reqwest(SERVICE, e))?;

        let content = json["choices"]
            .get(0)
            .and_then(|c| c["message"]["content"].as_str())
            .unwrap_or("")
            .to_string();

        if content.trim().is_empty() {
            return Err(BackendError::Permanent {
                service: SERVICE.to_string(),
                message: "empty completion".to_string(),
            });
        }
        Ok(content)
    }
}

/// Spaces calls at least `min_interval` apart and retries throttled or
/// transient failures with a linearly growing wait.
pub struct ThrottledGenerator<G> {
    inner: G,
    limiter: Option<DefaultDirectRateLimiter>,
    max_retries: u32,
    backoff_step: Duration,
}

impl<G: TextGenerator> ThrottledGenerator<G> {
    pub fn new(inner: G, config: &LlmConfig) -> Self {
        let limiter = Quota::with_period(Duration::from_millis(config.min_interval_ms))
            .map(|quota| RateLimiter::direct(quota.allow_burst(NonZeroU32::MIN)));
        Self {
            inner,
            limiter,
            max_retries: config.max_retries,
            backoff_step: Duration::from_millis(config.retry_backoff_ms),
        }
    }

    fn backoff(&self, attempt: u32, err: &BackendError) -> Duration {
        let linear = self.backoff_step * (attempt + 1);
        match err {
            BackendError::RateLimited {
                retry_after_secs: Some(secs),
                ..
            } => linear.max(Duration::from_secs(*secs)),
            _ => linear,
        }
    }
}

#[async_trait]
impl<G: TextGenerator> TextGenerator for ThrottledGenerator<G> {
    async fn generate(&self, messages: &[Message], max_tokens: u32) -> Result<String, BackendError> {
        let mut attempt = 0;
        loop {
            if let Some(limiter) = &self.limiter {
                limiter.until_ready().await;
            }

            match self.inner.generate(messages, max_tokens).await {
                Ok(text) => {
                    debug!(attempt, chars = text.len(), "Generation succeeded");
                    return Ok(text);
                }
                Err(e) if e.is_retryable() && attempt < self.max_retries => {
                    let wait = self.backoff(attempt, &e);
                    warn!(
                        attempt = attempt + 1,
                        max = self.max_retries,
                        backoff_ms = wait.as_millis() as u64,
                        error = %e,
                        "Retrying generation after transient error"
                    );
                    tokio::time::sleep(wait).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
