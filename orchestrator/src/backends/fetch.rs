use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use tracing::debug;

use super::ContentFetcher;
use crate::config::FetchConfig;
use crate::error::BackendError;

const SERVICE: &str = "fetch";

/// Fetches a page and converts HTML to plain text.
pub struct HttpFetcher {
    client: reqwest::Client,
    max_body_bytes: usize,
}

impl HttpFetcher {
    pub fn new(config: &FetchConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(concat!("report-orchestrator/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self {
            client,
            max_body_bytes: config.max_body_bytes,
        })
    }
}

#[async_trait]
impl ContentFetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<String, BackendError> {
        let mut resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| BackendError::from_reqwest(SERVICE, e))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(BackendError::from_status(SERVICE, status.as_u16(), String::new(), None));
        }

        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        if let Some(declared) = resp.content_length() {
            if declared > self.max_body_bytes as u64 {
                return Err(BackendError::Permanent {
                    service: SERVICE.to_string(),
                    message: format!("body of {} bytes exceeds {} byte limit", declared, self.max_body_bytes),
                });
            }
        }

        let mut body = Vec::new();
        while let Some(chunk) = resp
            .chunk()
            .await
            .map_err(|e| BackendError::from_reqwest(SERVICE, e))?
        {
            if append_limited(&mut body, &chunk, self.max_body_bytes) {
                debug!(url, limit = self.max_body_bytes, "Page body truncated");
                break;
            }
        }

        debug!(url, bytes = body.len(), content_type = %content_type, "Fetched page");
        Ok(page_text(&body, &content_type, self.max_body_bytes))
    }
}

/// Append `chunk` to `body` without growing past `limit`. Returns true once
/// the limit is reached.
fn append_limited(body: &mut Vec<u8>, chunk: &[u8], limit: usize) -> bool {
    let room = limit.saturating_sub(body.len());
    body.extend_from_slice(&chunk[..chunk.len().min(room)]);
    body.len() >= limit
}

/// Plain text of at most `max_bytes` of a response body, converting HTML when
/// the content type says so.
pub fn page_text(body: &[u8], content_type: &str, max_bytes: usize) -> String {
    let body = &body[..body.len().min(max_bytes)];
    if content_type.contains("html") {
        html2text::from_read(body, 120).unwrap_or_else(|_| String::from_utf8_lossy(body).to_string())
    } else {
        String::from_utf8_lossy(body).to_string()
    }
}
