use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{SearchBackend, SearchResult};
use crate::config::SearchConfig;
use crate::error::BackendError;

const SERVICE: &str = "search";

#[derive(Serialize)]
struct SerperRequest<'a> {
    q: &'a str,
    num: usize,
}

#[derive(Deserialize)]
struct SerperResponse {
    #[serde(default)]
    organic: Vec<SerperResult>,
}

#[derive(Deserialize)]
struct SerperResult {
    title: String,
    link: String,
    #[serde(default)]
    snippet: String,
}

pub struct SerperSearch {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
}

impl SerperSearch {
    pub fn new(config: &SearchConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            api_key: config.api_key.clone().unwrap_or_default(),
        })
    }
}

#[async_trait]
impl SearchBackend for SerperSearch {
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchResult>, BackendError> {
        let resp = self
            .client
            .post(&self.endpoint)
            .header("X-API-KEY", &self.api_key)
            .json(&SerperRequest { q: query, num: limit })
            .send()
            .await
            .map_err(|e| BackendError::from_reqwest(SERVICE, e))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(BackendError::from_status(SERVICE, status.as_u16(), text, None));
        }

        let data: SerperResponse = resp
            .json()
            .await
            .map_err(|e| BackendError::from_reqwest(SERVICE, e))?;

        Ok(data
            .organic
            .into_iter()
            .take(limit)
            .map(|r| SearchResult {
                title: r.title,
                url: r.link,
                snippet: r.snippet,
            })
            .collect())
    }
}

/// Deterministic results used when no search provider is configured.
/// Every query yields the same anchor report, a publisher page and a
/// government page derived from the query, and one untrusted blog post.
pub struct PlaceholderSearch;

#[async_trait]
impl SearchBackend for PlaceholderSearch {
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchResult>, BackendError> {
        let terms: Vec<&str> = query
            .split_whitespace()
            .filter(|t| !t.starts_with("site:"))
            .collect();
        let phrase = terms.join(" ");
        let slug = terms
            .iter()
            .map(|t| t.to_lowercase())
            .collect::<Vec<_>>()
            .join("-");

        let results = vec![
            SearchResult {
                title: "AI Index Report".to_string(),
                url: "https://hai.stanford.edu/ai-index".to_string(),
                snippet: "Annual report tracking research, adoption and policy trends.".to_string(),
            },
            SearchResult {
                title: format!("{} | Nature research collection", phrase),
                url: format!("https://www.nature.com/subjects/{}", slug),
                snippet: format!("Peer-reviewed research articles on {}.", phrase),
            },
            SearchResult {
                title: format!("{} statistics", phrase),
                url: format!("https://www.nsf.gov/statistics/{}", slug),
                snippet: format!("Federal statistics and survey data related to {}.", phrase),
            },
            SearchResult {
                title: format!("My thoughts on {}", phrase),
                url: format!("https://medium.com/@blogger/{}", slug),
                snippet: "Personal opinion piece.".to_string(),
            },
        ];

        Ok(results.into_iter().take(limit).collect())
    }
}
