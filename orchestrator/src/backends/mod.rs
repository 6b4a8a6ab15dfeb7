// External collaborators: generative text, web search, content fetch, persistence.

pub mod fetch;
pub mod llm;
pub mod search;
pub mod storage;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::{Config, LlmProvider, SearchProvider};
use crate::error::BackendError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(&self, messages: &[Message], max_tokens: u32) -> Result<String, BackendError>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchResult {
    pub title: String,
    pub url: String,
    pub snippet: String,
}

#[async_trait]
pub trait SearchBackend: Send + Sync {
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchResult>, BackendError>;
}

#[async_trait]
pub trait ContentFetcher: Send + Sync {
    /// Plain text of the page at `url`.
    async fn fetch(&self, url: &str) -> Result<String, BackendError>;
}

#[async_trait]
pub trait PersistenceSink: Send + Sync {
    /// Write `data` under `key` and return a locator for it.
    async fn persist(&self, key: &str, data: &[u8]) -> std::io::Result<String>;
}

/// The live or offline collaborators selected by configuration.
#[derive(Clone)]
pub struct Backends {
    pub generator: Arc<dyn TextGenerator>,
    pub search: Arc<dyn SearchBackend>,
    pub fetcher: Option<Arc<dyn ContentFetcher>>,
    pub sink: Arc<dyn PersistenceSink>,
}

impl Backends {
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let generator: Arc<dyn TextGenerator> = match config.llm.provider {
            LlmProvider::Offline => Arc::new(llm::OfflineGenerator),
            LlmProvider::Openai => {
                let client = llm::OpenAiCompatClient::new(&config.llm)?;
                Arc::new(llm::ThrottledGenerator::new(client, &config.llm))
            }
        };

        let search: Arc<dyn SearchBackend> = match config.search.provider {
            SearchProvider::Placeholder => Arc::new(search::PlaceholderSearch),
            SearchProvider::Serper => Arc::new(search::SerperSearch::new(&config.search)?),
        };

        let fetcher: Option<Arc<dyn ContentFetcher>> = if config.fetch.enabled {
            Some(Arc::new(fetch::HttpFetcher::new(&config.fetch)?))
        } else {
            None
        };

        let sink = Arc::new(storage::FileSink::new(config.output_dir.clone()));

        Ok(Self {
            generator,
            search,
            fetcher,
            sink,
        })
    }
}
