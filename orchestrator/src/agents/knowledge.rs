// Knowledge Base Builder: extracts bounded fact records from accepted sources

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::{truncate_chars, Outcome, Stage, KNOWLEDGE};
use crate::backends::ContentFetcher;
use crate::config::{FetchConfig, SourcePolicyConfig};
use crate::error::PipelineError;
use crate::models::{Fact, Source};

pub struct KnowledgeBaseBuilder {
    fetcher: Option<Arc<dyn ContentFetcher>>,
    max_sources: usize,
    max_paragraphs: usize,
    max_fact_chars: usize,
    min_paragraph_chars: usize,
}

impl KnowledgeBaseBuilder {
    pub fn new(
        fetcher: Option<Arc<dyn ContentFetcher>>,
        fetch: &FetchConfig,
        sources: &SourcePolicyConfig,
    ) -> Self {
        Self {
            fetcher,
            max_sources: sources.max_sources,
            max_paragraphs: fetch.max_paragraphs,
            max_fact_chars: fetch.max_fact_chars,
            min_paragraph_chars: fetch.min_paragraph_chars,
        }
    }

    fn title_claim(source: &Source) -> Fact {
        Fact::from_source(source, format!("Information derived from {}", source.title))
    }

    /// Paragraph-like blocks of `text`, whitespace collapsed, short or
    /// navigation-looking blocks dropped.
    pub fn paragraphs(&self, text: &str) -> Vec<String> {
        text.replace("\r\n", "\n")
            .split("\n\n")
            .map(|block| block.split_whitespace().collect::<Vec<_>>().join(" "))
            .filter(|block| block.chars().count() >= self.min_paragraph_chars)
            .filter(|block| !block.starts_with('[') && !block.starts_with('*') && !block.starts_with('|'))
            .take(self.max_paragraphs)
            .map(|block| truncate_chars(&block, self.max_fact_chars))
            .collect()
    }
}

#[async_trait]
impl Stage for KnowledgeBaseBuilder {
    type Input = Vec<Source>;
    type Output = Vec<Fact>;

    fn name(&self) -> &'static str {
        KNOWLEDGE
    }

    async fn run(&self, sources: Vec<Source>) -> Result<Outcome<Vec<Fact>>, PipelineError> {
        let batch: Vec<&Source> = sources.iter().take(self.max_sources).collect();
        info!(sources = batch.len(), fetch = self.fetcher.is_some(), "KB: building facts");

        let Some(fetcher) = &self.fetcher else {
            let facts = batch.into_iter().map(Self::title_claim).collect();
            return Ok(Outcome::ok(facts));
        };

        let mut facts = Vec::new();
        let mut skipped = 0usize;
        for source in &batch {
            match fetcher.fetch(&source.url).await {
                Ok(text) => {
                    let paragraphs = self.paragraphs(&text);
                    debug!(source_id = source.id, paragraphs = paragraphs.len(), "KB: content extracted");
                    if paragraphs.is_empty() {
                        facts.push(Self::title_claim(source));
                    } else {
                        facts.extend(paragraphs.into_iter().map(|p| Fact::from_source(source, p)));
                    }
                }
                Err(e) => {
                    warn!(source_id = source.id, url = %source.url, error = %e, "KB: skipping source");
                    skipped += 1;
                }
            }
        }

        let mut warnings = Vec::new();
        if skipped > 0 {
            warnings.push(format!("{} of {} sources could not be fetched", skipped, batch.len()));
        }
        Ok(Outcome::ok(facts).with_warnings(warnings))
    }
}
