// Search Executor: one external search call per query, gathered concurrently

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use futures::future::join_all;
use prometheus::IntCounter;
use serde_json::{json, Value};
use tracing::{info, warn};

use super::credibility::domain_of;
use super::{Outcome, Stage, SEARCH};
use crate::backends::SearchBackend;
use crate::config::SearchConfig;
use crate::error::PipelineError;
use crate::models::{Query, RawHit};

pub struct SearchExecutor {
    backend: Arc<dyn SearchBackend>,
    query_limit: usize,
    results_per_query: usize,
    failures: IntCounter,
}

impl SearchExecutor {
    pub fn new(backend: Arc<dyn SearchBackend>, config: &SearchConfig, failures: IntCounter) -> Self {
        Self {
            backend,
            query_limit: config.query_limit,
            results_per_query: config.results_per_query,
            failures,
        }
    }
}

#[async_trait]
impl Stage for SearchExecutor {
    type Input = Vec<Query>;
    type Output = Vec<RawHit>;

    fn name(&self) -> &'static str {
        SEARCH
    }

    async fn run(&self, queries: Vec<Query>) -> Result<Outcome<Vec<RawHit>>, PipelineError> {
        let issued: Vec<&Query> = queries.iter().take(self.query_limit).collect();
        info!(
            planned = queries.len(),
            issued = issued.len(),
            "Search: issuing queries"
        );

        let calls = issued.iter().map(|query| async move {
            let result = self.backend.search(&query.text, self.results_per_query).await;
            (*query, result)
        });

        let mut hits = Vec::new();
        let mut warnings = Vec::new();
        for (query, result) in join_all(calls).await {
            match result {
                Ok(results) => {
                    let retrieved_at = Utc::now();
                    hits.extend(results.into_iter().map(|r| RawHit {
                        domain: domain_of(&r.url),
                        url: r.url,
                        title: r.title,
                        snippet: r.snippet,
                        query: query.text.clone(),
                        retrieved_at,
                    }));
                }
                Err(e) => {
                    warn!(query = %query.text, error = %e, "Search: query failed, continuing");
                    self.failures.inc();
                    warnings.push(format!("query '{}' failed: {}", query.text, e));
                }
            }
        }

        info!(hits = hits.len(), failed = warnings.len(), "Search: results gathered");
        Ok(Outcome::ok(hits).with_warnings(warnings))
    }

    fn audit_view(&self, hits: &Vec<RawHit>) -> Value {
        json!({
            "hitCount": hits.len(),
            "hits": hits,
        })
    }
}
