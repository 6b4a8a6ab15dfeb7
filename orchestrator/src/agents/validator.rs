// Source Validator: dedupes raw hits and keeps the trusted ones

use std::collections::HashSet;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, info};

use super::credibility::{self, domain_of, is_within};
use super::{Outcome, Stage, VALIDATOR};
use crate::config::{AcceptancePolicy, SourcePolicyConfig};
use crate::error::PipelineError;
use crate::models::{RawHit, Source};

#[derive(Debug, Clone, Default, Serialize)]
pub struct Validation {
    pub accepted: Vec<Source>,
    pub rejected: Vec<RawHit>,
}

pub struct SourceValidator {
    policy: AcceptancePolicy,
    allowed_domains: Vec<String>,
    min_score: u8,
}

impl SourceValidator {
    pub fn new(config: &SourcePolicyConfig) -> Self {
        Self {
            policy: config.acceptance,
            allowed_domains: config
                .allowed_domains
                .iter()
                .map(|d| d.trim().to_lowercase())
                .filter(|d| !d.is_empty())
                .collect(),
            min_score: config.min_score,
        }
    }

    /// `.gov`-style entries match anywhere in the host, bare domains match
    /// the host or its subdomains.
    fn allowed(&self, domain: &str) -> bool {
        self.allowed_domains.iter().any(|entry| {
            if entry.starts_with('.') {
                domain.contains(entry.as_str())
            } else {
                is_within(domain, entry)
            }
        })
    }

    fn accepts(&self, domain: &str, score: u8) -> bool {
        match self.policy {
            AcceptancePolicy::Allowlist => self.allowed(domain),
            AcceptancePolicy::Threshold => score >= self.min_score,
        }
    }

    pub fn validate(&self, hits: Vec<RawHit>) -> Validation {
        let mut seen = HashSet::new();
        let mut validation = Validation::default();

        for hit in hits {
            let key = hit.url.trim().to_lowercase();
            if key.is_empty() || !seen.insert(key) {
                debug!(url = %hit.url, "Skipping duplicate or empty URL");
                continue;
            }

            let domain = domain_of(&hit.url);
            let score = credibility::score(&hit.url);
            if !self.accepts(&domain, score) {
                validation.rejected.push(hit);
                continue;
            }

            let id = validation.accepted.len() as u32 + 1;
            let title = if hit.title.trim().is_empty() {
                domain.clone()
            } else {
                hit.title.trim().to_string()
            };
            validation.accepted.push(Source {
                id,
                title,
                url: hit.url.trim().to_string(),
                domain,
                credibility: score,
                snippet: hit.snippet,
                authors: Vec::new(),
                year: None,
                publisher: None,
                journal: None,
                doi: None,
            });
        }

        validation
    }
}

#[async_trait]
impl Stage for SourceValidator {
    type Input = Vec<RawHit>;
    type Output = Validation;

    fn name(&self) -> &'static str {
        VALIDATOR
    }

    async fn run(&self, hits: Vec<RawHit>) -> Result<Outcome<Validation>, PipelineError> {
        let total = hits.len();
        let validation = self.validate(hits);
        info!(
            total,
            accepted = validation.accepted.len(),
            rejected = validation.rejected.len(),
            "Validator: sources screened"
        );
        Ok(Outcome::ok(validation))
    }
}
