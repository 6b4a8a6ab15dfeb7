// Critic: reviews the draft and reports issues with an overall score

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::{info, warn};

use super::{extract_json, Outcome, Stage, CRITIC};
use crate::backends::{Message, TextGenerator};
use crate::error::PipelineError;
use crate::models::{sections, CritiqueReport, Draft, Source};

const SYSTEM_PROMPT: &str = "You are a rigorous academic reviewer. Review the draft against the listed \
sources. Reply with one JSON object with the keys factIssues, flowIssues, unsupportedClaims, \
biasFlags, structuralWeaknesses, citationIssues, recommendations (all lists of strings) and \
overallScore (integer 0-100).";

pub struct CriticInput {
    pub draft: Draft,
    pub sources: Vec<Source>,
}

pub struct Critic {
    generator: Arc<dyn TextGenerator>,
    max_tokens: u32,
}

impl Critic {
    pub fn new(generator: Arc<dyn TextGenerator>, max_tokens: u32) -> Self {
        Self { generator, max_tokens }
    }

    fn prompt(input: &CriticInput) -> String {
        let draft = serde_json::to_string_pretty(&input.draft).unwrap_or_default();
        let sources: Vec<String> = input
            .sources
            .iter()
            .map(|s| format!("[{}] {} ({})", s.id, s.title, s.url))
            .collect();
        format!("Draft:\n{}\n\nSources:\n{}", draft, sources.join("\n"))
    }

    /// Lenient parse: keys may be snake_case, the score may be a float or out of range.
    pub fn parse(text: &str) -> Option<CritiqueReport> {
        let Value::Object(object) = extract_json(text)? else {
            return None;
        };

        let mut normalized = Map::new();
        let mut score = None;
        for (key, value) in object {
            let key = sections::normalize_key(&key);
            if key == "overallScore" || key == "score" {
                score = value.as_f64();
                continue;
            }
            normalized.insert(key, value);
        }

        let mut report: CritiqueReport = serde_json::from_value(Value::Object(normalized)).ok()?;
        if let Some(score) = score {
            report.overall_score = score.round().clamp(0.0, 100.0) as u8;
        }
        Some(report)
    }

    /// Citation markers in the draft that point past the end of the source list.
    fn dangling_citations(draft: &Draft, source_count: usize) -> Vec<String> {
        let mut texts: Vec<&str> = draft.sections.values().map(String::as_str).collect();
        texts.extend(draft.main_sections.iter().map(|s| s.content.as_str()));

        let mut dangling: Vec<usize> = Vec::new();
        for text in texts {
            let mut rest = text;
            while let Some(open) = rest.find('[') {
                let after = &rest[open + 1..];
                let Some(close) = after.find(']') else { break };
                if let Ok(n) = after[..close].trim().parse::<usize>() {
                    if (n == 0 || n > source_count) && !dangling.contains(&n) {
                        dangling.push(n);
                    }
                }
                rest = &after[close + 1..];
            }
        }
        dangling.sort_unstable();
        dangling
            .into_iter()
            .map(|n| format!("citation [{}] does not match any source", n))
            .collect()
    }
}

#[async_trait]
impl Stage for Critic {
    type Input = CriticInput;
    type Output = CritiqueReport;

    fn name(&self) -> &'static str {
        CRITIC
    }

    async fn run(&self, input: CriticInput) -> Result<Outcome<CritiqueReport>, PipelineError> {
        info!(sources = input.sources.len(), "Critic: reviewing draft");

        let messages = [Message::system(SYSTEM_PROMPT), Message::user(Self::prompt(&input))];
        let text = match self.generator.generate(&messages, self.max_tokens).await {
            Ok(text) => text,
            Err(e) => {
                warn!(error = %e, "Critic: generation failed, using neutral report");
                return Ok(Outcome::fallback(CritiqueReport::default(), e.to_string()));
            }
        };

        let Some(mut report) = Self::parse(&text) else {
            warn!("Critic: review output was malformed, using neutral report");
            return Ok(Outcome::fallback(CritiqueReport::default(), "malformed critique output"));
        };

        for issue in Self::dangling_citations(&input.draft, input.sources.len()) {
            if !report.citation_issues.contains(&issue) {
                report.citation_issues.push(issue);
            }
        }

        info!(score = report.overall_score, issues = report.issue_count(), "Critic: review complete");
        Ok(Outcome::ok(report))
    }
}
