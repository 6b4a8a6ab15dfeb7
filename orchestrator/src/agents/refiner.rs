// Refiner: applies the critique and adds the executive summary, never dropping sections

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use super::{extract_json, Outcome, Stage, REFINER};
use crate::backends::{Message, TextGenerator};
use crate::error::PipelineError;
use crate::models::{CritiqueReport, Draft, RefinedDocument};

const SYSTEM_PROMPT: &str = "You are an editor. Revise the draft to address the review. Keep every \
existing key, keep citation markers, and add an \"executiveSummary\" key. Reply with one JSON \
object only.";

pub struct RefinerInput {
    pub topic: String,
    pub draft: Draft,
    pub critique: CritiqueReport,
    pub source_count: usize,
}

pub struct Refiner {
    generator: Arc<dyn TextGenerator>,
    max_tokens: u32,
}

impl Refiner {
    pub fn new(generator: Arc<dyn TextGenerator>, max_tokens: u32) -> Self {
        Self { generator, max_tokens }
    }

    pub fn template_summary(input: &RefinerInput) -> String {
        let mut summary = format!(
            "This report on {} synthesizes evidence from {} vetted sources. \
             The internal review scored the draft {}/100 and raised {} issues.",
            input.topic,
            input.source_count,
            input.critique.overall_score,
            input.critique.issue_count(),
        );
        if let Some(first) = input.critique.recommendations.first() {
            summary.push_str(&format!(" Main recommendation: {}", first));
        }
        summary
    }

    fn prompt(input: &RefinerInput) -> String {
        format!(
            "Draft:\n{}\n\nReview:\n{}\n\nNumber of sources: {}",
            serde_json::to_string_pretty(&input.draft).unwrap_or_default(),
            serde_json::to_string_pretty(&input.critique).unwrap_or_default(),
            input.source_count
        )
    }

    fn unchanged(input: RefinerInput, reason: String) -> Outcome<RefinedDocument> {
        let executive_summary = Self::template_summary(&input);
        Outcome::fallback(
            RefinedDocument {
                executive_summary,
                draft: input.draft,
            },
            reason,
        )
    }
}

#[async_trait]
impl Stage for Refiner {
    type Input = RefinerInput;
    type Output = RefinedDocument;

    fn name(&self) -> &'static str {
        REFINER
    }

    async fn run(&self, input: RefinerInput) -> Result<Outcome<RefinedDocument>, PipelineError> {
        info!(score = input.critique.overall_score, "Refiner: refining draft");

        let messages = [Message::system(SYSTEM_PROMPT), Message::user(Self::prompt(&input))];
        let text = match self.generator.generate(&messages, self.max_tokens).await {
            Ok(text) => text,
            Err(e) => {
                warn!(error = %e, "Refiner: generation failed, keeping draft");
                return Ok(Self::unchanged(input, e.to_string()));
            }
        };

        let parsed = extract_json(&text);
        let Some(mut generated) = parsed.as_ref().and_then(Draft::from_value) else {
            warn!("Refiner: output was malformed, keeping draft");
            return Ok(Self::unchanged(input, "malformed refinement output".to_string()));
        };

        let mut warnings = Vec::new();
        let executive_summary = match parsed.as_ref().and_then(Draft::summary_from_value) {
            Some(summary) => summary,
            None => {
                warnings.push("executive summary missing from refinement, template used".to_string());
                Self::template_summary(&input)
            }
        };

        let restored = generated.backfill_from(&input.draft);
        if !restored.is_empty() {
            warnings.push(format!("restored sections dropped by refinement: {}", restored.join(", ")));
        }

        Ok(Outcome::ok(RefinedDocument {
            executive_summary,
            draft: generated,
        })
        .with_warnings(warnings))
    }
}
