// Writer: synthesizes the structured draft from facts and metadata

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use super::{extract_json, Outcome, Stage, WRITER};
use crate::backends::{Message, TextGenerator};
use crate::error::PipelineError;
use crate::models::{sections, Draft, Fact, MainSection, ReportMetadata, Source};

const SYSTEM_PROMPT: &str = "You are an academic report writer. Use only the supplied facts and cite \
them as [n] using the source numbers given. Reply with one JSON object whose keys are: abstract, \
introduction, literatureReview, mainSections (list of {\"title\", \"content\"}), dataStatistics, \
challenges, futureOutlook, conclusion. No prose outside the JSON.";

const PROMPT_FACT_LIMIT: usize = 40;

pub struct WriterInput {
    pub metadata: ReportMetadata,
    pub subtopics: Vec<String>,
    pub sources: Vec<Source>,
    pub facts: Vec<Fact>,
}

pub struct Writer {
    generator: Arc<dyn TextGenerator>,
    max_tokens: u32,
    required: Vec<String>,
}

impl Writer {
    pub fn new(generator: Arc<dyn TextGenerator>, max_tokens: u32, required: Vec<String>) -> Self {
        Self {
            generator,
            max_tokens,
            required,
        }
    }

    fn prompt(input: &WriterInput) -> String {
        let mut prompt = format!(
            "Topic: {}\nSubject: {}\nSubtopics: {}\n\nFacts:\n",
            input.metadata.topic(),
            input.metadata.subject(),
            input.subtopics.join("; "),
        );
        for fact in input.facts.iter().take(PROMPT_FACT_LIMIT) {
            prompt.push_str(&format!("[{}] {}\n", fact.source_id(), fact.claim()));
        }
        prompt.push_str("\nSources:\n");
        for source in &input.sources {
            prompt.push_str(&format!("[{}] {} ({})\n", source.id, source.title, source.domain));
        }
        prompt
    }

    fn placeholder(metadata: &ReportMetadata, key: &str) -> String {
        format!(
            "The {} for this report on {} could not be generated from the available material.",
            sections::heading(key).to_lowercase(),
            metadata.topic()
        )
    }

    /// Deterministic draft built from the topic, subject and source titles.
    pub fn template_draft(input: &WriterInput, required: &[String]) -> Draft {
        let topic = input.metadata.topic();
        let field = if input.metadata.subject().is_empty() {
            "its field".to_string()
        } else {
            input.metadata.subject().to_string()
        };

        let mut draft = Draft::default();
        let mut put = |key: &str, text: String| {
            draft.sections.insert(key.to_string(), text);
        };

        put(
            sections::ABSTRACT,
            format!(
                "This report analyzes recent developments in {} within {}, drawing on {} vetted sources.",
                topic,
                field,
                input.sources.len()
            ),
        );
        put(
            sections::INTRODUCTION,
            format!(
                "This report explores {}. It outlines the current state of research, the evidence \
                 available from trusted institutions, and the open questions that remain.",
                topic
            ),
        );

        let literature = if input.sources.is_empty() {
            format!("No vetted sources were available for {} at the time of writing.", topic)
        } else {
            let titles: Vec<String> = input
                .sources
                .iter()
                .take(5)
                .map(|s| format!("{} [{}]", s.title, s.id))
                .collect();
            format!(
                "The reviewed literature on {} includes {}.",
                topic,
                titles.join(", ")
            )
        };
        put(sections::LITERATURE_REVIEW, literature);
        put(
            sections::DATA_STATISTICS,
            format!(
                "{} facts were extracted from {} sources with an average credibility of {}/100.",
                input.facts.len(),
                input.sources.len(),
                average_confidence(&input.facts)
            ),
        );
        put(
            sections::CHALLENGES,
            format!(
                "Key challenges for {} include data availability, reproducibility of results, and adoption barriers.",
                topic
            ),
        );
        put(
            sections::FUTURE_OUTLOOK,
            format!("Future work on {} is expected to build on the trends identified in this report.", topic),
        );
        put(
            sections::CONCLUSION,
            format!("This report summarized the current evidence on {}.", topic),
        );

        draft.main_sections = input
            .subtopics
            .iter()
            .take(6)
            .map(|subtopic| {
                let supporting: Vec<String> = input
                    .facts
                    .iter()
                    .take(2)
                    .map(|f| format!("{} [{}]", f.claim(), f.source_id()))
                    .collect();
                let mut content = format!("This section examines {} in the context of {}.", subtopic, topic);
                if !supporting.is_empty() {
                    content.push(' ');
                    content.push_str(&supporting.join(" "));
                }
                MainSection {
                    title: capitalize(subtopic),
                    content,
                }
            })
            .collect();

        draft.complete_with(required, |key| Self::placeholder(&input.metadata, key));
        draft
    }
}

fn average_confidence(facts: &[Fact]) -> u32 {
    if facts.is_empty() {
        return 0;
    }
    facts.iter().map(|f| f.confidence() as u32).sum::<u32>() / facts.len() as u32
}

fn capitalize(text: &str) -> String {
    let mut chars = text.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

#[async_trait]
impl Stage for Writer {
    type Input = WriterInput;
    type Output = Draft;

    fn name(&self) -> &'static str {
        WRITER
    }

    async fn run(&self, input: WriterInput) -> Result<Outcome<Draft>, PipelineError> {
        info!(facts = input.facts.len(), "Writer: drafting report on {}", input.metadata.topic());

        let messages = [Message::system(SYSTEM_PROMPT), Message::user(Self::prompt(&input))];
        let generated = match self.generator.generate(&messages, self.max_tokens).await {
            Ok(text) => extract_json(&text).and_then(|v| Draft::from_value(&v)),
            Err(e) => {
                warn!(error = %e, "Writer: generation failed, using template draft");
                return Ok(Outcome::fallback(
                    Self::template_draft(&input, &self.required),
                    e.to_string(),
                ));
            }
        };

        let Some(mut draft) = generated.filter(|d| d.missing(&self.required).len() < self.required.len()) else {
            warn!("Writer: generated draft was malformed, using template draft");
            return Ok(Outcome::fallback(
                Self::template_draft(&input, &self.required),
                "malformed draft output",
            ));
        };

        let filled = draft.complete_with(&self.required, |key| Self::placeholder(&input.metadata, key));
        let warnings = if filled.is_empty() {
            Vec::new()
        } else {
            vec![format!("placeholder text used for: {}", filled.join(", "))]
        };
        Ok(Outcome::ok(draft).with_warnings(warnings))
    }
}
