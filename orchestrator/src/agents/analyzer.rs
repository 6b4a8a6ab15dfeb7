// Topic Analyzer: turns the report topic into a research plan

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{info, warn};

use super::{extract_json, Outcome, Stage, ANALYZER};
use crate::backends::{Message, TextGenerator};
use crate::error::PipelineError;
use crate::models::{ReportMetadata, ResearchPlan};

const SYSTEM_PROMPT: &str = "You are a research planner. Reply with a single JSON object with the keys \
\"subtopics\" (list of strings), \"research_dimensions\" (list of short labels such as technical, \
statistical, policy), \"keyword_clusters\" (object mapping each dimension to keywords) and \
\"queries\" (list of web search queries). No prose.";

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct GeneratedPlan {
    subtopics: Vec<String>,
    research_dimensions: Vec<String>,
    keyword_clusters: BTreeMap<String, Vec<String>>,
    queries: Vec<String>,
}

pub struct TopicAnalyzer {
    generator: Arc<dyn TextGenerator>,
    max_tokens: u32,
}

impl TopicAnalyzer {
    pub fn new(generator: Arc<dyn TextGenerator>, max_tokens: u32) -> Self {
        Self { generator, max_tokens }
    }

    /// The plan used whenever generation is unavailable or unusable.
    pub fn canned_plan(metadata: &ReportMetadata) -> ResearchPlan {
        let topic = metadata.topic();
        let subtopics = [
            "technical advances",
            "statistics",
            "applications",
            "ethics",
            "industry adoption",
            "future trends",
        ]
        .iter()
        .map(|s| format!("{} {}", topic, s))
        .collect();

        let research_dimensions = ["technical", "statistical", "policy", "applications", "ethics", "future"]
            .iter()
            .map(|s| s.to_string())
            .collect();

        let mut keyword_clusters = BTreeMap::new();
        keyword_clusters.insert(
            "technical".to_string(),
            vec![topic.to_string(), "methods".to_string(), "architecture".to_string()],
        );
        keyword_clusters.insert(
            "statistics".to_string(),
            vec![topic.to_string(), "market size".to_string(), "publications".to_string()],
        );
        keyword_clusters.insert(
            "policy".to_string(),
            vec![topic.to_string(), "regulation".to_string(), "governance".to_string()],
        );

        let mut queries = Vec::new();
        if !metadata.subject().is_empty() {
            queries.push(format!("{} {} research", topic, metadata.subject()));
        }

        ResearchPlan {
            main_topic: topic.to_string(),
            subtopics,
            research_dimensions,
            keyword_clusters,
            queries,
        }
    }

    fn parse(metadata: &ReportMetadata, text: &str) -> Option<ResearchPlan> {
        let value = extract_json(text)?;
        let generated: GeneratedPlan = serde_json::from_value(value).ok()?;

        let clean = |items: Vec<String>| -> Vec<String> {
            items
                .into_iter()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        };
        let subtopics = clean(generated.subtopics);
        let research_dimensions = clean(generated.research_dimensions);
        let queries = clean(generated.queries);

        if subtopics.is_empty() || (research_dimensions.is_empty() && queries.is_empty()) {
            return None;
        }

        Some(ResearchPlan {
            main_topic: metadata.topic().to_string(),
            subtopics,
            research_dimensions,
            keyword_clusters: generated.keyword_clusters,
            queries,
        })
    }
}

#[async_trait]
impl Stage for TopicAnalyzer {
    type Input = ReportMetadata;
    type Output = ResearchPlan;

    fn name(&self) -> &'static str {
        ANALYZER
    }

    async fn run(&self, metadata: ReportMetadata) -> Result<Outcome<ResearchPlan>, PipelineError> {
        info!("Analyzer: planning research for topic: {}", metadata.topic());

        let prompt = format!(
            "Topic: {}\nSubject area: {}\nProduce the research plan.",
            metadata.topic(),
            if metadata.subject().is_empty() { "general" } else { metadata.subject() },
        );
        let messages = [Message::system(SYSTEM_PROMPT), Message::user(prompt)];

        match self.generator.generate(&messages, self.max_tokens).await {
            Ok(text) => match Self::parse(&metadata, &text) {
                Some(plan) => Ok(Outcome::ok(plan)),
                None => {
                    warn!("Analyzer: generated plan was malformed, using canned plan");
                    Ok(Outcome::fallback(Self::canned_plan(&metadata), "malformed plan output"))
                }
            },
            Err(e) => {
                warn!(error = %e, "Analyzer: generation failed, using canned plan");
                Ok(Outcome::fallback(Self::canned_plan(&metadata), e.to_string()))
            }
        }
    }
}
