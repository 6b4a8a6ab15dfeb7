pub mod analyzer;
pub mod audit;
pub mod citations;
pub mod credibility;
pub mod critic;
pub mod knowledge;
pub mod planner;
pub mod refiner;
pub mod renderer;
pub mod search;
pub mod validator;
pub mod writer;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use crate::error::PipelineError;

// Stage names as they appear in logs, metrics and the audit trail.
pub const ANALYZER: &str = "topic_analyzer";
pub const PLANNER: &str = "query_planner";
pub const SEARCH: &str = "search_executor";
pub const VALIDATOR: &str = "source_validator";
pub const KNOWLEDGE: &str = "knowledge_base";
pub const WRITER: &str = "writer";
pub const CRITIC: &str = "critic";
pub const REFINER: &str = "refiner";
pub const CITATIONS: &str = "citation_manager";
pub const RENDERER: &str = "renderer";
pub const AUDIT: &str = "audit_exporter";

/// A stage's result plus what it had to absorb to produce it.
#[derive(Debug, Clone)]
pub struct Outcome<T> {
    pub value: T,
    /// Set when the value is a documented fallback rather than real output.
    pub fallback: Option<String>,
    pub warnings: Vec<String>,
}

impl<T> Outcome<T> {
    pub fn ok(value: T) -> Self {
        Self {
            value,
            fallback: None,
            warnings: Vec::new(),
        }
    }

    pub fn fallback(value: T, reason: impl Into<String>) -> Self {
        Self {
            value,
            fallback: Some(reason.into()),
            warnings: Vec::new(),
        }
    }

    pub fn with_warnings(mut self, warnings: Vec<String>) -> Self {
        self.warnings.extend(warnings);
        self
    }
}

/// One step of the report pipeline.
#[async_trait]
pub trait Stage: Send + Sync {
    type Input: Send;
    type Output: Serialize + Send;

    fn name(&self) -> &'static str;

    /// Soft failures are absorbed into the outcome; an `Err` ends the run.
    async fn run(&self, input: Self::Input) -> Result<Outcome<Self::Output>, PipelineError>;

    /// What the audit trail keeps of the output.
    fn audit_view(&self, output: &Self::Output) -> Value {
        serde_json::to_value(output).unwrap_or(Value::Null)
    }

    /// Stages that write to the persistence sink run with their run pinned,
    /// so a reset cannot interleave with the write.
    fn writes_artifacts(&self) -> bool {
        false
    }
}

/// Pull the JSON payload out of generated text, tolerating markdown fences
/// and surrounding prose.
pub fn extract_json(text: &str) -> Option<Value> {
    let trimmed = text.trim();
    if let Ok(value) = serde_json::from_str(trimmed) {
        return Some(value);
    }

    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        let body_start = after.find('\n').map(|i| i + 1).unwrap_or(0);
        let body = &after[body_start..];
        if let Some(end) = body.find("```") {
            if let Ok(value) = serde_json::from_str(body[..end].trim()) {
                return Some(value);
            }
        }
    }

    let start = trimmed.find(['{', '['])?;
    let end = trimmed.rfind(['}', ']'])?;
    if end <= start {
        return None;
    }
    serde_json::from_str(&trimmed[start..=end]).ok()
}

/// Cut `text` to at most `max` characters on a char boundary.
pub fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => text[..idx].trim_end().to_string(),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn extracts_plain_and_fenced_json() {
        assert_eq!(extract_json(r#"{"a": 1}"#), Some(json!({"a": 1})));
        assert_eq!(
            extract_json("Here you go:\n```json\n{\"a\": [1, 2]}\n```\nThanks"),
            Some(json!({"a": [1, 2]}))
        );
        assert_eq!(extract_json("```\n{\"b\": true}\n```"), Some(json!({"b": true})));
        assert_eq!(
            extract_json("Sure! {\"c\": \"x\"} hope that helps"),
            Some(json!({"c": "x"}))
        );
    }

    #[test]
    fn rejects_non_json() {
        assert_eq!(extract_json("no structured data here"), None);
        assert_eq!(extract_json("} backwards {"), None);
    }

    #[test]
    fn truncates_on_char_boundary() {
        assert_eq!(truncate_chars("héllo wörld", 7), "héllo w");
        assert_eq!(truncate_chars("short", 10), "short");
    }
}
