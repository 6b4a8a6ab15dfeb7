use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use bytes::Bytes;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::PipelineError;

/// Section keys of a report draft, in rendering order.
pub mod sections {
    pub const ABSTRACT: &str = "abstract";
    pub const INTRODUCTION: &str = "introduction";
    pub const LITERATURE_REVIEW: &str = "literatureReview";
    pub const MAIN_SECTIONS: &str = "mainSections";
    pub const DATA_STATISTICS: &str = "dataStatistics";
    pub const CHALLENGES: &str = "challenges";
    pub const FUTURE_OUTLOOK: &str = "futureOutlook";
    pub const CONCLUSION: &str = "conclusion";
    pub const EXECUTIVE_SUMMARY: &str = "executiveSummary";

    pub const ORDER: [&str; 8] = [
        ABSTRACT,
        INTRODUCTION,
        LITERATURE_REVIEW,
        MAIN_SECTIONS,
        DATA_STATISTICS,
        CHALLENGES,
        FUTURE_OUTLOOK,
        CONCLUSION,
    ];

    pub fn heading(key: &str) -> String {
        match key {
            ABSTRACT => "Abstract".to_string(),
            INTRODUCTION => "Introduction".to_string(),
            LITERATURE_REVIEW => "Literature Review".to_string(),
            MAIN_SECTIONS => "Main Sections".to_string(),
            DATA_STATISTICS => "Data and Statistics".to_string(),
            CHALLENGES => "Challenges".to_string(),
            FUTURE_OUTLOOK => "Future Outlook".to_string(),
            CONCLUSION => "Conclusion".to_string(),
            EXECUTIVE_SUMMARY => "Executive Summary".to_string(),
            other => humanize(other),
        }
    }

    /// `literature_review` and `literatureReview` both become `literatureReview`.
    pub fn normalize_key(key: &str) -> String {
        let mut out = String::with_capacity(key.len());
        let mut upper_next = false;
        for c in key.trim().chars() {
            if c == '_' || c == '-' || c == ' ' {
                upper_next = !out.is_empty();
            } else if upper_next {
                out.extend(c.to_uppercase());
                upper_next = false;
            } else {
                out.push(c);
            }
        }
        out
    }

    fn humanize(key: &str) -> String {
        let mut out = String::new();
        for (i, c) in key.chars().enumerate() {
            if i == 0 {
                out.extend(c.to_uppercase());
            } else if c.is_uppercase() {
                out.push(' ');
                out.push(c);
            } else {
                out.push(c);
            }
        }
        out
    }
}

/// User-supplied report metadata. Fixed at construction.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReportMetadata {
    topic: String,
    subject: String,
    researcher: String,
    institution: String,
    date: NaiveDate,
}

impl ReportMetadata {
    pub fn new(
        topic: impl Into<String>,
        subject: impl Into<String>,
        researcher: impl Into<String>,
        institution: impl Into<String>,
        date: NaiveDate,
    ) -> Result<Self, PipelineError> {
        let topic = topic.into().trim().to_string();
        if topic.is_empty() {
            return Err(PipelineError::InvalidMetadata("topic must not be empty".to_string()));
        }
        Ok(Self {
            topic,
            subject: subject.into().trim().to_string(),
            researcher: researcher.into().trim().to_string(),
            institution: institution.into().trim().to_string(),
            date,
        })
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn researcher(&self) -> &str {
        &self.researcher
    }

    pub fn institution(&self) -> &str {
        &self.institution
    }

    pub fn date(&self) -> NaiveDate {
        self.date
    }
}

/// Output of the topic analyzer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResearchPlan {
    pub main_topic: String,
    pub subtopics: Vec<String>,
    #[serde(default)]
    pub research_dimensions: Vec<String>,
    #[serde(default)]
    pub keyword_clusters: BTreeMap<String, Vec<String>>,
    /// Ready-made search strings, planned ahead of per-dimension queries.
    #[serde(default)]
    pub queries: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Query {
    pub text: String,
    pub category: Option<String>,
}

impl Query {
    pub fn new(text: impl Into<String>, category: Option<String>) -> Self {
        Self {
            text: text.into(),
            category,
        }
    }
}

/// Unvalidated search result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RawHit {
    pub url: String,
    pub title: String,
    pub snippet: String,
    pub query: String,
    pub domain: String,
    pub retrieved_at: DateTime<Utc>,
}

/// A validated source. `credibility` is on the 0-100 scale.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Source {
    pub id: u32,
    pub title: String,
    pub url: String,
    pub domain: String,
    pub credibility: u8,
    pub snippet: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub authors: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub year: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub publisher: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub journal: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub doi: Option<String>,
}

/// A claim tied to the source it was extracted from.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Fact {
    source_id: u32,
    claim: String,
    confidence: u8,
}

impl Fact {
    /// The only way to build a fact, so the source id always refers to a real source.
    pub fn from_source(source: &Source, claim: impl Into<String>) -> Self {
        Self {
            source_id: source.id,
            claim: claim.into(),
            confidence: source.credibility,
        }
    }

    pub fn source_id(&self) -> u32 {
        self.source_id
    }

    pub fn claim(&self) -> &str {
        &self.claim
    }

    pub fn confidence(&self) -> u8 {
        self.confidence
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MainSection {
    pub title: String,
    pub content: String,
}

/// Report draft: named text sections plus the repeatable main sections.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Draft {
    #[serde(rename = "mainSections", skip_serializing_if = "Vec::is_empty")]
    pub main_sections: Vec<MainSection>,
    #[serde(flatten)]
    pub sections: BTreeMap<String, String>,
}

impl Draft {
    /// Lenient conversion from generated JSON. Unknown keys are kept, empty
    /// values dropped; completeness is checked separately. `executiveSummary`
    /// belongs to the refined document and never enters a draft.
    pub fn from_value(value: &Value) -> Option<Self> {
        let object = value.as_object()?;
        let mut draft = Draft::default();

        for (raw_key, value) in object {
            let key = sections::normalize_key(raw_key);
            if key == sections::EXECUTIVE_SUMMARY {
                continue;
            }
            if key == sections::MAIN_SECTIONS {
                draft.main_sections = parse_main_sections(value);
                continue;
            }
            if let Some(text) = value_to_text(value) {
                draft.sections.insert(key, text);
            }
        }

        Some(draft)
    }

    /// The non-empty `executiveSummary` carried by generated JSON, under any
    /// key spelling.
    pub fn summary_from_value(value: &Value) -> Option<String> {
        value
            .as_object()?
            .iter()
            .filter(|(key, _)| sections::normalize_key(key) == sections::EXECUTIVE_SUMMARY)
            .find_map(|(_, value)| value_to_text(value))
            .filter(|text| !text.trim().is_empty())
    }

    pub fn section(&self, key: &str) -> Option<&str> {
        self.sections.get(key).map(String::as_str)
    }

    /// Every key this draft carries, `mainSections` included when present.
    pub fn keys(&self) -> BTreeSet<String> {
        let mut keys: BTreeSet<String> = self.sections.keys().cloned().collect();
        if !self.main_sections.is_empty() {
            keys.insert(sections::MAIN_SECTIONS.to_string());
        }
        keys
    }

    pub fn has(&self, key: &str) -> bool {
        if key == sections::MAIN_SECTIONS {
            return !self.main_sections.is_empty();
        }
        self.sections
            .get(key)
            .map(|text| !text.trim().is_empty())
            .unwrap_or(false)
    }

    pub fn missing<'a>(&self, required: &'a [String]) -> Vec<&'a str> {
        required
            .iter()
            .map(String::as_str)
            .filter(|key| !self.has(key))
            .collect()
    }

    /// Fill every missing required key from `placeholder`. Returns the keys
    /// that were filled.
    pub fn complete_with<F>(&mut self, required: &[String], placeholder: F) -> Vec<String>
    where
        F: Fn(&str) -> String,
    {
        let mut filled = Vec::new();
        for key in required {
            if self.has(key) {
                continue;
            }
            let text = placeholder(key);
            if key == sections::MAIN_SECTIONS {
                self.main_sections = vec![MainSection {
                    title: "Overview".to_string(),
                    content: text,
                }];
            } else {
                self.sections.insert(key.clone(), text);
            }
            filled.push(key.clone());
        }
        filled
    }

    /// Backfill from `original` every key this draft lacks. A summary in the
    /// original is never carried over.
    pub fn backfill_from(&mut self, original: &Draft) -> Vec<String> {
        let mut restored = Vec::new();
        if self.main_sections.is_empty() && !original.main_sections.is_empty() {
            self.main_sections = original.main_sections.clone();
            restored.push(sections::MAIN_SECTIONS.to_string());
        }
        for (key, text) in &original.sections {
            if key == sections::EXECUTIVE_SUMMARY {
                continue;
            }
            if !self.has(key) {
                self.sections.insert(key.clone(), text.clone());
                restored.push(key.clone());
            }
        }
        restored
    }
}

fn parse_main_sections(value: &Value) -> Vec<MainSection> {
    let Some(items) = value.as_array() else {
        return Vec::new();
    };
    items
        .iter()
        .enumerate()
        .filter_map(|(i, item)| match item {
            Value::Object(map) => {
                let content = map.get("content").and_then(value_to_text)?;
                let title = map
                    .get("title")
                    .and_then(Value::as_str)
                    .map(str::trim)
                    .filter(|t| !t.is_empty())
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("Section {}", i + 1));
                Some(MainSection { title, content })
            }
            Value::String(text) if !text.trim().is_empty() => Some(MainSection {
                title: format!("Section {}", i + 1),
                content: text.trim().to_string(),
            }),
            _ => None,
        })
        .collect()
}

fn value_to_text(value: &Value) -> Option<String> {
    let text = match value {
        Value::String(s) => s.trim().to_string(),
        Value::Array(items) => items
            .iter()
            .filter_map(value_to_text)
            .collect::<Vec<_>>()
            .join("\n\n"),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Object(_) | Value::Null => return None,
    };
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

pub const FALLBACK_CRITIQUE_SCORE: u8 = 50;

/// Structured review of a draft. List fields are never absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CritiqueReport {
    pub fact_issues: Vec<String>,
    pub flow_issues: Vec<String>,
    pub unsupported_claims: Vec<String>,
    pub bias_flags: Vec<String>,
    pub structural_weaknesses: Vec<String>,
    pub citation_issues: Vec<String>,
    pub overall_score: u8,
    pub recommendations: Vec<String>,
}

impl Default for CritiqueReport {
    fn default() -> Self {
        Self {
            fact_issues: Vec::new(),
            flow_issues: Vec::new(),
            unsupported_claims: Vec::new(),
            bias_flags: Vec::new(),
            structural_weaknesses: Vec::new(),
            citation_issues: Vec::new(),
            overall_score: FALLBACK_CRITIQUE_SCORE,
            recommendations: Vec::new(),
        }
    }
}

impl CritiqueReport {
    pub fn issue_count(&self) -> usize {
        self.fact_issues.len()
            + self.flow_issues.len()
            + self.unsupported_claims.len()
            + self.bias_flags.len()
            + self.structural_weaknesses.len()
            + self.citation_issues.len()
    }
}

/// Final report content: the draft plus an executive summary.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RefinedDocument {
    #[serde(rename = "executiveSummary")]
    pub executive_summary: String,
    #[serde(flatten)]
    pub draft: Draft,
}

impl RefinedDocument {
    pub fn keys(&self) -> BTreeSet<String> {
        let mut keys = self.draft.keys();
        keys.insert(sections::EXECUTIVE_SUMMARY.to_string());
        keys
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Reference {
    pub index: usize,
    pub source_id: u32,
    pub text: String,
}

/// Rendered artifacts. The PDF slot stays empty when PDF output is disabled
/// or failed.
#[derive(Debug, Clone, Default)]
pub struct RenderedReport {
    pub html: String,
    pub pdf: Option<Bytes>,
}

// The audit trail keeps sizes, not the documents themselves.
impl Serialize for RenderedReport {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeStruct;

        let mut state = serializer.serialize_struct("RenderedReport", 2)?;
        state.serialize_field("htmlBytes", &self.html.len())?;
        state.serialize_field("pdfBytes", &self.pdf.as_ref().map(Bytes::len))?;
        state.end()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Input,
    Analyzing,
    Planning,
    Searching,
    Validating,
    BuildingKb,
    Drafting,
    Critiquing,
    Refining,
    Citing,
    Rendering,
    Auditing,
    Complete,
    Error,
}

impl RunPhase {
    /// Progress shown when this phase is entered.
    pub fn progress(self) -> u8 {
        match self {
            RunPhase::Input => 0,
            RunPhase::Analyzing => 5,
            RunPhase::Planning => 12,
            RunPhase::Searching => 20,
            RunPhase::Validating => 35,
            RunPhase::BuildingKb => 45,
            RunPhase::Drafting => 55,
            RunPhase::Critiquing => 70,
            RunPhase::Refining => 80,
            RunPhase::Citing => 88,
            RunPhase::Rendering => 92,
            RunPhase::Auditing => 97,
            RunPhase::Complete => 100,
            // error keeps whatever progress the run had reached
            RunPhase::Error => 0,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, RunPhase::Complete | RunPhase::Error)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunPhase::Input => "input",
            RunPhase::Analyzing => "analyzing",
            RunPhase::Planning => "planning",
            RunPhase::Searching => "searching",
            RunPhase::Validating => "validating",
            RunPhase::BuildingKb => "building_kb",
            RunPhase::Drafting => "drafting",
            RunPhase::Critiquing => "critiquing",
            RunPhase::Refining => "refining",
            RunPhase::Citing => "citing",
            RunPhase::Rendering => "rendering",
            RunPhase::Auditing => "auditing",
            RunPhase::Complete => "complete",
            RunPhase::Error => "error",
        }
    }
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One stage's contribution to the audit trail.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEntry {
    pub stage: String,
    pub recorded_at: DateTime<Utc>,
    pub elapsed_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    pub output: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunOutcome {
    Complete,
    Error { phase: RunPhase, reason: String },
}

/// Append-only provenance of one run.
#[derive(Debug, Clone, Serialize)]
pub struct AuditRecord {
    run_id: Uuid,
    started_at: DateTime<Utc>,
    metadata: ReportMetadata,
    entries: Vec<AuditEntry>,
    warnings: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    outcome: Option<RunOutcome>,
}

impl AuditRecord {
    pub fn new(run_id: Uuid, metadata: ReportMetadata) -> Self {
        Self {
            run_id,
            started_at: Utc::now(),
            metadata,
            entries: Vec::new(),
            warnings: Vec::new(),
            outcome: None,
        }
    }

    pub fn record(&mut self, entry: AuditEntry) {
        self.warnings.extend(
            entry
                .warnings
                .iter()
                .map(|w| format!("{}: {}", entry.stage, w)),
        );
        if let Some(reason) = &entry.fallback {
            self.warnings
                .push(format!("{}: fallback used ({})", entry.stage, reason));
        }
        self.entries.push(entry);
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }

    pub fn finish(&mut self, outcome: RunOutcome) {
        self.outcome = Some(outcome);
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn entries(&self) -> &[AuditEntry] {
        &self.entries
    }

    pub fn entry(&self, stage: &str) -> Option<&AuditEntry> {
        self.entries.iter().find(|e| e.stage == stage)
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    pub fn outcome(&self) -> Option<&RunOutcome> {
        self.outcome.as_ref()
    }
}

// API Request/Response models
#[derive(Debug, Deserialize)]
pub struct StartReportRequest {
    pub topic: String,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub researcher: String,
    #[serde(default)]
    pub institution: String,
    pub date: Option<NaiveDate>,
}

impl StartReportRequest {
    pub fn into_metadata(self) -> Result<ReportMetadata, PipelineError> {
        let date = self.date.unwrap_or_else(|| Utc::now().date_naive());
        ReportMetadata::new(
            self.topic,
            self.subject,
            self.researcher,
            self.institution,
            date,
        )
    }
}

#[derive(Debug, Serialize)]
pub struct StartReportResponse {
    pub run_id: Uuid,
    pub phase: RunPhase,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 10, 19).unwrap()
    }

    #[test]
    fn metadata_requires_topic() {
        assert!(ReportMetadata::new("  ", "", "", "", date()).is_err());
        let meta = ReportMetadata::new(" Quantum sensing ", "Physics", "A. Researcher", "MIT", date()).unwrap();
        assert_eq!(meta.topic(), "Quantum sensing");
    }

    #[test]
    fn draft_from_value_normalizes_keys() {
        let value = json!({
            "abstract": "Short abstract.",
            "literature_review": ["First point.", "Second point."],
            "mainSections": [
                {"title": "Background", "content": "Some background."},
                {"content": ""},
                "Loose paragraph"
            ],
            "conclusion": null
        });
        let draft = Draft::from_value(&value).unwrap();
        assert_eq!(draft.section("literatureReview"), Some("First point.\n\nSecond point."));
        assert_eq!(draft.main_sections.len(), 2);
        assert_eq!(draft.main_sections[1].title, "Section 3");
        assert!(!draft.has("conclusion"));
    }

    #[test]
    fn complete_with_fills_every_required_key() {
        let required: Vec<String> = sections::ORDER.iter().map(|s| s.to_string()).collect();
        let mut draft = Draft::default();
        draft.sections.insert("abstract".into(), "Present.".into());

        let filled = draft.complete_with(&required, |key| format!("placeholder for {}", key));
        assert_eq!(filled.len(), required.len() - 1);
        assert!(draft.missing(&required).is_empty());
        assert_eq!(draft.section("abstract"), Some("Present."));
    }

    #[test]
    fn backfill_restores_dropped_keys() {
        let mut original = Draft::default();
        original.sections.insert("abstract".into(), "A".into());
        original.sections.insert("custom".into(), "C".into());
        original.main_sections.push(MainSection { title: "T".into(), content: "X".into() });

        let mut generated = Draft::default();
        generated.sections.insert("abstract".into(), "A2".into());

        let restored = generated.backfill_from(&original);
        assert!(generated.keys().is_superset(&original.keys()));
        assert_eq!(generated.section("abstract"), Some("A2"));
        assert_eq!(restored, vec!["mainSections".to_string(), "custom".to_string()]);
    }

    #[test]
    fn executive_summary_stays_out_of_drafts() {
        let value = json!({
            "abstract": "A",
            "executive_summary": "Generated summary."
        });
        let draft = Draft::from_value(&value).unwrap();
        assert!(!draft.keys().contains(sections::EXECUTIVE_SUMMARY));
        assert_eq!(Draft::summary_from_value(&value).as_deref(), Some("Generated summary."));
        assert_eq!(Draft::summary_from_value(&json!({"executiveSummary": "  "})), None);

        let mut original = Draft::default();
        original.sections.insert(sections::EXECUTIVE_SUMMARY.into(), "Stale".into());
        let mut generated = draft;
        assert!(generated.backfill_from(&original).is_empty());
        assert!(generated.section(sections::EXECUTIVE_SUMMARY).is_none());
    }

    #[test]
    fn critique_defaults_missing_lists() {
        let report: CritiqueReport = serde_json::from_value(json!({"factIssues": ["x"]})).unwrap();
        assert_eq!(report.fact_issues, vec!["x".to_string()]);
        assert!(report.recommendations.is_empty());
        assert_eq!(report.overall_score, FALLBACK_CRITIQUE_SCORE);
    }

    #[test]
    fn refined_document_serializes_flat() {
        let mut draft = Draft::default();
        draft.sections.insert("abstract".into(), "A".into());
        let doc = RefinedDocument { executive_summary: "E".into(), draft };
        let value = serde_json::to_value(&doc).unwrap();
        assert_eq!(value["executiveSummary"], "E");
        assert_eq!(value["abstract"], "A");
    }

    #[test]
    fn phase_progress_is_monotonic_along_the_pipeline() {
        let order = [
            RunPhase::Input,
            RunPhase::Analyzing,
            RunPhase::Planning,
            RunPhase::Searching,
            RunPhase::Validating,
            RunPhase::BuildingKb,
            RunPhase::Drafting,
            RunPhase::Critiquing,
            RunPhase::Refining,
            RunPhase::Citing,
            RunPhase::Rendering,
            RunPhase::Auditing,
            RunPhase::Complete,
        ];
        for pair in order.windows(2) {
            assert!(pair[0].progress() < pair[1].progress());
        }
    }
}
