use std::path::PathBuf;

use anyhow::Result;
use serde::Deserialize;

use crate::error::PipelineError;
use crate::models::sections;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub port: u16,
    pub output_dir: PathBuf,
    pub log_level: String,
    pub search: SearchConfig,
    pub llm: LlmConfig,
    pub fetch: FetchConfig,
    pub sources: SourcePolicyConfig,
    pub planner: PlannerConfig,
    pub render: RenderConfig,
    pub report: ReportConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchProvider {
    Placeholder,
    Serper,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub provider: SearchProvider,
    pub api_key: Option<String>,
    pub endpoint: String,
    pub results_per_query: usize,
    /// External calls issued per run, applied after the planner cap.
    pub query_limit: usize,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LlmProvider {
    Offline,
    Openai,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub provider: LlmProvider,
    pub model: String,
    pub base_url: String,
    pub api_key: Option<String>,
    pub max_tokens: u32,
    pub temperature: f32,
    pub min_interval_ms: u64,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    pub enabled: bool,
    pub timeout_secs: u64,
    pub max_paragraphs: usize,
    pub max_fact_chars: usize,
    pub min_paragraph_chars: usize,
    /// Larger declared bodies are refused; undeclared ones are cut here.
    pub max_body_bytes: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AcceptancePolicy {
    Allowlist,
    Threshold,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SourcePolicyConfig {
    pub acceptance: AcceptancePolicy,
    pub allowed_domains: Vec<String>,
    pub min_score: u8,
    pub max_sources: usize,
    pub min_sources: usize,
    pub allow_empty: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PlannerConfig {
    pub max_queries: usize,
    pub site_filters: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RenderEngine {
    Html,
    HtmlPdf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RenderConfig {
    pub engine: RenderEngine,
    pub font_dir: PathBuf,
    pub font_family: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReportConfig {
    pub required_sections: Vec<String>,
    /// Append `Credibility: n/100` to each reference.
    pub show_credibility: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8080,
            output_dir: PathBuf::from("outputs"),
            log_level: "info".to_string(),
            search: SearchConfig::default(),
            llm: LlmConfig::default(),
            fetch: FetchConfig::default(),
            sources: SourcePolicyConfig::default(),
            planner: PlannerConfig::default(),
            render: RenderConfig::default(),
            report: ReportConfig::default(),
        }
    }
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            provider: SearchProvider::Placeholder,
            api_key: None,
            endpoint: "https://google.serper.dev/search".to_string(),
            results_per_query: 5,
            query_limit: 6,
            timeout_secs: 20,
        }
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: LlmProvider::Offline,
            model: "gpt-4o-mini".to_string(),
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: None,
            max_tokens: 2048,
            temperature: 0.3,
            min_interval_ms: 1000,
            max_retries: 3,
            retry_backoff_ms: 2000,
            timeout_secs: 120,
        }
    }
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            timeout_secs: 15,
            max_paragraphs: 3,
            max_fact_chars: 500,
            min_paragraph_chars: 60,
            max_body_bytes: 2 * 1024 * 1024,
        }
    }
}

impl Default for SourcePolicyConfig {
    fn default() -> Self {
        Self {
            acceptance: AcceptancePolicy::Allowlist,
            allowed_domains: [
                ".edu",
                ".gov",
                ".org",
                "ieee.org",
                "nature.com",
                "sciencedirect.com",
                "acm.org",
                "springer.com",
            ]
            .iter()
            .map(|d| d.to_string())
            .collect(),
            min_score: 75,
            max_sources: 15,
            min_sources: 3,
            allow_empty: false,
        }
    }
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            max_queries: 15,
            site_filters: vec!["edu".to_string(), "gov".to_string()],
        }
    }
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            engine: RenderEngine::Html,
            font_dir: PathBuf::from("/usr/share/fonts/truetype/liberation"),
            font_family: "LiberationSans".to_string(),
        }
    }
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            required_sections: sections::ORDER.iter().map(|s| s.to_string()).collect(),
            show_credibility: true,
        }
    }
}

impl Config {
    /// `.env`, then an optional `report.toml`, then `REPORT__*` variables.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let settings = ::config::Config::builder()
            .add_source(::config::File::with_name("report").required(false))
            .add_source(
                ::config::Environment::with_prefix("REPORT")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("sources.allowed_domains")
                    .with_list_parse_key("planner.site_filters")
                    .with_list_parse_key("report.required_sections"),
            )
            .build()?;

        let mut config: Config = settings.try_deserialize()?;

        if config.llm.api_key.is_none() {
            config.llm.api_key = std::env::var("OPENAI_API_KEY").ok().filter(|k| !k.is_empty());
        }
        if config.search.api_key.is_none() {
            config.search.api_key = std::env::var("SERPER_API_KEY").ok().filter(|k| !k.is_empty());
        }
        if let Ok(port) = std::env::var("PORT") {
            config.port = port.parse()?;
        }

        Ok(config)
    }

    /// Credentials required by the selected providers.
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.llm.provider == LlmProvider::Openai && !has_value(&self.llm.api_key) {
            return Err(PipelineError::MissingConfiguration(
                "llm.api_key (or OPENAI_API_KEY) is required when llm.provider = openai".to_string(),
            ));
        }
        if self.search.provider == SearchProvider::Serper && !has_value(&self.search.api_key) {
            return Err(PipelineError::MissingConfiguration(
                "search.api_key (or SERPER_API_KEY) is required when search.provider = serper"
                    .to_string(),
            ));
        }
        if self.report.required_sections.is_empty() {
            return Err(PipelineError::MissingConfiguration(
                "report.required_sections must name at least one section".to_string(),
            ));
        }
        Ok(())
    }
}

fn has_value(value: &Option<String>) -> bool {
    value.as_deref().map(|v| !v.trim().is_empty()).unwrap_or(false)
}
