// Orchestrator: drives one report run through the stage sequence and owns the run state

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::agents::analyzer::TopicAnalyzer;
use crate::agents::audit::AuditExporter;
use crate::agents::citations::CitationManager;
use crate::agents::critic::{Critic, CriticInput};
use crate::agents::knowledge::KnowledgeBaseBuilder;
use crate::agents::planner::QueryPlanner;
use crate::agents::refiner::{Refiner, RefinerInput};
use crate::agents::renderer::{RenderInput, Renderer};
use crate::agents::search::SearchExecutor;
use crate::agents::validator::SourceValidator;
use crate::agents::writer::{Writer, WriterInput};
use crate::agents::{Stage, ANALYZER, PLANNER, VALIDATOR};
use crate::backends::{Backends, PersistenceSink};
use crate::config::Config;
use crate::error::PipelineError;
use crate::metrics::Metrics;
use crate::models::{
    AuditEntry, AuditRecord, RenderedReport, ReportMetadata, RunOutcome, RunPhase,
};

/// Rendered documents of a finished run and where they were persisted.
#[derive(Debug, Clone, Serialize)]
pub struct RunArtifacts {
    #[serde(skip)]
    pub html: String,
    #[serde(skip)]
    pub pdf: Option<Bytes>,
    pub html_location: Option<String>,
    pub pdf_location: Option<String>,
    pub audit_location: String,
}

/// Observable state of the current (or last) run. Only the orchestrator
/// writes it; everything else reads snapshots.
#[derive(Debug, Clone, Serialize)]
pub struct RunState {
    pub run_id: Option<Uuid>,
    pub phase: RunPhase,
    pub progress: u8,
    pub metadata: Option<ReportMetadata>,
    pub warnings: Vec<String>,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub artifacts: Option<RunArtifacts>,
    #[serde(skip)]
    pub audit: Option<AuditRecord>,
}

impl Default for RunState {
    fn default() -> Self {
        Self {
            run_id: None,
            phase: RunPhase::Input,
            progress: 0,
            metadata: None,
            warnings: Vec::new(),
            error: None,
            started_at: None,
            finished_at: None,
            artifacts: None,
            audit: None,
        }
    }
}

impl RunState {
    fn started(run_id: Uuid, metadata: ReportMetadata) -> Self {
        Self {
            run_id: Some(run_id),
            phase: RunPhase::Analyzing,
            progress: RunPhase::Analyzing.progress(),
            metadata: Some(metadata),
            started_at: Some(Utc::now()),
            ..Self::default()
        }
    }
}

struct Stages {
    analyzer: TopicAnalyzer,
    planner: QueryPlanner,
    search: SearchExecutor,
    validator: SourceValidator,
    knowledge: KnowledgeBaseBuilder,
    writer: Writer,
    critic: Critic,
    refiner: Refiner,
    citations: CitationManager,
    renderer: Renderer,
    audit: AuditExporter,
}

impl Stages {
    fn build(config: &Config, backends: &Backends, metrics: &Metrics) -> Result<Self, PipelineError> {
        let max_tokens = config.llm.max_tokens;
        Ok(Self {
            analyzer: TopicAnalyzer::new(backends.generator.clone(), max_tokens),
            planner: QueryPlanner::new(&config.planner),
            search: SearchExecutor::new(
                backends.search.clone(),
                &config.search,
                metrics.search_failures.clone(),
            ),
            validator: SourceValidator::new(&config.sources),
            knowledge: KnowledgeBaseBuilder::new(backends.fetcher.clone(), &config.fetch, &config.sources),
            writer: Writer::new(
                backends.generator.clone(),
                max_tokens,
                config.report.required_sections.clone(),
            ),
            critic: Critic::new(backends.generator.clone(), max_tokens),
            refiner: Refiner::new(backends.generator.clone(), max_tokens),
            citations: CitationManager::new(config.report.show_credibility),
            renderer: Renderer::new(&config.render)?,
            audit: AuditExporter::new(backends.sink.clone()),
        })
    }
}

struct Inner {
    config: Config,
    stages: Stages,
    sink: Arc<dyn PersistenceSink>,
    metrics: Metrics,
    state: RwLock<RunState>,
}

#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn new(config: Config, backends: Backends, metrics: Metrics) -> Result<Self, PipelineError> {
        let stages = Stages::build(&config, &backends, &metrics)?;
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                stages,
                sink: backends.sink,
                metrics,
                state: RwLock::new(RunState::default()),
            }),
        })
    }

    pub async fn snapshot(&self) -> RunState {
        self.inner.state.read().await.clone()
    }

    /// Move from `input` to `analyzing` for a new run. Configuration problems
    /// put the run straight into `error`.
    pub async fn begin(&self, metadata: &ReportMetadata) -> Result<Uuid, PipelineError> {
        let mut state = self.inner.state.write().await;
        match state.phase {
            RunPhase::Input => {}
            phase if phase.is_terminal() => return Err(PipelineError::ResetRequired(phase)),
            phase => return Err(PipelineError::RunInProgress(phase)),
        }

        let run_id = Uuid::new_v4();
        *state = RunState::started(run_id, metadata.clone());

        if let Err(err) = self.inner.config.validate() {
            error!(%run_id, error = %err, "Run refused: configuration incomplete");
            state.phase = RunPhase::Error;
            state.error = Some(err.to_string());
            state.finished_at = Some(Utc::now());
            self.inner.metrics.runs_total.with_label_values(&["error"]).inc();
            return Err(err);
        }

        info!(%run_id, topic = metadata.topic(), "Report run started");
        Ok(run_id)
    }

    /// Start a run and drive it to a terminal phase.
    pub async fn run(&self, metadata: ReportMetadata) -> Result<Uuid, PipelineError> {
        let run_id = self.begin(&metadata).await?;
        self.execute(run_id, metadata).await?;
        Ok(run_id)
    }

    /// Back to `input`, dropping everything the previous run accumulated.
    /// A run still in flight is superseded and its later writes discarded.
    pub async fn reset(&self) -> Option<Uuid> {
        let mut state = self.inner.state.write().await;
        let previous = state.run_id;
        if !state.phase.is_terminal() && state.phase != RunPhase::Input {
            warn!(run_id = ?previous, phase = %state.phase, "Reset while running, in-flight results will be discarded");
        } else {
            info!(run_id = ?previous, "Run state reset");
        }
        *state = RunState::default();
        previous
    }

    /// Run every stage of a run started with [`Orchestrator::begin`].
    pub async fn execute(&self, run_id: Uuid, metadata: ReportMetadata) -> Result<(), PipelineError> {
        let mut audit = AuditRecord::new(run_id, metadata.clone());
        let started = Instant::now();

        match self.drive(run_id, &metadata, &mut audit).await {
            Ok(artifacts) => {
                let warnings = audit.warnings().to_vec();
                self.with_run(run_id, move |state| {
                    state.phase = RunPhase::Complete;
                    state.progress = RunPhase::Complete.progress();
                    state.finished_at = Some(Utc::now());
                    state.warnings = warnings;
                    state.artifacts = Some(artifacts);
                    state.audit = Some(audit);
                })
                .await?;
                self.inner.metrics.runs_total.with_label_values(&["complete"]).inc();
                info!(%run_id, elapsed_ms = started.elapsed().as_millis() as u64, "Report run complete");
                Ok(())
            }
            Err(PipelineError::Superseded(id)) => {
                info!(run_id = %id, "Run superseded by reset, results discarded");
                Err(PipelineError::Superseded(id))
            }
            Err(err) => self.fail(run_id, audit, err).await,
        }
    }

    async fn drive(
        &self,
        run_id: Uuid,
        metadata: &ReportMetadata,
        audit: &mut AuditRecord,
    ) -> Result<RunArtifacts, PipelineError> {
        let stages = &self.inner.stages;

        let plan = self
            .run_stage(run_id, RunPhase::Analyzing, &stages.analyzer, metadata.clone(), audit)
            .await?;
        if plan.subtopics.is_empty() {
            return Err(PipelineError::EmptyOutput { stage: ANALYZER, what: "subtopics" });
        }
        let subtopics = plan.subtopics.clone();

        let queries = self
            .run_stage(run_id, RunPhase::Planning, &stages.planner, plan, audit)
            .await?;
        if queries.is_empty() {
            return Err(PipelineError::EmptyOutput { stage: PLANNER, what: "queries" });
        }

        let hits = self
            .run_stage(run_id, RunPhase::Searching, &stages.search, queries, audit)
            .await?;

        let validation = self
            .run_stage(run_id, RunPhase::Validating, &stages.validator, hits, audit)
            .await?;
        let sources = validation.accepted;
        self.check_source_count(sources.len(), audit)?;

        let facts = self
            .run_stage(run_id, RunPhase::BuildingKb, &stages.knowledge, sources.clone(), audit)
            .await?;

        let draft_input = WriterInput {
            metadata: metadata.clone(),
            subtopics,
            sources: sources.clone(),
            facts,
        };
        let draft = self
            .run_stage(run_id, RunPhase::Drafting, &stages.writer, draft_input, audit)
            .await?;

        let critic_input = CriticInput {
            draft: draft.clone(),
            sources: sources.clone(),
        };
        let critique = self
            .run_stage(run_id, RunPhase::Critiquing, &stages.critic, critic_input, audit)
            .await?;

        let refiner_input = RefinerInput {
            topic: metadata.topic().to_string(),
            draft,
            critique,
            source_count: sources.len(),
        };
        let document = self
            .run_stage(run_id, RunPhase::Refining, &stages.refiner, refiner_input, audit)
            .await?;

        let references = self
            .run_stage(run_id, RunPhase::Citing, &stages.citations, sources, audit)
            .await?;

        let render_input = RenderInput {
            document,
            references,
            metadata: metadata.clone(),
        };
        let rendered = self
            .run_stage(run_id, RunPhase::Rendering, &stages.renderer, render_input, audit)
            .await?;
        let (html_location, pdf_location) = self.persist_rendered(run_id, &rendered, audit).await?;

        audit.finish(RunOutcome::Complete);
        let snapshot = audit.clone();
        let audit_location = self
            .run_stage(run_id, RunPhase::Auditing, &stages.audit, snapshot, audit)
            .await?;

        Ok(RunArtifacts {
            html: rendered.html,
            pdf: rendered.pdf,
            html_location,
            pdf_location,
            audit_location,
        })
    }

    /// Enter `phase`, run the stage, and record its outcome in the audit trail.
    async fn run_stage<S: Stage>(
        &self,
        run_id: Uuid,
        phase: RunPhase,
        stage: &S,
        input: S::Input,
        audit: &mut AuditRecord,
    ) -> Result<S::Output, PipelineError> {
        self.with_run(run_id, |state| {
            state.phase = phase;
            state.progress = state.progress.max(phase.progress());
        })
        .await?;

        let name = stage.name();
        info!(%run_id, stage = name, "Stage started");
        let started = Instant::now();
        let result = if stage.writes_artifacts() {
            self.while_current(run_id, stage.run(input)).await?
        } else {
            stage.run(input).await
        };
        let elapsed = started.elapsed();
        self.inner
            .metrics
            .stage_duration
            .with_label_values(&[name])
            .observe(elapsed.as_secs_f64());
        let outcome = result?;

        let elapsed_ms = elapsed.as_millis() as u64;
        if let Some(reason) = &outcome.fallback {
            self.inner.metrics.stage_fallbacks.with_label_values(&[name]).inc();
            warn!(%run_id, stage = name, %reason, "Stage used its fallback output");
        }
        audit.record(AuditEntry {
            stage: name.to_string(),
            recorded_at: Utc::now(),
            elapsed_ms,
            fallback: outcome.fallback.clone(),
            warnings: outcome.warnings.clone(),
            output: stage.audit_view(&outcome.value),
        });

        let warnings = audit.warnings().to_vec();
        self.with_run(run_id, move |state| state.warnings = warnings).await?;
        info!(%run_id, stage = name, elapsed_ms, "Stage finished");
        Ok(outcome.value)
    }

    fn check_source_count(&self, count: usize, audit: &mut AuditRecord) -> Result<(), PipelineError> {
        let policy = &self.inner.config.sources;
        if count == 0 {
            if !policy.allow_empty {
                return Err(PipelineError::EmptyOutput {
                    stage: VALIDATOR,
                    what: "accepted sources",
                });
            }
            warn!("No trusted sources found, continuing without external evidence");
            audit.warn("no trusted sources were found; the report is not grounded in external evidence");
        } else if count < policy.min_sources {
            warn!(count, minimum = policy.min_sources, "Few trusted sources found");
            audit.warn(format!(
                "only {} trusted sources found (at least {} recommended)",
                count, policy.min_sources
            ));
        }
        Ok(())
    }

    /// Artifact persistence is best effort; the documents stay in memory.
    /// Only a superseded run is an error, and it writes nothing.
    async fn persist_rendered(
        &self,
        run_id: Uuid,
        rendered: &RenderedReport,
        audit: &mut AuditRecord,
    ) -> Result<(Option<String>, Option<String>), PipelineError> {
        let sink = &self.inner.sink;
        let html_key = format!("report-{}.html", run_id);
        let html_location = match self
            .while_current(run_id, sink.persist(&html_key, rendered.html.as_bytes()))
            .await?
        {
            Ok(location) => Some(location),
            Err(e) => {
                warn!(%run_id, error = %e, "Could not persist HTML report");
                audit.warn(format!("HTML report not persisted: {}", e));
                None
            }
        };

        let pdf_location = match &rendered.pdf {
            Some(pdf) => {
                let pdf_key = format!("report-{}.pdf", run_id);
                match self.while_current(run_id, sink.persist(&pdf_key, pdf)).await? {
                    Ok(location) => Some(location),
                    Err(e) => {
                        warn!(%run_id, error = %e, "Could not persist PDF report");
                        audit.warn(format!("PDF report not persisted: {}", e));
                        None
                    }
                }
            }
            None => None,
        };

        Ok((html_location, pdf_location))
    }

    async fn fail(&self, run_id: Uuid, mut audit: AuditRecord, err: PipelineError) -> Result<(), PipelineError> {
        let reason = err.to_string();
        let phase = {
            let state = self.inner.state.read().await;
            if state.run_id != Some(run_id) {
                return Err(PipelineError::Superseded(run_id));
            }
            state.phase
        };
        error!(%run_id, %phase, error = %reason, "Report run failed");

        audit.finish(RunOutcome::Error {
            phase,
            reason: reason.clone(),
        });
        let warnings = audit.warnings().to_vec();
        self.with_run(run_id, move |state| {
            state.phase = RunPhase::Error;
            state.error = Some(reason);
            state.finished_at = Some(Utc::now());
            state.warnings = warnings;
            state.audit = Some(audit);
        })
        .await?;
        self.inner.metrics.runs_total.with_label_values(&["error"]).inc();
        Err(err)
    }

    /// Await `work` only while `run_id` is the current run, holding the state
    /// so that a reset waits for it to finish.
    async fn while_current<T>(&self, run_id: Uuid, work: impl Future<Output = T>) -> Result<T, PipelineError> {
        let state = self.inner.state.read().await;
        if state.run_id != Some(run_id) {
            return Err(PipelineError::Superseded(run_id));
        }
        let output = work.await;
        drop(state);
        Ok(output)
    }

    /// Apply `update` only while `run_id` is still the current run.
    async fn with_run<F>(&self, run_id: Uuid, update: F) -> Result<(), PipelineError>
    where
        F: FnOnce(&mut RunState),
    {
        let mut state = self.inner.state.write().await;
        if state.run_id != Some(run_id) {
            return Err(PipelineError::Superseded(run_id));
        }
        update(&mut state);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::NaiveDate;
    use prometheus::Registry;
    use serde_json::Value;
    use tokio::sync::Notify;

    use crate::agents::{CRITIC, REFINER, WRITER};
    use crate::backends::testing::{hit, FailingGenerator, MemorySink, StaticSearch};
    use crate::backends::{Message, TextGenerator};
    use crate::config::{LlmProvider, RenderEngine};
    use crate::error::BackendError;

    fn metadata() -> ReportMetadata {
        ReportMetadata::new(
            "Quantum sensing",
            "Physics",
            "R. Feynman",
            "Caltech",
            NaiveDate::from_ymd_opt(2026, 10, 19).unwrap(),
        )
        .unwrap()
    }

    fn trusted_search() -> StaticSearch {
        StaticSearch::always(vec![
            hit("Sensing review", "https://mit.edu/sensing"),
            hit("Federal roadmap", "https://nist.gov/quantum"),
            hit("Nature article", "https://www.nature.com/articles/q1"),
            hit("Blog post", "https://randomblog.example/post"),
        ])
    }

    fn backends(generator: Arc<dyn TextGenerator>, search: StaticSearch, sink: Arc<MemorySink>) -> Backends {
        Backends {
            generator,
            search: Arc::new(search),
            fetcher: None,
            sink,
        }
    }

    fn offline() -> Arc<dyn TextGenerator> {
        Arc::new(FailingGenerator(BackendError::Unavailable("llm".into())))
    }

    fn orchestrator(config: Config, backends: Backends) -> (Orchestrator, Metrics) {
        let metrics = Metrics::register(&Registry::new()).unwrap();
        let orchestrator = Orchestrator::new(config, backends, metrics.clone()).unwrap();
        (orchestrator, metrics)
    }

    #[tokio::test]
    async fn failing_generator_still_completes_with_fallbacks_flagged() {
        let sink = Arc::new(MemorySink::default());
        let (orch, metrics) = orchestrator(Config::default(), backends(offline(), trusted_search(), sink.clone()));

        let run_id = orch.run(metadata()).await.unwrap();
        let state = orch.snapshot().await;
        assert_eq!(state.phase, RunPhase::Complete);
        assert_eq!(state.progress, 100);

        let audit = state.audit.as_ref().unwrap();
        for stage in [ANALYZER, WRITER, CRITIC, REFINER] {
            assert!(audit.entry(stage).unwrap().fallback.is_some(), "{} not flagged", stage);
        }
        assert_eq!(metrics.stage_fallbacks.with_label_values(&[WRITER]).get(), 1);
        assert_eq!(metrics.runs_total.with_label_values(&["complete"]).get(), 1);

        let artifacts = state.artifacts.as_ref().unwrap();
        assert!(artifacts.html.contains("Quantum sensing"));
        assert!(artifacts.pdf.is_none());
        assert_eq!(
            sink.keys(),
            vec![format!("audit-{}.json", run_id), format!("report-{}.html", run_id)]
        );
    }

    #[tokio::test]
    async fn persisted_audit_carries_plan_sources_and_critique() {
        let sink = Arc::new(MemorySink::default());
        let (orch, _) = orchestrator(Config::default(), backends(offline(), trusted_search(), sink.clone()));
        let run_id = orch.run(metadata()).await.unwrap();

        let raw = sink.get(&format!("audit-{}.json", run_id)).unwrap();
        let audit: Value = serde_json::from_slice(&raw).unwrap();
        assert_eq!(audit["metadata"]["topic"], "Quantum sensing");
        assert_eq!(audit["outcome"]["status"], "complete");

        let entry = |stage: &str| {
            audit["entries"]
                .as_array()
                .unwrap()
                .iter()
                .find(|e| e["stage"] == stage)
                .cloned()
                .unwrap()
        };
        assert!(!entry(ANALYZER)["output"]["subtopics"].as_array().unwrap().is_empty());
        let accepted = entry(VALIDATOR)["output"]["accepted"].as_array().unwrap().clone();
        let ids: Vec<u64> = accepted.iter().map(|s| s["id"].as_u64().unwrap()).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert_eq!(entry(CRITIC)["output"]["overallScore"], 50);
    }

    #[tokio::test]
    async fn zero_sources_is_a_hard_failure_by_default() {
        let sink = Arc::new(MemorySink::default());
        let (orch, metrics) = orchestrator(Config::default(), backends(offline(), StaticSearch::empty(), sink.clone()));

        let err = orch.run(metadata()).await.unwrap_err();
        assert!(matches!(err, PipelineError::EmptyOutput { stage: VALIDATOR, .. }));

        let state = orch.snapshot().await;
        assert_eq!(state.phase, RunPhase::Error);
        assert_eq!(state.progress, RunPhase::Validating.progress());
        assert!(state.error.as_deref().unwrap().contains("accepted sources"));

        let audit = state.audit.as_ref().unwrap();
        assert!(audit.entry(VALIDATOR).is_some());
        assert!(audit.entry(WRITER).is_none());
        assert!(matches!(
            audit.outcome(),
            Some(RunOutcome::Error { phase: RunPhase::Validating, .. })
        ));
        assert!(sink.keys().is_empty());
        assert_eq!(metrics.runs_total.with_label_values(&["error"]).get(), 1);
    }

    #[tokio::test]
    async fn zero_sources_warns_when_allowed() {
        let mut config = Config::default();
        config.sources.allow_empty = true;
        let (orch, _) = orchestrator(config, backends(offline(), StaticSearch::empty(), Arc::new(MemorySink::default())));

        orch.run(metadata()).await.unwrap();
        let state = orch.snapshot().await;
        assert_eq!(state.phase, RunPhase::Complete);
        assert!(state.warnings.iter().any(|w| w.contains("no trusted sources")));
    }

    #[tokio::test]
    async fn few_sources_is_a_warning() {
        let search = StaticSearch::always(vec![hit("Only one", "https://mit.edu/one")]);
        let (orch, _) = orchestrator(Config::default(), backends(offline(), search, Arc::new(MemorySink::default())));

        orch.run(metadata()).await.unwrap();
        let state = orch.snapshot().await;
        assert_eq!(state.phase, RunPhase::Complete);
        assert!(state.warnings.iter().any(|w| w.contains("only 1 trusted sources")));
    }

    #[tokio::test]
    async fn unavailable_pdf_still_completes() {
        let fonts = tempfile::TempDir::new().unwrap();
        let mut config = Config::default();
        config.render.engine = RenderEngine::HtmlPdf;
        config.render.font_dir = fonts.path().to_path_buf();
        let (orch, _) = orchestrator(config, backends(offline(), trusted_search(), Arc::new(MemorySink::default())));

        orch.run(metadata()).await.unwrap();
        let state = orch.snapshot().await;
        assert_eq!(state.phase, RunPhase::Complete);
        let artifacts = state.artifacts.unwrap();
        assert!(artifacts.pdf.is_none());
        assert!(artifacts.pdf_location.is_none());
        assert!(artifacts.html.starts_with("<!DOCTYPE html>"));
        assert!(state.warnings.iter().any(|w| w.contains("PDF not produced")));
    }

    #[tokio::test]
    async fn audit_persistence_failure_is_fatal() {
        let (orch, _) = orchestrator(
            Config::default(),
            backends(offline(), trusted_search(), Arc::new(MemorySink::failing())),
        );

        let err = orch.run(metadata()).await.unwrap_err();
        assert!(matches!(err, PipelineError::Persistence(_)));
        let state = orch.snapshot().await;
        assert_eq!(state.phase, RunPhase::Error);
        assert!(state.warnings.iter().any(|w| w.contains("HTML report not persisted")));
    }

    #[tokio::test]
    async fn missing_credential_refuses_to_start() {
        let mut config = Config::default();
        config.llm.provider = LlmProvider::Openai;
        config.llm.api_key = None;
        let sink = Arc::new(MemorySink::default());
        let (orch, _) = orchestrator(config, backends(offline(), trusted_search(), sink.clone()));

        let err = orch.run(metadata()).await.unwrap_err();
        assert!(matches!(err, PipelineError::MissingConfiguration(_)));

        let state = orch.snapshot().await;
        assert_eq!(state.phase, RunPhase::Error);
        assert!(state.error.unwrap().contains("llm.api_key"));
        assert!(state.audit.is_none());
        assert!(sink.keys().is_empty());

        assert!(matches!(
            orch.begin(&metadata()).await,
            Err(PipelineError::ResetRequired(RunPhase::Error))
        ));
    }

    #[tokio::test]
    async fn reset_clears_state_and_allows_a_new_run() {
        let (orch, _) = orchestrator(
            Config::default(),
            backends(offline(), trusted_search(), Arc::new(MemorySink::default())),
        );
        let first = orch.run(metadata()).await.unwrap();
        assert!(matches!(
            orch.begin(&metadata()).await,
            Err(PipelineError::ResetRequired(RunPhase::Complete))
        ));

        assert_eq!(orch.reset().await, Some(first));
        let state = orch.snapshot().await;
        assert_eq!(state.phase, RunPhase::Input);
        assert_eq!(state.progress, 0);
        assert!(state.run_id.is_none());
        assert!(state.audit.is_none() && state.artifacts.is_none() && state.warnings.is_empty());

        let second = orch.run(metadata()).await.unwrap();
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn concurrent_start_is_rejected() {
        let (orch, _) = orchestrator(
            Config::default(),
            backends(offline(), trusted_search(), Arc::new(MemorySink::default())),
        );
        orch.begin(&metadata()).await.unwrap();
        assert!(matches!(
            orch.begin(&metadata()).await,
            Err(PipelineError::RunInProgress(RunPhase::Analyzing))
        ));
    }

    /// Parks its first call until released, then behaves as unavailable.
    struct GatedGenerator {
        entered: Arc<Notify>,
        gate: Arc<Notify>,
        used: AtomicBool,
    }

    #[async_trait]
    impl TextGenerator for GatedGenerator {
        async fn generate(&self, _: &[Message], _: u32) -> Result<String, BackendError> {
            if !self.used.swap(true, Ordering::SeqCst) {
                self.entered.notify_one();
                self.gate.notified().await;
            }
            Err(BackendError::Unavailable("llm".into()))
        }
    }

    #[tokio::test]
    async fn reset_mid_run_discards_the_stale_run() {
        let entered = Arc::new(Notify::new());
        let gate = Arc::new(Notify::new());
        let generator = Arc::new(GatedGenerator {
            entered: entered.clone(),
            gate: gate.clone(),
            used: AtomicBool::new(false),
        });
        let sink = Arc::new(MemorySink::default());
        let (orch, _) = orchestrator(Config::default(), backends(generator, trusted_search(), sink.clone()));

        let stale_id = orch.begin(&metadata()).await.unwrap();
        let stale = tokio::spawn({
            let orch = orch.clone();
            async move { orch.execute(stale_id, metadata()).await }
        });
        entered.notified().await;

        assert_eq!(orch.reset().await, Some(stale_id));
        let fresh_id = orch.run(metadata()).await.unwrap();

        gate.notify_one();
        let result = stale.await.unwrap();
        assert!(matches!(result, Err(PipelineError::Superseded(id)) if id == stale_id));

        let state = orch.snapshot().await;
        assert_eq!(state.run_id, Some(fresh_id));
        assert_eq!(state.phase, RunPhase::Complete);
        assert!(sink.keys().iter().all(|k| !k.contains(&stale_id.to_string())));
    }

    #[tokio::test]
    async fn superseded_run_persists_no_artifacts() {
        let sink = Arc::new(MemorySink::default());
        let (orch, _) = orchestrator(Config::default(), backends(offline(), trusted_search(), sink.clone()));
        let rendered = RenderedReport {
            html: "<p>report</p>".into(),
            pdf: Some(Bytes::from_static(b"%PDF-1.4")),
        };

        let stale_id = orch.begin(&metadata()).await.unwrap();
        orch.reset().await;
        let mut audit = AuditRecord::new(stale_id, metadata());
        let result = orch.persist_rendered(stale_id, &rendered, &mut audit).await;
        assert!(matches!(result, Err(PipelineError::Superseded(id)) if id == stale_id));
        assert!(sink.keys().is_empty());

        let run_id = orch.begin(&metadata()).await.unwrap();
        let mut audit = AuditRecord::new(run_id, metadata());
        let (html, pdf) = orch.persist_rendered(run_id, &rendered, &mut audit).await.unwrap();
        assert_eq!(html, Some(format!("memory://report-{}.html", run_id)));
        assert_eq!(pdf, Some(format!("memory://report-{}.pdf", run_id)));
        assert_eq!(sink.keys().len(), 2);
    }

    #[tokio::test]
    async fn reset_waits_for_an_in_flight_write() {
        let (orch, _) = orchestrator(
            Config::default(),
            backends(offline(), trusted_search(), Arc::new(MemorySink::default())),
        );
        let run_id = orch.begin(&metadata()).await.unwrap();
        let started = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());

        let write = tokio::spawn({
            let orch = orch.clone();
            let started = started.clone();
            let release = release.clone();
            async move {
                orch.while_current(run_id, async {
                    started.notify_one();
                    release.notified().await;
                })
                .await
            }
        });
        started.notified().await;

        let reset = tokio::spawn({
            let orch = orch.clone();
            async move { orch.reset().await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!reset.is_finished());

        release.notify_one();
        assert!(write.await.unwrap().is_ok());
        assert_eq!(reset.await.unwrap(), Some(run_id));
        assert!(matches!(
            orch.while_current(run_id, async {}).await,
            Err(PipelineError::Superseded(id)) if id == run_id
        ));
    }
}
