use serde_json::json;
use tracing::{debug, info};
use warp::http::StatusCode;
use warp::reply::Response;
use warp::{Rejection, Reply};

use crate::error::ApiError;
use crate::models::{RunPhase, StartReportRequest, StartReportResponse};
use crate::pipeline::Orchestrator;

pub async fn handle_start(
    request: StartReportRequest,
    orchestrator: Orchestrator,
) -> Result<impl Reply, Rejection> {
    let metadata = request.into_metadata().map_err(reject)?;
    let run_id = orchestrator.begin(&metadata).await.map_err(reject)?;
    info!(%run_id, topic = metadata.topic(), "Report requested");

    let runner = orchestrator.clone();
    tokio::spawn(async move {
        // the outcome is recorded in the run state
        if let Err(e) = runner.execute(run_id, metadata).await {
            debug!(%run_id, error = %e, "Background run ended with error");
        }
    });

    Ok(warp::reply::with_status(
        warp::reply::json(&StartReportResponse {
            run_id,
            phase: RunPhase::Analyzing,
        }),
        StatusCode::ACCEPTED,
    ))
}

pub async fn handle_status(orchestrator: Orchestrator) -> Result<impl Reply, Rejection> {
    Ok(warp::reply::json(&orchestrator.snapshot().await))
}

pub async fn handle_reset(orchestrator: Orchestrator) -> Result<impl Reply, Rejection> {
    let previous = orchestrator.reset().await;
    Ok(warp::reply::json(&json!({
        "reset": true,
        "previous_run_id": previous,
        "phase": RunPhase::Input,
    })))
}

enum Artifact {
    Html,
    Pdf,
    Audit,
}

impl Artifact {
    fn parse(kind: &str) -> Result<Self, ApiError> {
        match kind {
            "html" => Ok(Artifact::Html),
            "pdf" => Ok(Artifact::Pdf),
            "audit" => Ok(Artifact::Audit),
            other => Err(ApiError::BadRequest(format!(
                "unknown artifact kind: {} (expected html, pdf or audit)",
                other
            ))),
        }
    }
}

pub async fn handle_artifact(kind: String, orchestrator: Orchestrator) -> Result<Response, Rejection> {
    let artifact = Artifact::parse(&kind).map_err(warp::reject::custom)?;
    let state = orchestrator.snapshot().await;
    let run_id = state
        .run_id
        .ok_or_else(|| warp::reject::custom(ApiError::NotFound("no report run".to_string())))?;

    match artifact {
        Artifact::Audit => {
            let audit = state
                .audit
                .ok_or_else(|| not_ready("audit record"))?;
            Ok(warp::reply::json(&audit).into_response())
        }
        Artifact::Html => {
            let artifacts = state.artifacts.ok_or_else(|| not_ready("HTML report"))?;
            Ok(warp::reply::html(artifacts.html).into_response())
        }
        Artifact::Pdf => {
            let pdf = state
                .artifacts
                .and_then(|a| a.pdf)
                .ok_or_else(|| not_ready("PDF report"))?;
            let reply = warp::reply::with_header(pdf.to_vec(), "Content-Type", "application/pdf");
            let reply = warp::reply::with_header(
                reply,
                "Content-Disposition",
                format!("attachment; filename=\"report-{}.pdf\"", run_id),
            );
            Ok(reply.into_response())
        }
    }
}

fn reject(err: crate::error::PipelineError) -> Rejection {
    warp::reject::custom(ApiError::Pipeline(err))
}

fn not_ready(what: &str) -> Rejection {
    warp::reject::custom(ApiError::NotFound(format!("{} is not available", what)))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use prometheus::Registry;
    use serde_json::Value;
    use warp::Filter;

    use crate::api::routes;
    use crate::backends::testing::{hit, FailingGenerator, MemorySink, StaticSearch};
    use crate::backends::Backends;
    use crate::config::Config;
    use crate::error::{handle_rejection, BackendError};
    use crate::metrics::Metrics;
    use crate::pipeline::Orchestrator;

    fn orchestrator() -> Orchestrator {
        let backends = Backends {
            generator: Arc::new(FailingGenerator(BackendError::Unavailable("llm".into()))),
            search: Arc::new(StaticSearch::always(vec![
                hit("A", "https://mit.edu/a"),
                hit("B", "https://nasa.gov/b"),
                hit("C", "https://stanford.edu/c"),
            ])),
            fetcher: None,
            sink: Arc::new(MemorySink::default()),
        };
        let metrics = Metrics::register(&Registry::new()).unwrap();
        Orchestrator::new(Config::default(), backends, metrics).unwrap()
    }

    async fn wait_until_finished(orchestrator: &Orchestrator) {
        for _ in 0..200 {
            if orchestrator.snapshot().await.phase.is_terminal() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("run did not finish");
    }

    #[tokio::test]
    async fn start_then_download_html() {
        let orch = orchestrator();
        let api = routes(orch.clone()).recover(handle_rejection);

        let resp = warp::test::request()
            .method("POST")
            .path("/api/v1/reports")
            .json(&serde_json::json!({"topic": "Edge computing", "researcher": "A. Turing"}))
            .reply(&api)
            .await;
        assert_eq!(resp.status(), 202);
        let body: Value = serde_json::from_slice(resp.body()).unwrap();
        assert_eq!(body["phase"], "analyzing");

        wait_until_finished(&orch).await;

        let resp = warp::test::request()
            .path("/api/v1/reports/status")
            .reply(&api)
            .await;
        let status: Value = serde_json::from_slice(resp.body()).unwrap();
        assert_eq!(status["phase"], "complete");
        assert_eq!(status["progress"], 100);
        assert_eq!(status["run_id"], body["run_id"]);

        let resp = warp::test::request()
            .path("/api/v1/reports/artifacts/html")
            .reply(&api)
            .await;
        assert_eq!(resp.status(), 200);
        assert!(String::from_utf8_lossy(resp.body()).contains("Edge computing"));

        let resp = warp::test::request()
            .path("/api/v1/reports/artifacts/audit")
            .reply(&api)
            .await;
        assert_eq!(resp.status(), 200);

        let resp = warp::test::request()
            .path("/api/v1/reports/artifacts/pdf")
            .reply(&api)
            .await;
        assert_eq!(resp.status(), 404);
    }

    #[tokio::test]
    async fn empty_topic_is_a_bad_request() {
        let api = routes(orchestrator()).recover(handle_rejection);
        let resp = warp::test::request()
            .method("POST")
            .path("/api/v1/reports")
            .json(&serde_json::json!({"topic": "   "}))
            .reply(&api)
            .await;
        assert_eq!(resp.status(), 400);
    }

    #[tokio::test]
    async fn second_start_conflicts_until_reset() {
        let orch = orchestrator();
        let api = routes(orch.clone()).recover(handle_rejection);
        let start = || {
            warp::test::request()
                .method("POST")
                .path("/api/v1/reports")
                .json(&serde_json::json!({"topic": "Soil health"}))
        };

        assert_eq!(start().reply(&api).await.status(), 202);
        assert_eq!(start().reply(&api).await.status(), 409);
        wait_until_finished(&orch).await;
        assert_eq!(start().reply(&api).await.status(), 409);

        let resp = warp::test::request()
            .method("POST")
            .path("/api/v1/reports/reset")
            .reply(&api)
            .await;
        assert_eq!(resp.status(), 200);
        assert_eq!(orch.snapshot().await.phase, crate::models::RunPhase::Input);

        assert_eq!(start().reply(&api).await.status(), 202);
        wait_until_finished(&orch).await;
    }

    #[tokio::test]
    async fn artifacts_before_any_run_are_not_found() {
        let api = routes(orchestrator()).recover(handle_rejection);
        for kind in ["html", "pdf", "audit"] {
            let resp = warp::test::request()
                .path(&format!("/api/v1/reports/artifacts/{}", kind))
                .reply(&api)
                .await;
            assert_eq!(resp.status(), 404, "{}", kind);
        }
    }

    #[tokio::test]
    async fn unknown_artifact_kind_is_a_bad_request() {
        let api = routes(orchestrator()).recover(handle_rejection);
        let resp = warp::test::request()
            .path("/api/v1/reports/artifacts/docx")
            .reply(&api)
            .await;
        assert_eq!(resp.status(), 400);
        let body: Value = serde_json::from_slice(resp.body()).unwrap();
        assert!(body.to_string().contains("docx"));
    }
}
