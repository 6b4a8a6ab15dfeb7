use thiserror::Error;
use uuid::Uuid;
use warp::{reject::Reject, Reply, Rejection};

use crate::models::RunPhase;

/// Failure reported by an external collaborator (generative text, search,
/// content fetch).
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BackendError {
    #[error("{service} rate limited the request")]
    RateLimited {
        service: String,
        retry_after_secs: Option<u64>,
    },

    #[error("transient {service} failure: {message}")]
    Transient { service: String, message: String },

    #[error("{service} failed: {message}")]
    Permanent { service: String, message: String },

    #[error("{0} backend is not available")]
    Unavailable(String),
}

impl BackendError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BackendError::RateLimited { .. } | BackendError::Transient { .. }
        )
    }

    /// Classify a reqwest failure. Timeouts and connection problems are worth
    /// retrying, anything else is not.
    pub fn from_reqwest(service: &str, err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() {
            BackendError::Transient {
                service: service.to_string(),
                message: err.to_string(),
            }
        } else {
            BackendError::Permanent {
                service: service.to_string(),
                message: err.to_string(),
            }
        }
    }

    /// Classify a non-success HTTP status.
    pub fn from_status(service: &str, status: u16, body: String, retry_after_secs: Option<u64>) -> Self {
        match status {
            429 => BackendError::RateLimited {
                service: service.to_string(),
                retry_after_secs,
            },
            500..=599 => BackendError::Transient {
                service: service.to_string(),
                message: format!("HTTP {}: {}", status, body),
            },
            _ => BackendError::Permanent {
                service: service.to_string(),
                message: format!("HTTP {}: {}", status, body),
            },
        }
    }
}

/// Hard failures of a report run. Anything that reaches the orchestrator as a
/// `PipelineError` moves the run to the `error` phase.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("missing required configuration: {0}")]
    MissingConfiguration(String),

    #[error("invalid report metadata: {0}")]
    InvalidMetadata(String),

    #[error("a report run is already in progress (phase: {0})")]
    RunInProgress(RunPhase),

    #[error("the previous run ended in phase {0}; reset before starting a new one")]
    ResetRequired(RunPhase),

    #[error("stage {stage} produced no {what}")]
    EmptyOutput { stage: &'static str, what: &'static str },

    #[error("rendering failed: {0}")]
    Render(String),

    #[error("persistence failed: {0}")]
    Persistence(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("run {0} was reset before it finished")]
    Superseded(Uuid),
}

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),
}

impl Reject for ApiError {}

pub async fn handle_rejection(err: Rejection) -> Result<impl Reply, Rejection> {
    if let Some(api_err) = err.find::<ApiError>() {
        let (code, message) = match api_err {
            ApiError::NotFound(_) => (404, "Resource not found"),
            ApiError::BadRequest(_) => (400, "Bad request"),
            ApiError::Pipeline(PipelineError::InvalidMetadata(_)) => (400, "Invalid report metadata"),
            ApiError::Pipeline(PipelineError::MissingConfiguration(_)) => (503, "Service not configured"),
            ApiError::Pipeline(PipelineError::RunInProgress(_))
            | ApiError::Pipeline(PipelineError::ResetRequired(_)) => (409, "Run state conflict"),
            _ => (500, "Internal server error"),
        };

        let json = warp::reply::json(&serde_json::json!({
            "error": message,
            "details": api_err.to_string(),
        }));

        let status = warp::http::StatusCode::from_u16(code)
            .unwrap_or(warp::http::StatusCode::INTERNAL_SERVER_ERROR);
        Ok(warp::reply::with_status(json, status))
    } else {
        Err(err)
    }
}
