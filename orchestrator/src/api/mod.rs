use warp::{Filter, Rejection, Reply};

use crate::pipeline::Orchestrator;

mod reports;

const MAX_BODY_BYTES: u64 = 16 * 1024;

pub fn routes(
    orchestrator: Orchestrator,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    let reports = warp::path("api").and(warp::path("v1")).and(warp::path("reports"));

    let start_route = reports
        .and(warp::path::end())
        .and(warp::post())
        .and(warp::body::content_length_limit(MAX_BODY_BYTES))
        .and(warp::body::json())
        .and(with_orchestrator(orchestrator.clone()))
        .and_then(reports::handle_start);

    let status_route = reports
        .and(warp::path("status"))
        .and(warp::path::end())
        .and(warp::get())
        .and(with_orchestrator(orchestrator.clone()))
        .and_then(reports::handle_status);

    let reset_route = reports
        .and(warp::path("reset"))
        .and(warp::path::end())
        .and(warp::post())
        .and(with_orchestrator(orchestrator.clone()))
        .and_then(reports::handle_reset);

    let artifact_route = reports
        .and(warp::path("artifacts"))
        .and(warp::path::param::<String>())
        .and(warp::path::end())
        .and(warp::get())
        .and(with_orchestrator(orchestrator))
        .and_then(reports::handle_artifact);

    start_route
        .or(status_route)
        .or(reset_route)
        .or(artifact_route)
}

fn with_orchestrator(
    orchestrator: Orchestrator,
) -> impl Filter<Extract = (Orchestrator,), Error = std::convert::Infallible> + Clone {
    warp::any().map(move || orchestrator.clone())
}
