use warp::Filter;
use tracing::{info, warn};

mod agents;
mod api;
mod backends;
mod config;
mod error;
mod metrics;
mod middleware;
mod models;
mod pipeline;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let config = config::Config::from_env()?;

    // Initialize tracing; RUST_LOG wins over the configured level
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level))
        )
        .json()
        .init();

    info!("Starting Research Report Orchestrator");
    info!(
        search = ?config.search.provider,
        llm = ?config.llm.provider,
        render = ?config.render.engine,
        output_dir = %config.output_dir.display(),
        "Configuration loaded"
    );
    if let Err(e) = config.validate() {
        warn!(error = %e, "Configuration incomplete, report runs will be refused");
    }

    // External collaborators
    let backends = backends::Backends::from_config(&config)?;
    info!(fetch = backends.fetcher.is_some(), "Backends initialized");

    let metrics = metrics::Metrics::register(prometheus::default_registry())?;

    let port = config.port;
    let orchestrator = pipeline::Orchestrator::new(config, backends, metrics)?;

    // Build API routes
    let api_routes = api::routes(orchestrator)
        .with(warp::log("api"))
        .with(middleware::cors());

    // Health check route
    let health = warp::path("health")
        .and(warp::get())
        .map(|| warp::reply::json(&serde_json::json!({"status": "healthy"})));

    // Metrics route
    let metrics = warp::path("metrics")
        .and(warp::get())
        .map(|| {
            use prometheus::{Encoder, TextEncoder};
            let encoder = TextEncoder::new();
            let metric_families = prometheus::gather();
            let mut buffer = vec![];
            if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
                warn!(error = %e, "Failed to encode metrics");
            }
            warp::reply::with_header(
                buffer,
                "Content-Type",
                encoder.format_type(),
            )
        });

    let routes = health
        .or(metrics)
        .or(api_routes)
        .recover(error::handle_rejection);

    // Start server
    let addr = ([0, 0, 0, 0], port);
    info!("Server listening on {}", addr.1);

    warp::serve(routes)
        .run(addr)
        .await;

    Ok(())
}
