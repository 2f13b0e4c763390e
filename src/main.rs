//! Binary entrypoint: loads configuration (fail-fast on missing secrets),
//! connects Postgres and runs migrations, spawns the pipeline scheduler,
//! and serves the query API.

use std::sync::Arc;

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use discussion_harvester::api::{create_router, AppState};
use discussion_harvester::llm::{OpenAiCompatClient, RetryingChat};
use discussion_harvester::pipeline::Pipeline;
use discussion_harvester::scheduler::spawn_pipeline_scheduler;
use discussion_harvester::settings::Settings;
use discussion_harvester::store::DiscussionStore;
use discussion_harvester::telemetry::Metrics;

const DEFAULT_INTERVAL_SECS: u64 = 24 * 3600;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().compact())
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env in local/dev; no-op in prod environments.
    let _ = dotenvy::dotenv();
    init_tracing();

    let settings = Arc::new(Settings::load()?);
    let store = DiscussionStore::connect(&settings.database_url()).await?;
    store.migrate().await?;

    let metrics = Metrics::init();

    let chat = Arc::new(RetryingChat::new(OpenAiCompatClient::new(
        &settings.base.llm.api_url,
        &settings.secret.llm_api_key,
        &settings.base.llm.model,
    )));
    let pipeline = Arc::new(Pipeline::new(settings.clone(), store.clone(), chat));

    let interval_secs = std::env::var("PIPELINE_INTERVAL_SECS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_INTERVAL_SECS);
    spawn_pipeline_scheduler(pipeline, interval_secs);

    let state = AppState {
        store,
        environment: settings.secret.app_env.clone(),
    };
    let router = create_router(state).merge(metrics.router());

    let addr = std::env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8000".to_string());
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(%addr, community = %settings.secret.community, "serving");
    axum::serve(listener, router).await?;
    Ok(())
}
