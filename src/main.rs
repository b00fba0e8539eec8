use anyhow::Result;
use replay_engine::api;
use replay_engine::config::ReplayEngineConfig;
use replay_engine::logging::init_logging;
use replay_engine::observability::metrics::init_metrics;
use replay_engine::replay::{
    BugDetector, InMemoryCheckpointStore, RedisCheckpointStore, RedisStreamAdapter, ReportWriter,
    SessionRegistry,
};
use replay_engine::state::AppState;
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_logging();
    init_metrics();

    let config_path = std::env::var("REPLAY_CONFIG").unwrap_or_else(|_| "replay.toml".to_string());
    let config = ReplayEngineConfig::load_or_default(&config_path)?;
    config.validate()?;
    tracing::info!(broker = %config.broker.url, stream = %config.broker.stream_key, "configuration loaded");

    let stream = Arc::new(RedisStreamAdapter::new(
        &config.broker.url,
        config.broker.stream_key.clone(),
        config.broker.consumer_group.clone(),
        config.broker.consumer_name.clone(),
    )?);

    let checkpoints: replay_engine::replay::SharedCheckpointStore =
        match RedisCheckpointStore::new(&config.broker.url) {
            Ok(store) => Arc::new(store),
            Err(e) => {
                tracing::warn!(error = %e, "falling back to in-memory checkpoint store");
                Arc::new(InMemoryCheckpointStore::new())
            }
        };

    let sessions = Arc::new(SessionRegistry::new());
    let detector = Arc::new(BugDetector::new(&config.bug_detection));
    let report_writer = Arc::new(ReportWriter::new(
        config
            .report_dir
            .clone()
            .unwrap_or_else(|| "reports".to_string()),
    ));

    let app_state = AppState::new(
        Arc::new(config.clone()),
        sessions,
        checkpoints,
        stream,
        report_writer,
        detector,
    );

    let app = api::router(app_state);

    let host = std::env::var("SERVER_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let port = std::env::var("SERVER_PORT").unwrap_or_else(|_| "8000".to_string());
    let addr = format!("{host}:{port}");

    tracing::info!(%addr, "replay engine control API starting");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
