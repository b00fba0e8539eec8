use crate::error::{ApiError, ApiResult, EngineError};
use crate::observability::metrics;
use crate::replay::{ReplayEngine, ReplayMode, ReplayRunConfig, SessionStatus};
use crate::state::AppState;
use axum::extract::{Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

#[derive(Debug, Deserialize)]
pub struct StartReplayRequest {
    pub session_id: Option<String>,
    #[serde(default)]
    pub start_ts: Option<String>,
    #[serde(default)]
    pub end_ts: Option<String>,
    pub mode: ReplayMode,
    #[serde(default = "default_speed")]
    pub speed: f64,
}

fn default_speed() -> f64 {
    1.0
}

#[derive(Debug, Serialize)]
pub struct StartReplayResponse {
    pub replay_id: String,
    pub status: &'static str,
}

pub async fn start_replay(
    State(state): State<AppState>,
    Json(request): Json<StartReplayRequest>,
) -> ApiResult<Json<StartReplayResponse>> {
    let replay_id = format!("r-{}", Uuid::new_v4().simple());

    let run_config = ReplayRunConfig {
        replay_id: replay_id.clone(),
        session_id: request.session_id,
        start_ts: request.start_ts.unwrap_or_else(|| "0".to_string()),
        end_ts: request.end_ts.unwrap_or_else(|| "+".to_string()),
        mode: request.mode,
        speed: request.speed,
        checkpoint_every: state.config.replay.checkpoint_every,
        max_events_per_batch: state.config.replay.max_events_per_batch,
    };
    run_config
        .validate()
        .map_err(|message| ApiError::BadRequest { message })?;

    if state
        .sessions
        .create(&replay_id, run_config.mode, run_config.speed)
        .is_none()
    {
        return Err(ApiError::Internal {
            message: format!("replay_id collision for {replay_id}"),
        });
    }

    let engine = ReplayEngine::new(
        state.stream.clone(),
        state.checkpoints.clone(),
        state.sessions.clone(),
        (*state.detector).clone(),
        state.report_writer.clone(),
    );

    let spawned_id = replay_id.clone();
    let handle = tokio::spawn(async move {
        // `engine.run` owns the session status transition on failure (it
        // consults `EngineError::is_fatal_to_run` to decide whether to mark
        // the session `Failed` or leave it as-is); this task only logs.
        if let Err(e) = engine.run(run_config).await {
            tracing::error!(replay_id = %spawned_id, error = %e, "replay run failed");
        }
    });
    state.running.lock().await.insert(replay_id.clone(), handle);

    Ok(Json(StartReplayResponse {
        replay_id,
        status: "started",
    }))
}

#[derive(Debug, Deserialize)]
pub struct StopReplayRequest {
    pub replay_id: String,
}

#[derive(Debug, Serialize)]
pub struct StopReplayResponse {
    pub status: &'static str,
}

pub async fn stop_replay(
    State(state): State<AppState>,
    Json(request): Json<StopReplayRequest>,
) -> ApiResult<Json<StopReplayResponse>> {
    if state.sessions.get(&request.replay_id).is_none() {
        return Err(EngineError::NotFound(request.replay_id).into());
    }
    state
        .sessions
        .update_status(&request.replay_id, SessionStatus::Stopped, None);
    Ok(Json(StopReplayResponse { status: "stopped" }))
}

#[derive(Debug, Deserialize)]
pub struct StatusQuery {
    pub replay_id: String,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub replay_id: String,
    pub status: String,
    pub progress: f64,
    pub events_processed: u64,
    pub total_events: u64,
    pub bugs_detected: u64,
    pub elapsed_seconds: f64,
    pub current_event_id: Option<String>,
    pub current_event_details: crate::replay::CurrentEventDetails,
    pub message: Option<String>,
}

pub async fn replay_status(
    State(state): State<AppState>,
    Query(query): Query<StatusQuery>,
) -> ApiResult<Json<StatusResponse>> {
    let session = state
        .sessions
        .get(&query.replay_id)
        .ok_or_else(|| EngineError::NotFound(query.replay_id.clone()))?;

    let elapsed_seconds = (chrono::Utc::now() - session.start_time).num_milliseconds() as f64 / 1000.0;

    Ok(Json(StatusResponse {
        replay_id: session.replay_id,
        status: format!("{:?}", session.status).to_lowercase(),
        progress: session.progress,
        events_processed: session.events_processed,
        total_events: session.total_events,
        bugs_detected: session.bugs_detected,
        elapsed_seconds,
        current_event_id: session.current_event_id,
        current_event_details: session.current_event_details,
        message: session.message,
    }))
}

pub async fn health_check(State(state): State<AppState>) -> impl axum::response::IntoResponse {
    let info = state.stream.stream_info().await;
    metrics::set_stream_length(&state.config.broker.stream_key, info.length);
    if info.error.is_none() {
        (axum::http::StatusCode::OK, Json(HashMap::from([("status", "ok")])))
    } else {
        (
            axum::http::StatusCode::SERVICE_UNAVAILABLE,
            Json(HashMap::from([("status", "broker unreachable")])),
        )
    }
}

pub async fn metrics() -> String {
    metrics::metrics_handler().await
}
