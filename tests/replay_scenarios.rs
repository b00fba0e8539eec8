//! End-to-end scenarios against the full `ReplayEngine`, using the
//! file-backed stream adapter and in-memory checkpoint store so each
//! scenario is deterministic without a live broker.

use replay_engine::config::BugDetectionConfig;
use replay_engine::replay::{
    BugDetector, FileStreamAdapter, InMemoryCheckpointStore, ReplayEngine, ReplayMode,
    ReplayRunConfig, ReportWriter, SessionRegistry, SessionStatus, SharedCheckpointStore,
    SharedStreamAdapter,
};
use std::collections::HashMap;
use std::sync::Arc;

fn detector() -> BugDetector {
    BugDetector::new(&BugDetectionConfig {
        error_levels: vec![
            "ERROR".to_string(),
            "FATAL".to_string(),
            "CRITICAL".to_string(),
        ],
        gap_threshold_seconds: 300,
        correlation_timeout_hours: 24,
    })
}

fn run_config(replay_id: &str, mode: ReplayMode, speed: f64, checkpoint_every: u32) -> ReplayRunConfig {
    ReplayRunConfig {
        replay_id: replay_id.to_string(),
        session_id: None,
        start_ts: "0".to_string(),
        end_ts: "+".to_string(),
        mode,
        speed,
        checkpoint_every,
        max_events_per_batch: 500,
    }
}

async fn seed(adapter: &FileStreamAdapter, fields: HashMap<String, String>) {
    adapter.append(fields).await.unwrap();
}

fn event_fields(event_id: &str, offset_secs: i64, level: &str, source: &str) -> HashMap<String, String> {
    let mut fields = HashMap::new();
    fields.insert("event_id".to_string(), event_id.to_string());
    fields.insert(
        "timestamp".to_string(),
        format!("2025-01-01T10:00:{:02}+00:00", offset_secs),
    );
    fields.insert("level".to_string(), level.to_string());
    fields.insert("source".to_string(), source.to_string());
    fields
}

/// Builds an engine wired to a concrete `FileStreamAdapter` it owns, plus
/// the registry and checkpoint store a test wants to inspect directly.
fn build_engine(
    adapter: FileStreamAdapter,
    sessions: Arc<SessionRegistry>,
    checkpoints: SharedCheckpointStore,
    report_dir: std::path::PathBuf,
) -> ReplayEngine {
    let stream: SharedStreamAdapter = Arc::new(adapter);
    ReplayEngine::new(
        stream,
        checkpoints,
        sessions,
        detector(),
        Arc::new(ReportWriter::new(report_dir)),
    )
}

#[tokio::test]
async fn out_of_order_insertion_is_sorted_before_processing() {
    let dir = tempfile::tempdir().unwrap();
    let adapter = FileStreamAdapter::new(dir.path().join("data"));
    // Append out of timestamp order: e2 (offset 5), e0 (offset 0), e1 (offset 2).
    seed(&adapter, event_fields("e2", 5, "INFO", "api")).await;
    seed(&adapter, event_fields("e0", 0, "INFO", "api")).await;
    seed(&adapter, event_fields("e1", 2, "INFO", "api")).await;

    let sessions = Arc::new(SessionRegistry::new());
    sessions.create("r-ooo", ReplayMode::DryRun, 1000.0);
    let checkpoints: SharedCheckpointStore = Arc::new(InMemoryCheckpointStore::new());
    let engine = build_engine(
        adapter,
        Arc::clone(&sessions),
        checkpoints,
        dir.path().join("reports"),
    );

    engine
        .run(run_config("r-ooo", ReplayMode::DryRun, 1000.0, 10))
        .await
        .unwrap();

    let session = sessions.get("r-ooo").unwrap();
    assert_eq!(session.status, SessionStatus::Completed);
    assert_eq!(session.events_processed, 3);
    // The last event processed, by timestamp order, is e2 (offset 5),
    // regardless of append order.
    assert_eq!(session.current_event_id.as_deref(), Some("e2"));
}

#[tokio::test]
async fn timing_gap_past_threshold_is_detected() {
    let dir = tempfile::tempdir().unwrap();
    let adapter = FileStreamAdapter::new(dir.path().join("data"));
    let mut first = event_fields("e0", 0, "INFO", "api");
    first.insert("session_id".to_string(), "s1".to_string());
    seed(&adapter, first).await;

    // Second event ten minutes later, past the 300s default gap threshold.
    let mut second = HashMap::new();
    second.insert("event_id".to_string(), "e1".to_string());
    second.insert(
        "timestamp".to_string(),
        "2025-01-01T10:10:05+00:00".to_string(),
    );
    second.insert("level".to_string(), "INFO".to_string());
    second.insert("source".to_string(), "api".to_string());
    second.insert("session_id".to_string(), "s1".to_string());
    seed(&adapter, second).await;

    let sessions = Arc::new(SessionRegistry::new());
    sessions.create("r-gap", ReplayMode::DryRun, 1000.0);
    let checkpoints: SharedCheckpointStore = Arc::new(InMemoryCheckpointStore::new());
    let engine = build_engine(
        adapter,
        Arc::clone(&sessions),
        checkpoints,
        dir.path().join("reports"),
    );

    engine
        .run(run_config("r-gap", ReplayMode::DryRun, 1000.0, 10))
        .await
        .unwrap();

    let session = sessions.get("r-gap").unwrap();
    assert_eq!(session.events_processed, 2);
    assert_eq!(session.bugs_detected, 1);
}

#[tokio::test]
async fn repeated_error_crosses_threshold_across_five_events() {
    let dir = tempfile::tempdir().unwrap();
    let adapter = FileStreamAdapter::new(dir.path().join("data"));
    for i in 0..5 {
        seed(&adapter, event_fields(&format!("e{i}"), i as i64, "INFO", "api")).await;
    }

    let sessions = Arc::new(SessionRegistry::new());
    sessions.create("r-repeat", ReplayMode::DryRun, 1000.0);
    let checkpoints: SharedCheckpointStore = Arc::new(InMemoryCheckpointStore::new());
    let engine = build_engine(
        adapter,
        Arc::clone(&sessions),
        checkpoints,
        dir.path().join("reports"),
    );

    engine
        .run(run_config("r-repeat", ReplayMode::DryRun, 1000.0, 10))
        .await
        .unwrap();

    let session = sessions.get("r-repeat").unwrap();
    // Five same-key INFO events cross the >3 threshold on the 4th and 5th.
    assert_eq!(session.bugs_detected, 2);
}

#[tokio::test]
async fn stop_mid_run_is_observed_before_all_events_process() {
    let dir = tempfile::tempdir().unwrap();
    let adapter = FileStreamAdapter::new(dir.path().join("data"));
    for i in 0..20 {
        seed(&adapter, event_fields(&format!("e{i}"), i as i64, "INFO", "api")).await;
    }

    let sessions = Arc::new(SessionRegistry::new());
    sessions.create("r-stop", ReplayMode::Live, 0.1);
    let checkpoints: SharedCheckpointStore = Arc::new(InMemoryCheckpointStore::new());
    let engine = build_engine(
        adapter,
        Arc::clone(&sessions),
        checkpoints,
        dir.path().join("reports"),
    );

    let run_sessions = Arc::clone(&sessions);
    let handle = tokio::spawn(async move {
        engine
            .run(run_config("r-stop", ReplayMode::Live, 0.1, 5))
            .await
    });

    // Live mode at speed 0.1 paces ~10s/event; stop well before it finishes.
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    run_sessions.update_status("r-stop", SessionStatus::Stopped, None);

    handle.await.unwrap().unwrap();

    let session = sessions.get("r-stop").unwrap();
    assert_eq!(session.status, SessionStatus::Stopped);
    assert!(session.events_processed < 20);
}

#[tokio::test]
async fn resume_from_checkpoint_continues_where_it_left_off() {
    let dir = tempfile::tempdir().unwrap();
    let adapter = FileStreamAdapter::new(dir.path().join("data"));
    let mut ids = Vec::new();
    for i in 0..6 {
        let fields = event_fields(&format!("e{i}"), i as i64, "INFO", "api");
        let id = adapter.append(fields).await.unwrap();
        ids.push(id);
    }

    let sessions = Arc::new(SessionRegistry::new());
    sessions.create("r-resume", ReplayMode::DryRun, 1000.0);
    let checkpoints: SharedCheckpointStore = Arc::new(InMemoryCheckpointStore::new());

    // Seed a checkpoint as if 3 events had already been processed, resuming
    // from just after the third appended id.
    let resume_checkpoint = replay_engine::replay::Checkpoint::new(
        "r-resume",
        replay_engine::replay::CheckpointKind::Main,
        chrono::Utc::now(),
    )
    .with_progress_fields(3, Some(ids[2].clone()), 0.5);
    checkpoints.save(&resume_checkpoint).await;

    let engine = build_engine(
        adapter,
        Arc::clone(&sessions),
        Arc::clone(&checkpoints),
        dir.path().join("reports"),
    );

    engine
        .run(run_config("r-resume", ReplayMode::DryRun, 1000.0, 10))
        .await
        .unwrap();

    let session = sessions.get("r-resume").unwrap();
    assert_eq!(session.status, SessionStatus::Completed);
    // The range read starts at the checkpointed id (inclusive), so the
    // events from that id onward are reprocessed; events_processed in the
    // resulting checkpoint reflects how far this run got through that range.
    assert!(session.events_processed > 0);

    let final_checkpoint = checkpoints
        .load("r-resume", replay_engine::replay::CheckpointKind::Main)
        .await
        .unwrap();
    assert_eq!(final_checkpoint.progress, 1.0);
}
