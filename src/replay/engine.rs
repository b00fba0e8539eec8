//! Deterministic Replayer: read -> sort -> pace -> detect -> checkpoint ->
//! ack, emitting a final report. This is the core of the core.

use super::checkpoint::{new_checkpoint, SharedCheckpointStore};
use super::config::ReplayRunConfig;
use super::detector::BugDetector;
use super::model::{
    CheckpointKind, DetectorState, Event, Level, ReplayMode, SessionStatus,
};
use super::report::{Report, ReportWriter};
use super::session::{ProgressUpdate, SessionRegistry};
use super::stream::{Message, SharedStreamAdapter};
use crate::error::EngineError;
use crate::observability::metrics;
use chrono::Utc;
use serde_json::Value;
use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Duration;

pub struct ReplayEngine {
    stream: SharedStreamAdapter,
    checkpoints: SharedCheckpointStore,
    sessions: Arc<SessionRegistry>,
    detector: BugDetector,
    report_writer: Arc<ReportWriter>,
}

impl ReplayEngine {
    pub fn new(
        stream: SharedStreamAdapter,
        checkpoints: SharedCheckpointStore,
        sessions: Arc<SessionRegistry>,
        detector: BugDetector,
        report_writer: Arc<ReportWriter>,
    ) -> Self {
        Self {
            stream,
            checkpoints,
            sessions,
            detector,
            report_writer,
        }
    }

    /// Runs one full replay to completion (or until stopped/failed). Meant
    /// to be driven inside its own `tokio::spawn`ed task, one per
    /// `replay_id`.
    pub async fn run(&self, config: ReplayRunConfig) -> Result<(), EngineError> {
        let replay_id = config.replay_id.clone();

        if let Err(e) = self.stream.connect().await {
            self.sessions.update_status(
                &replay_id,
                SessionStatus::Failed,
                Some(format!("connect failed: {e}")),
            );
            return Err(e);
        }

        let run_started_at = Utc::now();
        let (mut start_id, mut events_processed) = (config.start_ts.clone(), 0u64);
        if let Some(checkpoint) = self.checkpoints.load(&replay_id, CheckpointKind::Main).await {
            if let Some(id) = checkpoint.current_message_id {
                start_id = id;
            }
            events_processed = checkpoint.events_processed;
        }

        let mut batch = self
            .stream
            .read_range(&start_id, &config.end_ts, config.max_events_per_batch as usize)
            .await;

        if let Some(session_id) = &config.session_id {
            batch.retain(|m| m.session_id() == Some(session_id.as_str()));
        }

        let mut events = parse_events(batch);
        // Stable sort by (timestamp, event_id); ties broken lexicographically.
        events.sort_by(compare_events);

        // `events` is only the unprocessed remainder read from `start_id`
        // onward; the grand total also counts whatever a loaded checkpoint
        // already accounted for, so progress and the invariant check below
        // stay consistent across a resume.
        let total_events = events_processed + events.len() as u64;
        self.sessions.update_progress(
            &replay_id,
            ProgressUpdate {
                total_events: Some(total_events),
                events_processed: Some(events_processed),
                ..Default::default()
            },
        );

        if total_events == 0 {
            self.sessions.complete(&replay_id);
            self.finalize_report(&replay_id).await;
            return Ok(());
        }

        let baseline_processed = events_processed;
        let mut state = DetectorState::default();
        let run_result = self
            .process_events(
                &config,
                &replay_id,
                &events,
                total_events,
                &mut events_processed,
                &mut state,
            )
            .await;

        match run_result {
            Ok(cancelled) => {
                let batch_index = (events_processed - baseline_processed) as usize;
                let final_checkpoint = new_checkpoint(&replay_id, CheckpointKind::Main)
                    .with_progress_fields(
                        events_processed,
                        events.get(batch_index.saturating_sub(1)).map(|e| e.stream_id.clone()),
                        events_processed as f64 / total_events as f64,
                    );
                if !self.checkpoints.save(&final_checkpoint).await {
                    tracing::warn!(replay_id = %replay_id, "failed to write final checkpoint");
                }
                let status_label = if cancelled { "stopped" } else { "completed" };
                if !cancelled {
                    self.sessions.complete(&replay_id);
                }
                metrics::observe_replay_duration(
                    &replay_id,
                    status_label,
                    (Utc::now() - run_started_at).num_milliseconds() as f64 / 1000.0,
                );
                self.finalize_report(&replay_id).await;
                Ok(())
            }
            Err(e) => {
                if e.is_fatal_to_run() {
                    self.sessions.update_status(
                        &replay_id,
                        SessionStatus::Failed,
                        Some(e.to_string()),
                    );
                } else {
                    tracing::warn!(replay_id = %replay_id, error = %e, "non-fatal error ending run, session left as-is");
                }
                metrics::record_replay_error(&replay_id, e.error_type_label());
                metrics::observe_replay_duration(
                    &replay_id,
                    "failed",
                    (Utc::now() - run_started_at).num_milliseconds() as f64 / 1000.0,
                );
                let checkpoint = new_checkpoint(&replay_id, CheckpointKind::Main).with_progress_fields(
                    events_processed,
                    None,
                    events_processed as f64 / total_events.max(1) as f64,
                );
                self.checkpoints.save(&checkpoint).await;
                self.finalize_report(&replay_id).await;
                let _ = self.stream.disconnect().await;
                Err(e)
            }
        }
    }

    /// Returns `Ok(true)` if the run was cancelled (observed `stopped`),
    /// `Ok(false)` on normal completion of the batch.
    async fn process_events(
        &self,
        config: &ReplayRunConfig,
        replay_id: &str,
        events: &[Event],
        total_events: u64,
        events_processed: &mut u64,
        state: &mut DetectorState,
    ) -> Result<bool, EngineError> {
        for (i, event) in events.iter().enumerate() {
            self.pace(config.mode, config.speed, events, i, replay_id).await;

            if let Some(session) = self.sessions.get(replay_id) {
                if matches!(session.status, SessionStatus::Stopped | SessionStatus::Failed) {
                    return Ok(true);
                }
            } else {
                return Err(EngineError::InvariantViolation(format!(
                    "session {replay_id} disappeared mid-run"
                )));
            }

            let findings = self.detector.analyze(event, state);
            if !findings.is_empty() {
                self.sessions.increment_bugs_detected(replay_id, findings.len() as u64);
                for finding in &findings {
                    metrics::record_bug_detected(&finding.bug_type, finding.severity.as_str());
                }
            }

            *events_processed += 1;
            if *events_processed > total_events {
                return Err(EngineError::InvariantViolation(
                    "events_processed exceeded total_events".to_string(),
                ));
            }

            self.sessions.update_progress(
                replay_id,
                ProgressUpdate {
                    events_processed: Some(*events_processed),
                    current_event_id: Some(event.event_id.clone()),
                    current_event_method: event.method.clone(),
                    current_event_path: event.path.clone(),
                    current_event_status: event.status,
                    ..Default::default()
                },
            );
            metrics::record_event_processed(replay_id, event.status_class().as_str());
            metrics::set_progress_ratio(replay_id, *events_processed as f64 / total_events as f64);

            if *events_processed % u64::from(config.checkpoint_every) == 0 {
                let checkpoint = new_checkpoint(replay_id, CheckpointKind::Main).with_progress_fields(
                    *events_processed,
                    Some(event.stream_id.clone()),
                    *events_processed as f64 / total_events as f64,
                );
                if self.checkpoints.save(&checkpoint).await {
                    metrics::record_checkpoint_operation("periodic", "success");
                } else {
                    metrics::record_checkpoint_operation("periodic", "failure");
                }
            }

            self.stream.ack(&[event.stream_id.clone()]).await;
        }

        Ok(false)
    }

    async fn pace(&self, mode: ReplayMode, speed: f64, events: &[Event], index: usize, replay_id: &str) {
        let budget = match mode {
            ReplayMode::DryRun => 0.5 / speed,
            ReplayMode::Live => 1.0 / speed,
            ReplayMode::Timed => {
                if index == 0 {
                    0.5 / speed
                } else {
                    let prev = &events[index - 1];
                    let current = &events[index];
                    let delta = (current.timestamp - prev.timestamp).num_milliseconds() as f64 / 1000.0;
                    let delay = delta / speed;
                    if delay > 0.0 {
                        delay.min(2.0)
                    } else {
                        0.5 / speed
                    }
                }
            }
        };
        self.sleep_cancellable(Duration::from_secs_f64(budget.max(0.0)), replay_id)
            .await;
    }

    /// Sleeps for `budget`, but wakes early (in steps of at most 500ms) to
    /// check whether the session has been stopped, so a cancellation is
    /// observed within `min(budget, 500ms)`.
    async fn sleep_cancellable(&self, budget: Duration, replay_id: &str) {
        const POLL: Duration = Duration::from_millis(200);
        let mut remaining = budget;
        loop {
            let step = remaining.min(POLL);
            tokio::time::sleep(step).await;
            if step >= remaining {
                return;
            }
            remaining -= step;
            if let Some(session) = self.sessions.get(replay_id) {
                if matches!(session.status, SessionStatus::Stopped | SessionStatus::Failed) {
                    return;
                }
            }
        }
    }

    async fn finalize_report(&self, replay_id: &str) {
        let Some(session) = self.sessions.get(replay_id) else {
            return;
        };
        let report = Report::from_session(&session, Utc::now());
        let writer = Arc::clone(&self.report_writer);
        // Report I/O runs detached so it can never stall the next replay.
        tokio::spawn(async move {
            if let Err(e) = writer.write(&report).await {
                tracing::error!(error = %e, "failed to write replay report");
            }
        });
    }
}

fn parse_events(messages: Vec<Message>) -> Vec<Event> {
    messages
        .into_iter()
        .filter_map(|message| match event_from_message(&message) {
            Ok(event) => Some(event),
            Err(e) => {
                tracing::warn!(stream_id = %message.stream_id, error = %e, "dropping unparseable event");
                None
            }
        })
        .collect()
}

fn event_from_message(message: &Message) -> Result<Event, EngineError> {
    let event_id = message.event_id().to_string();
    if event_id.is_empty() {
        return Err(EngineError::DetectorParse("missing event_id".to_string()));
    }
    let raw_timestamp = message.fields.get("timestamp");
    let parsed_timestamp = raw_timestamp
        .and_then(|raw| chrono::DateTime::parse_from_rfc3339(raw).ok())
        .map(|dt| dt.with_timezone(&Utc));
    let timestamp_valid = parsed_timestamp.is_some();
    if !timestamp_valid {
        tracing::warn!(
            event_id = %event_id,
            raw_timestamp = ?raw_timestamp,
            "event timestamp missing or unparseable, falling back to broker timestamp"
        );
    }
    let timestamp = parsed_timestamp.unwrap_or(message.timestamp);

    let level = message
        .fields
        .get("level")
        .and_then(|raw| Level::parse(raw))
        .unwrap_or(Level::Info);

    let status = message
        .fields
        .get("status")
        .and_then(|raw| raw.parse::<i64>().ok());

    let payload = message
        .fields
        .get("payload")
        .and_then(|raw| serde_json::from_str::<Value>(raw).ok())
        .and_then(|v| v.as_object().cloned())
        .unwrap_or_default();
    let meta = message
        .fields
        .get("meta")
        .and_then(|raw| serde_json::from_str::<Value>(raw).ok())
        .and_then(|v| v.as_object().cloned())
        .unwrap_or_default();

    Ok(Event {
        stream_id: message.stream_id.clone(),
        event_id,
        timestamp,
        timestamp_valid,
        session_id: message.session_id().map(str::to_string),
        source: message
            .fields
            .get("source")
            .cloned()
            .unwrap_or_else(|| "unknown".to_string()),
        level,
        method: message.fields.get("method").cloned(),
        path: message.fields.get("path").cloned(),
        status,
        payload,
        meta,
    })
}

fn compare_events(a: &Event, b: &Event) -> Ordering {
    a.timestamp.cmp(&b.timestamp).then_with(|| a.event_id.cmp(&b.event_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BugDetectionConfig;
    use crate::replay::checkpoint::InMemoryCheckpointStore;
    use crate::replay::stream::FileStreamAdapter;
    use std::collections::HashMap as StdHashMap;

    fn detector() -> BugDetector {
        BugDetector::new(&BugDetectionConfig {
            error_levels: vec!["ERROR".to_string(), "FATAL".to_string(), "CRITICAL".to_string()],
            gap_threshold_seconds: 300,
            correlation_timeout_hours: 24,
        })
    }

    async fn seed_events(adapter: &FileStreamAdapter, count: usize) {
        for i in 0..count {
            let mut fields = StdHashMap::new();
            fields.insert("event_id".to_string(), format!("e{i}"));
            fields.insert(
                "timestamp".to_string(),
                format!("2025-01-01T10:00:{:02}+00:00", i),
            );
            fields.insert("source".to_string(), "api".to_string());
            fields.insert(
                "level".to_string(),
                if i % 2 == 0 { "INFO".to_string() } else { "ERROR".to_string() },
            );
            adapter.append(fields).await.unwrap();
        }
    }

    fn run_config(replay_id: &str) -> ReplayRunConfig {
        ReplayRunConfig {
            replay_id: replay_id.to_string(),
            session_id: None,
            start_ts: "0".to_string(),
            end_ts: "+".to_string(),
            mode: ReplayMode::DryRun,
            speed: 1000.0,
            checkpoint_every: 3,
            max_events_per_batch: 100,
        }
    }

    #[tokio::test]
    async fn happy_path_ten_events_two_errors() {
        let dir = tempfile::tempdir().unwrap();
        let file_adapter = FileStreamAdapter::new(dir.path().join("data"));
        seed_events(&file_adapter, 10).await;
        let adapter: SharedStreamAdapter = Arc::new(file_adapter);

        let sessions = Arc::new(SessionRegistry::new());
        sessions.create("r-happy", ReplayMode::DryRun, 1000.0);
        let checkpoints: SharedCheckpointStore = Arc::new(InMemoryCheckpointStore::new());
        let report_dir = dir.path().join("reports");
        let writer = Arc::new(ReportWriter::new(report_dir));

        let engine = ReplayEngine::new(adapter, checkpoints, Arc::clone(&sessions), detector(), writer);
        engine.run(run_config("r-happy")).await.unwrap();

        let session = sessions.get("r-happy").unwrap();
        assert_eq!(session.events_processed, 10);
        // 5 ERROR-level findings (odd indices) + 4 repeated_error findings
        // (each source:level key crosses the >3 threshold twice in 5 uses).
        assert_eq!(session.bugs_detected, 9);
        assert_eq!(session.status, SessionStatus::Completed);
        assert_eq!(session.progress, 1.0);
    }

    #[tokio::test]
    async fn zero_events_completes_immediately_with_zero_progress() {
        let dir = tempfile::tempdir().unwrap();
        let adapter: SharedStreamAdapter = Arc::new(FileStreamAdapter::new(dir.path().join("data")));
        adapter.connect().await.unwrap();

        let sessions = Arc::new(SessionRegistry::new());
        sessions.create("r-empty", ReplayMode::DryRun, 1.0);
        let checkpoints: SharedCheckpointStore = Arc::new(InMemoryCheckpointStore::new());
        let writer = Arc::new(ReportWriter::new(dir.path().join("reports")));

        let engine = ReplayEngine::new(adapter, checkpoints, Arc::clone(&sessions), detector(), writer);
        engine.run(run_config("r-empty")).await.unwrap();

        let session = sessions.get("r-empty").unwrap();
        assert_eq!(session.total_events, 0);
        assert_eq!(session.status, SessionStatus::Completed);
    }

    #[test]
    fn sort_breaks_ties_by_event_id() {
        let base = chrono::Utc::now();
        let mut events = vec![
            Event {
                stream_id: "1-0".into(),
                event_id: "b".into(),
                timestamp: base,
                timestamp_valid: true,
                session_id: None,
                source: "s".into(),
                level: Level::Info,
                method: None,
                path: None,
                status: None,
                payload: serde_json::Map::new(),
                meta: serde_json::Map::new(),
            },
            Event {
                stream_id: "2-0".into(),
                event_id: "a".into(),
                timestamp: base,
                timestamp_valid: true,
                session_id: None,
                source: "s".into(),
                level: Level::Info,
                method: None,
                path: None,
                status: None,
                payload: serde_json::Map::new(),
                meta: serde_json::Map::new(),
            },
        ];
        events.sort_by(compare_events);
        assert_eq!(events[0].event_id, "a");
        assert_eq!(events[1].event_id, "b");
    }

    #[test]
    fn missing_timestamp_field_marks_event_invalid() {
        let mut fields = StdHashMap::new();
        fields.insert("event_id".to_string(), "e1".to_string());
        let message = Message::from_stream_id("1700000000000-0".to_string(), fields);
        let event = event_from_message(&message).unwrap();
        assert!(!event.timestamp_valid);
        assert_eq!(event.timestamp, message.timestamp);
    }

    #[test]
    fn malformed_timestamp_field_marks_event_invalid() {
        let mut fields = StdHashMap::new();
        fields.insert("event_id".to_string(), "e1".to_string());
        fields.insert("timestamp".to_string(), "not-a-timestamp".to_string());
        let message = Message::from_stream_id("1700000000000-0".to_string(), fields);
        let event = event_from_message(&message).unwrap();
        assert!(!event.timestamp_valid);
    }

    #[tokio::test]
    async fn invalid_timestamp_event_contributes_no_findings() {
        let dir = tempfile::tempdir().unwrap();
        let file_adapter = FileStreamAdapter::new(dir.path().join("data"));
        // One event missing its timestamp field entirely, at ERROR level
        // (would otherwise trigger the error-level rule).
        let mut fields = StdHashMap::new();
        fields.insert("event_id".to_string(), "e0".to_string());
        fields.insert("level".to_string(), "ERROR".to_string());
        fields.insert("source".to_string(), "api".to_string());
        file_adapter.append(fields).await.unwrap();
        let adapter: SharedStreamAdapter = Arc::new(file_adapter);

        let sessions = Arc::new(SessionRegistry::new());
        sessions.create("r-badts", ReplayMode::DryRun, 1000.0);
        let checkpoints: SharedCheckpointStore = Arc::new(InMemoryCheckpointStore::new());
        let writer = Arc::new(ReportWriter::new(dir.path().join("reports")));

        let engine = ReplayEngine::new(adapter, checkpoints, Arc::clone(&sessions), detector(), writer);
        engine.run(run_config("r-badts")).await.unwrap();

        let session = sessions.get("r-badts").unwrap();
        assert_eq!(session.events_processed, 1);
        assert_eq!(session.bugs_detected, 0);
        assert_eq!(session.status, SessionStatus::Completed);
    }
}
