//! Report Writer: machine-readable + human-readable per-run summaries,
//! written atomically (write-to-temp + rename) so a crash mid-write never
//! leaves a corrupt artifact, and off the replay loop's critical path.

use super::model::ReplaySession;
use crate::error::EngineError;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Serialize)]
pub struct Report {
    pub replay_id: String,
    pub status: String,
    pub events_processed: u64,
    pub total_events: u64,
    pub progress: f64,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub bugs_detected: u64,
}

impl Report {
    pub fn from_session(session: &ReplaySession, completed_at: DateTime<Utc>) -> Self {
        Self {
            replay_id: session.replay_id.clone(),
            status: format!("{:?}", session.status).to_lowercase(),
            events_processed: session.events_processed,
            total_events: session.total_events,
            progress: session.progress,
            started_at: session.start_time,
            completed_at,
            bugs_detected: session.bugs_detected,
        }
    }

    fn to_html(&self) -> String {
        format!(
            "<!DOCTYPE html>\n<html><head><title>Replay {id}</title></head><body>\n\
             <h1>Replay {id}</h1>\n\
             <table>\n\
             <tr><td>status</td><td>{status}</td></tr>\n\
             <tr><td>events_processed</td><td>{events_processed}</td></tr>\n\
             <tr><td>total_events</td><td>{total_events}</td></tr>\n\
             <tr><td>progress</td><td>{progress:.2}</td></tr>\n\
             <tr><td>started_at</td><td>{started_at}</td></tr>\n\
             <tr><td>completed_at</td><td>{completed_at}</td></tr>\n\
             <tr><td>bugs_detected</td><td>{bugs_detected}</td></tr>\n\
             </table>\n</body></html>\n",
            id = self.replay_id,
            status = self.status,
            events_processed = self.events_processed,
            total_events = self.total_events,
            progress = self.progress,
            started_at = self.started_at.to_rfc3339(),
            completed_at = self.completed_at.to_rfc3339(),
            bugs_detected = self.bugs_detected,
        )
    }
}

pub struct ReportWriter {
    report_dir: PathBuf,
}

impl ReportWriter {
    pub fn new(report_dir: impl Into<PathBuf>) -> Self {
        Self {
            report_dir: report_dir.into(),
        }
    }

    /// Writes `replay_<id>.json` and `replay_<id>.html` atomically. Never
    /// called from inside the replay loop's await points that gate the next
    /// run — callers should spawn this off after marking the session
    /// terminal, so report I/O cannot stall the next replay.
    pub async fn write(&self, report: &Report) -> Result<(), EngineError> {
        tokio::fs::create_dir_all(&self.report_dir)
            .await
            .map_err(|e| EngineError::Config(format!("creating report directory: {e}")))?;

        let json = serde_json::to_string_pretty(report)
            .map_err(|e| EngineError::InvariantViolation(format!("serializing report: {e}")))?;
        self.write_atomic(
            &self.report_dir.join(format!("replay_{}.json", report.replay_id)),
            &json,
        )
        .await?;

        let html = report.to_html();
        self.write_atomic(
            &self.report_dir.join(format!("replay_{}.html", report.replay_id)),
            &html,
        )
        .await?;

        Ok(())
    }

    async fn write_atomic(&self, target: &Path, contents: &str) -> Result<(), EngineError> {
        let tmp_path = target.with_extension(format!(
            "{}.tmp",
            target.extension().and_then(|e| e.to_str()).unwrap_or("tmp")
        ));
        tokio::fs::write(&tmp_path, contents)
            .await
            .map_err(|e| EngineError::Config(format!("writing report temp file: {e}")))?;
        tokio::fs::rename(&tmp_path, target)
            .await
            .map_err(|e| EngineError::Config(format!("renaming report into place: {e}")))?;
        Ok(())
    }
}
