use crate::config::ReplayEngineConfig;
use crate::replay::{BugDetector, ReportWriter, SessionRegistry, SharedCheckpointStore, SharedStreamAdapter};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// Shared application state threaded through every control-API handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ReplayEngineConfig>,
    pub sessions: Arc<SessionRegistry>,
    pub checkpoints: SharedCheckpointStore,
    pub stream: SharedStreamAdapter,
    pub report_writer: Arc<ReportWriter>,
    pub detector: Arc<BugDetector>,
    /// Handles of currently-spawned replay tasks, keyed by `replay_id`, kept
    /// only so a future `/replay/stop` can await cleanup if it ever needs to;
    /// cancellation itself goes through `SessionRegistry::update_status`.
    pub running: Arc<Mutex<HashMap<String, JoinHandle<()>>>>,
}

impl AppState {
    pub fn new(
        config: Arc<ReplayEngineConfig>,
        sessions: Arc<SessionRegistry>,
        checkpoints: SharedCheckpointStore,
        stream: SharedStreamAdapter,
        report_writer: Arc<ReportWriter>,
        detector: Arc<BugDetector>,
    ) -> Self {
        Self {
            config,
            sessions,
            checkpoints,
            stream,
            report_writer,
            detector,
            running: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}
