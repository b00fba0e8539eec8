//! Core data model: `Event`, `ReplaySession`, `Checkpoint`, `Finding`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Level {
    Debug,
    Info,
    Warning,
    Error,
    Fatal,
    Critical,
}

impl Level {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_uppercase().as_str() {
            "DEBUG" => Some(Level::Debug),
            "INFO" => Some(Level::Info),
            "WARNING" => Some(Level::Warning),
            "ERROR" => Some(Level::Error),
            "FATAL" => Some(Level::Fatal),
            "CRITICAL" => Some(Level::Critical),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Debug => "DEBUG",
            Level::Info => "INFO",
            Level::Warning => "WARNING",
            Level::Error => "ERROR",
            Level::Fatal => "FATAL",
            Level::Critical => "CRITICAL",
        }
    }
}

/// An immutable record pulled from the broker, with typed accessors for the
/// known HTTP-shaped fields and a raw map for everything else.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub stream_id: String,
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    /// `false` when the wire `timestamp` field was missing or unparseable
    /// and `timestamp` was filled in from the broker-assigned id instead.
    /// The detector declines to analyze such events.
    #[serde(default = "default_timestamp_valid")]
    pub timestamp_valid: bool,
    pub session_id: Option<String>,
    pub source: String,
    pub level: Level,
    pub method: Option<String>,
    pub path: Option<String>,
    pub status: Option<i64>,
    #[serde(default)]
    pub payload: Map<String, Value>,
    #[serde(default)]
    pub meta: Map<String, Value>,
}

fn default_timestamp_valid() -> bool {
    true
}

impl Event {
    /// `source:level` key used by the repeated-error rule.
    pub fn source_level_key(&self) -> String {
        format!("{}:{}", self.source, self.level.as_str())
    }

    /// Session key used by the timing-gap rule; events without a
    /// `session_id` share the `"default"` bucket.
    pub fn timing_key(&self) -> &str {
        self.session_id.as_deref().unwrap_or("default")
    }

    /// HTTP status classification (§4.4 rule 4): not itself a Finding, only
    /// used for dashboard/progress snapshot typing.
    pub fn status_class(&self) -> StatusClass {
        match self.status {
            Some(status) if status >= 400 => StatusClass::Error,
            Some(status) if status >= 300 => StatusClass::Warning,
            _ => StatusClass::Success,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    Success,
    Warning,
    Error,
}

impl StatusClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            StatusClass::Success => "success",
            StatusClass::Warning => "warning",
            StatusClass::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReplayMode {
    DryRun,
    Timed,
    Live,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Pending,
    Running,
    Stopped,
    Completed,
    Failed,
}

impl SessionStatus {
    /// Terminal statuses are sticky; only `Failed` may overwrite `Stopped`.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionStatus::Completed | SessionStatus::Stopped | SessionStatus::Failed
        )
    }

    pub fn can_transition_to(self, next: SessionStatus) -> bool {
        if !self.is_terminal() {
            return true;
        }
        self == SessionStatus::Stopped && next == SessionStatus::Failed
    }
}

/// Best-effort snapshot of the event currently being processed, enriched
/// with an inferred human-readable activity label.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CurrentEventDetails {
    pub method: Option<String>,
    pub path: Option<String>,
    pub status: Option<i64>,
    pub activity: Option<String>,
}

const ACTIVITY_MAP: &[(&str, &str)] = &[
    ("login", "User Login"),
    ("users", "User Registration"),
    ("basket", "Cart Update"),
    ("products", "Product Browse"),
    ("challenges", "Scoreboard Check"),
    ("address", "Address Update"),
    ("deliverys", "Delivery Check"),
    ("quantitys", "Quantity Query"),
    ("socket.io", "Real-time Poll"),
    ("rest/admin", "App Config Fetch"),
    ("api/cards", "Payment Info"),
    ("wallet", "Wallet Check"),
];

/// Infer a human-readable activity label from a request path, following the
/// fixed substring mapping; unmatched paths fall back to `"API Request"`.
pub fn infer_activity(path: Option<&str>) -> String {
    let Some(path) = path else {
        return "API Request".to_string();
    };
    let lowered = path.to_ascii_lowercase();
    for (needle, label) in ACTIVITY_MAP {
        if lowered.contains(needle) {
            return (*label).to_string();
        }
    }
    "API Request".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplaySession {
    pub replay_id: String,
    pub mode: ReplayMode,
    pub speed: f64,
    pub status: SessionStatus,
    pub start_time: DateTime<Utc>,
    pub events_processed: u64,
    pub total_events: u64,
    pub bugs_detected: u64,
    pub progress: f64,
    pub current_event_id: Option<String>,
    pub current_event_details: CurrentEventDetails,
    pub message: Option<String>,
}

impl ReplaySession {
    pub fn new(replay_id: impl Into<String>, mode: ReplayMode, speed: f64, now: DateTime<Utc>) -> Self {
        Self {
            replay_id: replay_id.into(),
            mode,
            speed,
            status: SessionStatus::Running,
            start_time: now,
            events_processed: 0,
            total_events: 0,
            bugs_detected: 0,
            progress: 0.0,
            current_event_id: None,
            current_event_details: CurrentEventDetails::default(),
            message: None,
        }
    }

    pub fn recompute_progress(&mut self) {
        self.progress = if self.total_events > 0 {
            self.events_processed as f64 / self.total_events as f64
        } else {
            0.0
        };
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointKind {
    Main,
    Progress,
}

impl CheckpointKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckpointKind::Main => "main",
            CheckpointKind::Progress => "progress",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub replay_id: String,
    pub kind: CheckpointKind,
    pub events_processed: u64,
    pub current_message_id: Option<String>,
    pub progress: f64,
    pub saved_at: DateTime<Utc>,
    #[serde(default)]
    pub passthrough: HashMap<String, Value>,
}

impl Checkpoint {
    pub fn new(replay_id: impl Into<String>, kind: CheckpointKind, now: DateTime<Utc>) -> Self {
        Self {
            replay_id: replay_id.into(),
            kind,
            events_processed: 0,
            current_message_id: None,
            progress: 0.0,
            saved_at: now,
            passthrough: HashMap::new(),
        }
    }

    pub fn with_progress_fields(
        mut self,
        events_processed: u64,
        current_message_id: Option<String>,
        progress: f64,
    ) -> Self {
        self.events_processed = events_processed;
        self.current_message_id = current_message_id;
        self.progress = progress;
        self
    }

    pub fn with_passthrough(mut self, key: impl Into<String>, value: Value) -> Self {
        self.passthrough.insert(key.into(), value);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Finding {
    pub bug_id: String,
    pub bug_type: String,
    pub severity: Severity,
    pub event_id: String,
    pub context: Map<String, Value>,
}

impl Finding {
    pub fn new(
        event_id: &str,
        suffix: &str,
        bug_type: impl Into<String>,
        severity: Severity,
        context: Map<String, Value>,
    ) -> Self {
        Self {
            bug_id: format!("bug-{event_id}-{suffix}"),
            bug_type: bug_type.into(),
            severity,
            event_id: event_id.to_string(),
            context,
        }
    }
}

/// Per-Replayer-instance detector state; never persisted or shared across
/// sessions.
#[derive(Debug, Default)]
pub struct DetectorState {
    pub last_event_time: HashMap<String, DateTime<Utc>>,
    pub error_counts: HashMap<String, u64>,
}
