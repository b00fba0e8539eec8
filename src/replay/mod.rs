//! Deterministic replay: read ordered events from a broker stream, detect
//! anomalies, and pace them back out under a chosen replay mode.

pub mod checkpoint;
pub mod config;
pub mod detector;
pub mod engine;
pub mod model;
pub mod report;
pub mod session;
pub mod stream;

pub use checkpoint::{CheckpointStore, InMemoryCheckpointStore, RedisCheckpointStore, SharedCheckpointStore};
pub use config::ReplayRunConfig;
pub use detector::BugDetector;
pub use engine::ReplayEngine;
pub use model::{
    Checkpoint, CheckpointKind, CurrentEventDetails, DetectorState, Event, Finding, Level,
    ReplayMode, ReplaySession, Severity, SessionStatus, StatusClass,
};
pub use report::{Report, ReportWriter};
pub use session::{ProgressUpdate, SessionRegistry};
pub use stream::{FileStreamAdapter, Message, RedisStreamAdapter, SharedStreamAdapter, StreamAdapter, StreamInfo};
