//! Per-run replay configuration (distinct from the process-wide
//! `ReplayEngineConfig`): the request shape accepted by `POST /replay/start`.

use super::model::ReplayMode;

#[derive(Debug, Clone)]
pub struct ReplayRunConfig {
    pub replay_id: String,
    pub session_id: Option<String>,
    pub start_ts: String,
    pub end_ts: String,
    pub mode: ReplayMode,
    pub speed: f64,
    pub checkpoint_every: u32,
    pub max_events_per_batch: u32,
}

impl ReplayRunConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.replay_id.is_empty() {
            return Err("replay_id is required".to_string());
        }
        if self.speed <= 0.0 {
            return Err("speed must be > 0".to_string());
        }
        if self.checkpoint_every == 0 {
            return Err("checkpoint_every must be > 0".to_string());
        }
        if self.max_events_per_batch == 0 {
            return Err("max_events_per_batch must be > 0".to_string());
        }
        Ok(())
    }
}
