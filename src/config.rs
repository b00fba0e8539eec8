//! Explicit configuration record, threaded through constructors.
//!
//! There is no global config singleton: every component that needs
//! configuration takes the relevant section (or the whole record) as a
//! constructor argument. Values come from `replay.toml` with a few
//! environment overrides applied last.

use crate::error::EngineError;
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    pub url: String,
    pub stream_key: String,
    pub consumer_group: String,
    pub consumer_name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReplayDefaults {
    pub checkpoint_every: u32,
    pub max_events_per_batch: u32,
    #[serde(default = "default_speed")]
    pub speed: f64,
}

fn default_speed() -> f64 {
    1.0
}

#[derive(Debug, Clone, Deserialize)]
pub struct BugDetectionConfig {
    pub error_levels: Vec<String>,
    pub gap_threshold_seconds: i64,
    pub correlation_timeout_hours: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SecurityConfig {
    pub enable_auth: bool,
    pub shared_token: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReplayEngineConfig {
    pub broker: BrokerConfig,
    pub replay: ReplayDefaults,
    pub bug_detection: BugDetectionConfig,
    pub security: SecurityConfig,
    #[serde(default)]
    pub report_dir: Option<String>,
}

impl Default for ReplayEngineConfig {
    fn default() -> Self {
        Self {
            broker: BrokerConfig {
                url: "redis://127.0.0.1:6379".to_string(),
                stream_key: "events".to_string(),
                consumer_group: "replay-engine".to_string(),
                consumer_name: "replay-engine-1".to_string(),
            },
            replay: ReplayDefaults {
                checkpoint_every: 10,
                max_events_per_batch: 500,
                speed: 1.0,
            },
            bug_detection: BugDetectionConfig {
                error_levels: vec![
                    "ERROR".to_string(),
                    "FATAL".to_string(),
                    "CRITICAL".to_string(),
                ],
                gap_threshold_seconds: 300,
                correlation_timeout_hours: 24,
            },
            security: SecurityConfig {
                enable_auth: false,
                shared_token: String::new(),
            },
            report_dir: None,
        }
    }
}

impl ReplayEngineConfig {
    /// Load from a TOML file, then apply environment overrides.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, EngineError> {
        let contents = std::fs::read_to_string(path.as_ref())
            .map_err(|e| EngineError::Config(format!("reading config file: {e}")))?;
        let mut config: Self = toml::from_str(&contents)
            .map_err(|e| EngineError::Config(format!("parsing config file: {e}")))?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Same as `load`, but starting from defaults when the file is absent.
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self, EngineError> {
        match std::fs::read_to_string(path.as_ref()) {
            Ok(contents) => {
                let mut config: Self = toml::from_str(&contents)
                    .map_err(|e| EngineError::Config(format!("parsing config file: {e}")))?;
                config.apply_env_overrides();
                Ok(config)
            }
            Err(_) => {
                let mut config = Self::default();
                config.apply_env_overrides();
                Ok(config)
            }
        }
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("BROKER_URL") {
            self.broker.url = url;
        }
        if let Ok(key) = std::env::var("STREAM_KEY") {
            self.broker.stream_key = key;
        }
        if let Ok(token) = std::env::var("REPLAY_SHARED_TOKEN") {
            self.security.shared_token = token;
        }
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.broker.url.is_empty() {
            return Err(EngineError::Config("broker.url must not be empty".into()));
        }
        if self.broker.stream_key.is_empty() {
            return Err(EngineError::Config(
                "broker.stream_key must not be empty".into(),
            ));
        }
        if self.replay.checkpoint_every == 0 {
            return Err(EngineError::Config(
                "replay.checkpoint_every must be > 0".into(),
            ));
        }
        if self.replay.max_events_per_batch == 0 {
            return Err(EngineError::Config(
                "replay.max_events_per_batch must be > 0".into(),
            ));
        }
        if self.security.enable_auth && self.security.shared_token.is_empty() {
            return Err(EngineError::Config(
                "security.shared_token must be set when security.enable_auth is true".into(),
            ));
        }
        Ok(())
    }
}
