//! Checkpoint Store: persist and load opaque replay-progress records.

use super::model::{Checkpoint, CheckpointKind};
use crate::error::EngineError;
use async_trait::async_trait;
use chrono::Utc;
use redis::AsyncCommands;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

const TTL_SECONDS: i64 = 24 * 60 * 60;
const DEFAULT_PREFIX: &str = "replay:checkpoint";

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn save(&self, checkpoint: &Checkpoint) -> bool;
    async fn load(&self, replay_id: &str, kind: CheckpointKind) -> Option<Checkpoint>;
    async fn delete(&self, replay_id: &str, kind: CheckpointKind) -> bool;
    async fn list(&self, replay_id: &str) -> Vec<CheckpointKind>;
    async fn clear_all(&self, replay_id: &str) -> bool;
}

fn key_for(prefix: &str, replay_id: &str, kind: CheckpointKind) -> String {
    format!("{prefix}:{replay_id}:{}", kind.as_str())
}

/// Redis hash-backed checkpoint store. Writes are last-writer-wins; there is
/// no atomicity between the `main` and `progress` kinds.
pub struct RedisCheckpointStore {
    client: redis::Client,
    conn: Mutex<Option<redis::aio::MultiplexedConnection>>,
    prefix: String,
}

impl RedisCheckpointStore {
    pub fn new(redis_url: &str) -> Result<Self, EngineError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| EngineError::Config(format!("invalid broker.url: {e}")))?;
        Ok(Self {
            client,
            conn: Mutex::new(None),
            prefix: DEFAULT_PREFIX.to_string(),
        })
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, EngineError> {
        let mut guard = self.conn.lock().await;
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }
        let conn = self
            .client
            .get_multiplexed_tokio_connection()
            .await
            .map_err(|e| EngineError::Transport(format!("connecting to broker: {e}")))?;
        *guard = Some(conn.clone());
        Ok(conn)
    }
}

#[async_trait]
impl CheckpointStore for RedisCheckpointStore {
    async fn save(&self, checkpoint: &Checkpoint) -> bool {
        let mut conn = match self.connection().await {
            Ok(c) => c,
            Err(e) => {
                tracing::error!(error = %e, replay_id = %checkpoint.replay_id, "failed to save checkpoint");
                return false;
            }
        };
        let key = key_for(&self.prefix, &checkpoint.replay_id, checkpoint.kind);
        let data = match serde_json::to_string(checkpoint) {
            Ok(d) => d,
            Err(e) => {
                tracing::error!(error = %e, "failed to serialize checkpoint");
                return false;
            }
        };
        let result: redis::RedisResult<()> = conn
            .hset_multiple(
                &key,
                &[
                    ("data", data),
                    ("timestamp", checkpoint.saved_at.to_rfc3339()),
                ],
            )
            .await;
        if let Err(e) = result {
            tracing::error!(error = %e, replay_id = %checkpoint.replay_id, "failed to save checkpoint");
            return false;
        }
        let expire: redis::RedisResult<()> = conn.expire(&key, TTL_SECONDS).await;
        if let Err(e) = expire {
            tracing::warn!(error = %e, replay_id = %checkpoint.replay_id, "failed to set checkpoint TTL");
        }
        true
    }

    async fn load(&self, replay_id: &str, kind: CheckpointKind) -> Option<Checkpoint> {
        let mut conn = self.connection().await.ok()?;
        let key = key_for(&self.prefix, replay_id, kind);
        let hash: HashMap<String, String> = conn.hgetall(&key).await.ok()?;
        let data = hash.get("data")?;
        serde_json::from_str(data).ok()
    }

    async fn delete(&self, replay_id: &str, kind: CheckpointKind) -> bool {
        let Ok(mut conn) = self.connection().await else {
            return false;
        };
        let key = key_for(&self.prefix, replay_id, kind);
        let result: redis::RedisResult<i64> = conn.del(&key).await;
        result.unwrap_or(0) > 0
    }

    async fn list(&self, replay_id: &str) -> Vec<CheckpointKind> {
        let Ok(mut conn) = self.connection().await else {
            return Vec::new();
        };
        let pattern = format!("{}:{}:*", self.prefix, replay_id);
        let keys: redis::RedisResult<Vec<String>> = conn.keys(&pattern).await;
        keys.unwrap_or_default()
            .iter()
            .filter_map(|key| match key.rsplit(':').next() {
                Some("main") => Some(CheckpointKind::Main),
                Some("progress") => Some(CheckpointKind::Progress),
                _ => None,
            })
            .collect()
    }

    async fn clear_all(&self, replay_id: &str) -> bool {
        let kinds = self.list(replay_id).await;
        if kinds.is_empty() {
            return true;
        }
        let mut deleted = 0;
        for kind in &kinds {
            if self.delete(replay_id, *kind).await {
                deleted += 1;
            }
        }
        deleted == kinds.len()
    }
}

/// In-memory checkpoint store used by tests and the file-backed adapter
/// path, so a checkpoint round trip can be exercised without a live Redis.
#[derive(Default)]
pub struct InMemoryCheckpointStore {
    inner: Mutex<HashMap<(String, &'static str), Checkpoint>>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn save(&self, checkpoint: &Checkpoint) -> bool {
        let mut guard = self.inner.lock().await;
        guard.insert(
            (checkpoint.replay_id.clone(), checkpoint.kind.as_str()),
            checkpoint.clone(),
        );
        true
    }

    async fn load(&self, replay_id: &str, kind: CheckpointKind) -> Option<Checkpoint> {
        let guard = self.inner.lock().await;
        guard.get(&(replay_id.to_string(), kind.as_str())).cloned()
    }

    async fn delete(&self, replay_id: &str, kind: CheckpointKind) -> bool {
        let mut guard = self.inner.lock().await;
        guard.remove(&(replay_id.to_string(), kind.as_str())).is_some()
    }

    async fn list(&self, replay_id: &str) -> Vec<CheckpointKind> {
        let guard = self.inner.lock().await;
        guard
            .keys()
            .filter(|(id, _)| id == replay_id)
            .filter_map(|(_, kind)| match *kind {
                "main" => Some(CheckpointKind::Main),
                "progress" => Some(CheckpointKind::Progress),
                _ => None,
            })
            .collect()
    }

    async fn clear_all(&self, replay_id: &str) -> bool {
        let mut guard = self.inner.lock().await;
        guard.retain(|(id, _), _| id != replay_id);
        true
    }
}

pub type SharedCheckpointStore = Arc<dyn CheckpointStore>;

pub fn new_checkpoint(replay_id: &str, kind: CheckpointKind) -> Checkpoint {
    Checkpoint::new(replay_id, kind, Utc::now())
}
