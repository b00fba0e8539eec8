//! Stream Adapter: consumer-group-aware reads, range reads, and acks against
//! the external broker, plus a file-backed fallback for local development
//! and tests.

use crate::error::EngineError;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use redis::AsyncCommands;
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;

/// A single entry read from the broker: the broker-assigned id, the raw
/// field map, and the timestamp derived from the id's millisecond prefix.
#[derive(Debug, Clone)]
pub struct Message {
    pub stream_id: String,
    pub fields: HashMap<String, String>,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    pub fn from_stream_id(stream_id: String, fields: HashMap<String, String>) -> Self {
        let timestamp = derive_timestamp(&stream_id);
        Self {
            stream_id,
            fields,
            timestamp,
        }
    }

    pub fn event_id(&self) -> &str {
        self.fields.get("event_id").map(String::as_str).unwrap_or("")
    }

    pub fn session_id(&self) -> Option<&str> {
        self.fields.get("session_id").map(String::as_str)
    }

    pub fn request_id(&self) -> Option<&str> {
        self.fields.get("request_id").map(String::as_str)
    }
}

/// Millisecond epoch prefix of a broker id (`"<millis>-<seq>"`), converted
/// to UTC. Falls back to the Unix epoch if the id is malformed.
fn derive_timestamp(stream_id: &str) -> DateTime<Utc> {
    stream_id
        .split('-')
        .next()
        .and_then(|millis| millis.parse::<i64>().ok())
        .and_then(|millis| Utc.timestamp_millis_opt(millis).single())
        .unwrap_or_else(|| Utc.timestamp_opt(0, 0).unwrap())
}

#[derive(Debug, Default, Clone)]
pub struct StreamInfo {
    pub length: u64,
    pub first_id: Option<String>,
    pub last_id: Option<String>,
    pub group_count: u64,
    pub error: Option<String>,
}

#[async_trait]
pub trait StreamAdapter: Send + Sync {
    async fn connect(&self) -> Result<(), EngineError>;
    async fn disconnect(&self) -> Result<(), EngineError>;
    async fn stream_info(&self) -> StreamInfo;
    async fn read_new(&self, batch: usize, block_ms: u64) -> Vec<Message>;
    async fn read_pending(&self, batch: usize) -> Vec<Message>;
    async fn read_range(&self, min_id: &str, max_id: &str, count: usize) -> Vec<Message>;
    async fn ack(&self, ids: &[String]) -> usize;
}

/// Redis Streams implementation with consumer-group support.
pub struct RedisStreamAdapter {
    client: redis::Client,
    conn: Mutex<Option<redis::aio::MultiplexedConnection>>,
    stream_key: String,
    consumer_group: String,
    consumer_name: String,
}

impl RedisStreamAdapter {
    pub fn new(
        redis_url: &str,
        stream_key: impl Into<String>,
        consumer_group: impl Into<String>,
        consumer_name: impl Into<String>,
    ) -> Result<Self, EngineError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| EngineError::Config(format!("invalid broker.url: {e}")))?;
        Ok(Self {
            client,
            conn: Mutex::new(None),
            stream_key: stream_key.into(),
            consumer_group: consumer_group.into(),
            consumer_name: consumer_name.into(),
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
impl StreamAdapter for RedisStreamAdapter {
    async fn connect(&self) -> Result<(), EngineError> {
        let mut conn = self.connection().await?;
        let created: redis::RedisResult<()> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&self.stream_key)
            .arg(&self.consumer_group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;
        if let Err(e) = created {
            if !e.to_string().contains("BUSYGROUP") {
                return Err(EngineError::Transport(format!(
                    "creating consumer group: {e}"
                )));
            }
            tracing::info!(group = %self.consumer_group, "consumer group already exists");
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), EngineError> {
        let mut guard = self.conn.lock().await;
        *guard = None;
        Ok(())
    }

    async fn stream_info(&self) -> StreamInfo {
        let mut conn = match self.connection().await {
            Ok(c) => c,
            Err(e) => {
                return StreamInfo {
                    error: Some(e.to_string()),
                    ..Default::default()
                }
            }
        };
        let result: redis::RedisResult<redis::Value> = redis::cmd("XINFO")
            .arg("STREAM")
            .arg(&self.stream_key)
            .query_async(&mut conn)
            .await;
        match result {
            Ok(redis::Value::Bulk(items)) => {
                let mut info = StreamInfo::default();
                let mut iter = items.into_iter();
                while let (Some(redis::Value::Data(key)), Some(value)) = (iter.next(), iter.next())
                {
                    match String::from_utf8_lossy(&key).as_ref() {
                        "length" => {
                            if let redis::Value::Int(n) = value {
                                info.length = n as u64;
                            }
                        }
                        "groups" => {
                            if let redis::Value::Int(n) = value {
                                info.group_count = n as u64;
                            }
                        }
                        "first-entry" => {
                            info.first_id = extract_entry_id(&value);
                        }
                        "last-entry" => {
                            info.last_id = extract_entry_id(&value);
                        }
                        _ => {}
                    }
                }
                info
            }
            Ok(_) => StreamInfo::default(),
            Err(e) => StreamInfo {
                error: Some(e.to_string()),
                ..Default::default()
            },
        }
    }

    async fn read_new(&self, batch: usize, block_ms: u64) -> Vec<Message> {
        let mut conn = match self.connection().await {
            Ok(c) => c,
            Err(e) => {
                tracing::error!(error = %e, "failed to read new messages");
                return Vec::new();
            }
        };
        let result: redis::RedisResult<redis::streams::StreamReadReply> = conn
            .xread_options(
                &[&self.stream_key],
                &[">"],
                &redis::streams::StreamReadOptions::default()
                    .group(&self.consumer_group, &self.consumer_name)
                    .count(batch)
                    .block(block_ms as usize),
            )
            .await;
        match result {
            Ok(reply) => reply_to_messages(reply),
            Err(e) => {
                tracing::error!(error = %e, "failed to read new messages");
                Vec::new()
            }
        }
    }

    async fn read_pending(&self, batch: usize) -> Vec<Message> {
        let mut conn = match self.connection().await {
            Ok(c) => c,
            Err(e) => {
                tracing::error!(error = %e, "failed to read pending messages");
                return Vec::new();
            }
        };
        let pending: redis::RedisResult<Vec<(String, String, i64, i64)>> = redis::cmd("XPENDING")
            .arg(&self.stream_key)
            .arg(&self.consumer_group)
            .arg("-")
            .arg("+")
            .arg(batch)
            .arg(&self.consumer_name)
            .query_async(&mut conn)
            .await;
        let ids = match pending {
            Ok(entries) => entries.into_iter().map(|(id, ..)| id).collect::<Vec<_>>(),
            Err(e) => {
                tracing::error!(error = %e, "failed to read pending entries");
                return Vec::new();
            }
        };
        let (Some(first), Some(last)) = (ids.first(), ids.last()) else {
            return Vec::new();
        };
        self.read_range(first, last, batch).await
    }

    async fn read_range(&self, min_id: &str, max_id: &str, count: usize) -> Vec<Message> {
        let mut conn = match self.connection().await {
            Ok(c) => c,
            Err(e) => {
                tracing::error!(error = %e, "failed to read range");
                return Vec::new();
            }
        };
        let result: redis::RedisResult<Vec<(String, Vec<(String, String)>)>> = conn
            .xrange_count(&self.stream_key, min_id, max_id, count)
            .await;
        match result {
            Ok(entries) => entries
                .into_iter()
                .map(|(id, fields)| Message::from_stream_id(id, fields.into_iter().collect()))
                .collect(),
            Err(e) => {
                tracing::error!(error = %e, "failed to read range");
                Vec::new()
            }
        }
    }

    async fn ack(&self, ids: &[String]) -> usize {
        if ids.is_empty() {
            return 0;
        }
        let mut conn = match self.connection().await {
            Ok(c) => c,
            Err(e) => {
                tracing::error!(error = %e, "failed to ack messages");
                return 0;
            }
        };
        let result: redis::RedisResult<usize> =
            conn.xack(&self.stream_key, &self.consumer_group, ids).await;
        result.unwrap_or_else(|e| {
            tracing::error!(error = %e, "failed to ack messages");
            0
        })
    }
}

fn extract_entry_id(value: &redis::Value) -> Option<String> {
    if let redis::Value::Bulk(entry) = value {
        if let Some(redis::Value::Data(id)) = entry.first() {
            return Some(String::from_utf8_lossy(id).to_string());
        }
    }
    None
}

fn reply_to_messages(reply: redis::streams::StreamReadReply) -> Vec<Message> {
    reply
        .keys
        .into_iter()
        .flat_map(|key| key.ids)
        .map(|id| {
            let fields = id
                .map
                .into_iter()
                .filter_map(|(k, v)| match v {
                    redis::Value::Data(bytes) => {
                        Some((k, String::from_utf8_lossy(&bytes).to_string()))
                    }
                    _ => None,
                })
                .collect();
            Message::from_stream_id(id.id, fields)
        })
        .collect()
}

/// File-backed fallback event store, grounded on the original file adapter:
/// an append-only JSONL log plus an in-memory index of ids written this
/// process. Used for local development and deterministic tests that should
/// not require a live Redis broker.
pub struct FileStreamAdapter {
    events_file: PathBuf,
    entries: Mutex<Vec<(String, HashMap<String, String>)>>,
}

impl FileStreamAdapter {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            events_file: data_dir.into().join("events.jsonl"),
            entries: Mutex::new(Vec::new()),
        }
    }

    /// Load every line of the JSONL log into memory, in file order.
    pub async fn load(&self) -> Result<(), EngineError> {
        let contents = match tokio::fs::read_to_string(&self.events_file).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(EngineError::Transport(format!("reading event log: {e}"))),
        };
        let mut entries = self.entries.lock().await;
        entries.clear();
        for line in contents.lines() {
            if line.trim().is_empty() {
                continue;
            }
            let value: Value = serde_json::from_str(line)
                .map_err(|e| EngineError::DetectorParse(format!("bad event line: {e}")))?;
            let Value::Object(map) = value else {
                continue;
            };
            let stream_id = map
                .get("stream_id")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let fields = map
                .into_iter()
                .filter(|(k, _)| k != "stream_id")
                .map(|(k, v)| {
                    let s = match v {
                        Value::String(s) => s,
                        other => other.to_string(),
                    };
                    (k, s)
                })
                .collect();
            entries.push((stream_id, fields));
        }
        Ok(())
    }

    /// Append a new event, auto-assigning a broker-style id if none is set.
    pub async fn append(&self, fields: HashMap<String, String>) -> Result<String, EngineError> {
        let mut entries = self.entries.lock().await;
        let seq = entries.len();
        let millis = Utc::now().timestamp_millis();
        let stream_id = format!("{millis}-{seq}");
        entries.push((stream_id.clone(), fields));
        Ok(stream_id)
    }
}

#[async_trait]
impl StreamAdapter for FileStreamAdapter {
    async fn connect(&self) -> Result<(), EngineError> {
        self.load().await
    }

    async fn disconnect(&self) -> Result<(), EngineError> {
        Ok(())
    }

    async fn stream_info(&self) -> StreamInfo {
        let entries = self.entries.lock().await;
        StreamInfo {
            length: entries.len() as u64,
            first_id: entries.first().map(|(id, _)| id.clone()),
            last_id: entries.last().map(|(id, _)| id.clone()),
            group_count: 1,
            error: None,
        }
    }

    async fn read_new(&self, batch: usize, _block_ms: u64) -> Vec<Message> {
        let entries = self.entries.lock().await;
        entries
            .iter()
            .take(batch)
            .map(|(id, fields)| Message::from_stream_id(id.clone(), fields.clone()))
            .collect()
    }

    async fn read_pending(&self, _batch: usize) -> Vec<Message> {
        Vec::new()
    }

    async fn read_range(&self, min_id: &str, max_id: &str, count: usize) -> Vec<Message> {
        let entries = self.entries.lock().await;
        entries
            .iter()
            .filter(|(id, _)| in_range(id, min_id, max_id))
            .take(count)
            .map(|(id, fields)| Message::from_stream_id(id.clone(), fields.clone()))
            .collect()
    }

    async fn ack(&self, ids: &[String]) -> usize {
        ids.len()
    }
}

fn in_range(id: &str, min_id: &str, max_id: &str) -> bool {
    let min_ok = min_id == "0" || min_id == "-" || id >= min_id;
    let max_ok = max_id == "+" || id <= max_id;
    min_ok && max_ok
}

pub type SharedStreamAdapter = Arc<dyn StreamAdapter>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derive_timestamp_parses_millis_prefix() {
        let ts = derive_timestamp("1700000000000-0");
        assert_eq!(ts.timestamp_millis(), 1_700_000_000_000);
    }

    #[test]
    fn derive_timestamp_falls_back_on_malformed_id() {
        let ts = derive_timestamp("not-an-id");
        assert_eq!(ts.timestamp(), 0);
    }

    #[tokio::test]
    async fn file_adapter_range_read_is_inclusive() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = FileStreamAdapter::new(dir.path());
        adapter.connect().await.unwrap();
        for i in 0..3 {
            let mut fields = HashMap::new();
            fields.insert("event_id".to_string(), format!("e{i}"));
            adapter.append(fields).await.unwrap();
        }
        let all = adapter.read_range("0", "+", 10).await;
        assert_eq!(all.len(), 3);
    }

    #[tokio::test]
    async fn file_adapter_ack_counts_ids() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = FileStreamAdapter::new(dir.path());
        let acked = adapter
            .ack(&["a".to_string(), "b".to_string()])
            .await;
        assert_eq!(acked, 2);
    }
}
