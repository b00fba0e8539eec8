//! Hand-rolled Prometheus text exposition for the replay engine's metric
//! surface: per-replay counters, gauges, and a bucketed duration histogram.

use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};

const DURATION_BUCKETS: &[f64] = &[1.0, 5.0, 10.0, 30.0, 60.0, 300.0, 600.0, 1800.0, 3600.0];

#[derive(Default)]
struct Histogram {
    bucket_counts: Vec<u64>,
    count: u64,
    sum: f64,
}

impl Histogram {
    fn observe(&mut self, value: f64) {
        if self.bucket_counts.is_empty() {
            self.bucket_counts = vec![0; DURATION_BUCKETS.len()];
        }
        for (i, bound) in DURATION_BUCKETS.iter().enumerate() {
            if value <= *bound {
                self.bucket_counts[i] += 1;
            }
        }
        self.count += 1;
        self.sum += value;
    }
}

#[derive(Default)]
struct MetricsState {
    events_processed_total: Mutex<HashMap<String, u64>>,
    events_errors_total: Mutex<HashMap<String, u64>>,
    checkpoint_operations_total: Mutex<HashMap<String, u64>>,
    bugs_detected_total: Mutex<HashMap<String, u64>>,
    progress_ratio: Mutex<HashMap<String, f64>>,
    stream_length: Mutex<HashMap<String, u64>>,
    duration_seconds: Mutex<HashMap<String, Histogram>>,
}

static METRICS: OnceLock<MetricsState> = OnceLock::new();

fn state() -> &'static MetricsState {
    METRICS.get_or_init(MetricsState::default)
}

fn make_key(labels: &[(&str, &str)]) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{}={}", k, v.replace('|', "_")))
        .collect::<Vec<_>>()
        .join("|")
}

fn key_to_prom_labels(key: &str) -> String {
    if key.is_empty() {
        return String::new();
    }
    let labels = key
        .split('|')
        .filter_map(|part| {
            let mut chunks = part.splitn(2, '=');
            let label = chunks.next()?;
            let value = chunks.next().unwrap_or_default().replace('"', "\\\"");
            Some(format!(r#"{label}="{value}""#))
        })
        .collect::<Vec<_>>()
        .join(",");
    format!("{{{labels}}}")
}

fn inc_counter(map: &Mutex<HashMap<String, u64>>, key: String) {
    if let Ok(mut guard) = map.lock() {
        *guard.entry(key).or_insert(0) += 1;
    }
}

fn set_gauge<T: Copy>(map: &Mutex<HashMap<String, T>>, key: String, value: T) {
    if let Ok(mut guard) = map.lock() {
        guard.insert(key, value);
    }
}

pub fn init_metrics() {
    let _ = state();
}

pub fn record_event_processed(replay_id: &str, status: &str) {
    inc_counter(
        &state().events_processed_total,
        make_key(&[("replay_id", replay_id), ("status", status)]),
    );
}

pub fn record_replay_error(replay_id: &str, error_type: &str) {
    inc_counter(
        &state().events_errors_total,
        make_key(&[("replay_id", replay_id), ("error_type", error_type)]),
    );
}

pub fn record_checkpoint_operation(operation_type: &str, status: &str) {
    inc_counter(
        &state().checkpoint_operations_total,
        make_key(&[("operation_type", operation_type), ("status", status)]),
    );
}

pub fn record_bug_detected(bug_type: &str, severity: &str) {
    inc_counter(
        &state().bugs_detected_total,
        make_key(&[("bug_type", bug_type), ("severity", severity)]),
    );
}

pub fn set_progress_ratio(replay_id: &str, ratio: f64) {
    set_gauge(
        &state().progress_ratio,
        make_key(&[("replay_id", replay_id)]),
        ratio,
    );
}

pub fn set_stream_length(stream_key: &str, length: u64) {
    set_gauge(
        &state().stream_length,
        make_key(&[("stream_key", stream_key)]),
        length,
    );
}

pub fn observe_replay_duration(replay_id: &str, status: &str, duration_seconds: f64) {
    let key = make_key(&[("replay_id", replay_id), ("status", status)]);
    if let Ok(mut guard) = state().duration_seconds.lock() {
        guard.entry(key).or_default().observe(duration_seconds);
    }
}

pub async fn metrics_handler() -> String {
    let metrics = state();
    let mut out = String::new();

    out.push_str("# HELP replay_events_processed_total Events processed per replay\n");
    out.push_str("# TYPE replay_events_processed_total counter\n");
    if let Ok(guard) = metrics.events_processed_total.lock() {
        for (key, value) in guard.iter() {
            out.push_str(&format!(
                "replay_events_processed_total{} {}\n",
                key_to_prom_labels(key),
                value
            ));
        }
    }

    out.push_str("# HELP replay_events_errors_total Errors encountered per replay\n");
    out.push_str("# TYPE replay_events_errors_total counter\n");
    if let Ok(guard) = metrics.events_errors_total.lock() {
        for (key, value) in guard.iter() {
            out.push_str(&format!(
                "replay_events_errors_total{} {}\n",
                key_to_prom_labels(key),
                value
            ));
        }
    }

    out.push_str("# HELP replay_checkpoint_operations_total Checkpoint saves by operation type and outcome\n");
    out.push_str("# TYPE replay_checkpoint_operations_total counter\n");
    if let Ok(guard) = metrics.checkpoint_operations_total.lock() {
        for (key, value) in guard.iter() {
            out.push_str(&format!(
                "replay_checkpoint_operations_total{} {}\n",
                key_to_prom_labels(key),
                value
            ));
        }
    }

    out.push_str("# HELP replay_bugs_detected_total Findings emitted by the bug detector\n");
    out.push_str("# TYPE replay_bugs_detected_total counter\n");
    if let Ok(guard) = metrics.bugs_detected_total.lock() {
        for (key, value) in guard.iter() {
            out.push_str(&format!(
                "replay_bugs_detected_total{} {}\n",
                key_to_prom_labels(key),
                value
            ));
        }
    }

    out.push_str("# HELP replay_progress_ratio Fraction of events processed for an in-flight replay\n");
    out.push_str("# TYPE replay_progress_ratio gauge\n");
    if let Ok(guard) = metrics.progress_ratio.lock() {
        for (key, value) in guard.iter() {
            out.push_str(&format!(
                "replay_progress_ratio{} {}\n",
                key_to_prom_labels(key),
                value
            ));
        }
    }

    out.push_str("# HELP redis_stream_length Length of the source stream as last observed\n");
    out.push_str("# TYPE redis_stream_length gauge\n");
    if let Ok(guard) = metrics.stream_length.lock() {
        for (key, value) in guard.iter() {
            out.push_str(&format!(
                "redis_stream_length{} {}\n",
                key_to_prom_labels(key),
                value
            ));
        }
    }

    out.push_str("# HELP replay_duration_seconds Wall-clock duration of a replay run\n");
    out.push_str("# TYPE replay_duration_seconds histogram\n");
    if let Ok(guard) = metrics.duration_seconds.lock() {
        for (key, hist) in guard.iter() {
            let base_labels = &key[..];
            for (i, bound) in DURATION_BUCKETS.iter().enumerate() {
                let labelled = format!("{base_labels}|le={bound}");
                out.push_str(&format!(
                    "replay_duration_seconds_bucket{} {}\n",
                    key_to_prom_labels(&labelled),
                    hist.bucket_counts.get(i).copied().unwrap_or(0)
                ));
            }
            let inf_labels = format!("{base_labels}|le=+Inf");
            out.push_str(&format!(
                "replay_duration_seconds_bucket{} {}\n",
                key_to_prom_labels(&inf_labels),
                hist.count
            ));
            let labels = key_to_prom_labels(key);
            out.push_str(&format!(
                "replay_duration_seconds_count{labels} {}\n",
                hist.count
            ));
            out.push_str(&format!("replay_duration_seconds_sum{labels} {}\n", hist.sum));
        }
    }

    out
}
