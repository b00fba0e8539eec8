//! Per-event anomaly analyzer with per-session stateful rules.

use super::model::{DetectorState, Event, Finding, Severity};
use crate::config::BugDetectionConfig;
use serde_json::{json, Map};

#[derive(Clone)]
pub struct BugDetector {
    error_levels: Vec<String>,
    gap_threshold_seconds: i64,
}

impl BugDetector {
    pub fn new(config: &BugDetectionConfig) -> Self {
        Self {
            error_levels: config.error_levels.clone(),
            gap_threshold_seconds: config.gap_threshold_seconds,
        }
    }

    /// Evaluate all rules against `event`, mutating `state` in place and
    /// returning zero or more Findings. Given the same ordered event
    /// sequence and identical initial state, this is byte-identical across
    /// runs.
    pub fn analyze(&self, event: &Event, state: &mut DetectorState) -> Vec<Finding> {
        if !event.timestamp_valid {
            tracing::warn!(
                event_id = %event.event_id,
                "event timestamp missing or unparseable, skipping bug detection"
            );
            return Vec::new();
        }

        let mut findings = Vec::new();

        // Error-level rule.
        if self.error_levels.contains(&event.level.as_str().to_string()) {
            let mut context = Map::new();
            context.insert("message".to_string(), serde_json::Value::Object(event.payload.clone()));
            context.insert("level".to_string(), json!(event.level.as_str()));
            findings.push(Finding::new(
                &event.event_id,
                "error",
                "error_event",
                Severity::High,
                context,
            ));
        }

        // Timing-gap rule: always update the stored timestamp, including the
        // first observation, before deciding whether to emit a finding.
        let key = event.timing_key().to_string();
        if let Some(last_time) = state.last_event_time.get(&key).copied() {
            let gap_seconds = (event.timestamp - last_time).num_seconds();
            if gap_seconds > self.gap_threshold_seconds {
                let mut context = Map::new();
                context.insert("gap_seconds".to_string(), json!(gap_seconds));
                findings.push(Finding::new(
                    &event.event_id,
                    "gap",
                    "timing_gap",
                    Severity::Medium,
                    context,
                ));
            }
        }
        state.last_event_time.insert(key, event.timestamp);

        // Repeated-error rule: increments on every event regardless of
        // level, preserving source parity (see DESIGN.md).
        let error_key = event.source_level_key();
        let count = state.error_counts.entry(error_key).or_insert(0);
        *count += 1;
        if *count > 3 {
            let mut context = Map::new();
            context.insert("error_count".to_string(), json!(*count));
            context.insert("source".to_string(), json!(event.source));
            findings.push(Finding::new(
                &event.event_id,
                "repeated",
                "repeated_error",
                Severity::High,
                context,
            ));
        }

        findings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replay::model::Level;
    use chrono::{TimeZone, Utc};
    use serde_json::Map as JsonMap;

    fn config() -> BugDetectionConfig {
        BugDetectionConfig {
            error_levels: vec!["ERROR".to_string(), "FATAL".to_string(), "CRITICAL".to_string()],
            gap_threshold_seconds: 300,
            correlation_timeout_hours: 24,
        }
    }

    fn event(id: &str, source: &str, level: Level, secs: i64, session_id: Option<&str>) -> Event {
        Event {
            stream_id: format!("{}-0", 1_700_000_000_000i64 + secs * 1000),
            event_id: id.to_string(),
            timestamp: Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap(),
            timestamp_valid: true,
            session_id: session_id.map(str::to_string),
            source: source.to_string(),
            level,
            method: None,
            path: None,
            status: None,
            payload: JsonMap::new(),
            meta: JsonMap::new(),
        }
    }

    #[test]
    fn error_level_emits_finding() {
        let detector = BugDetector::new(&config());
        let mut state = DetectorState::default();
        let findings = detector.analyze(&event("e1", "api", Level::Error, 0, None), &mut state);
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].bug_type, "error_event");
        assert_eq!(findings[0].bug_id, "bug-e1-error");
    }

    #[test]
    fn timing_gap_triggers_only_past_threshold() {
        let detector = BugDetector::new(&config());
        let mut state = DetectorState::default();
        detector.analyze(&event("e1", "api", Level::Info, 0, Some("s1")), &mut state);
        let findings = detector.analyze(&event("e2", "api", Level::Info, 301, Some("s1")), &mut state);
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].bug_type, "timing_gap");
    }

    #[test]
    fn timing_gap_under_threshold_does_not_trigger() {
        let detector = BugDetector::new(&config());
        let mut state = DetectorState::default();
        detector.analyze(&event("e1", "api", Level::Info, 0, Some("s1")), &mut state);
        let findings = detector.analyze(&event("e2", "api", Level::Info, 100, Some("s1")), &mut state);
        assert!(findings.is_empty());
    }

    #[test]
    fn repeated_error_fires_after_four_occurrences() {
        let detector = BugDetector::new(&config());
        let mut state = DetectorState::default();
        let mut total_findings = 0;
        for i in 0..5 {
            let findings = detector.analyze(
                &event(&format!("e{i}"), "api", Level::Info, i, None),
                &mut state,
            );
            total_findings += findings
                .iter()
                .filter(|f| f.bug_type == "repeated_error")
                .count();
        }
        // Matches scenario 4: five same-key events produce two repeated_error findings.
        assert_eq!(total_findings, 2);
    }

    #[test]
    fn repeated_error_counts_every_event_regardless_of_level() {
        let detector = BugDetector::new(&config());
        let mut state = DetectorState::default();
        for i in 0..4 {
            detector.analyze(&event(&format!("e{i}"), "api", Level::Info, i, None), &mut state);
        }
        let findings = detector.analyze(&event("e4", "api", Level::Info, 4, None), &mut state);
        assert!(findings.iter().any(|f| f.bug_type == "repeated_error"));
    }

    #[test]
    fn missing_session_id_uses_default_bucket() {
        let detector = BugDetector::new(&config());
        let mut state = DetectorState::default();
        detector.analyze(&event("e1", "api", Level::Info, 0, None), &mut state);
        assert!(state.last_event_time.contains_key("default"));
    }

    #[test]
    fn invalid_timestamp_skips_detection_entirely() {
        let detector = BugDetector::new(&config());
        let mut state = DetectorState::default();
        let mut invalid = event("e1", "api", Level::Error, 0, None);
        invalid.timestamp_valid = false;
        let findings = detector.analyze(&invalid, &mut state);
        assert!(findings.is_empty());
        // Neither the timing-gap nor repeated-error counters should advance
        // for a skipped event.
        assert!(state.last_event_time.is_empty());
        assert!(state.error_counts.is_empty());
    }
}
