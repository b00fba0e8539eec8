//! Session Registry: in-process map of replay sessions, guarded by a single
//! mutex that is never held across I/O.

use super::model::{infer_activity, CurrentEventDetails, ReplayMode, ReplaySession, SessionStatus};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Debug, Default, Clone)]
pub struct ProgressUpdate {
    pub events_processed: Option<u64>,
    pub total_events: Option<u64>,
    pub current_event_id: Option<String>,
    pub current_event_method: Option<String>,
    pub current_event_path: Option<String>,
    pub current_event_status: Option<i64>,
    pub message: Option<String>,
}

#[derive(Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, ReplaySession>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a session with `status=running`. Fails if `replay_id` is
    /// already present.
    pub fn create(&self, replay_id: &str, mode: ReplayMode, speed: f64) -> Option<ReplaySession> {
        let mut guard = self.sessions.lock().expect("session registry mutex poisoned");
        if guard.contains_key(replay_id) {
            return None;
        }
        let session = ReplaySession::new(replay_id, mode, speed, Utc::now());
        guard.insert(replay_id.to_string(), session.clone());
        Some(session)
    }

    /// Atomic status transition; terminal statuses may not be overwritten
    /// except `Stopped -> Failed`.
    pub fn update_status(&self, replay_id: &str, next: SessionStatus, message: Option<String>) -> bool {
        let mut guard = self.sessions.lock().expect("session registry mutex poisoned");
        let Some(session) = guard.get_mut(replay_id) else {
            return false;
        };
        if !session.status.can_transition_to(next) {
            return false;
        }
        session.status = next;
        if let Some(message) = message {
            session.message = Some(message);
        }
        true
    }

    pub fn update_progress(&self, replay_id: &str, update: ProgressUpdate) -> bool {
        let mut guard = self.sessions.lock().expect("session registry mutex poisoned");
        let Some(session) = guard.get_mut(replay_id) else {
            return false;
        };
        if let Some(events_processed) = update.events_processed {
            session.events_processed = events_processed;
        }
        if let Some(total_events) = update.total_events {
            session.total_events = total_events;
        }
        session.recompute_progress();
        if update.current_event_id.is_some() {
            session.current_event_id = update.current_event_id;
        }
        if let Some(message) = update.message {
            session.message = Some(message);
        }
        if update.current_event_method.is_some()
            || update.current_event_path.is_some()
            || update.current_event_status.is_some()
        {
            session.current_event_details = CurrentEventDetails {
                activity: Some(infer_activity(update.current_event_path.as_deref())),
                method: update.current_event_method,
                path: update.current_event_path,
                status: update.current_event_status,
            };
        }
        true
    }

    pub fn increment_bugs_detected(&self, replay_id: &str, by: u64) {
        let mut guard = self.sessions.lock().expect("session registry mutex poisoned");
        if let Some(session) = guard.get_mut(replay_id) {
            session.bugs_detected += by;
        }
    }

    pub fn get(&self, replay_id: &str) -> Option<ReplaySession> {
        let guard = self.sessions.lock().expect("session registry mutex poisoned");
        guard.get(replay_id).cloned()
    }

    pub fn list(&self, status: Option<SessionStatus>) -> Vec<ReplaySession> {
        let guard = self.sessions.lock().expect("session registry mutex poisoned");
        guard
            .values()
            .filter(|s| status.map_or(true, |want| s.status == want))
            .cloned()
            .collect()
    }

    pub fn complete(&self, replay_id: &str) -> bool {
        let mut guard = self.sessions.lock().expect("session registry mutex poisoned");
        let Some(session) = guard.get_mut(replay_id) else {
            return false;
        };
        if !session.status.can_transition_to(SessionStatus::Completed) {
            return false;
        }
        session.status = SessionStatus::Completed;
        session.progress = 1.0;
        true
    }

    pub fn delete(&self, replay_id: &str) -> bool {
        let mut guard = self.sessions.lock().expect("session registry mutex poisoned");
        guard.remove(replay_id).is_some()
    }

    /// Bounded LRU-style purge: keep only the `keep` most recently started
    /// terminal sessions, dropping the oldest first. Running/pending
    /// sessions are never purged.
    pub fn purge_oldest_terminal(&self, keep: usize) {
        let mut guard = self.sessions.lock().expect("session registry mutex poisoned");
        let mut terminal: Vec<(String, chrono::DateTime<Utc>)> = guard
            .iter()
            .filter(|(_, s)| s.status.is_terminal())
            .map(|(id, s)| (id.clone(), s.start_time))
            .collect();
        if terminal.len() <= keep {
            return;
        }
        terminal.sort_by_key(|(_, start)| *start);
        let drop_count = terminal.len() - keep;
        for (id, _) in terminal.into_iter().take(drop_count) {
            guard.remove(&id);
        }
    }
}
