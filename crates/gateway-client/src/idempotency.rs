//! Idempotency keys and duplicate terminal-notification suppression.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::Mutex,
};

use serde_json::Value;
use uuid::Uuid;

/// Events that carry the terminal outcome of a run.
const TERMINAL_EVENTS: &[&str] = &["run.completed", "run.failed", "run.cancelled"];

/// Terminal run ids remembered for duplicate suppression.
const RECENT_RUNS: usize = 1024;

/// Whether an event name marks a run's terminal outcome.
pub(crate) fn is_terminal_event(name: &str) -> bool {
    TERMINAL_EVENTS.contains(&name)
}

/// Extract the run id an event or response payload refers to, if any.
pub(crate) fn run_id_of(payload: &Value) -> Option<&str> {
    payload.get("runId").and_then(Value::as_str)
}

/// Tracks runs started through this connection.
///
/// After a reconnect the gateway may re-emit trailing events for runs whose
/// outcome was already delivered; the ledger recognizes those by run id so
/// the caller observes each terminal outcome exactly once.
#[derive(Default)]
pub(crate) struct RunLedger {
    runs_by_key: Mutex<HashMap<String, String>>,
    terminal: Mutex<TerminalWindow>,
}

#[derive(Default)]
struct TerminalWindow {
    seen: HashSet<String>,
    order: VecDeque<String>,
}

impl RunLedger {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// The caller's idempotency key, or a fresh one when omitted.
    pub(crate) fn ensure_key(explicit: Option<String>) -> String {
        explicit.unwrap_or_else(|| Uuid::new_v4().to_string())
    }

    /// Record the run the gateway assigned to an idempotency key.
    pub(crate) fn record_run(&self, key: &str, run_id: &str) {
        self.runs_by_key
            .lock()
            .expect("ledger lock poisoned")
            .insert(key.to_string(), run_id.to_string());
    }

    /// The run previously accepted for an idempotency key, if any.
    pub(crate) fn run_for_key(&self, key: &str) -> Option<String> {
        self.runs_by_key
            .lock()
            .expect("ledger lock poisoned")
            .get(key)
            .cloned()
    }

    /// Record a terminal outcome. Returns `true` the first time a run id is
    /// seen and `false` for duplicates, which are dropped by the caller.
    pub(crate) fn observe_terminal(&self, run_id: &str) -> bool {
        let mut window = self.terminal.lock().expect("ledger lock poisoned");
        if !window.seen.insert(run_id.to_string()) {
            return false;
        }
        window.order.push_back(run_id.to_string());
        while window.order.len() > RECENT_RUNS {
            if let Some(evicted) = window.order.pop_front() {
                window.seen.remove(&evicted);
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_ensure_key_prefers_explicit() {
        assert_eq!(
            RunLedger::ensure_key(Some("key-1".into())),
            "key-1".to_string()
        );
        let generated = RunLedger::ensure_key(None);
        assert_ne!(generated, RunLedger::ensure_key(None));
    }

    #[test]
    fn test_duplicate_terminal_is_suppressed() {
        let ledger = RunLedger::new();
        assert!(ledger.observe_terminal("run-1"));
        assert!(!ledger.observe_terminal("run-1"));
        assert!(ledger.observe_terminal("run-2"));
    }

    #[test]
    fn test_window_is_bounded() {
        let ledger = RunLedger::new();
        for i in 0..=RECENT_RUNS {
            assert!(ledger.observe_terminal(&format!("run-{i}")));
        }
        // run-0 was evicted, so it reads as fresh again.
        assert!(ledger.observe_terminal("run-0"));
    }

    #[test]
    fn test_key_to_run_mapping() {
        let ledger = RunLedger::new();
        assert_eq!(ledger.run_for_key("k"), None);
        ledger.record_run("k", "run-9");
        assert_eq!(ledger.run_for_key("k"), Some("run-9".to_string()));
    }

    #[test]
    fn test_terminal_event_names() {
        assert!(is_terminal_event("run.completed"));
        assert!(is_terminal_event("run.failed"));
        assert!(!is_terminal_event("run.log"));
    }

    #[test]
    fn test_run_id_extraction() {
        assert_eq!(run_id_of(&json!({"runId": "r"})), Some("r"));
        assert_eq!(run_id_of(&json!({"id": "r"})), None);
        assert_eq!(run_id_of(&json!(null)), None);
    }
}
