//! Append-only conversation logs, one per run.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use crate::conversation::Message;
use crate::error::RunError;

type Log = Arc<RwLock<Vec<Message>>>;

/// Thread-safe store of per-run conversation logs.
///
/// The outer map lock is only held to find a log; appends and reads lock the
/// individual run's log, so distinct runs never contend.
#[derive(Debug, Clone, Default)]
pub struct HistoryStore {
    inner: Arc<RwLock<HashMap<String, Log>>>,
}

impl HistoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Start an empty log for `run_id`. Existing logs are left untouched.
    pub fn create(&self, run_id: &str) {
        let mut guard = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        guard.entry(run_id.to_string()).or_default();
    }

    /// Append `message` to the end of the run's log and return its index.
    pub fn append(&self, run_id: &str, message: Message) -> Result<usize, RunError> {
        let log = self.log(run_id)?;
        let mut guard = log.write().unwrap_or_else(PoisonError::into_inner);
        guard.push(message);
        Ok(guard.len() - 1)
    }

    /// The full ordered log.
    pub fn read(&self, run_id: &str) -> Result<Vec<Message>, RunError> {
        self.read_since(run_id, 0)
    }

    /// Messages appended at or after position `index`.
    ///
    /// An index past the end yields an empty slice.
    pub fn read_since(&self, run_id: &str, index: usize) -> Result<Vec<Message>, RunError> {
        let log = self.log(run_id)?;
        let guard = log.read().unwrap_or_else(PoisonError::into_inner);
        Ok(guard.get(index..).map(<[Message]>::to_vec).unwrap_or_default())
    }

    /// Number of messages in the run's log.
    pub fn len(&self, run_id: &str) -> Result<usize, RunError> {
        let log = self.log(run_id)?;
        let guard = log.read().unwrap_or_else(PoisonError::into_inner);
        Ok(guard.len())
    }

    /// Drop the run's log.
    pub fn remove(&self, run_id: &str) -> bool {
        let mut guard = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        guard.remove(run_id).is_some()
    }

    /// Number of runs with a log.
    #[must_use]
    pub fn run_count(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn log(&self, run_id: &str) -> Result<Log, RunError> {
        let guard = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        guard
            .get(run_id)
            .cloned()
            .ok_or_else(|| RunError::UnknownRun(run_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::Role;

    #[test]
    fn append_preserves_insertion_order() {
        let store = HistoryStore::new();
        store.create("r");

        assert_eq!(store.append("r", Message::human("one")).unwrap(), 0);
        assert_eq!(
            store
                .append("r", Message::agent(Role::SystemAgent, "assistant", "two"))
                .unwrap(),
            1
        );

        let log = store.read("r").unwrap();
        assert_eq!(
            log.iter().map(|m| m.content.as_str()).collect::<Vec<_>>(),
            ["one", "two"]
        );
    }

    #[test]
    fn read_since_returns_only_the_tail() {
        let store = HistoryStore::new();
        store.create("r");
        for text in ["a", "b", "c"] {
            store.append("r", Message::human(text)).unwrap();
        }

        let tail = store.read_since("r", 1).unwrap();
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].content, "b");
        assert!(store.read_since("r", 3).unwrap().is_empty());
        assert!(store.read_since("r", 99).unwrap().is_empty());
    }

    #[test]
    fn unknown_run_is_an_error() {
        let store = HistoryStore::new();
        assert!(matches!(store.read("nope"), Err(RunError::UnknownRun(id)) if id == "nope"));
        assert!(matches!(
            store.append("nope", Message::human("x")),
            Err(RunError::UnknownRun(_))
        ));
    }

    #[test]
    fn create_does_not_reset_an_existing_log() {
        let store = HistoryStore::new();
        store.create("r");
        store.append("r", Message::human("kept")).unwrap();
        store.create("r");
        assert_eq!(store.len("r").unwrap(), 1);
    }

    #[test]
    fn remove_forgets_the_run() {
        let store = HistoryStore::new();
        store.create("r");
        assert!(store.remove("r"));
        assert!(!store.remove("r"));
        assert_eq!(store.run_count(), 0);
    }
}
