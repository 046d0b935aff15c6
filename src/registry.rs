//! Continuation registry: where a suspended run can be found again.
//!
//! The registry maps `run_id` to the run awaiting a human answer. It does not
//! own runs; entries hold [`Weak`] references, so a run dropped elsewhere can
//! never be resumed through a stale entry.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, Weak};
use std::time::Duration;

use tokio::time::Instant;

use crate::error::RunError;

#[derive(Debug)]
struct Entry<T> {
    run: Weak<T>,
    touched: Instant,
}

/// Thread-safe `run_id → suspended run` lookup.
#[derive(Debug)]
pub struct ContinuationRegistry<T> {
    entries: RwLock<HashMap<String, Entry<T>>>,
}

impl<T> Default for ContinuationRegistry<T> {
    fn default() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }
}

impl<T> ContinuationRegistry<T> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `run` as resumable under `run_id`, replacing any previous entry.
    pub fn register(&self, run_id: &str, run: &Arc<T>) {
        let mut guard = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        guard.insert(
            run_id.to_string(),
            Entry {
                run: Arc::downgrade(run),
                touched: Instant::now(),
            },
        );
    }

    /// The run registered under `run_id`.
    ///
    /// Absent entries and entries whose run no longer exists are both
    /// [`RunError::NotFound`]; the latter is pruned.
    pub fn lookup(&self, run_id: &str) -> Result<Arc<T>, RunError> {
        let found = {
            let guard = self.entries.read().unwrap_or_else(PoisonError::into_inner);
            guard.get(run_id).map(|e| e.run.upgrade())
        };
        match found {
            Some(Some(run)) => Ok(run),
            Some(None) => {
                self.release(run_id);
                Err(RunError::NotFound(run_id.to_string()))
            }
            None => Err(RunError::NotFound(run_id.to_string())),
        }
    }

    /// Reset the idle clock of an entry.
    pub fn touch(&self, run_id: &str) {
        let mut guard = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(entry) = guard.get_mut(run_id) {
            entry.touched = Instant::now();
        }
    }

    /// Forget `run_id`. Returns whether an entry existed.
    pub fn release(&self, run_id: &str) -> bool {
        let mut guard = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        guard.remove(run_id).is_some()
    }

    /// Entries untouched for at least `idle`.
    #[must_use]
    pub fn idle_entries(&self, idle: Duration) -> Vec<String> {
        let guard = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        guard
            .iter()
            .filter(|(_, e)| e.touched.elapsed() >= idle)
            .map(|(id, _)| id.clone())
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
