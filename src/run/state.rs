use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use super::policy::{AnswerPolicy, PromptPolicy};
use crate::conversation::Message;
use crate::error::RunError;

/// Lifecycle of a run.
///
/// `Created → Running → {Suspended, Completed, Failed}` and
/// `Suspended → Running`. `Completed` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Created,
    Running,
    Suspended,
    Completed,
    Failed,
}

impl RunState {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Suspended => "suspended",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The question a suspended run is waiting on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingQuestion {
    /// Text currently shown to the human (amended after invalid answers).
    pub question: String,
    /// Text originally raised at suspension.
    pub base_question: String,
    pub policy: AnswerPolicy,
    /// Number of answers rejected so far.
    pub rejections: u32,
}

impl PendingQuestion {
    #[must_use]
    pub fn new(question: impl Into<String>, policy: AnswerPolicy) -> Self {
        let question = question.into();
        Self {
            base_question: question.clone(),
            question,
            policy,
            rejections: 0,
        }
    }
}

/// One conversation execution.
///
/// Only the run controller mutates a `Run`; every transition goes through a
/// method here so the state/pending-question invariant holds.
#[derive(Debug)]
pub struct Run {
    run_id: String,
    selector: Option<String>,
    state: RunState,
    pending: Option<PendingQuestion>,
    prompt_policy: PromptPolicy,
    metadata: serde_json::Value,
    failure: Option<String>,
    failure_code: Option<String>,
    turns: usize,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    active_at: Instant,
    settled_at: Option<Instant>,
}

impl Run {
    #[must_use]
    pub fn new(run_id: impl Into<String>, metadata: serde_json::Value) -> Self {
        let now = Utc::now();
        Self {
            run_id: run_id.into(),
            selector: None,
            state: RunState::Created,
            pending: None,
            prompt_policy: PromptPolicy::default(),
            metadata,
            failure: None,
            failure_code: None,
            turns: 0,
            created_at: now,
            updated_at: now,
            active_at: Instant::now(),
            settled_at: None,
        }
    }

    #[must_use]
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    #[must_use]
    pub fn state(&self) -> RunState {
        self.state
    }

    #[must_use]
    pub fn selector(&self) -> Option<&str> {
        self.selector.as_deref()
    }

    #[must_use]
    pub fn pending(&self) -> Option<&PendingQuestion> {
        self.pending.as_ref()
    }

    #[must_use]
    pub fn prompt_policy(&self) -> &PromptPolicy {
        &self.prompt_policy
    }

    #[must_use]
    pub fn turns(&self) -> usize {
        self.turns
    }

    /// Why the run failed, if it did.
    #[must_use]
    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    /// Stable code of the failure, e.g. `cancelled` or `idle_timeout`.
    #[must_use]
    pub fn failure_code(&self) -> Option<&str> {
        self.failure_code.as_deref()
    }

    /// Last creation, transition or recorded turn.
    #[must_use]
    pub fn active_at(&self) -> Instant {
        self.active_at
    }

    /// When the run reached a terminal state.
    #[must_use]
    pub fn settled_at(&self) -> Option<Instant> {
        self.settled_at
    }

    /// `Created → Running`, binding the run to its team.
    pub fn begin(&mut self, selector: &str, prompt_policy: PromptPolicy) -> Result<(), RunError> {
        self.expect(RunState::Created)?;
        self.selector = Some(selector.to_string());
        self.prompt_policy = prompt_policy;
        self.transition(RunState::Running);
        Ok(())
    }

    /// Count one agent turn.
    pub fn record_turn(&mut self) {
        self.turns += 1;
        self.updated_at = Utc::now();
        self.active_at = Instant::now();
    }

    /// `Running → Suspended`.
    ///
    /// Fails if a question is already pending: suspensions never stack.
    pub fn suspend(&mut self, question: PendingQuestion) -> Result<(), RunError> {
        self.expect(RunState::Running)?;
        if self.pending.is_some() {
            return Err(self.invalid());
        }
        self.pending = Some(question);
        self.transition(RunState::Suspended);
        Ok(())
    }

    /// Amend the pending question after an invalid answer. The run stays
    /// suspended in the same slot.
    pub fn reprompt(&mut self, reason: &str) -> Result<&PendingQuestion, RunError> {
        self.expect(RunState::Suspended)?;
        let Some(pending) = self.pending.as_mut() else {
            return Err(RunError::InvalidState {
                run_id: self.run_id.clone(),
                state: self.state,
            });
        };
        pending.rejections += 1;
        pending.question = AnswerPolicy::amend(&pending.base_question, reason);
        self.updated_at = Utc::now();
        Ok(pending)
    }

    /// `Suspended → Running`, clearing and returning the pending question.
    pub fn resume(&mut self) -> Result<PendingQuestion, RunError> {
        self.expect(RunState::Suspended)?;
        let pending = self.pending.take().ok_or_else(|| self.invalid())?;
        self.transition(RunState::Running);
        Ok(pending)
    }

    /// `Running → Completed`.
    pub fn complete(&mut self) -> Result<(), RunError> {
        self.expect(RunState::Running)?;
        self.transition(RunState::Completed);
        Ok(())
    }

    /// Any non-terminal state → `Failed`, recording why and under which
    /// code. Returns `false` if already terminal.
    pub fn fail(&mut self, reason: impl Into<String>, code: &str) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        self.pending = None;
        self.failure = Some(reason.into());
        self.failure_code = Some(code.to_string());
        self.transition(RunState::Failed);
        true
    }

    #[must_use]
    pub fn snapshot(&self, messages: Vec<Message>) -> RunSnapshot {
        RunSnapshot {
            run_id: self.run_id.clone(),
            thread_id: self.run_id.clone(),
            assistant_id: self.selector.clone(),
            status: self.state,
            messages,
            question: self.pending.as_ref().map(|p| p.question.clone()),
            choices: self
                .pending
                .as_ref()
                .map(|p| p.policy.choices().to_vec())
                .unwrap_or_default(),
            error: self.failure.clone(),
            metadata: self.metadata.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }

    fn expect(&self, state: RunState) -> Result<(), RunError> {
        if self.state == state {
            Ok(())
        } else {
            Err(self.invalid())
        }
    }

    fn invalid(&self) -> RunError {
        RunError::InvalidState {
            run_id: self.run_id.clone(),
            state: self.state,
        }
    }

    fn transition(&mut self, next: RunState) {
        tracing::debug!(run_id = %self.run_id, from = %self.state, to = %next, "run transition");
        self.state = next;
        self.updated_at = Utc::now();
        self.active_at = Instant::now();
        if next.is_terminal() {
            self.settled_at = Some(Instant::now());
        }
    }
}

/// Serializable view of a run, returned by state queries and wait-mode calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSnapshot {
    pub run_id: String,
    /// Thread the run lives on. Runs and threads share one id.
    #[serde(default)]
    pub thread_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assistant_id: Option<String>,
    pub status: RunState,
    pub messages: Vec<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub question: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub choices: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn running() -> Run {
        let mut run = Run::new("r-1", serde_json::Value::Null);
        run.begin("echo", PromptPolicy::default()).unwrap();
        run
    }

    #[test]
    fn pending_question_only_while_suspended() {
        let mut run = running();
        assert!(run.pending().is_none());

        run.suspend(PendingQuestion::new("Approve?", AnswerPolicy::FreeText))
            .unwrap();
        assert_eq!(run.state(), RunState::Suspended);
        assert_eq!(run.pending().unwrap().question, "Approve?");

        let taken = run.resume().unwrap();
        assert_eq!(taken.question, "Approve?");
        assert_eq!(run.state(), RunState::Running);
        assert!(run.pending().is_none());
    }

    #[test]
    fn a_second_suspension_cannot_stack() {
        let mut run = running();
        run.suspend(PendingQuestion::new("first", AnswerPolicy::FreeText))
            .unwrap();
        let err = run
            .suspend(PendingQuestion::new("second", AnswerPolicy::FreeText))
            .unwrap_err();
        assert!(matches!(err, RunError::InvalidState { state: RunState::Suspended, .. }));
        assert_eq!(run.pending().unwrap().question, "first");
    }

    #[test]
    fn reprompt_amends_in_place() {
        let mut run = running();
        run.suspend(PendingQuestion::new("Approve?", AnswerPolicy::one_of(["APPROVE"])))
            .unwrap();
        let pending = run.reprompt("Invalid answer \"nah\".").unwrap();
        assert_eq!(pending.rejections, 1);
        assert!(pending.question.starts_with("Approve?"));
        assert!(pending.question.ends_with("Invalid answer \"nah\"."));
        assert_eq!(pending.base_question, "Approve?");
        assert_eq!(run.state(), RunState::Suspended);
    }

    #[test]
    fn terminal_states_reject_everything() {
        let mut run = running();
        run.complete().unwrap();
        assert!(run.settled_at().is_some());
        assert!(run.resume().is_err());
        assert!(run.complete().is_err());
        assert!(!run.fail("late", "cancelled"));
        assert_eq!(run.state(), RunState::Completed);
    }

    #[test]
    fn fail_clears_the_pending_question() {
        let mut run = running();
        run.suspend(PendingQuestion::new("q", AnswerPolicy::FreeText))
            .unwrap();
        assert!(run.fail("cancelled", "cancelled"));
        assert!(run.pending().is_none());
        assert_eq!(run.failure_code(), Some("cancelled"));
        let snapshot = run.snapshot(vec![]);
        assert_eq!(snapshot.status, RunState::Failed);
        assert_eq!(snapshot.error.as_deref(), Some("cancelled"));
        assert!(snapshot.question.is_none());
        assert_eq!(snapshot.thread_id, "r-1");
    }

    #[test]
    fn first_failure_keeps_its_code() {
        let mut run = running();
        assert!(run.fail("evicted after 60s", "idle_timeout"));
        assert!(!run.fail("run cancelled", "cancelled"));
        assert_eq!(run.failure(), Some("evicted after 60s"));
        assert_eq!(run.failure_code(), Some("idle_timeout"));
    }

    #[test]
    fn begin_only_from_created() {
        let mut run = running();
        assert!(run.begin("echo", PromptPolicy::default()).is_err());
    }
}
