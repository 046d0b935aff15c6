use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use super::{Agent, AgentFailure, AgentReply, HumanInputRequest, TurnOutcome};
use crate::conversation::{Message, Usage};
use crate::run::AnswerPolicy;

/// One scripted turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptStep {
    /// Reply with fixed text.
    Say(String),
    /// Reply by echoing the latest human turn.
    Echo,
    /// Ask for human input.
    Ask(Option<String>, AnswerPolicy),
    /// Fail the turn.
    Fail(String),
}

/// Deterministic agent used for offline selectors and tests.
///
/// Steps are taken in order; once exhausted the last step repeats. Token usage
/// is approximated by whitespace-separated word counts.
#[derive(Debug)]
pub struct ScriptedAgent {
    name: String,
    steps: Vec<ScriptStep>,
    cursor: AtomicUsize,
    delay: Option<Duration>,
}

impl ScriptedAgent {
    #[must_use]
    pub fn new(name: impl Into<String>, steps: Vec<ScriptStep>) -> Self {
        Self {
            name: name.into(),
            steps,
            cursor: AtomicUsize::new(0),
            delay: None,
        }
    }

    /// Echo the latest human turn on every call.
    #[must_use]
    pub fn echo(name: impl Into<String>) -> Self {
        Self::new(name, vec![ScriptStep::Echo])
    }

    /// Reply with each text in turn, repeating the last.
    #[must_use]
    pub fn replies<I, S>(name: impl Into<String>, replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(name, replies.into_iter().map(|r| ScriptStep::Say(r.into())).collect())
    }

    /// Sleep before every turn.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    fn next_step(&self) -> Option<&ScriptStep> {
        let at = self.cursor.fetch_add(1, Ordering::SeqCst);
        self.steps.get(at).or_else(|| self.steps.last())
    }
}

fn words(text: &str) -> u64 {
    text.split_whitespace().count() as u64
}

#[async_trait::async_trait]
impl Agent for ScriptedAgent {
    fn name(&self) -> &str {
        &self.name
    }

    async fn take_turn(&self, history: &[Message]) -> TurnOutcome {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let content = match self.next_step() {
            None => return TurnOutcome::Failure(AgentFailure::new("script is empty")),
            Some(ScriptStep::Say(text)) => text.clone(),
            Some(ScriptStep::Echo) => {
                let last = history
                    .iter()
                    .rev()
                    .find(|m| !m.role.is_agent())
                    .map_or("", |m| m.content.as_str());
                format!("Echo: {last}")
            }
            Some(ScriptStep::Ask(prompt, policy)) => {
                return TurnOutcome::NeedsHumanInput(HumanInputRequest {
                    prompt: prompt.clone(),
                    policy: policy.clone(),
                });
            }
            Some(ScriptStep::Fail(reason)) => return TurnOutcome::Failure(AgentFailure::new(reason.clone())),
        };

        let usage = Usage {
            prompt_tokens: history.iter().map(|m| words(&m.content)).sum(),
            completion_tokens: words(&content),
        };
        TurnOutcome::Message(AgentReply {
            content,
            usage: Some(usage),
        })
    }
}
