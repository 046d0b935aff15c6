//! Agent capability driven by the run controller.
//!
//! The controller depends only on the [`Agent`] trait: one turn over the
//! conversation so far, returning a closed set of outcomes. How an agent
//! produces its text is its own business.
//!
//! # Implementations
//!
//! - [`LlmAssistant`]: `OpenAI`-compatible Chat Completions endpoint
//! - [`HumanProxy`]: always asks for human input
//! - [`ScriptedAgent`]: deterministic replies, no network
//!
//! Agents are grouped into a [`Team`] (primary responder plus optional
//! counterpart) and looked up by selector in the [`AgentRegistry`].

mod assistant;
mod proxy;
mod registry;
mod scripted;

pub use assistant::{LlmAssistant, LlmSettings};
pub use proxy::HumanProxy;
pub use registry::AgentRegistry;
pub use scripted::{ScriptStep, ScriptedAgent};

use std::fmt;
use std::sync::Arc;

use crate::conversation::{Message, Role, Usage};
use crate::run::{AnswerPolicy, PromptPolicy};

/// Text produced by an agent turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentReply {
    pub content: String,
    pub usage: Option<Usage>,
}

impl AgentReply {
    #[must_use]
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            usage: None,
        }
    }
}

/// An agent's request to hand the conversation to a human.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HumanInputRequest {
    /// Prompt the agent would like shown, if any.
    pub prompt: Option<String>,
    /// Validation applied to the answer.
    pub policy: AnswerPolicy,
}

/// Failure raised inside an agent turn.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct AgentFailure {
    pub message: String,
}

impl AgentFailure {
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<anyhow::Error> for AgentFailure {
    fn from(err: anyhow::Error) -> Self {
        Self::new(format!("{err:#}"))
    }
}

/// Result of one agent turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnOutcome {
    /// The agent said something.
    Message(AgentReply),
    /// The agent needs a human answer before the conversation can go on.
    NeedsHumanInput(HumanInputRequest),
    /// The turn failed.
    Failure(AgentFailure),
}

/// A conversational participant.
#[async_trait::async_trait]
pub trait Agent: Send + Sync + fmt::Debug {
    /// Name recorded as the `source` of this agent's messages.
    fn name(&self) -> &str;

    /// Take one turn over the conversation so far.
    async fn take_turn(&self, history: &[Message]) -> TurnOutcome;

    /// Whether `message` ends the conversation from this agent's point of view.
    fn is_termination(&self, _message: &Message) -> bool {
        false
    }
}

/// Conversation-level stop condition.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Termination {
    /// Only the turn limit or an agent's own check ends the run.
    #[default]
    Never,
    /// A message containing `phrase`, optionally only from `role`.
    TextMention { phrase: String, role: Option<Role> },
}

impl Termination {
    #[must_use]
    pub fn matches(&self, message: &Message) -> bool {
        match self {
            Self::Never => false,
            Self::TextMention { phrase, role } => {
                role.is_none_or(|r| r == message.role) && message.content.contains(phrase.as_str())
            }
        }
    }
}

/// A primary responder and an optional counterpart, alternating turns.
#[derive(Debug, Clone)]
pub struct Team {
    pub selector: String,
    pub primary: Arc<dyn Agent>,
    pub counterpart: Option<Arc<dyn Agent>>,
    pub termination: Termination,
    pub prompt_policy: PromptPolicy,
}

impl Team {
    /// A single agent; the run completes after its first message.
    #[must_use]
    pub fn solo(selector: impl Into<String>, primary: Arc<dyn Agent>) -> Self {
        Self {
            selector: selector.into(),
            primary,
            counterpart: None,
            termination: Termination::Never,
            prompt_policy: PromptPolicy::default(),
        }
    }

    /// Two agents taking turns, primary first.
    #[must_use]
    pub fn pair(
        selector: impl Into<String>,
        primary: Arc<dyn Agent>,
        counterpart: Arc<dyn Agent>,
        termination: Termination,
    ) -> Self {
        Self {
            selector: selector.into(),
            primary,
            counterpart: Some(counterpart),
            termination,
            prompt_policy: PromptPolicy::default(),
        }
    }

    #[must_use]
    pub fn with_prompt_policy(mut self, policy: PromptPolicy) -> Self {
        self.prompt_policy = policy;
        self
    }

    #[must_use]
    pub fn is_termination(&self, message: &Message) -> bool {
        self.termination.matches(message)
            || self.primary.is_termination(message)
            || self
                .counterpart
                .as_ref()
                .is_some_and(|c| c.is_termination(message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_mention_respects_role_filter() {
        let stop = Termination::TextMention {
            phrase: "APPROVE".into(),
            role: Some(Role::Human),
        };
        assert!(stop.matches(&Message::human("I APPROVE this")));
        assert!(!stop.matches(&Message::agent(
            Role::SystemAgent,
            "assistant",
            "Reply APPROVE when done"
        )));

        let any = Termination::TextMention {
            phrase: "TERMINATE".into(),
            role: None,
        };
        assert!(any.matches(&Message::agent(Role::CounterpartAgent, "critic", "TERMINATE")));
        assert!(!Termination::Never.matches(&Message::human("TERMINATE")));
    }

    #[test]
    fn anyhow_errors_keep_their_context() {
        let err = anyhow::anyhow!("connection refused").context("calling model");
        let failure = AgentFailure::from(err);
        assert_eq!(failure.message, "calling model: connection refused");
    }
}
