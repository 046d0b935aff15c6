//! Conversation turns exchanged inside a run.
//!
//! A [`Message`] is immutable once appended to a run's history. Agent turns may
//! carry token accounting; human turns never do.

use serde::{Deserialize, Serialize};

/// Author of a conversation turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Role {
    /// The primary responder of the team.
    SystemAgent,
    /// The collaborating counterpart of the team.
    CounterpartAgent,
    /// A person answering a suspension, or the initial query.
    Human,
}

impl Role {
    /// Whether this turn was produced by an agent rather than a person.
    #[must_use]
    pub fn is_agent(self) -> bool {
        !matches!(self, Self::Human)
    }

    /// Wire name of the role.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SystemAgent => "system-agent",
            Self::CounterpartAgent => "counterpart-agent",
            Self::Human => "human",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Token accounting reported by the model behind an agent turn.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    /// Tokens consumed by the prompt.
    pub prompt_tokens: u64,
    /// Tokens produced in the completion.
    pub completion_tokens: u64,
}

impl Usage {
    /// Total tokens billed for the turn.
    #[must_use]
    pub fn total(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }
}

/// One turn of the conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Who produced the turn.
    pub role: Role,
    /// Name of the producing agent (`"human"` for people).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// Text payload.
    pub content: String,
    /// Token accounting, absent for human turns.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

impl Message {
    /// A human turn (initial query or continuation answer).
    #[must_use]
    pub fn human(content: impl Into<String>) -> Self {
        Self {
            role: Role::Human,
            source: None,
            content: content.into(),
            usage: None,
        }
    }

    /// An agent turn attributed to `source`.
    #[must_use]
    pub fn agent(role: Role, source: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role,
            source: Some(source.into()),
            content: content.into(),
            usage: None,
        }
    }

    /// Attach token accounting to an agent turn. Ignored for human turns.
    #[must_use]
    pub fn with_usage(mut self, usage: Option<Usage>) -> Self {
        if self.role.is_agent() {
            self.usage = usage;
        }
        self
    }
}
