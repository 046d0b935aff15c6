//! Policies attached to a suspension: what the human is shown, and which
//! answers are acceptable.

use serde::{Deserialize, Serialize};

use crate::conversation::Message;

/// Fallback question when neither history nor the agent supplies one.
pub const DEFAULT_QUESTION: &str = "Please provide feedback:";

/// Which text is shown to the human when a run suspends.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptPolicy {
    /// Echo the most recent agent message.
    #[default]
    LastAgentMessage,
    /// Use the prompt supplied by the agent that asked for input, falling
    /// back to the most recent agent message.
    AgentPrompt,
    /// Always show a fixed text.
    Custom(String),
}

impl PromptPolicy {
    /// Parse the configuration form: `last_agent_message`, `agent_prompt`, or
    /// any other text taken verbatim as a custom prompt.
    #[must_use]
    pub fn from_config(value: &str) -> Self {
        match value.trim() {
            "" | "last_agent_message" => Self::LastAgentMessage,
            "agent_prompt" => Self::AgentPrompt,
            custom => Self::Custom(custom.to_string()),
        }
    }

    /// Build the question for a suspension raised after `history`.
    #[must_use]
    pub fn render(&self, history: &[Message], requested: Option<&str>) -> String {
        let last_agent = || {
            history
                .iter()
                .rev()
                .find(|m| m.role.is_agent())
                .map(|m| m.content.clone())
        };

        match self {
            Self::LastAgentMessage => last_agent()
                .or_else(|| requested.map(ToString::to_string))
                .unwrap_or_else(|| DEFAULT_QUESTION.to_string()),
            Self::AgentPrompt => requested
                .map(ToString::to_string)
                .or_else(last_agent)
                .unwrap_or_else(|| DEFAULT_QUESTION.to_string()),
            Self::Custom(text) => text.clone(),
        }
    }
}

/// Validation applied to a continuation answer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AnswerPolicy {
    /// Any text is accepted as-is.
    #[default]
    FreeText,
    /// The answer must match one of `choices`, ignoring case and surrounding
    /// whitespace. The canonical spelling is recorded.
    OneOf { choices: Vec<String> },
}

impl AnswerPolicy {
    #[must_use]
    pub fn one_of<I, S>(choices: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::OneOf {
            choices: choices.into_iter().map(Into::into).collect(),
        }
    }

    /// Acceptable answers, empty for free text.
    #[must_use]
    pub fn choices(&self) -> &[String] {
        match self {
            Self::FreeText => &[],
            Self::OneOf { choices } => choices,
        }
    }

    /// Check `answer`, returning the text to record.
    pub fn validate(&self, answer: &str) -> Result<String, String> {
        match self {
            Self::FreeText => Ok(answer.to_string()),
            Self::OneOf { choices } => {
                let wanted = answer.trim();
                choices
                    .iter()
                    .find(|c| c.eq_ignore_ascii_case(wanted))
                    .cloned()
                    .ok_or_else(|| {
                        format!(
                            "Invalid answer \"{}\". Please answer with one of: {}.",
                            answer.trim(),
                            choices.join(", ")
                        )
                    })
            }
        }
    }

    /// The question re-raised after `reason` rejected an answer.
    #[must_use]
    pub fn amend(base_question: &str, reason: &str) -> String {
        format!("{base_question}\n\n{reason}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::Role;

    fn history() -> Vec<Message> {
        vec![
            Message::human("tell me a story"),
            Message::agent(Role::SystemAgent, "assistant", "A hare raced a tortoise."),
            Message::human("more"),
        ]
    }

    #[test]
    fn last_agent_message_skips_human_turns() {
        let q = PromptPolicy::LastAgentMessage.render(&history(), Some("ignored"));
        assert_eq!(q, "A hare raced a tortoise.");
    }

    #[test]
    fn agent_prompt_prefers_the_request() {
        assert_eq!(PromptPolicy::AgentPrompt.render(&history(), Some("Approve?")), "Approve?");
        assert_eq!(
            PromptPolicy::AgentPrompt.render(&history(), None),
            "A hare raced a tortoise."
        );
    }

    #[test]
    fn empty_history_falls_back() {
        assert_eq!(PromptPolicy::LastAgentMessage.render(&[], None), DEFAULT_QUESTION);
        assert_eq!(PromptPolicy::Custom("Go?".into()).render(&[], None), "Go?");
    }

    #[test]
    fn config_strings_map_to_policies() {
        assert_eq!(PromptPolicy::from_config(""), PromptPolicy::LastAgentMessage);
        assert_eq!(PromptPolicy::from_config("agent_prompt"), PromptPolicy::AgentPrompt);
        assert_eq!(
            PromptPolicy::from_config("Proceed?"),
            PromptPolicy::Custom("Proceed?".into())
        );
    }

    #[test]
    fn one_of_is_case_insensitive_and_canonicalizes() {
        let policy = AnswerPolicy::one_of(["APPROVE", "REVISE"]);
        assert_eq!(policy.validate(" approve ").unwrap(), "APPROVE");

        let reason = policy.validate("maybe").unwrap_err();
        assert!(reason.contains("maybe"));
        assert!(reason.contains("APPROVE, REVISE"));
    }

    #[test]
    fn free_text_accepts_anything() {
        assert_eq!(AnswerPolicy::FreeText.validate("  spaced ").unwrap(), "  spaced ");
        assert!(AnswerPolicy::FreeText.choices().is_empty());
    }
}
