use super::{Agent, HumanInputRequest, TurnOutcome};
use crate::conversation::Message;
use crate::run::AnswerPolicy;

/// Stand-in for a person: every turn hands control to a human.
#[derive(Debug, Clone)]
pub struct HumanProxy {
    name: String,
    prompt: Option<String>,
    policy: AnswerPolicy,
}

impl HumanProxy {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            prompt: None,
            policy: AnswerPolicy::FreeText,
        }
    }

    /// Prompt offered to the run's prompt policy.
    #[must_use]
    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = Some(prompt.into());
        self
    }

    #[must_use]
    pub fn with_policy(mut self, policy: AnswerPolicy) -> Self {
        self.policy = policy;
        self
    }
}

#[async_trait::async_trait]
impl Agent for HumanProxy {
    fn name(&self) -> &str {
        &self.name
    }

    async fn take_turn(&self, _history: &[Message]) -> TurnOutcome {
        TurnOutcome::NeedsHumanInput(HumanInputRequest {
            prompt: self.prompt.clone(),
            policy: self.policy.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn always_asks_for_input() {
        let proxy = HumanProxy::new("user_proxy")
            .with_prompt("Approve?")
            .with_policy(AnswerPolicy::one_of(["APPROVE"]));
        let outcome = proxy.take_turn(&[]).await;
        assert_eq!(
            outcome,
            TurnOutcome::NeedsHumanInput(HumanInputRequest {
                prompt: Some("Approve?".into()),
                policy: AnswerPolicy::one_of(["APPROVE"]),
            })
        );
    }
}
