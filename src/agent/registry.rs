use std::collections::BTreeMap;
use std::sync::Arc;

use super::{Agent, HumanProxy, LlmAssistant, LlmSettings, ScriptedAgent, Team, Termination};
use crate::config::AgentsConfig;
use crate::conversation::Role;
use crate::error::RunError;
use crate::run::{AnswerPolicy, PromptPolicy};

/// Teams addressable by selector (`assistant_id` on the wire).
#[derive(Debug, Clone, Default)]
pub struct AgentRegistry {
    teams: BTreeMap<String, Team>,
}

impl AgentRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Built-in selectors.
    ///
    /// `echo` and `echo_human_in_loop` are always present. `assistant` and
    /// `assistant_human_in_loop` are added when `llm` is configured.
    #[must_use]
    pub fn from_config(agents: &AgentsConfig, llm: Option<LlmSettings>) -> Self {
        let mut registry = Self::new();
        let prompt_policy = PromptPolicy::from_config(&agents.prompt_policy);
        let answer_policy = if agents.approval_choices.is_empty() {
            AnswerPolicy::FreeText
        } else {
            AnswerPolicy::one_of(agents.approval_choices.iter().cloned())
        };
        let termination = Termination::TextMention {
            phrase: agents.termination_phrase.clone(),
            role: Some(Role::Human),
        };
        let proxy: Arc<dyn Agent> = Arc::new(HumanProxy::new("user_proxy").with_policy(answer_policy));

        registry.register(Team::solo("echo", Arc::new(ScriptedAgent::echo("echo"))));
        registry.register(
            Team::pair(
                "echo_human_in_loop",
                Arc::new(ScriptedAgent::echo("echo")),
                Arc::clone(&proxy),
                termination.clone(),
            )
            .with_prompt_policy(prompt_policy.clone()),
        );

        if let Some(settings) = llm {
            let assistant: Arc<dyn Agent> = Arc::new(LlmAssistant::new("assistant", settings));
            registry.register(Team::solo("assistant", Arc::clone(&assistant)));
            registry.register(
                Team::pair("assistant_human_in_loop", assistant, proxy, termination)
                    .with_prompt_policy(prompt_policy),
            );
        }

        registry
    }

    /// Add or replace a team under its selector.
    pub fn register(&mut self, team: Team) {
        self.teams.insert(team.selector.clone(), team);
    }

    /// Resolve `selector`. Empty selectors are invalid input; unknown ones
    /// are [`RunError::UnknownAgent`].
    pub fn get(&self, selector: &str) -> Result<Team, RunError> {
        let selector = selector.trim();
        if selector.is_empty() {
            return Err(RunError::InvalidInput("assistant_id is required".into()));
        }
        self.teams
            .get(selector)
            .cloned()
            .ok_or_else(|| RunError::UnknownAgent(selector.to_string()))
    }

    pub fn selectors(&self) -> impl Iterator<Item = &str> {
        self.teams.keys().map(String::as_str)
    }
}
