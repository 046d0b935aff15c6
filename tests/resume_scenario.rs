//! "Tell me a story" through the caller-side orchestrator, in process and
//! over a real socket.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;

use hitl_relay::AppState;
use hitl_relay::agent::AgentRegistry;
use hitl_relay::client::{
    Client, ClientError, HumanInput, OutcomeStatus, Prompt, ResumeOrchestrator, RunTransport,
};
use hitl_relay::config::{AgentsConfig, AppConfig};
use hitl_relay::conversation::Role;
use hitl_relay::run::{RunController, RunState};
use hitl_relay::server::router;

#[derive(Debug, Default)]
struct Reviewer {
    answers: VecDeque<String>,
    asked: Vec<Prompt>,
}

impl Reviewer {
    fn answering(answers: &[&str]) -> Self {
        Self {
            answers: answers.iter().map(ToString::to_string).collect(),
            asked: Vec::new(),
        }
    }
}

#[async_trait]
impl HumanInput for Reviewer {
    async fn answer(&mut self, prompt: &Prompt) -> Result<String, ClientError> {
        self.asked.push(prompt.clone());
        self.answers
            .pop_front()
            .ok_or_else(|| ClientError::Input("reviewer has nothing more to say".into()))
    }
}

fn agents(config: &AgentsConfig) -> AgentRegistry {
    AgentRegistry::from_config(config, None)
}

async fn tell_a_story<T: RunTransport>(transport: T, answers: &[&str]) -> anyhow::Result<(
    hitl_relay::client::ClientOutcome,
    Vec<Prompt>,
)> {
    let mut orchestrator = ResumeOrchestrator::new(transport, Reviewer::answering(answers));
    let outcome = orchestrator.run("echo_human_in_loop", "tell me a story").await?;
    Ok((outcome, orchestrator.human().asked.clone()))
}

fn assert_story_transcript(outcome: &hitl_relay::client::ClientOutcome) {
    assert_eq!(outcome.status, OutcomeStatus::Completed);
    let agent_turns = outcome
        .transcript
        .iter()
        .filter(|m| m.role != Role::Human)
        .count();
    assert_eq!(agent_turns, 2);
    let human: Vec<&str> = outcome
        .transcript
        .iter()
        .filter(|m| m.role == Role::Human)
        .map(|m| m.content.as_str())
        .collect();
    assert_eq!(human, ["tell me a story", "APPROVE"]);
}

#[tokio::test]
async fn in_process_story_is_approved() -> anyhow::Result<()> {
    let config = AppConfig::default();
    let controller = RunController::new(agents(&config.agents), &config.runs);

    let (outcome, asked) = tell_a_story(controller.clone(), &["APPROVE"]).await?;

    assert_story_transcript(&outcome);
    assert_eq!(asked.len(), 1);
    assert_eq!(asked[0].run_id, outcome.run_id);
    assert!(asked[0].question.contains("Echo: tell me a story"));

    let snapshot = controller.snapshot(&outcome.run_id)?;
    assert_eq!(snapshot.status, RunState::Completed);
    assert_eq!(snapshot.messages, outcome.transcript);
    assert_eq!(controller.suspended_count(), 0);
    Ok(())
}

#[tokio::test]
async fn feedback_round_before_approval() -> anyhow::Result<()> {
    let config = AppConfig::default();
    let controller = RunController::new(agents(&config.agents), &config.runs);

    let (outcome, asked) =
        tell_a_story(controller, &["make it about a dragon", "APPROVE"]).await?;

    assert_eq!(outcome.status, OutcomeStatus::Completed);
    assert_eq!(outcome.questions, 2);
    assert_eq!(asked.len(), 2);
    assert_eq!(asked[0].run_id, asked[1].run_id);
    assert!(asked[1].question.contains("make it about a dragon"));
    Ok(())
}

#[tokio::test]
async fn constrained_answers_over_http() -> anyhow::Result<()> {
    let mut config = AppConfig::default();
    config.agents.approval_choices = vec!["APPROVE".into(), "REJECT".into()];
    let config = Arc::new(config);
    let controller = RunController::new(agents(&config.agents), &config.runs);
    let app = router(AppState {
        controller,
        config: Arc::clone(&config),
    });

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let server = tokio::spawn(async move {
        axum::serve(listener, app.into_make_service()).await
    });

    let client = Client::new(format!("http://{addr}"))?;
    let (outcome, asked) = tell_a_story(client.clone(), &["sounds good", "approve"]).await?;

    assert_story_transcript(&outcome);
    assert_eq!(outcome.questions, 1);
    assert_eq!(outcome.rejections, 1);
    assert_eq!(asked.len(), 2);
    assert_eq!(asked[1].rejected_answer.as_deref(), Some("sounds good"));
    assert_eq!(asked[1].choices, ["APPROVE", "REJECT"]);

    let snapshot = client.runs().get(&outcome.run_id).await?;
    assert_eq!(snapshot.status, RunState::Completed);

    let err = client.runs().resume(&outcome.run_id, "APPROVE").await.unwrap_err();
    assert!(matches!(
        err,
        ClientError::Api { status: 409, ref code, .. } if code.as_deref() == Some("invalid_state")
    ));

    server.abort();
    Ok(())
}

#[tokio::test]
async fn reserved_characters_in_ids_survive_the_path() -> anyhow::Result<()> {
    let config = Arc::new(AppConfig::default());
    let controller = RunController::new(agents(&config.agents), &config.runs);
    let app = router(AppState {
        controller,
        config: Arc::clone(&config),
    });

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let server = tokio::spawn(async move {
        axum::serve(listener, app.into_make_service()).await
    });

    let client = Client::new(format!("http://{addr}"))?;
    let thread_id = "team a/1?draft#2";
    let created = client
        .threads()
        .create(Some(thread_id), serde_json::json!({}))
        .await?;
    assert_eq!(created.thread_id, thread_id);

    let state = client.threads().state(thread_id).await?;
    assert_eq!(state.run_id, thread_id);
    assert_eq!(state.status, RunState::Created);

    let cancelled = client.runs().cancel(thread_id).await?;
    assert_eq!(cancelled.status, RunState::Failed);
    assert_eq!(client.runs().get(thread_id).await?.status, RunState::Failed);

    server.abort();
    Ok(())
}
