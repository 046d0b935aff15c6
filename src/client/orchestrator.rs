//! Caller-side resume loop.
//!
//! The orchestrator reads one stream segment at a time. `update` envelopes
//! extend the local transcript; an `interrupt` parks the loop until the
//! [`HumanInput`] answers, then a continuation bound to the interrupt's
//! `run_id` opens the next segment. An interrupt that re-asks after a
//! rejected answer is the same question again, not a new one.

use async_trait::async_trait;
use futures::StreamExt;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines, Stdin};

use super::EnvelopeStream;
use super::error::{ClientError, Result};
use super::http::Client;
use crate::conversation::Message;
use crate::error::DecodeError;
use crate::protocol::{Envelope, ErrorData, InterruptData, UpdateStatus};
use crate::run::{RunController, StartRequest};

/// Default number of rejected answers tolerated for a single question.
pub const DEFAULT_MAX_REJECTIONS: usize = 5;

/// Where runs are started and continued.
#[async_trait]
pub trait RunTransport: Send + Sync {
    async fn start(&self, assistant_id: &str, query: &str) -> Result<EnvelopeStream>;

    async fn resume(&self, run_id: &str, answer: &str) -> Result<EnvelopeStream>;
}

#[async_trait]
impl RunTransport for Client {
    async fn start(&self, assistant_id: &str, query: &str) -> Result<EnvelopeStream> {
        self.runs().create_stream(assistant_id, query).await
    }

    async fn resume(&self, run_id: &str, answer: &str) -> Result<EnvelopeStream> {
        self.runs().resume_stream(run_id, answer).await
    }
}

/// Embedded mode: drive runs on an in-process controller.
#[async_trait]
impl RunTransport for RunController {
    async fn start(&self, assistant_id: &str, query: &str) -> Result<EnvelopeStream> {
        let stream = RunController::start(self, StartRequest::query(assistant_id, query))?;
        Ok(stream.map(Ok::<_, DecodeError>).boxed())
    }

    async fn resume(&self, run_id: &str, answer: &str) -> Result<EnvelopeStream> {
        let stream = RunController::resume(self, run_id, answer)?;
        Ok(stream.map(Ok::<_, DecodeError>).boxed())
    }
}

/// A question surfaced to the human.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompt {
    pub run_id: String,
    pub question: String,
    /// Acceptable answers; empty for free text.
    pub choices: Vec<String>,
    /// The previous answer, when it was rejected.
    pub rejected_answer: Option<String>,
    /// 0 for a new question, incremented on each re-prompt.
    pub attempt: usize,
}

impl From<(&InterruptData, usize)> for Prompt {
    fn from((data, attempt): (&InterruptData, usize)) -> Self {
        Self {
            run_id: data.run_id.clone(),
            question: data.question.clone(),
            choices: data.choices.clone(),
            rejected_answer: data.rejected_answer.clone(),
            attempt,
        }
    }
}

/// External source of human answers.
#[async_trait]
pub trait HumanInput: Send {
    /// Answer `prompt`.
    async fn answer(&mut self, prompt: &Prompt) -> Result<String>;

    /// New messages arrived on the stream.
    async fn show(&mut self, _messages: &[Message]) -> Result<()> {
        Ok(())
    }
}

/// Reads answers from standard input and prints the transcript to stdout.
#[derive(Debug)]
pub struct StdinHuman {
    lines: Lines<BufReader<Stdin>>,
}

impl StdinHuman {
    #[must_use]
    pub fn new() -> Self {
        Self {
            lines: BufReader::new(tokio::io::stdin()).lines(),
        }
    }
}

impl Default for StdinHuman {
    fn default() -> Self {
        Self::new()
    }
}

async fn write_stdout(text: &str) -> Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout
        .write_all(text.as_bytes())
        .await
        .map_err(|e| ClientError::Input(e.to_string()))?;
    stdout
        .flush()
        .await
        .map_err(|e| ClientError::Input(e.to_string()))
}

#[async_trait]
impl HumanInput for StdinHuman {
    async fn answer(&mut self, prompt: &Prompt) -> Result<String> {
        let mut text = String::new();
        if let Some(rejected) = &prompt.rejected_answer {
            text.push_str(&format!("'{rejected}' was not accepted.\n"));
        }
        text.push_str(&format!("\n{}\n", prompt.question));
        if !prompt.choices.is_empty() {
            text.push_str(&format!("[{}]\n", prompt.choices.join(" / ")));
        }
        text.push_str("> ");
        write_stdout(&text).await?;

        match self.lines.next_line().await {
            Ok(Some(line)) => Ok(line.trim_end().to_string()),
            Ok(None) => Err(ClientError::Input("stdin closed".into())),
            Err(e) => Err(ClientError::Input(e.to_string())),
        }
    }

    async fn show(&mut self, messages: &[Message]) -> Result<()> {
        let mut text = String::new();
        for message in messages {
            let source = message.source.as_deref().unwrap_or(message.role.as_str());
            text.push_str(&format!("[{source}] {}\n", message.content));
        }
        write_stdout(&text).await
    }
}

/// How a run ended from the caller's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeStatus {
    Completed,
    Failed,
}

/// Result of [`ResumeOrchestrator::run`].
#[derive(Debug, Clone)]
pub struct ClientOutcome {
    pub run_id: String,
    pub status: OutcomeStatus,
    /// Every message received, in stream order.
    pub transcript: Vec<Message>,
    /// Distinct questions answered.
    pub questions: usize,
    /// Re-prompts after rejected answers.
    pub rejections: usize,
    pub error: Option<ErrorData>,
}

enum Segment {
    Completed,
    Interrupted(InterruptData),
    Failed(ErrorData),
}

/// Drives a run to a terminal state, answering every interrupt.
#[derive(Debug)]
pub struct ResumeOrchestrator<T, H> {
    transport: T,
    human: H,
    max_rejections: usize,
}

impl<T: RunTransport, H: HumanInput> ResumeOrchestrator<T, H> {
    pub fn new(transport: T, human: H) -> Self {
        Self {
            transport,
            human,
            max_rejections: DEFAULT_MAX_REJECTIONS,
        }
    }

    #[must_use]
    pub fn with_max_rejections(mut self, max: usize) -> Self {
        self.max_rejections = max;
        self
    }

    pub fn human(&self) -> &H {
        &self.human
    }

    /// Start a run with `query` and follow it until it completes or fails.
    #[tracing::instrument(skip(self, query), fields(run_id = tracing::field::Empty))]
    pub async fn run(&mut self, assistant_id: &str, query: &str) -> Result<ClientOutcome> {
        let mut stream = self.transport.start(assistant_id, query).await?;
        let mut outcome = ClientOutcome {
            run_id: String::new(),
            status: OutcomeStatus::Completed,
            transcript: Vec::new(),
            questions: 0,
            rejections: 0,
            error: None,
        };
        let mut attempt = 0;
        let mut continued = false;

        loop {
            let received_before = outcome.transcript.len();
            let segment = self.consume(&mut stream, &mut outcome).await?;
            let fresh = outcome.transcript.len() > received_before;

            let interrupt = match segment {
                Segment::Completed => return Ok(outcome),
                Segment::Failed(error) => {
                    tracing::warn!(run_id = %outcome.run_id, error = %error.message, "run failed");
                    outcome.status = OutcomeStatus::Failed;
                    outcome.error = Some(error);
                    return Ok(outcome);
                }
                Segment::Interrupted(interrupt) => interrupt,
            };

            // A re-ask carries the rejected answer and no new messages.
            let reprompt = interrupt.rejected_answer.is_some() || (continued && !fresh);
            if reprompt {
                attempt += 1;
                outcome.rejections += 1;
                if attempt > self.max_rejections {
                    return Err(ClientError::TooManyRejections {
                        run_id: interrupt.run_id,
                        attempts: attempt,
                    });
                }
                tracing::debug!(run_id = %interrupt.run_id, attempt, "question re-asked");
            } else {
                attempt = 0;
                outcome.questions += 1;
            }

            let answer = self.human.answer(&Prompt::from((&interrupt, attempt))).await?;
            stream = self.transport.resume(&interrupt.run_id, &answer).await?;
            continued = true;
        }
    }

    async fn consume(
        &mut self,
        stream: &mut EnvelopeStream,
        outcome: &mut ClientOutcome,
    ) -> Result<Segment> {
        while let Some(envelope) = stream.next().await {
            let envelope = envelope?;
            if outcome.run_id.is_empty() && !envelope.run_id().is_empty() {
                outcome.run_id = envelope.run_id().to_string();
                tracing::Span::current().record("run_id", outcome.run_id.as_str());
            }
            match envelope {
                Envelope::Update(update) => {
                    if !update.messages.is_empty() {
                        self.human.show(&update.messages).await?;
                    }
                    outcome.transcript.extend(update.messages);
                    if update.status == UpdateStatus::Completed {
                        return Ok(Segment::Completed);
                    }
                }
                Envelope::Interrupt(interrupt) => return Ok(Segment::Interrupted(interrupt)),
                Envelope::Error(error) => return Ok(Segment::Failed(error)),
            }
        }
        Err(ClientError::StreamEnded)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Arc;

    use super::*;
    use crate::agent::{AgentRegistry, HumanProxy, ScriptedAgent, Team, Termination};
    use crate::config::RunsConfig;
    use crate::conversation::Role;
    use crate::run::AnswerPolicy;

    #[derive(Debug, Default)]
    struct ScriptedHuman {
        answers: VecDeque<String>,
        prompts: Vec<Prompt>,
    }

    impl ScriptedHuman {
        fn new<const N: usize>(answers: [&str; N]) -> Self {
            Self {
                answers: answers.iter().map(ToString::to_string).collect(),
                prompts: Vec::new(),
            }
        }
    }

    #[async_trait]
    impl HumanInput for ScriptedHuman {
        async fn answer(&mut self, prompt: &Prompt) -> Result<String> {
            self.prompts.push(prompt.clone());
            self.answers
                .pop_front()
                .ok_or_else(|| ClientError::Input("no more answers".into()))
        }
    }

    fn controller(policy: AnswerPolicy) -> RunController {
        let mut agents = AgentRegistry::new();
        agents.register(Team::pair(
            "story",
            Arc::new(ScriptedAgent::replies(
                "writer",
                ["Once upon a time a hare raced a tortoise.", "The tortoise won."],
            )),
            Arc::new(HumanProxy::new("user_proxy").with_policy(policy)),
            Termination::TextMention {
                phrase: "APPROVE".into(),
                role: Some(Role::Human),
            },
        ));
        RunController::new(agents, &RunsConfig::default())
    }

    #[tokio::test]
    async fn answers_the_interrupt_and_finishes() {
        let human = ScriptedHuman::new(["APPROVE"]);
        let mut orchestrator = ResumeOrchestrator::new(controller(AnswerPolicy::FreeText), human);

        let outcome = orchestrator.run("story", "tell me a story").await.unwrap();

        assert_eq!(outcome.status, OutcomeStatus::Completed);
        assert_eq!(outcome.questions, 1);
        assert_eq!(outcome.rejections, 0);
        let contents: Vec<&str> = outcome.transcript.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(
            contents,
            [
                "tell me a story",
                "Once upon a time a hare raced a tortoise.",
                "APPROVE",
                "The tortoise won.",
            ]
        );

        let prompts = &orchestrator.human().prompts;
        assert_eq!(prompts.len(), 1);
        assert_eq!(prompts[0].run_id, outcome.run_id);
        assert!(prompts[0].question.contains("hare raced a tortoise"));
    }

    #[tokio::test]
    async fn rejected_answer_is_reasked_not_a_new_question() {
        let human = ScriptedHuman::new(["maybe", "APPROVE"]);
        let policy = AnswerPolicy::one_of(["APPROVE", "REJECT"]);
        let mut orchestrator = ResumeOrchestrator::new(controller(policy), human);

        let outcome = orchestrator.run("story", "tell me a story").await.unwrap();

        assert_eq!(outcome.status, OutcomeStatus::Completed);
        assert_eq!(outcome.questions, 1);
        assert_eq!(outcome.rejections, 1);

        let prompts = &orchestrator.human().prompts;
        assert_eq!(prompts.len(), 2);
        assert_eq!(prompts[0].attempt, 0);
        assert_eq!(prompts[1].attempt, 1);
        assert_eq!(prompts[1].rejected_answer.as_deref(), Some("maybe"));
        assert_eq!(prompts[1].run_id, prompts[0].run_id);
        assert_eq!(prompts[1].choices, ["APPROVE", "REJECT"]);
        assert!(!outcome.transcript.iter().any(|m| m.content == "maybe"));
    }

    #[tokio::test]
    async fn gives_up_after_repeated_rejections() {
        let human = ScriptedHuman::new(["no", "nope", "never"]);
        let policy = AnswerPolicy::one_of(["APPROVE"]);
        let mut orchestrator =
            ResumeOrchestrator::new(controller(policy), human).with_max_rejections(1);

        let err = orchestrator.run("story", "tell me a story").await.unwrap_err();
        assert!(matches!(
            err,
            ClientError::TooManyRejections { attempts: 2, .. }
        ));
    }

    #[tokio::test]
    async fn failed_run_is_reported_not_raised() {
        let mut agents = AgentRegistry::new();
        agents.register(Team::solo(
            "broken",
            Arc::new(ScriptedAgent::new(
                "broken",
                vec![crate::agent::ScriptStep::Fail("model offline".into())],
            )),
        ));
        let controller = RunController::new(agents, &RunsConfig::default());
        let mut orchestrator = ResumeOrchestrator::new(controller, ScriptedHuman::default());

        let outcome = orchestrator.run("broken", "hello").await.unwrap();
        assert_eq!(outcome.status, OutcomeStatus::Failed);
        let error = outcome.error.unwrap();
        assert!(error.message.contains("model offline"));
        assert_eq!(error.code.as_deref(), Some("agent_failure"));
    }

    #[derive(Debug)]
    struct Truncating;

    #[async_trait]
    impl RunTransport for Truncating {
        async fn start(&self, _: &str, _: &str) -> Result<EnvelopeStream> {
            let items: Vec<std::result::Result<Envelope, DecodeError>> = vec![
                Ok(Envelope::update(
                    "r-1",
                    vec![Message::human("hi")],
                    UpdateStatus::Running,
                )),
                Err(DecodeError::Truncated { pending_lines: 1 }),
            ];
            Ok(futures::stream::iter(items).boxed())
        }

        async fn resume(&self, _: &str, _: &str) -> Result<EnvelopeStream> {
            Err(ClientError::StreamEnded)
        }
    }

    #[tokio::test]
    async fn decode_errors_surface_to_the_caller() {
        let mut orchestrator = ResumeOrchestrator::new(Truncating, ScriptedHuman::default());
        let err = orchestrator.run("any", "hi").await.unwrap_err();
        assert!(matches!(
            err,
            ClientError::Decode(DecodeError::Truncated { .. })
        ));
    }

    #[tokio::test]
    async fn unknown_selector_is_a_run_error() {
        let mut orchestrator =
            ResumeOrchestrator::new(controller(AnswerPolicy::FreeText), ScriptedHuman::default());
        let err = orchestrator.run("missing", "hi").await.unwrap_err();
        assert!(matches!(err, ClientError::Run(crate::error::RunError::UnknownAgent(_))));
    }
}
