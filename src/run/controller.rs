//! Run controller: the single writer of run state.
//!
//! Starting a run appends the human query and spawns a driver task that asks
//! the team's agents for turns until one of three things happens:
//!
//! - a termination condition holds: the run completes and the last `update`
//!   carries `status: completed`
//! - an agent needs human input: the run suspends, registers for continuation
//!   and the stream ends with an `interrupt`
//! - a turn fails: the run fails and the stream ends with an `error`
//!
//! Resuming validates the answer against the pending question, appends it as a
//! human turn and drives the same run again. History is never replayed and no
//! turn is re-executed.

use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::task::{Context, Poll};
use std::time::Duration;

use futures::{FutureExt, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, instrument};
use uuid::Uuid;

use super::state::{PendingQuestion, Run, RunSnapshot, RunState};
use crate::agent::{AgentFailure, AgentRegistry, HumanInputRequest, Team, TurnOutcome};
use crate::config::RunsConfig;
use crate::conversation::{Message, Role};
use crate::error::RunError;
use crate::history::HistoryStore;
use crate::protocol::{Envelope, InterruptData, UpdateStatus};
use crate::registry::ContinuationRegistry;

const CANCELLED_CODE: &str = "cancelled";
const IDLE_TIMEOUT_CODE: &str = "idle_timeout";

/// What to do when a thread is created under an id that already exists.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IfExists {
    /// Reject with [`RunError::ThreadExists`].
    Raise,
    /// Return the existing thread unchanged.
    #[default]
    DoNothing,
}

/// Parameters of a new run.
#[derive(Debug, Clone, Default)]
pub struct StartRequest {
    /// Team selector.
    pub assistant_id: String,
    /// Initial human turns, in order.
    pub queries: Vec<String>,
    /// Reuse a thread created beforehand; a fresh id is generated otherwise.
    pub thread_id: Option<String>,
    pub metadata: serde_json::Value,
}

impl StartRequest {
    #[must_use]
    pub fn query(assistant_id: impl Into<String>, query: impl Into<String>) -> Self {
        Self {
            assistant_id: assistant_id.into(),
            queries: vec![query.into()],
            ..Self::default()
        }
    }
}

/// Ordered envelopes of one run segment. Ends after the terminal envelope.
#[derive(Debug)]
pub struct RunStream {
    run_id: String,
    inner: ReceiverStream<Envelope>,
}

impl RunStream {
    fn new(run_id: &str, rx: mpsc::Receiver<Envelope>) -> Self {
        Self {
            run_id: run_id.to_string(),
            inner: ReceiverStream::new(rx),
        }
    }

    #[must_use]
    pub fn run_id(&self) -> &str {
        &self.run_id
    }
}

impl Stream for RunStream {
    type Item = Envelope;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.get_mut().inner).poll_next(cx)
    }
}

/// A run plus the cancellation handle of its active segment.
#[derive(Debug)]
struct RunCell {
    run: Mutex<Run>,
    cancel: Mutex<CancellationToken>,
}

impl RunCell {
    fn new(run: Run) -> Self {
        Self {
            run: Mutex::new(run),
            cancel: Mutex::new(CancellationToken::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Run> {
        self.run.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn state(&self) -> RunState {
        self.lock().state()
    }

    fn renew_token(&self) -> CancellationToken {
        let token = CancellationToken::new();
        *self.cancel.lock().unwrap_or_else(PoisonError::into_inner) = token.clone();
        token
    }

    fn cancel_segment(&self) {
        self.cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .cancel();
    }
}

#[derive(Debug)]
struct Inner {
    runs: RwLock<HashMap<String, Arc<RunCell>>>,
    history: HistoryStore,
    registry: ContinuationRegistry<RunCell>,
    agents: AgentRegistry,
    max_turns: usize,
    stream_buffer: usize,
    idle_timeout: Duration,
}

/// Owns every run and drives them through their lifecycle.
///
/// Cheap to clone; clones share state.
#[derive(Debug, Clone)]
pub struct RunController {
    inner: Arc<Inner>,
}

impl RunController {
    #[must_use]
    pub fn new(agents: AgentRegistry, config: &RunsConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                runs: RwLock::new(HashMap::new()),
                history: HistoryStore::new(),
                registry: ContinuationRegistry::new(),
                agents,
                max_turns: config.max_turns,
                stream_buffer: config.stream_buffer.max(1),
                idle_timeout: Duration::from_secs(config.idle_timeout_secs),
            }),
        }
    }

    #[must_use]
    pub fn agents(&self) -> &AgentRegistry {
        &self.inner.agents
    }

    #[must_use]
    pub fn history(&self) -> &HistoryStore {
        &self.inner.history
    }

    /// Runs currently waiting for a human answer.
    #[must_use]
    pub fn suspended_count(&self) -> usize {
        self.inner.registry.len()
    }

    /// Runs known to the controller, terminal ones included.
    #[must_use]
    pub fn run_count(&self) -> usize {
        self.inner
            .runs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Create an empty thread that a later [`start`](Self::start) can use.
    pub fn create_thread(
        &self,
        thread_id: Option<String>,
        metadata: serde_json::Value,
        if_exists: IfExists,
    ) -> Result<RunSnapshot, RunError> {
        let (run_id, cell) = self.ensure_cell(thread_id, metadata, if_exists)?;
        self.snapshot_of(&run_id, &cell, 0)
    }

    /// Start a run and stream its first segment.
    #[instrument(skip(self, request), fields(assistant_id = %request.assistant_id, run_id = tracing::field::Empty))]
    pub fn start(&self, request: StartRequest) -> Result<RunStream, RunError> {
        let team = self.inner.agents.get(&request.assistant_id)?;
        if request.queries.iter().all(|q| q.trim().is_empty()) {
            return Err(RunError::InvalidInput("input must contain a non-empty query".into()));
        }

        let (run_id, cell) =
            self.ensure_cell(request.thread_id, request.metadata, IfExists::DoNothing)?;
        tracing::Span::current().record("run_id", run_id.as_str());

        let messages: Vec<Message> = request
            .queries
            .into_iter()
            .filter(|q| !q.trim().is_empty())
            .map(Message::human)
            .collect();
        let (token, segment_start) = {
            let mut run = cell.lock();
            run.begin(&team.selector, team.prompt_policy.clone())?;
            let segment_start = self.inner.history.len(&run_id)?;
            for message in &messages {
                self.inner.history.append(&run_id, message.clone())?;
            }
            (cell.renew_token(), segment_start)
        };

        let (tx, rx) = mpsc::channel(self.inner.stream_buffer);
        let _ = tx.try_send(Envelope::update(&run_id, messages, UpdateStatus::Running));
        tracing::info!(name: "run.started", run_id = %run_id, assistant_id = %team.selector, "run started");

        self.spawn_segment(cell, team, tx, token, segment_start);
        Ok(RunStream::new(&run_id, rx))
    }

    /// Continue a suspended run with `answer`.
    ///
    /// An answer rejected by the pending question's policy yields a single
    /// `interrupt` carrying the amended question; the run stays suspended and
    /// its history is unchanged.
    #[instrument(skip(self, answer))]
    pub fn resume(&self, run_id: &str, answer: &str) -> Result<RunStream, RunError> {
        let cell = match self.inner.registry.lookup(run_id) {
            Ok(cell) => cell,
            Err(not_found) => {
                return Err(match self.cell(run_id) {
                    Some(cell) => RunError::InvalidState {
                        run_id: run_id.to_string(),
                        state: cell.state(),
                    },
                    None => not_found,
                });
            }
        };

        let selector = cell.lock().selector().unwrap_or_default().to_string();
        let team = self.inner.agents.get(&selector)?;
        let (tx, rx) = mpsc::channel(self.inner.stream_buffer);

        let accepted = {
            let mut run = cell.lock();
            let Some(pending) = run.pending().cloned() else {
                return Err(RunError::InvalidState {
                    run_id: run_id.to_string(),
                    state: run.state(),
                });
            };

            match pending.policy.validate(answer) {
                Err(reason) => {
                    let pending = run.reprompt(&reason)?;
                    tracing::info!(
                        name: "run.reprompted",
                        run_id = %run_id,
                        rejections = pending.rejections,
                        "answer rejected"
                    );
                    let _ = tx.try_send(interrupt_envelope(run_id, pending, Some(answer)));
                    self.inner.registry.touch(run_id);
                    None
                }
                Ok(accepted) => {
                    run.resume()?;
                    let message = Message::human(accepted);
                    match self.inner.history.append(run_id, message.clone()) {
                        Ok(segment_start) => Some((message, segment_start, cell.renew_token())),
                        Err(err) => {
                            run.fail(err.to_string(), err.code());
                            self.inner.registry.release(run_id);
                            return Err(err);
                        }
                    }
                }
            }
        };

        if let Some((message, segment_start, token)) = accepted {
            tracing::info!(name: "run.resumed", run_id = %run_id, "run resumed");
            let _ = tx.try_send(Envelope::update(run_id, vec![message], UpdateStatus::Running));
            self.spawn_segment(cell, team, tx, token, segment_start);
        }
        Ok(RunStream::new(run_id, rx))
    }

    /// Drain `stream` and return the run's state once the segment ends.
    pub async fn wait(&self, mut stream: RunStream) -> Result<RunSnapshot, RunError> {
        while let Some(envelope) = stream.next().await {
            if envelope.is_terminal() {
                break;
            }
        }
        self.snapshot(stream.run_id())
    }

    /// Cancel a non-terminal run. Its active segment, if any, stops at the
    /// next await point and the run is failed.
    #[instrument(skip(self))]
    pub fn cancel(&self, run_id: &str) -> Result<RunSnapshot, RunError> {
        let cell = self
            .cell(run_id)
            .ok_or_else(|| RunError::NotFound(run_id.to_string()))?;
        {
            let mut run = cell.lock();
            if run.state().is_terminal() {
                return Err(RunError::InvalidState {
                    run_id: run_id.to_string(),
                    state: run.state(),
                });
            }
            run.fail("run cancelled", CANCELLED_CODE);
            cell.cancel_segment();
            self.inner.registry.release(run_id);
        }
        tracing::info!(name: "run.cancelled", run_id = %run_id, "run cancelled");
        self.snapshot_of(run_id, &cell, 0)
    }

    /// Fail a run from outside the driver, e.g. when its stream could not be
    /// encoded. `code` is what an active segment reports in its `error`.
    /// Returns `false` if the run is unknown or already terminal.
    pub fn fail(&self, run_id: &str, reason: &str, code: &str) -> bool {
        let Some(cell) = self.cell(run_id) else {
            return false;
        };
        let failed = {
            let mut run = cell.lock();
            let failed = run.fail(reason, code);
            cell.cancel_segment();
            failed
        };
        self.inner.registry.release(run_id);
        if failed {
            tracing::warn!(name: "run.failed", run_id = %run_id, error = %reason, "run failed");
        }
        failed
    }

    /// Current state and full history of a run.
    pub fn snapshot(&self, run_id: &str) -> Result<RunSnapshot, RunError> {
        self.snapshot_since(run_id, 0)
    }

    /// Current state and the history appended at or after `since`.
    pub fn snapshot_since(&self, run_id: &str, since: usize) -> Result<RunSnapshot, RunError> {
        let cell = self
            .cell(run_id)
            .ok_or_else(|| RunError::NotFound(run_id.to_string()))?;
        self.snapshot_of(run_id, &cell, since)
    }

    /// Reclaim runs nobody is using. Returns the number of runs evicted.
    ///
    /// - suspended runs idle past the timeout are failed
    /// - running segments with no turn for as long are failed and cancelled
    /// - threads created but never started are dropped after the timeout
    /// - terminal runs are dropped once settled for as long
    pub fn evict_idle(&self) -> usize {
        let idle = self.inner.idle_timeout;
        let mut evicted = 0;

        for run_id in self.inner.registry.idle_entries(idle) {
            let Ok(cell) = self.inner.registry.lookup(&run_id) else {
                continue;
            };
            let mut run = cell.lock();
            if run.state() == RunState::Suspended {
                run.fail(
                    format!("evicted after {}s without an answer", idle.as_secs()),
                    IDLE_TIMEOUT_CODE,
                );
                evicted += 1;
                tracing::info!(name: "run.evicted", run_id = %run_id, "suspended run evicted");
            }
            if run.state().is_terminal() {
                self.inner.registry.release(&run_id);
            }
        }

        let mut expired = Vec::new();
        {
            let runs = self.inner.runs.read().unwrap_or_else(PoisonError::into_inner);
            for (run_id, cell) in runs.iter() {
                let mut run = cell.lock();
                match run.state() {
                    RunState::Created if run.active_at().elapsed() >= idle => {
                        expired.push(run_id.clone());
                        evicted += 1;
                    }
                    RunState::Running if run.active_at().elapsed() >= idle => {
                        run.fail(
                            format!("evicted after {}s without progress", idle.as_secs()),
                            IDLE_TIMEOUT_CODE,
                        );
                        cell.cancel_segment();
                        evicted += 1;
                        tracing::warn!(name: "run.evicted", run_id = %run_id, "stalled run evicted");
                    }
                    state if state.is_terminal()
                        && run.settled_at().is_some_and(|at| at.elapsed() >= idle) =>
                    {
                        expired.push(run_id.clone());
                    }
                    _ => {}
                }
            }
        }
        if !expired.is_empty() {
            let mut runs = self.inner.runs.write().unwrap_or_else(PoisonError::into_inner);
            for run_id in &expired {
                runs.remove(run_id);
                self.inner.history.remove(run_id);
            }
            tracing::debug!(dropped = expired.len(), "idle runs dropped");
        }

        evicted
    }

    /// Run [`evict_idle`](Self::evict_idle) every `every` until `shutdown`.
    pub fn spawn_sweeper(&self, every: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        this.evict_idle();
                    }
                }
            }
        })
    }

    fn cell(&self, run_id: &str) -> Option<Arc<RunCell>> {
        self.inner
            .runs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(run_id)
            .cloned()
    }

    fn ensure_cell(
        &self,
        thread_id: Option<String>,
        metadata: serde_json::Value,
        if_exists: IfExists,
    ) -> Result<(String, Arc<RunCell>), RunError> {
        let run_id = thread_id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let mut runs = self.inner.runs.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = runs.get(&run_id) {
            return match if_exists {
                IfExists::Raise => Err(RunError::ThreadExists(run_id)),
                IfExists::DoNothing => Ok((run_id, Arc::clone(existing))),
            };
        }

        let cell = Arc::new(RunCell::new(Run::new(&run_id, metadata)));
        self.inner.history.create(&run_id);
        runs.insert(run_id.clone(), Arc::clone(&cell));
        Ok((run_id, cell))
    }

    fn snapshot_of(&self, run_id: &str, cell: &RunCell, since: usize) -> Result<RunSnapshot, RunError> {
        let messages = self.inner.history.read_since(run_id, since)?;
        Ok(cell.lock().snapshot(messages))
    }

    fn spawn_segment(
        &self,
        cell: Arc<RunCell>,
        team: Team,
        tx: mpsc::Sender<Envelope>,
        token: CancellationToken,
        segment_start: usize,
    ) {
        let this = self.clone();
        let run_id = cell.lock().run_id().to_string();
        let span = tracing::info_span!("run_segment", run_id = %run_id, assistant_id = %team.selector);
        tokio::spawn(
            async move {
                this.drive(&run_id, &cell, &team, &tx, &token, segment_start)
                    .await;
            }
            .instrument(span),
        );
    }

    async fn drive(
        &self,
        run_id: &str,
        cell: &Arc<RunCell>,
        team: &Team,
        tx: &mpsc::Sender<Envelope>,
        token: &CancellationToken,
        segment_start: usize,
    ) {
        let mut primary_turn = true;

        loop {
            if cell.state() != RunState::Running {
                self.aborted(run_id, cell, tx).await;
                return;
            }

            let (agent, role) = match (&team.counterpart, primary_turn) {
                (Some(counterpart), false) => (Arc::clone(counterpart), Role::CounterpartAgent),
                _ => (Arc::clone(&team.primary), Role::SystemAgent),
            };

            let history = match self.inner.history.read(run_id) {
                Ok(history) => history,
                Err(err) => {
                    self.failed(run_id, cell, &err.to_string(), err.code(), tx).await;
                    return;
                }
            };

            let outcome = tokio::select! {
                biased;
                () = token.cancelled() => {
                    self.aborted(run_id, cell, tx).await;
                    return;
                }
                outcome = AssertUnwindSafe(agent.take_turn(&history)).catch_unwind() => {
                    outcome.unwrap_or_else(|payload| {
                        TurnOutcome::Failure(AgentFailure::new(format!(
                            "agent panicked: {}",
                            panic_message(&*payload)
                        )))
                    })
                }
            };

            match outcome {
                TurnOutcome::Message(reply) => {
                    let message =
                        Message::agent(role, agent.name(), reply.content).with_usage(reply.usage);
                    let step = {
                        let mut run = cell.lock();
                        if run.state() == RunState::Running {
                            run.record_turn();
                            Some(self.inner.history.append(run_id, message.clone()).map(|_| {
                                let limit_reached = run.turns() >= self.inner.max_turns;
                                if limit_reached {
                                    tracing::info!(max_turns = self.inner.max_turns, "turn limit reached");
                                }
                                let done = limit_reached
                                    || team.counterpart.is_none()
                                    || self
                                        .inner
                                        .history
                                        .read_since(run_id, segment_start)
                                        .unwrap_or_default()
                                        .iter()
                                        .any(|m| team.is_termination(m));
                                done && run.complete().is_ok()
                            }))
                        } else {
                            None
                        }
                    };

                    match step {
                        None => {
                            self.aborted(run_id, cell, tx).await;
                            return;
                        }
                        Some(Err(err)) => {
                            self.failed(run_id, cell, &err.to_string(), err.code(), tx).await;
                            return;
                        }
                        Some(Ok(true)) => {
                            self.completed(run_id, cell, vec![message], tx).await;
                            return;
                        }
                        Some(Ok(false)) => {
                            emit(tx, Envelope::update(run_id, vec![message], UpdateStatus::Running))
                                .await;
                            primary_turn = !primary_turn;
                        }
                    }
                }
                TurnOutcome::NeedsHumanInput(request) => {
                    self.suspended(run_id, cell, &history, request, tx).await;
                    return;
                }
                TurnOutcome::Failure(failure) => {
                    let err = RunError::AgentFailure {
                        run_id: run_id.to_string(),
                        agent: agent.name().to_string(),
                        message: failure.message,
                    };
                    self.failed(run_id, cell, &err.to_string(), err.code(), tx).await;
                    return;
                }
            }
        }
    }

    async fn suspended(
        &self,
        run_id: &str,
        cell: &Arc<RunCell>,
        history: &[Message],
        request: HumanInputRequest,
        tx: &mpsc::Sender<Envelope>,
    ) {
        let outcome = {
            let mut run = cell.lock();
            if run.state() == RunState::Running {
                run.record_turn();
                let question = run
                    .prompt_policy()
                    .render(history, request.prompt.as_deref());
                let pending = PendingQuestion::new(question, request.policy);
                let envelope = interrupt_envelope(run_id, &pending, None);
                Some(run.suspend(pending).map(|()| {
                    self.inner.registry.register(run_id, cell);
                    envelope
                }))
            } else {
                None
            }
        };

        match outcome {
            None => self.aborted(run_id, cell, tx).await,
            Some(Err(err)) => self.failed(run_id, cell, &err.to_string(), err.code(), tx).await,
            Some(Ok(envelope)) => {
                tracing::info!(name: "run.suspended", run_id = %run_id, "run suspended");
                emit(tx, envelope).await;
            }
        }
    }

    async fn completed(
        &self,
        run_id: &str,
        cell: &RunCell,
        messages: Vec<Message>,
        tx: &mpsc::Sender<Envelope>,
    ) {
        self.inner.registry.release(run_id);
        let turns = cell.lock().turns();
        tracing::info!(name: "run.completed", run_id = %run_id, turns, "run completed");
        emit(tx, Envelope::update(run_id, messages, UpdateStatus::Completed)).await;
    }

    async fn failed(
        &self,
        run_id: &str,
        cell: &RunCell,
        message: &str,
        code: &str,
        tx: &mpsc::Sender<Envelope>,
    ) {
        let failed = cell.lock().fail(message, code);
        self.inner.registry.release(run_id);
        if failed {
            tracing::warn!(name: "run.failed", run_id = %run_id, error = %message, "run failed");
        }
        emit(tx, Envelope::error(run_id, message, Some(code))).await;
    }

    /// The run was failed from outside while this segment was active.
    async fn aborted(&self, run_id: &str, cell: &RunCell, tx: &mpsc::Sender<Envelope>) {
        let (reason, code) = {
            let run = cell.lock();
            (
                run.failure().unwrap_or("run cancelled").to_string(),
                run.failure_code().unwrap_or(CANCELLED_CODE).to_string(),
            )
        };
        self.inner.registry.release(run_id);
        emit(tx, Envelope::error(run_id, reason, Some(code.as_str()))).await;
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

fn interrupt_envelope(run_id: &str, pending: &PendingQuestion, rejected: Option<&str>) -> Envelope {
    Envelope::Interrupt(InterruptData {
        run_id: run_id.to_string(),
        question: pending.question.clone(),
        choices: pending.policy.choices().to_vec(),
        rejected_answer: rejected.map(ToString::to_string),
        emitted_at: chrono::Utc::now(),
    })
}

async fn emit(tx: &mpsc::Sender<Envelope>, envelope: Envelope) {
    if tx.send(envelope).await.is_err() {
        tracing::debug!("stream receiver dropped");
    }
}
