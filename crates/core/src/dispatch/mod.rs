//! # Execution Dispatcher
//!
//! Runs one turn: classify the utterance, then execute the intents strictly
//! in order, one at a time, until the queue drains, a handler waits for a
//! human, or something fails.
//!
//! ## Architecture
//!
//! ```text
//! TurnRequest ─> IntentClassifier ─> [active, ...queue]
//!                                       │
//!        ┌──────────────────────────────┘
//!        ▼
//!   generate? ─> plan_generation (resolver + preconditions)
//!        │
//!        ▼
//!   DispatchTable[kind] ──handle──> HandlerResult
//!        │   tokens / commits ─> TurnEvent stream, graph snapshot
//!        │   cancel / timeout ─> SalvageHook
//!        ▼
//!   PhaseStateMachine (autonomy gate) ─> checkpoint ─> next intent
//! ```

pub mod events;
pub mod handler;
pub mod plan;
pub mod salvage;

#[cfg(test)]
mod tests;

pub use events::{TurnEvent, TurnEventKind};
pub use handler::{DispatchTable, Handler, HandlerContext, HandlerResult, PhaseOutcome};
pub use plan::{plan_generation, GenerationPlan};
pub use salvage::{CommitPartialContent, PartialOutput, SalvageHook};

use chrono::Utc;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::StudioConfig;
use crate::error::{CoreError, CoreResult};
use crate::graph::{ContentUnit, ContentUnitGraph};
use crate::handlers;
use crate::intent::{Intent, IntentClassifier, IntentKind, TargetStrategy};
use crate::llm::LlmClient;
use crate::phase::{NextPhase, PhaseStateMachine};
use crate::session::{SessionKey, SessionSnapshot, TranscriptEntry, TurnCheckpoint};
use crate::state::{ProjectStore, SessionStore};
use crate::tools::ToolRegistry;
use crate::transport::{ErrorObject, TurnRequest, TurnResponse};

/// Event sink for one turn; silent for non-streaming callers
struct Emitter {
    tx: Option<mpsc::Sender<TurnEvent>>,
    seq: AtomicUsize,
}

impl Emitter {
    fn silent() -> Self {
        Self {
            tx: None,
            seq: AtomicUsize::new(0),
        }
    }

    fn to(tx: mpsc::Sender<TurnEvent>) -> Self {
        Self {
            tx: Some(tx),
            seq: AtomicUsize::new(0),
        }
    }

    async fn emit(&self, mut event: TurnEvent) {
        if let Some(tx) = &self.tx {
            event.seq = self.seq.fetch_add(1, Ordering::SeqCst);
            let _ = tx.send(event).await;
        }
    }

    /// Resolves when a streaming caller drops its receiver
    async fn closed(&self) {
        match &self.tx {
            Some(tx) => tx.closed().await,
            None => std::future::pending::<()>().await,
        }
    }
}

enum Start {
    Fresh(TurnRequest),
    Resume(SessionKey),
}

/// Mutable state of the turn in progress
struct Turn {
    session: SessionSnapshot,
    checkpoint: TurnCheckpoint,
    queue: VecDeque<Intent>,
    outputs: Vec<String>,
    produced_unit: Option<ContentUnit>,
    executed: Vec<IntentKind>,
    discarded: Vec<Intent>,
    waiting: bool,
}

impl Turn {
    fn new(session: SessionSnapshot, checkpoint: TurnCheckpoint) -> Self {
        Self {
            queue: checkpoint.pending.iter().cloned().collect(),
            session,
            checkpoint,
            outputs: Vec::new(),
            produced_unit: None,
            executed: Vec::new(),
            discarded: Vec::new(),
            waiting: false,
        }
    }

    fn record_commit(&mut self, unit: &ContentUnit) {
        if !self.checkpoint.committed_units.contains(&unit.id) {
            self.checkpoint.committed_units.push(unit.id.clone());
        }
        self.session.units.upsert(unit.clone());
    }

    /// Drop everything still queued, keeping a record for the response
    fn discard_queue(&mut self) {
        self.discarded.extend(self.queue.drain(..));
    }

    fn enqueue_phase(&mut self, next: NextPhase) {
        if let NextPhase::Phase(phase) = next {
            let position = self.executed.len() + self.queue.len();
            self.queue.push_back(
                Intent::new(IntentKind::PhaseContinue)
                    .with_operation(format!("Begin the {} phase.", phase))
                    .at(position),
            );
        }
    }

    fn response(&self) -> TurnResponse {
        let mut response = TurnResponse::from_phases(&self.session.phases);
        response.waiting_for_human = self.waiting;
        response.output = self.outputs.join("\n\n");
        response.produced_unit = self.produced_unit.clone();
        response.executed = self.executed.clone();
        response.discarded = self.discarded.clone();
        response
    }
}

/// Whether a failed turn should stay resumable
fn keeps_checkpoint(err: &CoreError) -> bool {
    err.is_retryable() || matches!(err, CoreError::Cancelled | CoreError::Persistence(_))
}

/// Errors a handler raised as `CoreError` keep their own code
fn handler_error(kind: IntentKind, err: anyhow::Error) -> CoreError {
    match err.downcast::<CoreError>() {
        Ok(core) => core,
        Err(err) => CoreError::handler(kind, err),
    }
}

pub struct Dispatcher {
    config: Arc<StudioConfig>,
    llm: Arc<dyn LlmClient>,
    projects: Arc<dyn ProjectStore>,
    sessions: Arc<dyn SessionStore>,
    tools: Arc<ToolRegistry>,
    classifier: IntentClassifier,
    table: DispatchTable,
    salvage: Arc<dyn SalvageHook>,
}

impl Dispatcher {
    /// Dispatcher with the standard handler table, no tools and the default
    /// salvage hook
    pub fn new(
        config: StudioConfig,
        llm: Arc<dyn LlmClient>,
        projects: Arc<dyn ProjectStore>,
        sessions: Arc<dyn SessionStore>,
    ) -> Self {
        let classifier = IntentClassifier::new(llm.clone(), config.vocabulary.clone())
            .with_timeout(config.classifier_timeout());
        Self {
            config: Arc::new(config),
            llm,
            projects,
            sessions,
            tools: Arc::new(ToolRegistry::new()),
            classifier,
            table: handlers::standard_table(),
            salvage: Arc::new(CommitPartialContent),
        }
    }

    pub fn with_tools(mut self, tools: ToolRegistry) -> Self {
        self.tools = Arc::new(tools);
        self
    }

    /// Replace the handler for one intent kind
    pub fn with_handler(mut self, kind: IntentKind, handler: Arc<dyn Handler>) -> Self {
        self.table.insert(kind, handler);
        self
    }

    pub fn with_target_strategy(mut self, strategy: Arc<dyn TargetStrategy>) -> Self {
        self.classifier = self.classifier.with_strategy(strategy);
        self
    }

    pub fn with_salvage_hook(mut self, hook: Arc<dyn SalvageHook>) -> Self {
        self.salvage = hook;
        self
    }

    pub fn config(&self) -> &StudioConfig {
        &self.config
    }

    /// Stored phase progress merged onto the configured phase order
    pub async fn load_phases(&self, project_id: &str) -> CoreResult<PhaseStateMachine> {
        let stored = self
            .projects
            .load_session_state(project_id)
            .await
            .map_err(CoreError::Persistence)?;

        Ok(match stored {
            Some(stored) => {
                let mut autonomy = self.config.autonomy.clone();
                autonomy.extend(stored.autonomy().iter().map(|(p, f)| (p.clone(), *f)));
                PhaseStateMachine::restore(
                    self.config.phase_order.clone(),
                    stored.statuses().clone(),
                    stored.current().map(str::to_string),
                    autonomy,
                )
            }
            None => self.config.initial_phases(),
        })
    }

    /// Read everything a turn needs, once
    pub async fn load_session(&self, key: &SessionKey) -> CoreResult<SessionSnapshot> {
        let units = self
            .projects
            .load_units(&key.project_id)
            .await
            .map_err(CoreError::Persistence)?;
        let transcript = self
            .sessions
            .load_transcript(key)
            .await
            .map_err(CoreError::Persistence)?;

        Ok(SessionSnapshot {
            key: key.clone(),
            phases: self.load_phases(&key.project_id).await?,
            units: ContentUnitGraph::new(&key.project_id, units),
            transcript,
        })
    }

    /// Flip a phase's autonomy flag and persist it
    pub async fn set_autonomy(
        &self,
        project_id: &str,
        phase: &str,
        autonomous: bool,
    ) -> CoreResult<PhaseStateMachine> {
        let mut phases = self.load_phases(project_id).await?;
        if !phases.contains(phase) {
            return Err(CoreError::UnknownPhase(phase.to_string()));
        }
        phases.set_autonomy(phase, autonomous);
        self.projects
            .save_session_state(project_id, &phases)
            .await
            .map_err(CoreError::Persistence)?;
        Ok(phases)
    }

    #[tracing::instrument(skip_all, fields(project_id = %request.project_id, conversation_id = %request.conversation_id))]
    pub async fn run_turn(&self, request: TurnRequest) -> TurnResponse {
        self.drive(Start::Fresh(request), &Emitter::silent(), &CancellationToken::new())
            .await
    }

    /// Like [`Dispatcher::run_turn`], emitting `route`, `token`, `content`,
    /// `done` and `error` events. Cancelling `cancel` or dropping the receiver
    /// stops the turn after salvaging partial output.
    #[tracing::instrument(skip_all, fields(project_id = %request.project_id, conversation_id = %request.conversation_id))]
    pub async fn run_turn_streaming(
        &self,
        request: TurnRequest,
        events: mpsc::Sender<TurnEvent>,
        cancel: CancellationToken,
    ) -> TurnResponse {
        self.drive(Start::Fresh(request), &Emitter::to(events), &cancel)
            .await
    }

    /// Continue a checkpointed turn from its pending intents
    #[tracing::instrument(skip_all, fields(project_id = %key.project_id, conversation_id = %key.conversation_id))]
    pub async fn resume_turn(&self, key: &SessionKey) -> TurnResponse {
        self.drive(
            Start::Resume(key.clone()),
            &Emitter::silent(),
            &CancellationToken::new(),
        )
        .await
    }

    async fn drive(&self, start: Start, emitter: &Emitter, cancel: &CancellationToken) -> TurnResponse {
        let key = match &start {
            Start::Fresh(request) => request.key(),
            Start::Resume(key) => key.clone(),
        };

        let mut session = match self.load_session(&key).await {
            Ok(session) => session,
            Err(e) => return self.finish(TurnResponse::default(), Some((e, None)), emitter).await,
        };

        let checkpoint = match start {
            Start::Fresh(request) => {
                if let Some(phase) = &request.current_phase {
                    if !session.phases.contains(phase) {
                        let err = CoreError::UnknownPhase(phase.clone());
                        let response = TurnResponse::from_phases(&session.phases);
                        return self.finish(response, Some((err, None)), emitter).await;
                    }
                    if session.current_phase() != Some(phase.as_str()) {
                        tracing::debug!(
                            requested = %phase,
                            stored = ?session.current_phase(),
                            "Request phase differs from stored phase, using stored"
                        );
                    }
                }

                let intents = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        let response = TurnResponse::from_phases(&session.phases);
                        return self.finish(response, Some((CoreError::Cancelled, None)), emitter).await;
                    }
                    intents = self.classifier.classify(&request.message, &request.references, &session) => intents,
                };
                tracing::info!(
                    intents = ?intents.iter().map(|i| i.kind.as_str()).collect::<Vec<_>>(),
                    "Classified turn"
                );

                let entry = TranscriptEntry::user(&request.message, session.current_phase());
                if let Err(e) = self.sessions.append_transcript(&key, &entry).await {
                    let response = TurnResponse::from_phases(&session.phases);
                    return self
                        .finish(response, Some((CoreError::Persistence(e), None)), emitter)
                        .await;
                }
                session.transcript.push(entry);

                TurnCheckpoint::new(&request.message, &request.references, intents)
            }
            Start::Resume(_) => match self.sessions.load_checkpoint(&key).await {
                Ok(Some(checkpoint)) => {
                    tracing::info!(pending = checkpoint.pending.len(), "Resuming turn");
                    checkpoint
                }
                Ok(None) => {
                    tracing::info!("No checkpoint to resume");
                    TurnCheckpoint::new("", &[], Vec::new())
                }
                Err(e) => {
                    let response = TurnResponse::from_phases(&session.phases);
                    return self
                        .finish(response, Some((CoreError::Persistence(e), None)), emitter)
                        .await;
                }
            },
        };

        self.execute(Turn::new(session, checkpoint), emitter, cancel)
            .await
    }

    async fn execute(&self, mut turn: Turn, emitter: &Emitter, cancel: &CancellationToken) -> TurnResponse {
        if !turn.queue.is_empty() {
            if let Err(e) = self.save_checkpoint(&mut turn).await {
                return self.finish(turn.response(), Some((e, None)), emitter).await;
            }
        }

        while let Some(intent) = turn.queue.pop_front() {
            if turn.executed.len() >= self.config.max_intents_per_turn {
                turn.queue.push_front(intent);
                tracing::warn!(
                    discarded = turn.queue.len(),
                    "Intent limit reached, discarding remaining intents"
                );
                let kinds: Vec<&str> = turn.queue.iter().map(|i| i.kind.as_str()).collect();
                turn.outputs.push(format!(
                    "Stopped after {} intents; not run: {}.",
                    self.config.max_intents_per_turn,
                    kinds.join(", ")
                ));
                turn.discard_queue();
                break;
            }

            emitter.emit(TurnEvent::route(&intent)).await;

            let outcome = match self.run_intent(&intent, &mut turn, emitter, cancel).await {
                Ok(result) => self.apply(&intent, result, &mut turn).await,
                Err(e) => Err(e),
            };
            if let Err(e) = outcome {
                return self.fail(turn, intent, e, emitter).await;
            }

            if turn.waiting {
                if !turn.queue.is_empty() {
                    tracing::info!(
                        discarded = turn.queue.len(),
                        "Waiting for human, discarding remaining intents"
                    );
                }
                turn.discard_queue();
            }

            if !turn.queue.is_empty() {
                if let Err(e) = self.save_checkpoint(&mut turn).await {
                    return self.finish(turn.response(), Some((e, None)), emitter).await;
                }
            }
        }

        if let Err(e) = self.sessions.clear_checkpoint(&turn.session.key).await {
            tracing::warn!(error = %e, "Failed to clear turn checkpoint");
        }
        self.finish(turn.response(), None, emitter).await
    }

    #[tracing::instrument(skip_all, fields(intent_kind = %intent.kind, target = ?intent.target, position = intent.position))]
    async fn run_intent(
        &self,
        intent: &Intent,
        turn: &mut Turn,
        emitter: &Emitter,
        cancel: &CancellationToken,
    ) -> CoreResult<HandlerResult> {
        let kind = intent.kind;
        if kind == IntentKind::PhaseContinue {
            turn.session.phases.begin();
        }

        let plan = if kind.requires_generation_plan() {
            let planned = plan_generation(intent.target.as_deref(), &turn.session.units)?;
            if let Some(unit) = planned.declared {
                self.projects
                    .save_unit(&unit)
                    .await
                    .map_err(CoreError::Persistence)?;
                turn.session.units.upsert(unit);
            }
            tracing::debug!(
                batches = planned.plan.batches.len(),
                blocked = planned.plan.blocked.len(),
                "Generation planned"
            );
            Some(planned.plan)
        } else {
            None
        };

        let (token_tx, mut token_rx) = mpsc::unbounded_channel::<String>();
        let (commit_tx, mut commit_rx) = mpsc::unbounded_channel::<ContentUnit>();
        let ctx = HandlerContext::new(
            &turn.checkpoint.message,
            self.projects.clone(),
            self.llm.clone(),
            self.tools.clone(),
            self.config.clone(),
            plan,
            token_tx,
            commit_tx,
        );
        let handler = self.table.handler_for(kind);
        let snapshot = turn.session.clone();
        let timeout = self.config.handler_timeout();
        let mut partial = String::new();
        let mut committed: Vec<String> = Vec::new();

        let outcome = {
            let run = handler.handle(intent, &snapshot, &ctx);
            tokio::pin!(run);
            let deadline = tokio::time::sleep(timeout);
            tokio::pin!(deadline);

            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break Err(CoreError::Cancelled),
                    _ = emitter.closed() => break Err(CoreError::Cancelled),
                    Some(text) = token_rx.recv() => {
                        partial.push_str(&text);
                        emitter.emit(TurnEvent::token(kind, &text)).await;
                    }
                    Some(unit) = commit_rx.recv() => {
                        turn.record_commit(&unit);
                        committed.push(unit.id.clone());
                        emitter.emit(content_event(kind, &unit)).await;
                    }
                    result = &mut run => break result.map_err(|e| handler_error(kind, e)),
                    _ = &mut deadline => break Err(CoreError::Timeout { kind, after: timeout }),
                }
            }
        };

        while let Ok(text) = token_rx.try_recv() {
            partial.push_str(&text);
            emitter.emit(TurnEvent::token(kind, &text)).await;
        }
        while let Ok(unit) = commit_rx.try_recv() {
            turn.record_commit(&unit);
            committed.push(unit.id.clone());
            emitter.emit(content_event(kind, &unit)).await;
        }

        if let Err(err @ (CoreError::Cancelled | CoreError::Timeout { .. })) = &outcome {
            tracing::warn!(error = %err, chars = partial.len(), "Intent interrupted, salvaging");
            let partial = PartialOutput {
                intent: intent.clone(),
                text: partial,
                committed_units: committed,
            };
            if let Err(e) = self
                .salvage
                .salvage(&partial, &turn.session, self.projects.as_ref())
                .await
            {
                tracing::error!(error = %e, "Salvage hook failed");
            }
        }

        outcome
    }

    /// Fold a handler result into the turn: graph, phases, transcript
    async fn apply(&self, intent: &Intent, result: HandlerResult, turn: &mut Turn) -> CoreResult<()> {
        let key = turn.session.key.clone();
        turn.executed.push(intent.kind);
        turn.checkpoint.intents_run += 1;

        if result.reload_units {
            let units = self
                .projects
                .load_units(&key.project_id)
                .await
                .map_err(CoreError::Persistence)?;
            turn.session.units.replace_all(units);
        }
        if let Some(unit) = result.produced_unit {
            turn.session.units.upsert(unit.clone());
            turn.produced_unit = Some(unit);
        }

        let phase_before = turn.session.current_phase().map(str::to_string);
        match result.phase {
            Some(PhaseOutcome::Completed { produced }) => {
                let gate = turn.session.phases.complete_phase(produced);
                tracing::info!(phase = ?phase_before, produced, gate = ?gate, "Phase work finished");
                if gate.waiting_for_human() {
                    turn.waiting = true;
                } else if turn.queue.is_empty() && !result.waiting_for_human {
                    let next = turn.session.phases.advance(None)?;
                    turn.enqueue_phase(next);
                }
            }
            Some(PhaseOutcome::Advance(target)) => {
                let next = turn.session.phases.advance(target.as_deref())?;
                if turn.queue.is_empty() {
                    turn.enqueue_phase(next);
                }
            }
            None => {}
        }

        if !result.output.trim().is_empty() {
            let entry = match (&phase_before, result.asks_question) {
                (Some(phase), true) => TranscriptEntry::question(&result.output, phase),
                _ => TranscriptEntry::assistant(&result.output, phase_before.as_deref()),
            };
            self.sessions
                .append_transcript(&key, &entry)
                .await
                .map_err(CoreError::Persistence)?;
            turn.session.transcript.push(entry);
            turn.outputs.push(result.output);
        }

        turn.waiting |= result.waiting_for_human;

        self.projects
            .save_session_state(&key.project_id, &turn.session.phases)
            .await
            .map_err(CoreError::Persistence)
    }

    async fn fail(&self, mut turn: Turn, intent: Intent, err: CoreError, emitter: &Emitter) -> TurnResponse {
        let key = turn.session.key.clone();
        if let Err(e) = self
            .projects
            .save_session_state(&key.project_id, &turn.session.phases)
            .await
        {
            tracing::warn!(error = %e, "Failed to save phase state after error");
        }

        if !turn.queue.is_empty() {
            tracing::info!(
                discarded = turn.queue.len(),
                "Turn stopped, remaining intents not run"
            );
        }

        if keeps_checkpoint(&err) {
            turn.queue.push_front(intent.clone());
            if let Err(e) = self.save_checkpoint(&mut turn).await {
                tracing::warn!(error = %e, "Failed to keep turn checkpoint");
            }
        } else {
            turn.discard_queue();
            if let Err(e) = self.sessions.clear_checkpoint(&key).await {
                tracing::warn!(error = %e, "Failed to clear turn checkpoint");
            }
        }
        self.finish(turn.response(), Some((err, Some(intent.kind))), emitter)
            .await
    }

    async fn save_checkpoint(&self, turn: &mut Turn) -> CoreResult<()> {
        turn.checkpoint.pending = turn.queue.iter().cloned().collect();
        turn.checkpoint.updated_at = Utc::now();
        self.sessions
            .save_checkpoint(&turn.session.key, &turn.checkpoint)
            .await
            .map_err(CoreError::Persistence)
    }

    async fn finish(
        &self,
        mut response: TurnResponse,
        failure: Option<(CoreError, Option<IntentKind>)>,
        emitter: &Emitter,
    ) -> TurnResponse {
        match failure {
            Some((err, kind)) => {
                tracing::error!(code = err.code(), intent_kind = ?kind, error = %err, "Turn failed");
                let error = ErrorObject::new(&err, response.phase.as_deref(), kind);
                let mut event = TurnEvent::new(TurnEventKind::Error)
                    .with_data(serde_json::to_value(&error).unwrap_or_default());
                event.intent_kind = kind;
                emitter.emit(event).await;
                response.error = Some(error);
            }
            None => {
                tracing::info!(
                    executed = response.executed.len(),
                    waiting_for_human = response.waiting_for_human,
                    "Turn complete"
                );
                emitter
                    .emit(
                        TurnEvent::new(TurnEventKind::Done)
                            .with_data(serde_json::to_value(&response).unwrap_or_default()),
                    )
                    .await;
            }
        }
        response
    }
}

fn content_event(kind: IntentKind, unit: &ContentUnit) -> TurnEvent {
    TurnEvent::new(TurnEventKind::Content)
        .for_intent(kind)
        .with_data(serde_json::to_value(unit).unwrap_or_default())
}
