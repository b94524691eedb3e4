//! Handler seam: the shared interface every intent handler implements, the
//! context it runs with and the result it reports back.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::config::StudioConfig;
use crate::graph::{ContentUnit, ExecutionPlan};
use crate::intent::{Intent, IntentKind};
use crate::llm::{Completion, CompletionRequest, LlmClient};
use crate::session::SessionSnapshot;
use crate::state::ProjectStore;
use crate::tools::ToolRegistry;

/// Phase hint reported by a handler
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PhaseOutcome {
    /// The current phase finished its work; run the autonomy gate
    Completed { produced: bool },
    /// Move to the named phase, or the next one
    Advance(Option<String>),
}

#[derive(Debug, Clone, Default)]
pub struct HandlerResult {
    pub output: String,
    pub produced_unit: Option<ContentUnit>,
    pub phase: Option<PhaseOutcome>,
    pub waiting_for_human: bool,
    /// `output` is a scripted question of the current phase
    pub asks_question: bool,
    /// Units were changed outside the handler context (structural tools)
    pub reload_units: bool,
}

impl HandlerResult {
    pub fn reply(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            ..Self::default()
        }
    }

    pub fn with_unit(mut self, unit: ContentUnit) -> Self {
        self.produced_unit = Some(unit);
        self
    }

    pub fn completing_phase(mut self, produced: bool) -> Self {
        self.phase = Some(PhaseOutcome::Completed { produced });
        self
    }

    pub fn advancing(mut self, target: Option<String>) -> Self {
        self.phase = Some(PhaseOutcome::Advance(target));
        self
    }

    /// Output is a question for the human; the turn suspends
    pub fn asking(mut self) -> Self {
        self.asks_question = true;
        self.waiting_for_human = true;
        self
    }

    pub fn waiting(mut self) -> Self {
        self.waiting_for_human = true;
        self
    }

    pub fn reloading(mut self) -> Self {
        self.reload_units = true;
        self
    }
}

/// Collaborators and channels available to a running handler.
///
/// Cheap to clone so generation tasks can own a copy.
#[derive(Clone)]
pub struct HandlerContext {
    /// The user's message for this turn
    pub message: String,
    pub projects: Arc<dyn ProjectStore>,
    pub llm: Arc<dyn LlmClient>,
    pub tools: Arc<ToolRegistry>,
    pub config: Arc<StudioConfig>,
    /// Batches to generate, set for intents that need a generation plan
    pub plan: Option<Arc<ExecutionPlan>>,
    tokens: mpsc::UnboundedSender<String>,
    commits: mpsc::UnboundedSender<ContentUnit>,
}

impl HandlerContext {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        message: &str,
        projects: Arc<dyn ProjectStore>,
        llm: Arc<dyn LlmClient>,
        tools: Arc<ToolRegistry>,
        config: Arc<StudioConfig>,
        plan: Option<ExecutionPlan>,
        tokens: mpsc::UnboundedSender<String>,
        commits: mpsc::UnboundedSender<ContentUnit>,
    ) -> Self {
        Self {
            message: message.to_string(),
            projects,
            llm,
            tools,
            config,
            plan: plan.map(Arc::new),
            tokens,
            commits,
        }
    }

    /// Forward a chunk of output to the caller
    pub fn token(&self, text: &str) {
        if !text.is_empty() {
            let _ = self.tokens.send(text.to_string());
        }
    }

    /// Model call whose reply is streamed to the caller as it arrives
    pub async fn stream(&self, request: &CompletionRequest) -> Result<Completion> {
        self.llm.stream(request, &self.tokens).await
    }

    /// Atomically persist one unit and report the commit to the dispatcher
    pub async fn commit(&self, unit: &ContentUnit) -> Result<()> {
        self.projects
            .save_unit(unit)
            .await
            .with_context(|| format!("Failed to save unit '{}'", unit.name))?;
        let _ = self.commits.send(unit.clone());
        Ok(())
    }

    /// Replace a unit's content, snapshotting non-empty previous content first.
    /// The caller commits.
    pub async fn overwrite(&self, unit: &mut ContentUnit, content: String, source: &str) -> Result<()> {
        if !unit.content.trim().is_empty() && unit.content != content {
            self.projects
                .snapshot_before_overwrite(&unit.id, &unit.content, source)
                .await
                .with_context(|| format!("Failed to snapshot unit '{}'", unit.name))?;
        }
        unit.content = content;
        unit.touch();
        Ok(())
    }
}

/// Runs one intent kind
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(
        &self,
        intent: &Intent,
        session: &SessionSnapshot,
        ctx: &HandlerContext,
    ) -> Result<HandlerResult>;
}

/// Kind-to-handler map with one default arm
#[derive(Clone)]
pub struct DispatchTable {
    entries: HashMap<IntentKind, Arc<dyn Handler>>,
    default: Arc<dyn Handler>,
}

impl DispatchTable {
    /// Empty table; every kind falls through to `default`
    pub fn new(default: Arc<dyn Handler>) -> Self {
        Self {
            entries: HashMap::new(),
            default,
        }
    }

    pub fn with(mut self, kind: IntentKind, handler: Arc<dyn Handler>) -> Self {
        self.insert(kind, handler);
        self
    }

    pub fn insert(&mut self, kind: IntentKind, handler: Arc<dyn Handler>) {
        self.entries.insert(kind, handler);
    }

    pub fn handler_for(&self, kind: IntentKind) -> Arc<dyn Handler> {
        match self.entries.get(&kind) {
            Some(handler) => handler.clone(),
            None => {
                tracing::debug!(intent_kind = %kind, "No handler registered, using default");
                self.default.clone()
            }
        }
    }

    pub fn has_entry(&self, kind: IntentKind) -> bool {
        self.entries.contains_key(&kind)
    }
}
