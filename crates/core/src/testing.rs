//! Test doubles shared by unit tests across the crate.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::config::StudioConfig;
use crate::dispatch::{Dispatcher, HandlerContext};
use crate::graph::{ContentUnit, ContentUnitGraph, ExecutionPlan};
use crate::llm::{Completion, CompletionRequest, LlmClient};
use crate::phase::PhaseStateMachine;
use crate::session::{SessionKey, SessionSnapshot};
use crate::state::{InMemoryProjectStore, InMemorySessionStore};
use crate::tools::ToolRegistry;

enum Scripted {
    Reply(String),
    Fail(String),
}

/// LLM double replaying scripted answers in order.
///
/// Replies registered for a purpose ("classifier", "generate", ...) are used
/// first; then the shared queue; then a plain "ok".
#[derive(Default)]
pub(crate) struct ScriptedLlm {
    queue: Mutex<VecDeque<Scripted>>,
    by_purpose: Mutex<HashMap<String, VecDeque<Scripted>>>,
    calls: Mutex<Vec<CompletionRequest>>,
    delay: Option<Duration>,
}

impl ScriptedLlm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reply(self, text: &str) -> Self {
        self.queue
            .lock()
            .unwrap()
            .push_back(Scripted::Reply(text.to_string()));
        self
    }

    pub fn fail(self, message: &str) -> Self {
        self.queue
            .lock()
            .unwrap()
            .push_back(Scripted::Fail(message.to_string()));
        self
    }

    pub fn reply_for(self, purpose: &str, text: &str) -> Self {
        self.by_purpose
            .lock()
            .unwrap()
            .entry(purpose.to_string())
            .or_default()
            .push_back(Scripted::Reply(text.to_string()));
        self
    }

    pub fn fail_for(self, purpose: &str, message: &str) -> Self {
        self.by_purpose
            .lock()
            .unwrap()
            .entry(purpose.to_string())
            .or_default()
            .push_back(Scripted::Fail(message.to_string()));
        self
    }

    /// Delay before every reply, and between streamed chunks
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn calls(&self) -> Vec<CompletionRequest> {
        self.calls.lock().unwrap().clone()
    }

    pub fn purposes(&self) -> Vec<String> {
        self.calls().into_iter().map(|c| c.purpose).collect()
    }

    fn next(&self, request: &CompletionRequest) -> Scripted {
        self.calls.lock().unwrap().push(request.clone());
        let scripted = self
            .by_purpose
            .lock()
            .unwrap()
            .get_mut(&request.purpose)
            .and_then(VecDeque::pop_front);
        scripted
            .or_else(|| self.queue.lock().unwrap().pop_front())
            .unwrap_or_else(|| Scripted::Reply("ok".to_string()))
    }
}

#[async_trait]
impl LlmClient for ScriptedLlm {
    async fn complete(&self, request: &CompletionRequest) -> anyhow::Result<Completion> {
        let scripted = self.next(request);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        match scripted {
            Scripted::Reply(text) => Ok(Completion::text(text)),
            Scripted::Fail(message) => Err(anyhow::anyhow!(message)),
        }
    }

    async fn stream(
        &self,
        request: &CompletionRequest,
        sink: &mpsc::UnboundedSender<String>,
    ) -> anyhow::Result<Completion> {
        let text = match self.next(request) {
            Scripted::Reply(text) => text,
            Scripted::Fail(message) => return Err(anyhow::anyhow!(message)),
        };
        for chunk in text.split_inclusive(' ') {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            let _ = sink.send(chunk.to_string());
        }
        Ok(Completion::text(text))
    }
}

pub(crate) fn snapshot(phases: &[&str], units: Vec<ContentUnit>) -> SessionSnapshot {
    SessionSnapshot {
        key: SessionKey::new("p1", "main"),
        phases: PhaseStateMachine::new(phases.iter().copied()),
        units: ContentUnitGraph::new("p1", units),
        transcript: Vec::new(),
    }
}

/// Handler context plus the receiving ends of its channels
pub(crate) struct Harness {
    pub ctx: HandlerContext,
    pub tokens: mpsc::UnboundedReceiver<String>,
    pub commits: mpsc::UnboundedReceiver<ContentUnit>,
}

impl Harness {
    pub fn new(
        projects: Arc<InMemoryProjectStore>,
        llm: Arc<ScriptedLlm>,
        plan: Option<ExecutionPlan>,
    ) -> Self {
        Self::with_tools(projects, llm, plan, ToolRegistry::new())
    }

    pub fn with_tools(
        projects: Arc<InMemoryProjectStore>,
        llm: Arc<ScriptedLlm>,
        plan: Option<ExecutionPlan>,
        tools: ToolRegistry,
    ) -> Self {
        let (token_tx, tokens) = mpsc::unbounded_channel();
        let (commit_tx, commits) = mpsc::unbounded_channel();
        let ctx = HandlerContext::new(
            "test message",
            projects,
            llm,
            Arc::new(tools),
            Arc::new(StudioConfig::default()),
            plan,
            token_tx,
            commit_tx,
        );
        Self {
            ctx,
            tokens,
            commits,
        }
    }

    pub fn drain_commits(&mut self) -> Vec<ContentUnit> {
        let mut units = Vec::new();
        while let Ok(unit) = self.commits.try_recv() {
            units.push(unit);
        }
        units
    }

    pub fn drain_tokens(&mut self) -> String {
        let mut text = String::new();
        while let Ok(chunk) = self.tokens.try_recv() {
            text.push_str(&chunk);
        }
        text
    }
}

/// Config with a short phase list and quick timeouts
pub(crate) fn test_config() -> StudioConfig {
    StudioConfig {
        phase_order: vec!["brief".to_string(), "outline".to_string(), "draft".to_string()],
        handler_timeout_secs: 5,
        classifier_timeout_secs: 5,
        ..StudioConfig::default()
    }
}

pub(crate) struct Fixture {
    pub dispatcher: Dispatcher,
    pub llm: Arc<ScriptedLlm>,
    pub projects: Arc<InMemoryProjectStore>,
    pub sessions: Arc<InMemorySessionStore>,
}

pub(crate) fn fixture(config: StudioConfig, llm: ScriptedLlm, units: Vec<ContentUnit>) -> Fixture {
    let llm = Arc::new(llm);
    let projects = Arc::new(InMemoryProjectStore::with_units("p1", units));
    let sessions = Arc::new(InMemorySessionStore::new());
    let dispatcher = Dispatcher::new(config, llm.clone(), projects.clone(), sessions.clone());
    Fixture {
        dispatcher,
        llm,
        projects,
        sessions,
    }
}
