//! # Transport Types
//!
//! Request and response shapes exchanged with whatever transport embeds the
//! core (HTTP, CLI, desktop shell).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::CoreError;
use crate::graph::ContentUnit;
use crate::intent::{Intent, IntentKind};
use crate::phase::{PhaseStateMachine, PhaseStatus};
use crate::session::SessionKey;

fn default_conversation() -> String {
    "main".to_string()
}

/// One user turn
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnRequest {
    pub project_id: String,
    #[serde(default = "default_conversation")]
    pub conversation_id: String,
    pub message: String,
    /// Phase the caller believes is current. Stored state wins; a name outside
    /// the phase order is rejected.
    #[serde(default)]
    pub current_phase: Option<String>,
    /// Unit names attached by the UI in addition to `@Name` mentions
    #[serde(default)]
    pub references: Vec<String>,
}

impl TurnRequest {
    pub fn new(project_id: &str, message: &str) -> Self {
        Self {
            project_id: project_id.to_string(),
            conversation_id: default_conversation(),
            message: message.to_string(),
            current_phase: None,
            references: Vec::new(),
        }
    }

    pub fn in_conversation(mut self, conversation_id: &str) -> Self {
        self.conversation_id = conversation_id.to_string();
        self
    }

    pub fn with_phase(mut self, phase: &str) -> Self {
        self.current_phase = Some(phase.to_string());
        self
    }

    pub fn with_references<I, S>(mut self, references: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.references = references.into_iter().map(Into::into).collect();
        self
    }

    pub fn key(&self) -> SessionKey {
        SessionKey::new(&self.project_id, &self.conversation_id)
    }
}

/// Structured error carried in a response so a UI can offer a scoped retry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorObject {
    pub code: String,
    pub message: String,
    pub phase: Option<String>,
    pub intent_kind: Option<IntentKind>,
    pub retryable: bool,
}

impl ErrorObject {
    pub fn new(err: &CoreError, phase: Option<&str>, intent_kind: Option<IntentKind>) -> Self {
        Self {
            code: err.code().to_string(),
            message: err.to_string(),
            phase: phase.map(str::to_string),
            intent_kind,
            retryable: err.is_retryable(),
        }
    }
}

/// Outcome of one turn
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TurnResponse {
    pub phase: Option<String>,
    pub phase_status: BTreeMap<String, PhaseStatus>,
    pub waiting_for_human: bool,
    pub output: String,
    #[serde(default)]
    pub produced_unit: Option<ContentUnit>,
    #[serde(default)]
    pub error: Option<ErrorObject>,
    /// Kinds of the intents that ran, in order
    #[serde(default)]
    pub executed: Vec<IntentKind>,
    /// Queued intents that were dropped without running: the turn waited for
    /// a human, failed, or hit `max_intents_per_turn`
    #[serde(default)]
    pub discarded: Vec<Intent>,
}

impl TurnResponse {
    pub(crate) fn from_phases(phases: &PhaseStateMachine) -> Self {
        Self {
            phase: phases.current().map(str::to_string),
            phase_status: phases.statuses().clone(),
            ..Self::default()
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    pub fn error_code(&self) -> Option<&str> {
        self.error.as_ref().map(|e| e.code.as_str())
    }
}
