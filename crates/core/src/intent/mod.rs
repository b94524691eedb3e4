//! # Intents
//!
//! Classified user actions. One utterance may decompose into several intents
//! that run strictly in emitted order.
//!
//! ## Architecture
//!
//! ```text
//! utterance ─┬─ decompose (rule-based clause split)
//!            ├─ references (@Name mentions + TargetStrategy)
//!            └─ classifier (precedence chain, LLM fallback)
//!                   ↓
//!            Vec<Intent> → [active, ...PendingIntentQueue]
//! ```

pub mod classifier;
pub mod decompose;
pub mod references;

pub use classifier::{ClassifierVocabulary, IntentClassifier};
pub use decompose::decompose;
pub use references::{KeywordProximity, ReferenceMention, TargetStrategy};

use serde::{Deserialize, Serialize};
use std::fmt;

/// Closed set of intent kinds
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum IntentKind {
    /// Conversational answer, no content changes
    Chat,
    /// Explain or inspect existing content
    Query,
    /// Rewrite existing content
    Modify,
    /// Produce new content for one unit or the whole graph
    Generate,
    /// Structural edit: add, remove or move a unit or phase
    Edit,
    /// Continue the current phase's scripted conversation
    PhaseContinue,
    /// Move to the next (or a named) phase
    AdvancePhase,
    /// Web research tool
    Research,
    /// Persona management tool
    Persona,
    /// Evaluation role-play tool
    Evaluate,
    /// Skill application tool
    Skill,
}

impl IntentKind {
    pub const ALL: [IntentKind; 11] = [
        Self::Chat,
        Self::Query,
        Self::Modify,
        Self::Generate,
        Self::Edit,
        Self::PhaseContinue,
        Self::AdvancePhase,
        Self::Research,
        Self::Persona,
        Self::Evaluate,
        Self::Skill,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Chat => "chat",
            Self::Query => "query",
            Self::Modify => "modify",
            Self::Generate => "generate",
            Self::Edit => "edit",
            Self::PhaseContinue => "phase_continue",
            Self::AdvancePhase => "advance_phase",
            Self::Research => "research",
            Self::Persona => "persona",
            Self::Evaluate => "evaluate",
            Self::Skill => "skill",
        }
    }

    /// Normalize a kind name through the synonym table.
    ///
    /// Unrecognized names map to [`IntentKind::Chat`].
    pub fn normalize(raw: &str) -> Self {
        let key = raw.trim().to_lowercase().replace(['-', ' '], "_");
        match key.as_str() {
            "chat" | "talk" | "conversation" | "answer" | "smalltalk" => Self::Chat,
            "query" | "ask" | "explain" | "question" | "understand" => Self::Query,
            "modify" | "rewrite" | "revise" | "change" | "update" | "edit_content" | "fix" => {
                Self::Modify
            }
            "generate" | "gen" | "create" | "write" | "produce" | "draft" => Self::Generate,
            "edit" | "delete" | "remove" | "add" | "move" | "restructure" | "structure" => {
                Self::Edit
            }
            "phase_continue" | "continue" | "phase" => Self::PhaseContinue,
            "advance_phase" | "advance" | "next" | "next_phase" | "proceed" => Self::AdvancePhase,
            "research" | "search" | "web_search" | "lookup" => Self::Research,
            "persona" | "personas" | "audience" => Self::Persona,
            "evaluate" | "eval" | "review" | "simulate" => Self::Evaluate,
            "skill" | "skills" | "apply_skill" => Self::Skill,
            _ => Self::Chat,
        }
    }

    /// Whether the dispatcher must resolve dependencies before running it
    pub fn requires_generation_plan(&self) -> bool {
        matches!(self, Self::Generate)
    }

    /// Tool-registry entry backing this kind, if any
    pub fn tool_name(&self) -> Option<&'static str> {
        match self {
            Self::Edit => Some("structure"),
            Self::Research => Some("research"),
            Self::Persona => Some("persona"),
            Self::Evaluate => Some("evaluate"),
            Self::Skill => Some("skill"),
            Self::Chat
            | Self::Query
            | Self::Modify
            | Self::Generate
            | Self::PhaseContinue
            | Self::AdvancePhase => None,
        }
    }
}

impl fmt::Display for IntentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified user action
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Intent {
    pub kind: IntentKind,
    /// Target unit (or phase, for `advance_phase`) name
    #[serde(default)]
    pub target: Option<String>,
    /// Free-text operation payload
    #[serde(default)]
    pub operation: Option<String>,
    /// Position in the original decomposition
    #[serde(default)]
    pub position: usize,
}

impl Intent {
    pub fn new(kind: IntentKind) -> Self {
        Self {
            kind,
            target: None,
            operation: None,
            position: 0,
        }
    }

    pub fn chat() -> Self {
        Self::new(IntentKind::Chat)
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn with_operation(mut self, operation: impl Into<String>) -> Self {
        self.operation = Some(operation.into());
        self
    }

    pub fn at(mut self, position: usize) -> Self {
        self.position = position;
        self
    }
}

/// Renumber positions after assembling a decomposition
pub(crate) fn number(intents: Vec<Intent>) -> Vec<Intent> {
    intents
        .into_iter()
        .enumerate()
        .map(|(i, intent)| intent.at(i))
        .collect()
}
