//! # Error Taxonomy
//!
//! Errors raised by the decision-and-scheduling core. Collaborator failures
//! (LLM, tools, stores) arrive as `anyhow::Error` and are wrapped here.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::intent::IntentKind;

/// Result alias for core operations
pub type CoreResult<T> = Result<T, CoreError>;

/// A dependency cycle in a content-unit graph.
///
/// `members` holds every unit that could not be scheduled because it sits on
/// (or behind) a cycle, sorted by id.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("dependency cycle among units: {}", members.join(", "))]
pub struct CycleError {
    pub members: Vec<String>,
}

/// Errors produced while running a turn
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Cycle(#[from] CycleError),

    /// The utterance referenced units that do not exist in the project.
    #[error("unknown unit reference(s): {}", names.join(", "))]
    ReferenceResolution { names: Vec<String> },

    /// Classification could not produce a usable intent list; a default was substituted.
    #[error("classification fell back to chat: {reason}")]
    ClassificationFallback { reason: String },

    #[error("cannot generate '{target}': unmet dependencies {}", unmet.join(", "))]
    PreconditionNotMet { target: String, unmet: Vec<String> },

    #[error("{kind} handler failed: {source:#}")]
    HandlerExecution {
        kind: IntentKind,
        #[source]
        source: anyhow::Error,
    },

    #[error("{kind} handler timed out after {}s", after.as_secs())]
    Timeout { kind: IntentKind, after: Duration },

    #[error("unknown phase: {0}")]
    UnknownPhase(String),

    #[error("persistence error: {0:#}")]
    Persistence(anyhow::Error),

    #[error("turn cancelled by caller")]
    Cancelled,
}

impl CoreError {
    /// Stable machine-readable code for transport responses
    pub fn code(&self) -> &'static str {
        match self {
            Self::Cycle(_) => "cycle",
            Self::ReferenceResolution { .. } => "reference_resolution",
            Self::ClassificationFallback { .. } => "classification_fallback",
            Self::PreconditionNotMet { .. } => "precondition_not_met",
            Self::HandlerExecution { .. } => "handler_execution",
            Self::Timeout { .. } => "timeout",
            Self::UnknownPhase(_) => "unknown_phase",
            Self::Persistence(_) => "persistence",
            Self::Cancelled => "cancelled",
        }
    }

    /// Whether a caller-side retry of the same intent may succeed.
    ///
    /// Structural problems (cycles, unmet preconditions) are never retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::HandlerExecution { .. })
    }

    pub(crate) fn handler(kind: IntentKind, source: anyhow::Error) -> Self {
        Self::HandlerExecution { kind, source }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_error_message_lists_members() {
        let err = CycleError {
            members: vec!["A".to_string(), "B".to_string()],
        };
        assert_eq!(err.to_string(), "dependency cycle among units: A, B");
    }

    #[test]
    fn test_error_codes() {
        let timeout = CoreError::Timeout {
            kind: IntentKind::Generate,
            after: Duration::from_secs(30),
        };
        assert_eq!(timeout.code(), "timeout");
        assert!(timeout.is_retryable());

        let precondition = CoreError::PreconditionNotMet {
            target: "Summary".to_string(),
            unmet: vec!["Research".to_string()],
        };
        assert_eq!(precondition.code(), "precondition_not_met");
        assert!(!precondition.is_retryable());
        assert!(precondition.to_string().contains("Research"));
    }
}
