//! # Session Snapshot
//!
//! Read-only view of a project's state taken at turn start and handed to the
//! classifier and to every handler.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::graph::ContentUnitGraph;
use crate::intent::Intent;
use crate::phase::PhaseStateMachine;

/// Cross-turn state is keyed by project and conversation
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionKey {
    pub project_id: String,
    pub conversation_id: String,
}

impl SessionKey {
    pub fn new(project_id: &str, conversation_id: &str) -> Self {
        Self {
            project_id: project_id.to_string(),
            conversation_id: conversation_id.to_string(),
        }
    }
}

impl std::fmt::Display for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.project_id, self.conversation_id)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Speaker {
    User,
    Assistant,
}

/// One line of the conversation transcript
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TranscriptEntry {
    pub speaker: Speaker,
    pub content: String,
    /// Phase active when the entry was written
    #[serde(default)]
    pub phase: Option<String>,
    /// Set on assistant questions a phase asks as part of its script
    #[serde(default)]
    pub scripted_question: bool,
    pub at: DateTime<Utc>,
}

impl TranscriptEntry {
    pub fn user(content: impl Into<String>, phase: Option<&str>) -> Self {
        Self {
            speaker: Speaker::User,
            content: content.into(),
            phase: phase.map(str::to_string),
            scripted_question: false,
            at: Utc::now(),
        }
    }

    pub fn assistant(content: impl Into<String>, phase: Option<&str>) -> Self {
        Self {
            speaker: Speaker::Assistant,
            content: content.into(),
            phase: phase.map(str::to_string),
            scripted_question: false,
            at: Utc::now(),
        }
    }

    /// A question asked by `phase`'s script that awaits the user's answer
    pub fn question(content: impl Into<String>, phase: &str) -> Self {
        Self {
            scripted_question: true,
            ..Self::assistant(content, Some(phase))
        }
    }
}

/// Serializable progress of an unfinished turn.
///
/// Written after every completed intent so a cancelled or crashed turn can
/// resume from its last committed unit write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnCheckpoint {
    pub message: String,
    #[serde(default)]
    pub references: Vec<String>,
    /// Intents not yet completed, the next one to run first
    pub pending: Vec<Intent>,
    /// Ids of units committed so far in this turn
    #[serde(default)]
    pub committed_units: Vec<String>,
    #[serde(default)]
    pub intents_run: usize,
    pub updated_at: DateTime<Utc>,
}

impl TurnCheckpoint {
    pub fn new(message: &str, references: &[String], pending: Vec<Intent>) -> Self {
        Self {
            message: message.to_string(),
            references: references.to_vec(),
            pending,
            committed_units: Vec::new(),
            intents_run: 0,
            updated_at: Utc::now(),
        }
    }
}

/// Everything a classifier or handler may read about the session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub key: SessionKey,
    pub phases: PhaseStateMachine,
    pub units: ContentUnitGraph,
    pub transcript: Vec<TranscriptEntry>,
}

impl SessionSnapshot {
    pub fn project_id(&self) -> &str {
        &self.key.project_id
    }

    pub fn current_phase(&self) -> Option<&str> {
        self.phases.current()
    }

    /// The current phase's scripted question, if the user has not replied since
    pub fn pending_question(&self) -> Option<&TranscriptEntry> {
        let phase = self.current_phase()?;
        let last = self.transcript.last()?;
        (last.speaker == Speaker::Assistant
            && last.scripted_question
            && last.phase.as_deref() == Some(phase))
        .then_some(last)
    }

    /// Last `limit` transcript entries, oldest first
    pub fn recent_transcript(&self, limit: usize) -> &[TranscriptEntry] {
        let start = self.transcript.len().saturating_sub(limit);
        &self.transcript[start..]
    }
}
