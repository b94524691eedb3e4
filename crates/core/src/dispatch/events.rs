//! # Turn Events
//!
//! Ordered event stream emitted by a streaming turn.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::intent::{Intent, IntentKind};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TurnEventKind {
    /// Classified intent about to run, sent before any of its output
    Route,
    /// Chunk of model output
    Token,
    /// A unit was committed
    Content,
    /// Turn finished; data holds the response
    Done,
    /// Turn failed; data holds the error object
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnEvent {
    /// Position in the turn's event sequence
    pub seq: usize,
    pub timestamp: DateTime<Utc>,
    pub kind: TurnEventKind,
    /// Intent the event belongs to
    #[serde(default)]
    pub intent_kind: Option<IntentKind>,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
}

impl TurnEvent {
    pub fn new(kind: TurnEventKind) -> Self {
        Self {
            seq: 0,
            timestamp: Utc::now(),
            kind,
            intent_kind: None,
            data: None,
        }
    }

    pub fn route(intent: &Intent) -> Self {
        Self::new(TurnEventKind::Route)
            .for_intent(intent.kind)
            .with_data(serde_json::json!({
                "kind": intent.kind,
                "target": intent.target,
                "position": intent.position,
            }))
    }

    pub fn token(kind: IntentKind, text: &str) -> Self {
        Self::new(TurnEventKind::Token)
            .for_intent(kind)
            .with_data(serde_json::Value::from(text))
    }

    pub fn for_intent(mut self, kind: IntentKind) -> Self {
        self.intent_kind = Some(kind);
        self
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Token text, for `token` events
    pub fn text(&self) -> Option<&str> {
        match self.kind {
            TurnEventKind::Token => self.data.as_ref().and_then(|d| d.as_str()),
            _ => None,
        }
    }
}
