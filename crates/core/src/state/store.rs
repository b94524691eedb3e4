//! Persistence seams consumed by the dispatcher and handlers.

use anyhow::Result;
use async_trait::async_trait;

use crate::graph::ContentUnit;
use crate::phase::PhaseStateMachine;
use crate::session::{SessionKey, TranscriptEntry, TurnCheckpoint};

/// Durable project data: units and phase progress.
///
/// `save_unit` is atomic per unit; a failure never leaves a unit half-written.
#[async_trait]
pub trait ProjectStore: Send + Sync {
    /// Units of a project in declaration order
    async fn load_units(&self, project_id: &str) -> Result<Vec<ContentUnit>>;

    async fn save_unit(&self, unit: &ContentUnit) -> Result<()>;

    /// Keep the previous content of a unit before it is overwritten
    async fn snapshot_before_overwrite(
        &self,
        unit_id: &str,
        old_content: &str,
        source: &str,
    ) -> Result<()>;

    async fn load_session_state(&self, project_id: &str) -> Result<Option<PhaseStateMachine>>;

    async fn save_session_state(&self, project_id: &str, state: &PhaseStateMachine) -> Result<()>;
}

/// Cross-turn conversation state, keyed by project and conversation
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn load_transcript(&self, key: &SessionKey) -> Result<Vec<TranscriptEntry>>;

    async fn append_transcript(&self, key: &SessionKey, entry: &TranscriptEntry) -> Result<()>;

    async fn load_checkpoint(&self, key: &SessionKey) -> Result<Option<TurnCheckpoint>>;

    async fn save_checkpoint(&self, key: &SessionKey, checkpoint: &TurnCheckpoint) -> Result<()>;

    async fn clear_checkpoint(&self, key: &SessionKey) -> Result<()>;
}
