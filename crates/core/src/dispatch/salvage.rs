//! Salvage of in-flight output when a turn is cancelled or times out.

use anyhow::Result;
use async_trait::async_trait;

use crate::graph::UnitStatus;
use crate::intent::{Intent, IntentKind};
use crate::session::SessionSnapshot;
use crate::state::ProjectStore;

/// Output produced by the interrupted intent before it stopped
#[derive(Debug, Clone)]
pub struct PartialOutput {
    pub intent: Intent,
    /// Streamed text accumulated so far
    pub text: String,
    /// Ids of units the intent already committed
    pub committed_units: Vec<String>,
}

/// Invoked with partial output before a cancellation propagates
#[async_trait]
pub trait SalvageHook: Send + Sync {
    async fn salvage(
        &self,
        partial: &PartialOutput,
        session: &SessionSnapshot,
        projects: &dyn ProjectStore,
    ) -> Result<()>;
}

/// Writes partial text into the intent's target unit, leaving it in progress
pub struct CommitPartialContent;

#[async_trait]
impl SalvageHook for CommitPartialContent {
    async fn salvage(
        &self,
        partial: &PartialOutput,
        session: &SessionSnapshot,
        projects: &dyn ProjectStore,
    ) -> Result<()> {
        if partial.text.trim().is_empty()
            || !matches!(partial.intent.kind, IntentKind::Generate | IntentKind::Modify)
        {
            return Ok(());
        }
        let Some(target) = partial.intent.target.as_deref() else {
            return Ok(());
        };

        let mut unit = session
            .units
            .by_name(target)
            .cloned()
            .unwrap_or_else(|| session.units.declare(target));

        if !unit.content.trim().is_empty() {
            projects
                .snapshot_before_overwrite(&unit.id, &unit.content, "salvage")
                .await?;
        }
        unit.content = partial.text.clone();
        unit.status = UnitStatus::InProgress;
        unit.touch();
        projects.save_unit(&unit).await?;

        tracing::info!(
            unit = %unit.name,
            chars = partial.text.len(),
            "Salvaged partial output"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{ContentUnit, ContentUnitGraph};
    use crate::phase::PhaseStateMachine;
    use crate::session::SessionKey;
    use crate::state::InMemoryProjectStore;

    fn session(units: Vec<ContentUnit>) -> SessionSnapshot {
        SessionSnapshot {
            key: SessionKey::new("p1", "main"),
            phases: PhaseStateMachine::new(["draft"]),
            units: ContentUnitGraph::new("p1", units),
            transcript: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_partial_text_lands_in_target() {
        let existing = ContentUnit::new("p1", "Intro")
            .with_content("old intro")
            .with_status(UnitStatus::Completed);
        let store = InMemoryProjectStore::with_units("p1", vec![existing.clone()]);
        let partial = PartialOutput {
            intent: Intent::new(IntentKind::Modify).with_target("Intro"),
            text: "new intro, half wri".to_string(),
            committed_units: Vec::new(),
        };

        CommitPartialContent
            .salvage(&partial, &session(vec![existing]), &store)
            .await
            .unwrap();

        let unit = store.unit("p1", "Intro").await.unwrap();
        assert_eq!(unit.content, "new intro, half wri");
        assert_eq!(unit.status, UnitStatus::InProgress);
        let snapshots = store.snapshots().await;
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].content, "old intro");
        assert_eq!(snapshots[0].source, "salvage");
    }

    #[tokio::test]
    async fn test_chat_output_is_not_committed() {
        let store = InMemoryProjectStore::new();
        let partial = PartialOutput {
            intent: Intent::chat(),
            text: "Sure, here".to_string(),
            committed_units: Vec::new(),
        };
        CommitPartialContent
            .salvage(&partial, &session(Vec::new()), &store)
            .await
            .unwrap();
        assert!(store.load_units("p1").await.unwrap().is_empty());
    }
}
