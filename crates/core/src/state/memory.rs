//! In-memory stores for tests and ephemeral sessions.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;

use super::store::{ProjectStore, SessionStore};
use crate::graph::ContentUnit;
use crate::phase::PhaseStateMachine;
use crate::session::{SessionKey, TranscriptEntry, TurnCheckpoint};

/// Previous content kept by `snapshot_before_overwrite`
#[derive(Debug, Clone, PartialEq)]
pub struct UnitSnapshot {
    pub unit_id: String,
    pub content: String,
    pub source: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Default)]
pub struct InMemoryProjectStore {
    units: RwLock<HashMap<String, Vec<ContentUnit>>>,
    snapshots: RwLock<Vec<UnitSnapshot>>,
    sessions: RwLock<HashMap<String, PhaseStateMachine>>,
}

impl InMemoryProjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-seeded with units
    pub fn with_units(project_id: &str, units: Vec<ContentUnit>) -> Self {
        let mut map = HashMap::new();
        map.insert(project_id.to_string(), units);
        Self {
            units: RwLock::new(map),
            ..Self::default()
        }
    }

    pub async fn snapshots(&self) -> Vec<UnitSnapshot> {
        self.snapshots.read().await.clone()
    }

    pub async fn unit(&self, project_id: &str, name: &str) -> Option<ContentUnit> {
        self.units
            .read()
            .await
            .get(project_id)
            .and_then(|units| units.iter().find(|u| u.name.eq_ignore_ascii_case(name)))
            .cloned()
    }
}

#[async_trait]
impl ProjectStore for InMemoryProjectStore {
    async fn load_units(&self, project_id: &str) -> Result<Vec<ContentUnit>> {
        Ok(self
            .units
            .read()
            .await
            .get(project_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn save_unit(&self, unit: &ContentUnit) -> Result<()> {
        let mut units = self.units.write().await;
        let project = units.entry(unit.project_id.clone()).or_default();
        match project.iter_mut().find(|u| u.id == unit.id) {
            Some(existing) => *existing = unit.clone(),
            None => project.push(unit.clone()),
        }
        Ok(())
    }

    async fn snapshot_before_overwrite(
        &self,
        unit_id: &str,
        old_content: &str,
        source: &str,
    ) -> Result<()> {
        self.snapshots.write().await.push(UnitSnapshot {
            unit_id: unit_id.to_string(),
            content: old_content.to_string(),
            source: source.to_string(),
            created_at: Utc::now(),
        });
        Ok(())
    }

    async fn load_session_state(&self, project_id: &str) -> Result<Option<PhaseStateMachine>> {
        Ok(self.sessions.read().await.get(project_id).cloned())
    }

    async fn save_session_state(&self, project_id: &str, state: &PhaseStateMachine) -> Result<()> {
        self.sessions
            .write()
            .await
            .insert(project_id.to_string(), state.clone());
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemorySessionStore {
    transcripts: RwLock<HashMap<SessionKey, Vec<TranscriptEntry>>>,
    checkpoints: RwLock<HashMap<SessionKey, TurnCheckpoint>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn load_transcript(&self, key: &SessionKey) -> Result<Vec<TranscriptEntry>> {
        Ok(self
            .transcripts
            .read()
            .await
            .get(key)
            .cloned()
            .unwrap_or_default())
    }

    async fn append_transcript(&self, key: &SessionKey, entry: &TranscriptEntry) -> Result<()> {
        self.transcripts
            .write()
            .await
            .entry(key.clone())
            .or_default()
            .push(entry.clone());
        Ok(())
    }

    async fn load_checkpoint(&self, key: &SessionKey) -> Result<Option<TurnCheckpoint>> {
        Ok(self.checkpoints.read().await.get(key).cloned())
    }

    async fn save_checkpoint(&self, key: &SessionKey, checkpoint: &TurnCheckpoint) -> Result<()> {
        self.checkpoints
            .write()
            .await
            .insert(key.clone(), checkpoint.clone());
        Ok(())
    }

    async fn clear_checkpoint(&self, key: &SessionKey) -> Result<()> {
        self.checkpoints.write().await.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::UnitStatus;

    #[tokio::test]
    async fn test_save_unit_replaces_by_id() {
        let store = InMemoryProjectStore::new();
        let unit = ContentUnit::new("p1", "Intro");
        store.save_unit(&unit).await.unwrap();
        store
            .save_unit(&unit.clone().with_status(UnitStatus::Completed))
            .await
            .unwrap();

        let units = store.load_units("p1").await.unwrap();
        assert_eq!(units.len(), 1);
        assert_eq!(units[0].status, UnitStatus::Completed);
        assert!(store.load_units("other").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sessions_are_isolated_by_key() {
        let store = InMemorySessionStore::new();
        let a = SessionKey::new("p1", "main");
        let b = SessionKey::new("p1", "side");

        store
            .append_transcript(&a, &TranscriptEntry::user("hello", None))
            .await
            .unwrap();
        store
            .save_checkpoint(&a, &TurnCheckpoint::new("hello", &[], Vec::new()))
            .await
            .unwrap();

        assert_eq!(store.load_transcript(&a).await.unwrap().len(), 1);
        assert!(store.load_transcript(&b).await.unwrap().is_empty());
        assert!(store.load_checkpoint(&b).await.unwrap().is_none());

        store.clear_checkpoint(&a).await.unwrap();
        assert!(store.load_checkpoint(&a).await.unwrap().is_none());
    }
}
