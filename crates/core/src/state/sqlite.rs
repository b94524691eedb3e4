//! # SQLite Stores
//!
//! Durable [`ProjectStore`] and [`SessionStore`] over one [`StudioDb`].
//! Each write is a single statement (or transaction), so per-unit commits
//! are atomic.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::sync::{Arc, Mutex, MutexGuard};

use super::db::StudioDb;
use super::store::{ProjectStore, SessionStore};
use crate::graph::{ContentUnit, UnitStatus};
use crate::phase::PhaseStateMachine;
use crate::session::{SessionKey, Speaker, TranscriptEntry, TurnCheckpoint};

fn lock(conn: &Mutex<Connection>) -> Result<MutexGuard<'_, Connection>> {
    conn.lock().map_err(|e| anyhow::anyhow!("Lock error: {}", e))
}

fn parse_time(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

pub struct SqliteProjectStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteProjectStore {
    pub fn new(db: &StudioDb) -> Self {
        Self {
            conn: db.connection(),
        }
    }

    /// Number of stored snapshots for a unit
    pub fn snapshot_count(&self, unit_id: &str) -> Result<usize> {
        let conn = lock(&self.conn)?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM unit_snapshots WHERE unit_id = ?1",
            params![unit_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    fn row_to_unit(row: &rusqlite::Row) -> rusqlite::Result<ContentUnit> {
        let status: String = row.get(5)?;
        let depends_on_json: String = row.get(6)?;
        let needs_review: i32 = row.get(7)?;
        let updated_at: String = row.get(8)?;

        Ok(ContentUnit {
            id: row.get(0)?,
            project_id: row.get(1)?,
            name: row.get(2)?,
            parent_id: row.get(3)?,
            content: row.get(4)?,
            status: UnitStatus::from_str(&status),
            depends_on: serde_json::from_str(&depends_on_json).unwrap_or_default(),
            needs_review: needs_review != 0,
            updated_at: parse_time(&updated_at),
        })
    }
}

#[async_trait]
impl ProjectStore for SqliteProjectStore {
    async fn load_units(&self, project_id: &str) -> Result<Vec<ContentUnit>> {
        let conn = lock(&self.conn)?;
        let mut stmt = conn.prepare(
            r#"
            SELECT id, project_id, name, parent_id, content, status, depends_on_json,
                   needs_review, updated_at
            FROM content_units
            WHERE project_id = ?1
            ORDER BY position, id
            "#,
        )?;

        let units = stmt
            .query_map(params![project_id], Self::row_to_unit)?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to load content units")?;

        Ok(units)
    }

    async fn save_unit(&self, unit: &ContentUnit) -> Result<()> {
        let conn = lock(&self.conn)?;
        let depends_on_json = serde_json::to_string(&unit.depends_on)?;

        conn.execute(
            r#"
            INSERT INTO content_units
                (id, project_id, name, parent_id, content, status, depends_on_json,
                 needs_review, position, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8,
                    (SELECT COALESCE(MAX(position), -1) + 1 FROM content_units WHERE project_id = ?2),
                    ?9)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                parent_id = excluded.parent_id,
                content = excluded.content,
                status = excluded.status,
                depends_on_json = excluded.depends_on_json,
                needs_review = excluded.needs_review,
                updated_at = excluded.updated_at
            "#,
            params![
                unit.id,
                unit.project_id,
                unit.name,
                unit.parent_id,
                unit.content,
                unit.status.as_str(),
                depends_on_json,
                unit.needs_review as i32,
                unit.updated_at.to_rfc3339(),
            ],
        )
        .with_context(|| format!("Failed to save unit {}", unit.id))?;

        Ok(())
    }

    async fn snapshot_before_overwrite(
        &self,
        unit_id: &str,
        old_content: &str,
        source: &str,
    ) -> Result<()> {
        let conn = lock(&self.conn)?;
        conn.execute(
            "INSERT INTO unit_snapshots (unit_id, content, source, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![unit_id, old_content, source, Utc::now().to_rfc3339()],
        )
        .context("Failed to snapshot unit")?;

        tracing::debug!(unit_id = %unit_id, source = %source, "Unit snapshot taken");
        Ok(())
    }

    async fn load_session_state(&self, project_id: &str) -> Result<Option<PhaseStateMachine>> {
        let conn = lock(&self.conn)?;
        let data: Option<String> = conn
            .query_row(
                "SELECT data FROM session_state WHERE project_id = ?1",
                params![project_id],
                |row| row.get(0),
            )
            .optional()?;

        data.map(|json| serde_json::from_str(&json).context("Corrupt session state"))
            .transpose()
    }

    async fn save_session_state(&self, project_id: &str, state: &PhaseStateMachine) -> Result<()> {
        let conn = lock(&self.conn)?;
        let data = serde_json::to_string(state)?;
        conn.execute(
            "INSERT OR REPLACE INTO session_state (project_id, data, updated_at) VALUES (?1, ?2, ?3)",
            params![project_id, data, Utc::now().to_rfc3339()],
        )
        .context("Failed to save session state")?;
        Ok(())
    }
}

pub struct SqliteSessionStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteSessionStore {
    pub fn new(db: &StudioDb) -> Self {
        Self {
            conn: db.connection(),
        }
    }
}

#[async_trait]
impl SessionStore for SqliteSessionStore {
    async fn load_transcript(&self, key: &SessionKey) -> Result<Vec<TranscriptEntry>> {
        let conn = lock(&self.conn)?;
        let mut stmt = conn.prepare(
            r#"
            SELECT speaker, content, phase, scripted_question, at
            FROM transcripts
            WHERE project_id = ?1 AND conversation_id = ?2
            ORDER BY id
            "#,
        )?;

        let entries = stmt
            .query_map(params![key.project_id, key.conversation_id], |row| {
                let speaker: String = row.get(0)?;
                let scripted: i32 = row.get(3)?;
                let at: String = row.get(4)?;
                Ok(TranscriptEntry {
                    speaker: if speaker == "assistant" {
                        Speaker::Assistant
                    } else {
                        Speaker::User
                    },
                    content: row.get(1)?,
                    phase: row.get(2)?,
                    scripted_question: scripted != 0,
                    at: parse_time(&at),
                })
            })?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to load transcript")?;

        Ok(entries)
    }

    async fn append_transcript(&self, key: &SessionKey, entry: &TranscriptEntry) -> Result<()> {
        let conn = lock(&self.conn)?;
        let speaker = match entry.speaker {
            Speaker::User => "user",
            Speaker::Assistant => "assistant",
        };
        conn.execute(
            r#"
            INSERT INTO transcripts
                (project_id, conversation_id, speaker, content, phase, scripted_question, at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
            params![
                key.project_id,
                key.conversation_id,
                speaker,
                entry.content,
                entry.phase,
                entry.scripted_question as i32,
                entry.at.to_rfc3339(),
            ],
        )
        .context("Failed to append transcript entry")?;
        Ok(())
    }

    async fn load_checkpoint(&self, key: &SessionKey) -> Result<Option<TurnCheckpoint>> {
        let conn = lock(&self.conn)?;
        let data: Option<String> = conn
            .query_row(
                "SELECT data FROM turn_checkpoints WHERE project_id = ?1 AND conversation_id = ?2",
                params![key.project_id, key.conversation_id],
                |row| row.get(0),
            )
            .optional()?;

        data.map(|json| serde_json::from_str(&json).context("Corrupt turn checkpoint"))
            .transpose()
    }

    async fn save_checkpoint(&self, key: &SessionKey, checkpoint: &TurnCheckpoint) -> Result<()> {
        let conn = lock(&self.conn)?;
        let data = serde_json::to_string(checkpoint)?;
        conn.execute(
            r#"
            INSERT OR REPLACE INTO turn_checkpoints (project_id, conversation_id, data, updated_at)
            VALUES (?1, ?2, ?3, ?4)
            "#,
            params![
                key.project_id,
                key.conversation_id,
                data,
                checkpoint.updated_at.to_rfc3339()
            ],
        )
        .context("Failed to save turn checkpoint")?;
        Ok(())
    }

    async fn clear_checkpoint(&self, key: &SessionKey) -> Result<()> {
        let conn = lock(&self.conn)?;
        conn.execute(
            "DELETE FROM turn_checkpoints WHERE project_id = ?1 AND conversation_id = ?2",
            params![key.project_id, key.conversation_id],
        )?;
        Ok(())
    }
}
