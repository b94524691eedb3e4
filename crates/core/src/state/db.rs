//! # Studio Database
//!
//! Single SQLite file backing the durable project and session stores.
//! Lives at `StudioConfig::db_path` (`.scriptorium/studio.db` by default).

use anyhow::{Context, Result};
use rusqlite::Connection;
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::config::StudioConfig;

/// Schema version for migrations
const SCHEMA_VERSION: i32 = 1;

/// Shared connection plus migrations
pub struct StudioDb {
    conn: Arc<Mutex<Connection>>,
}

impl StudioDb {
    /// Open or create the database at the configured `db_path`
    pub fn open(config: &StudioConfig) -> Result<Self> {
        Self::open_at(&config.db_path)
    }

    /// Open database at a specific path (useful for testing)
    pub fn open_at<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let conn = Connection::open(path.as_ref()).context("Failed to open studio database")?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;

        Ok(db)
    }

    /// Shared connection for the stores
    pub fn connection(&self) -> Arc<Mutex<Connection>> {
        Arc::clone(&self.conn)
    }

    fn run_migrations(&self) -> Result<()> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER PRIMARY KEY)",
            [],
        )?;

        let current_version: i32 = conn
            .query_row(
                "SELECT COALESCE(MAX(version), 0) FROM schema_version",
                [],
                |row| row.get(0),
            )
            .unwrap_or(0);

        if current_version < 1 {
            Self::migrate_v1(&conn)?;
            conn.execute(
                "INSERT OR REPLACE INTO schema_version (version) VALUES (?1)",
                [1],
            )?;
        }

        tracing::debug!(
            from = current_version,
            to = SCHEMA_VERSION,
            "Studio database ready"
        );
        Ok(())
    }

    /// Migration to version 1 - units, snapshots, session state, transcripts, checkpoints
    fn migrate_v1(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS content_units (
                id TEXT PRIMARY KEY,
                project_id TEXT NOT NULL,
                name TEXT NOT NULL,
                parent_id TEXT,
                content TEXT NOT NULL DEFAULT '',
                status TEXT NOT NULL DEFAULT 'pending',
                depends_on_json TEXT NOT NULL DEFAULT '[]',
                needs_review INTEGER NOT NULL DEFAULT 0,
                position INTEGER NOT NULL DEFAULT 0,
                updated_at TEXT NOT NULL,
                UNIQUE (project_id, name)
            );

            CREATE TABLE IF NOT EXISTS unit_snapshots (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                unit_id TEXT NOT NULL,
                content TEXT NOT NULL,
                source TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS session_state (
                project_id TEXT PRIMARY KEY,
                data TEXT NOT NULL DEFAULT '{}',
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS transcripts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                project_id TEXT NOT NULL,
                conversation_id TEXT NOT NULL,
                speaker TEXT NOT NULL,
                content TEXT NOT NULL,
                phase TEXT,
                scripted_question INTEGER NOT NULL DEFAULT 0,
                at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS turn_checkpoints (
                project_id TEXT NOT NULL,
                conversation_id TEXT NOT NULL,
                data TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (project_id, conversation_id)
            );

            CREATE INDEX IF NOT EXISTS idx_units_project ON content_units(project_id);
            CREATE INDEX IF NOT EXISTS idx_snapshots_unit ON unit_snapshots(unit_id);
            CREATE INDEX IF NOT EXISTS idx_transcripts_session
                ON transcripts(project_id, conversation_id);
            "#,
        )
        .context("Failed to run studio migration v1")?;

        tracing::info!("Studio database migrated to version 1");
        Ok(())
    }
}
