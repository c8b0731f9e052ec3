//! SQLite bootstrap and the shared connection handle.
//!
//! Two relations back the orchestrator: `events` (the append-only session
//! log) and `research_results` (persisted answers). Full-text search over
//! results runs through an FTS5 external-content table kept in sync by
//! triggers; embeddings live in a nullable BLOB column as little-endian f32.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{Context, Result};
use rusqlite::Connection;

use crate::errors::StoreError;

pub struct Db {
    conn: Connection,
}

impl Db {
    /// Open (or create) the database at the given path and run migrations.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create database directory")?;
        }
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS events (
                    id TEXT PRIMARY KEY,
                    log_id TEXT NOT NULL,
                    timestamp TEXT NOT NULL,
                    event_type TEXT NOT NULL,
                    plan_id TEXT,
                    phase_id TEXT,
                    step_id TEXT,
                    data TEXT NOT NULL DEFAULT '{}',
                    seq INTEGER
                );

                CREATE INDEX IF NOT EXISTS idx_events_log ON events(log_id);
                CREATE INDEX IF NOT EXISTS idx_events_timestamp ON events(timestamp);
                CREATE INDEX IF NOT EXISTS idx_events_type ON events(event_type);

                CREATE TABLE IF NOT EXISTS research_results (
                    id TEXT PRIMARY KEY,
                    log_id TEXT NOT NULL,
                    plan_id TEXT NOT NULL,
                    query TEXT NOT NULL,
                    answer TEXT NOT NULL,
                    sources TEXT NOT NULL DEFAULT '[]',
                    metadata TEXT NOT NULL DEFAULT '{}',
                    confidence TEXT,
                    embedding BLOB,
                    created_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE INDEX IF NOT EXISTS idx_research_results_log
                    ON research_results(log_id);

                CREATE VIRTUAL TABLE IF NOT EXISTS research_results_fts USING fts5(
                    query,
                    answer,
                    content='research_results',
                    content_rowid='rowid'
                );

                CREATE TRIGGER IF NOT EXISTS research_results_fts_insert
                AFTER INSERT ON research_results BEGIN
                    INSERT INTO research_results_fts(rowid, query, answer)
                    VALUES (new.rowid, new.query, new.answer);
                END;

                CREATE TRIGGER IF NOT EXISTS research_results_fts_delete
                AFTER DELETE ON research_results BEGIN
                    INSERT INTO research_results_fts(research_results_fts, rowid, query, answer)
                    VALUES ('delete', old.rowid, old.query, old.answer);
                END;

                CREATE TRIGGER IF NOT EXISTS research_results_fts_update
                AFTER UPDATE OF query, answer ON research_results BEGIN
                    INSERT INTO research_results_fts(research_results_fts, rowid, query, answer)
                    VALUES ('delete', old.rowid, old.query, old.answer);
                    INSERT INTO research_results_fts(rowid, query, answer)
                    VALUES (new.rowid, new.query, new.answer);
                END;
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }
}

/// Cloneable handle sharing one connection behind a mutex.
///
/// SQLite serializes writers anyway; a single guarded connection keeps the
/// write-ahead discipline simple and is cheap at this scale.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<Mutex<Db>>,
}

impl DbHandle {
    pub fn new(db: Db) -> Self {
        Self {
            inner: Arc::new(Mutex::new(db)),
        }
    }

    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self::new(Db::open(path)?))
    }

    pub fn in_memory() -> Result<Self> {
        Ok(Self::new(Db::open_in_memory()?))
    }

    pub fn lock(&self) -> Result<MutexGuard<'_, Db>, StoreError> {
        self.inner.lock().map_err(|_| StoreError::LockPoisoned)
    }

    /// Run a closure against the guarded connection.
    pub fn with<R>(
        &self,
        f: impl FnOnce(&Connection) -> Result<R, StoreError>,
    ) -> Result<R, StoreError> {
        let guard = self.lock()?;
        f(guard.conn())
    }
}
