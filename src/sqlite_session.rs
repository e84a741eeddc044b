//! # SQLite-Based Thread Storage
//!
//! A durable [`ThreadStore`] backed by SQLite, so conversations survive process
//! restarts. Each thread is one row: the full [`ConversationState`] serialized
//! as JSON, plus the active handler and an update timestamp for inspection.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use tower_triage::sessions::{ConversationState, ThreadStore};
//! use tower_triage::sqlite_session::SqliteThreadStore;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let store = SqliteThreadStore::new("threads.db").await?;
//! let state = ConversationState::new(store.generate_id(), "Triage Agent");
//! store.save(&state).await?;
//!
//! let loaded = store.load(&state.thread_id).await?;
//! assert_eq!(loaded.as_ref(), Some(&state));
//! # Ok(())
//! # }
//! ```
//!
//! Saving is an upsert; the last save of a thread wins. For tests, use
//! [`SqliteThreadStore::new_in_memory`], which keeps a single connection so the
//! in-memory database is shared by every query.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Row, Sqlite};
use std::path::Path;
use tracing::debug;

use crate::error::{Result, TriageError};
use crate::sessions::{ConversationState, ThreadStore};

/// A [`ThreadStore`] implementation that uses SQLite for persistent storage.
pub struct SqliteThreadStore {
    pool: Pool<Sqlite>,
}

impl SqliteThreadStore {
    /// Open (creating if missing) the database at `db_path` and run migrations.
    pub async fn new(db_path: impl AsRef<Path>) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(db_path.as_ref())
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new().connect_with(options).await?;
        Self::run_migrations(&pool).await?;
        Ok(Self { pool })
    }

    /// In-memory database; contents are lost when the store is dropped.
    pub async fn new_in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        Self::run_migrations(&pool).await?;
        Ok(Self { pool })
    }

    async fn run_migrations(pool: &Pool<Sqlite>) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS threads (
                thread_id TEXT PRIMARY KEY,
                current_handler TEXT NOT NULL,
                state TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(pool)
        .await?;

        Ok(())
    }

    /// Remove a thread; returns whether it existed.
    pub async fn delete(&self, thread_id: &str) -> Result<bool> {
        let done = sqlx::query("DELETE FROM threads WHERE thread_id = ?")
            .bind(thread_id)
            .execute(&self.pool)
            .await?;
        Ok(done.rows_affected() > 0)
    }

    /// Stored thread ids, most recently updated first.
    pub async fn thread_ids(&self) -> Result<Vec<String>> {
        let rows = sqlx::query("SELECT thread_id FROM threads ORDER BY updated_at DESC")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| row.try_get::<String, _>("thread_id").map_err(TriageError::from))
            .collect()
    }
}

#[async_trait]
impl ThreadStore for SqliteThreadStore {
    async fn load(&self, thread_id: &str) -> Result<Option<ConversationState>> {
        let row = sqlx::query("SELECT state FROM threads WHERE thread_id = ?")
            .bind(thread_id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => {
                let raw: String = row.try_get("state")?;
                Ok(Some(serde_json::from_str(&raw)?))
            }
            None => Ok(None),
        }
    }

    async fn save(&self, state: &ConversationState) -> Result<()> {
        let raw = serde_json::to_string(state)?;
        sqlx::query(
            r#"
            INSERT INTO threads (thread_id, current_handler, state, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(thread_id) DO UPDATE SET
                current_handler = excluded.current_handler,
                state = excluded.state,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&state.thread_id)
        .bind(&state.current_handler)
        .bind(raw)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        debug!(thread_id = %state.thread_id, events = state.events.len(), "thread saved");
        Ok(())
    }
}

impl std::fmt::Debug for SqliteThreadStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteThreadStore").finish_non_exhaustive()
    }
}
