// Copyright 2025 Memoir (https://github.com/memoir-mem/memoir)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Memoir relational store.
//!
//! SQLite-backed persistence for sessions, observations, session summaries,
//! user prompts, and the pending-message queue the session agents drain.
//! The store owns every row; other components read through its API and
//! mutate through named operations. Observations are append-only; sessions
//! mutate only `memory_session_id` (once) and `status`.
//!
//! Writes are funneled through this type for the worker's lifetime; readers
//! share the pool concurrently under WAL.

pub mod migrate;
pub mod observations;
pub mod pending;
pub mod schema;
pub mod sessions;
pub mod summaries;

pub use migrate::{MigrateOptions, MigrateOutcome, MigrateReport, MigratedRecord};
pub use observations::NewObservation;
pub use pending::{PendingKind, PendingMessage};
pub use schema::{ProjectStat, SessionRow, SessionStatus, StoreStats, StoredId, UserPromptRecord};
pub use summaries::NewSummary;

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

/// Errors produced by store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("{0}")]
    Conflict(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Core(#[from] memoir_core::CoreError),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// The relational store. Cheap to clone via the inner pool handle.
#[derive(Clone)]
pub struct MemoryStore {
    pool: Arc<Pool<SqliteConnectionManager>>,
}

impl MemoryStore {
    /// Open (or create) the store at `db_path`.
    pub fn open(db_path: &Path) -> StoreResult<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(memoir_core::CoreError::Io)?;
        }

        let manager = SqliteConnectionManager::file(db_path).with_flags(
            rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
                | rusqlite::OpenFlags::SQLITE_OPEN_CREATE
                | rusqlite::OpenFlags::SQLITE_OPEN_FULL_MUTEX,
        );
        let pool = Pool::builder().max_size(8).build(manager)?;

        {
            let conn = pool.get()?;
            conn.execute_batch(
                "PRAGMA foreign_keys = ON;
                 PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;
                 PRAGMA busy_timeout = 5000;",
            )?;
            conn.execute_batch(schema::SCHEMA_SQL)?;
        }

        info!("store opened at {}", db_path.display());
        Ok(Self { pool: Arc::new(pool) })
    }

    /// In-memory store for tests. The pool is pinned to one connection so
    /// every operation sees the same database.
    pub fn in_memory() -> StoreResult<Self> {
        let manager = SqliteConnectionManager::memory();
        let pool = Pool::builder().max_size(1).build(manager)?;
        {
            let conn = pool.get()?;
            conn.execute_batch("PRAGMA foreign_keys = ON;")?;
            conn.execute_batch(schema::SCHEMA_SQL)?;
        }
        Ok(Self { pool: Arc::new(pool) })
    }

    pub(crate) fn conn(
        &self,
    ) -> StoreResult<r2d2::PooledConnection<SqliteConnectionManager>> {
        Ok(self.pool.get()?)
    }

    /// Aggregate row counts for the stats endpoint.
    pub fn get_stats(&self) -> StoreResult<StoreStats> {
        let conn = self.conn()?;
        let count = |table: &str| -> StoreResult<i64> {
            Ok(conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |r| r.get(0))?)
        };
        Ok(StoreStats {
            sessions: count("sessions")?,
            observations: count("observations")?,
            summaries: count("session_summaries")?,
            user_prompts: count("user_prompts")?,
            pending_messages: conn.query_row(
                "SELECT COUNT(*) FROM pending_messages WHERE processed_at IS NULL",
                [],
                |r| r.get(0),
            )?,
        })
    }
}

impl Drop for MemoryStore {
    fn drop(&mut self) {
        if Arc::strong_count(&self.pool) == 1 {
            if let Ok(conn) = self.pool.get() {
                let _ = conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_on_disk_creates_schema() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::open(&dir.path().join("claude-mem.db")).unwrap();
        let stats = store.get_stats().unwrap();
        assert_eq!(stats.sessions, 0);
        assert_eq!(stats.observations, 0);
    }

    #[test]
    fn test_in_memory_schema() {
        let store = MemoryStore::in_memory().unwrap();
        assert_eq!(store.get_stats().unwrap().pending_messages, 0);
    }
}
