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

//! Session operations.

use crate::schema::{SessionRow, SessionStatus};
use crate::{MemoryStore, StoreError, StoreResult};
use rusqlite::{params, OptionalExtension, Row};
use tracing::info;

impl MemoryStore {
    /// Look up or create the session for a host session id. Idempotent on
    /// `content_session_id`; the first caller's project and prompt win.
    pub fn create_session(
        &self,
        content_session_id: &str,
        project: &str,
        user_prompt: &str,
    ) -> StoreResult<SessionRow> {
        let conn = self.conn()?;
        let inserted = conn.execute(
            "INSERT INTO sessions (content_session_id, project, status, started_at, user_prompt)
             VALUES (?1, ?2, 'active', ?3, ?4)
             ON CONFLICT(content_session_id) DO NOTHING",
            params![content_session_id, project, memoir_core::epoch_ms(), user_prompt],
        )?;
        if inserted > 0 {
            info!(content_session_id, project, "session created");
        }

        conn.query_row(
            "SELECT id, content_session_id, memory_session_id, project, status, started_at, user_prompt
             FROM sessions WHERE content_session_id = ?1",
            [content_session_id],
            row_to_session,
        )
        .map_err(Into::into)
    }

    /// Fetch a session by its row id.
    pub fn get_session(&self, session_db_id: i64) -> StoreResult<SessionRow> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT id, content_session_id, memory_session_id, project, status, started_at, user_prompt
             FROM sessions WHERE id = ?1",
            [session_db_id],
            row_to_session,
        )
        .optional()?
        .ok_or_else(|| StoreError::NotFound(format!("session {session_db_id}")))
    }

    /// Fetch a session by the host's session id.
    pub fn get_session_by_content_id(
        &self,
        content_session_id: &str,
    ) -> StoreResult<Option<SessionRow>> {
        let conn = self.conn()?;
        Ok(conn
            .query_row(
                "SELECT id, content_session_id, memory_session_id, project, status, started_at, user_prompt
                 FROM sessions WHERE content_session_id = ?1",
                [content_session_id],
                row_to_session,
            )
            .optional()?)
    }

    /// Record the extractor's session id. Assigned at most once: a second
    /// call with the same value is a no-op, a different value is a conflict.
    pub fn update_memory_session_id(
        &self,
        session_db_id: i64,
        memory_session_id: &str,
    ) -> StoreResult<()> {
        let session = self.get_session(session_db_id)?;
        match session.memory_session_id.as_deref() {
            None => {
                let conn = self.conn()?;
                conn.execute(
                    "UPDATE sessions SET memory_session_id = ?1
                     WHERE id = ?2 AND memory_session_id IS NULL",
                    params![memory_session_id, session_db_id],
                )?;
                Ok(())
            }
            Some(existing) if existing == memory_session_id => Ok(()),
            Some(existing) => Err(StoreError::Conflict(format!(
                "session {session_db_id} already has memory_session_id {existing:?}"
            ))),
        }
    }

    pub fn mark_session_completed(&self, session_db_id: i64) -> StoreResult<()> {
        self.set_session_status(session_db_id, SessionStatus::Completed)
    }

    pub fn mark_session_failed(&self, session_db_id: i64) -> StoreResult<()> {
        self.set_session_status(session_db_id, SessionStatus::Failed)
    }

    fn set_session_status(&self, session_db_id: i64, status: SessionStatus) -> StoreResult<()> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE sessions SET status = ?1 WHERE id = ?2",
            params![status.as_str(), session_db_id],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!("session {session_db_id}")));
        }
        Ok(())
    }
}

fn row_to_session(row: &Row<'_>) -> rusqlite::Result<SessionRow> {
    let status: String = row.get(4)?;
    Ok(SessionRow {
        id: row.get(0)?,
        content_session_id: row.get(1)?,
        memory_session_id: row.get(2)?,
        project: row.get(3)?,
        status: status.parse().unwrap_or(SessionStatus::Active),
        started_at: row.get(5)?,
        user_prompt: row.get(6)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_session_idempotent() {
        let store = MemoryStore::in_memory().unwrap();
        let first = store.create_session("sess-1", "memoir", "fix the bug").unwrap();
        let second = store.create_session("sess-1", "other", "ignored").unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.project, "memoir");
        assert_eq!(second.status, SessionStatus::Active);
    }

    #[test]
    fn test_memory_session_id_assigned_once() {
        let store = MemoryStore::in_memory().unwrap();
        let session = store.create_session("sess-1", "memoir", "").unwrap();

        store.update_memory_session_id(session.id, "mem-abc").unwrap();
        // Same value is idempotent.
        store.update_memory_session_id(session.id, "mem-abc").unwrap();
        // A different value is rejected.
        let err = store.update_memory_session_id(session.id, "mem-xyz");
        assert!(matches!(err, Err(StoreError::Conflict(_))));

        let reloaded = store.get_session(session.id).unwrap();
        assert_eq!(reloaded.memory_session_id.as_deref(), Some("mem-abc"));
    }

    #[test]
    fn test_status_transitions() {
        let store = MemoryStore::in_memory().unwrap();
        let session = store.create_session("sess-1", "memoir", "").unwrap();

        store.mark_session_completed(session.id).unwrap();
        assert_eq!(store.get_session(session.id).unwrap().status, SessionStatus::Completed);

        store.mark_session_failed(session.id).unwrap();
        assert_eq!(store.get_session(session.id).unwrap().status, SessionStatus::Failed);
    }

    #[test]
    fn test_missing_session_is_not_found() {
        let store = MemoryStore::in_memory().unwrap();
        assert!(matches!(store.get_session(99), Err(StoreError::NotFound(_))));
    }
}
