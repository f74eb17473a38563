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

//! The pending-message queue.
//!
//! Hook events are absorbed into this table and drained per session, in
//! enqueue order, by the single active generator. A row is claimed with an
//! in-flight marker and marked processed exactly once after its results are
//! committed; a generator crash leaves the marker set, and
//! [`MemoryStore::reset_stuck_messages`] clears it on worker start so the
//! row is re-consumed.

use crate::{MemoryStore, StoreResult};
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

/// What a pending message asks the agent to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PendingKind {
    Observation,
    Summarize,
}

impl PendingKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PendingKind::Observation => "observation",
            PendingKind::Summarize => "summarize",
        }
    }
}

/// One queued hook event awaiting processing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingMessage {
    pub id: i64,
    pub session_id: i64,
    pub kind: PendingKind,
    pub tool_name: Option<String>,
    pub tool_input: Option<Value>,
    pub tool_response: Option<Value>,
    pub prompt_number: i64,
    pub cwd: Option<String>,
    pub last_assistant_message: Option<String>,
    pub enqueued_at: i64,
    pub processed_at: Option<i64>,
}

impl MemoryStore {
    /// Append an observation message to a session's queue.
    pub fn enqueue_observation_message(
        &self,
        session_db_id: i64,
        tool_name: &str,
        tool_input: &Value,
        tool_response: &Value,
        prompt_number: i64,
        cwd: &str,
    ) -> StoreResult<i64> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO pending_messages
                 (session_id, kind, tool_name, tool_input, tool_response, prompt_number, cwd, enqueued_at)
             VALUES (?1, 'observation', ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                session_db_id,
                tool_name,
                serde_json::to_string(tool_input)?,
                serde_json::to_string(tool_response)?,
                prompt_number,
                cwd,
                memoir_core::epoch_ms(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Append a summarize message to a session's queue.
    pub fn enqueue_summary_message(
        &self,
        session_db_id: i64,
        prompt_number: i64,
        last_assistant_message: &str,
    ) -> StoreResult<i64> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO pending_messages
                 (session_id, kind, prompt_number, last_assistant_message, enqueued_at)
             VALUES (?1, 'summarize', ?2, ?3, ?4)",
            params![
                session_db_id,
                prompt_number,
                last_assistant_message,
                memoir_core::epoch_ms(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Claim the oldest unprocessed, unclaimed message for a session. The
    /// claim sets the in-flight marker; callers must follow up with
    /// [`MemoryStore::mark_processed`] once the results are committed.
    pub fn next_pending(&self, session_db_id: i64) -> StoreResult<Option<PendingMessage>> {
        let conn = self.conn()?;
        let message = conn
            .query_row(
                "SELECT id, session_id, kind, tool_name, tool_input, tool_response,
                        prompt_number, cwd, last_assistant_message, enqueued_at, processed_at
                 FROM pending_messages
                 WHERE session_id = ?1 AND processed_at IS NULL AND in_flight = 0
                 ORDER BY enqueued_at, id LIMIT 1",
                [session_db_id],
                row_to_pending,
            )
            .optional()?;

        if let Some(message) = &message {
            conn.execute(
                "UPDATE pending_messages SET in_flight = 1 WHERE id = ?1",
                [message.id],
            )?;
        }
        Ok(message)
    }

    /// Mark a message processed. Exactly-once: a processed row never
    /// transitions back.
    pub fn mark_processed(&self, message_id: i64) -> StoreResult<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE pending_messages SET processed_at = ?1, in_flight = 0
             WHERE id = ?2 AND processed_at IS NULL",
            params![memoir_core::epoch_ms(), message_id],
        )?;
        Ok(())
    }

    /// Unprocessed, unclaimed messages for a session.
    pub fn pending_count(&self, session_db_id: i64) -> StoreResult<i64> {
        let conn = self.conn()?;
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM pending_messages
             WHERE session_id = ?1 AND processed_at IS NULL AND in_flight = 0",
            [session_db_id],
            |row| row.get(0),
        )?)
    }

    /// Clear in-flight markers left behind by a crashed generator, making
    /// those rows consumable again. Run once on worker start.
    pub fn reset_stuck_messages(&self) -> StoreResult<usize> {
        let conn = self.conn()?;
        let reset = conn.execute(
            "UPDATE pending_messages SET in_flight = 0
             WHERE in_flight = 1 AND processed_at IS NULL",
            [],
        )?;
        if reset > 0 {
            debug!(reset, "stuck pending messages reset");
        }
        Ok(reset)
    }

    /// Delete processed rows older than the given epoch. Returns the count
    /// removed.
    pub fn cleanup_processed(&self, older_than_epoch_ms: i64) -> StoreResult<usize> {
        let conn = self.conn()?;
        Ok(conn.execute(
            "DELETE FROM pending_messages
             WHERE processed_at IS NOT NULL AND processed_at < ?1",
            [older_than_epoch_ms],
        )?)
    }
}

fn row_to_pending(row: &Row<'_>) -> rusqlite::Result<PendingMessage> {
    let kind: String = row.get(2)?;
    let tool_input: Option<String> = row.get(4)?;
    let tool_response: Option<String> = row.get(5)?;

    Ok(PendingMessage {
        id: row.get(0)?,
        session_id: row.get(1)?,
        kind: if kind == "summarize" { PendingKind::Summarize } else { PendingKind::Observation },
        tool_name: row.get(3)?,
        tool_input: tool_input.and_then(|s| serde_json::from_str(&s).ok()),
        tool_response: tool_response.and_then(|s| serde_json::from_str(&s).ok()),
        prompt_number: row.get(6)?,
        cwd: row.get(7)?,
        last_assistant_message: row.get(8)?,
        enqueued_at: row.get(9)?,
        processed_at: row.get(10)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store_with_session() -> (MemoryStore, i64) {
        let store = MemoryStore::in_memory().unwrap();
        let session = store.create_session("sess-1", "memoir", "").unwrap();
        (store, session.id)
    }

    #[test]
    fn test_consumed_in_enqueue_order() {
        let (store, session) = store_with_session();
        for i in 0..3 {
            store
                .enqueue_observation_message(
                    session,
                    "Read",
                    &json!({"file": format!("/tmp/{i}.rs")}),
                    &json!({"ok": true}),
                    i,
                    "/tmp",
                )
                .unwrap();
        }

        let mut seen = Vec::new();
        while let Some(message) = store.next_pending(session).unwrap() {
            seen.push(message.prompt_number);
            store.mark_processed(message.id).unwrap();
        }
        assert_eq!(seen, vec![0, 1, 2]);
    }

    #[test]
    fn test_claimed_row_not_handed_out_twice() {
        let (store, session) = store_with_session();
        store
            .enqueue_observation_message(session, "Read", &json!({}), &json!({}), 1, "/")
            .unwrap();

        let first = store.next_pending(session).unwrap();
        assert!(first.is_some());
        // Claimed but unprocessed: not visible again.
        assert!(store.next_pending(session).unwrap().is_none());
    }

    #[test]
    fn test_reset_stuck_resurrects_claimed_rows() {
        let (store, session) = store_with_session();
        store
            .enqueue_observation_message(session, "Read", &json!({}), &json!({}), 1, "/")
            .unwrap();

        let claimed = store.next_pending(session).unwrap().unwrap();
        // Simulated crash: never marked processed.
        assert_eq!(store.reset_stuck_messages().unwrap(), 1);

        let again = store.next_pending(session).unwrap().unwrap();
        assert_eq!(again.id, claimed.id);
    }

    #[test]
    fn test_summarize_message_round_trip() {
        let (store, session) = store_with_session();
        store.enqueue_summary_message(session, 3, "done").unwrap();

        let message = store.next_pending(session).unwrap().unwrap();
        assert_eq!(message.kind, PendingKind::Summarize);
        assert_eq!(message.last_assistant_message.as_deref(), Some("done"));
        assert!(message.tool_name.is_none());
    }

    #[test]
    fn test_cleanup_processed() {
        let (store, session) = store_with_session();
        store
            .enqueue_observation_message(session, "Read", &json!({}), &json!({}), 1, "/")
            .unwrap();
        let message = store.next_pending(session).unwrap().unwrap();
        store.mark_processed(message.id).unwrap();

        let removed = store.cleanup_processed(memoir_core::epoch_ms() + 1).unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.get_stats().unwrap().pending_messages, 0);
    }

    #[test]
    fn test_pending_count_excludes_claimed() {
        let (store, session) = store_with_session();
        store
            .enqueue_observation_message(session, "Read", &json!({}), &json!({}), 1, "/")
            .unwrap();
        store
            .enqueue_observation_message(session, "Read", &json!({}), &json!({}), 2, "/")
            .unwrap();
        assert_eq!(store.pending_count(session).unwrap(), 2);

        store.next_pending(session).unwrap();
        assert_eq!(store.pending_count(session).unwrap(), 1);
    }
}
