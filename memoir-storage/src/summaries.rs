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

//! Session-summary and user-prompt operations.
//!
//! At most one summary exists per `memory_session_id`; storing a second one
//! for the same session replaces its fields and reports `imported = false`.

use crate::schema::{StoredId, UserPromptRecord};
use crate::{MemoryStore, StoreResult};
use memoir_core::{ParsedSummary, SummaryRecord};
use rusqlite::{params, OptionalExtension, Row};

/// A new summary ready for insertion.
#[derive(Debug, Clone)]
pub struct NewSummary {
    pub memory_session_id: String,
    pub content_session_id: String,
    pub project: String,
    pub body: ParsedSummary,
    pub created_at_epoch: i64,
}

const SUMMARY_COLUMNS: &str = "id, memory_session_id, content_session_id, project, request, \
     investigated, learned, completed, next_steps, notes, created_at_epoch";

impl MemoryStore {
    /// Insert or replace the summary for a memory session.
    pub fn store_summary(&self, summary: &NewSummary) -> StoreResult<StoredId> {
        let conn = self.conn()?;
        let existing: Option<i64> = conn
            .query_row(
                "SELECT id FROM session_summaries WHERE memory_session_id = ?1",
                [&summary.memory_session_id],
                |row| row.get(0),
            )
            .optional()?;

        match existing {
            Some(id) => {
                conn.execute(
                    "UPDATE session_summaries
                     SET request = ?1, investigated = ?2, learned = ?3, completed = ?4,
                         next_steps = ?5, notes = ?6, created_at_epoch = ?7
                     WHERE id = ?8",
                    params![
                        summary.body.request,
                        summary.body.investigated,
                        summary.body.learned,
                        summary.body.completed,
                        summary.body.next_steps,
                        summary.body.notes,
                        summary.created_at_epoch,
                        id,
                    ],
                )?;
                Ok(StoredId { id, imported: false })
            }
            None => {
                conn.execute(
                    "INSERT INTO session_summaries
                         (memory_session_id, content_session_id, project, request, investigated,
                          learned, completed, next_steps, notes, created_at_epoch)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                    params![
                        summary.memory_session_id,
                        summary.content_session_id,
                        summary.project,
                        summary.body.request,
                        summary.body.investigated,
                        summary.body.learned,
                        summary.body.completed,
                        summary.body.next_steps,
                        summary.body.notes,
                        summary.created_at_epoch,
                    ],
                )?;
                Ok(StoredId { id: conn.last_insert_rowid(), imported: true })
            }
        }
    }

    /// Fetch the summary for a memory session, if any.
    pub fn get_summary(&self, memory_session_id: &str) -> StoreResult<Option<SummaryRecord>> {
        let conn = self.conn()?;
        Ok(conn
            .query_row(
                &format!(
                    "SELECT {SUMMARY_COLUMNS} FROM session_summaries WHERE memory_session_id = ?1"
                ),
                [memory_session_id],
                row_to_summary,
            )
            .optional()?)
    }

    /// Every summary, oldest first. Used by the backfill pass.
    pub fn all_summaries(&self) -> StoreResult<Vec<SummaryRecord>> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare(&format!("SELECT {SUMMARY_COLUMNS} FROM session_summaries ORDER BY id"))?;
        let rows = stmt
            .query_map([], row_to_summary)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Record one user prompt turn for searchability.
    pub fn store_user_prompt(
        &self,
        content_session_id: &str,
        prompt_number: i64,
        prompt_text: &str,
    ) -> StoreResult<UserPromptRecord> {
        let conn = self.conn()?;
        let created_at_epoch = memoir_core::epoch_ms();
        conn.execute(
            "INSERT INTO user_prompts (content_session_id, prompt_number, prompt_text, created_at_epoch)
             VALUES (?1, ?2, ?3, ?4)",
            params![content_session_id, prompt_number, prompt_text, created_at_epoch],
        )?;
        Ok(UserPromptRecord {
            id: conn.last_insert_rowid(),
            content_session_id: content_session_id.to_string(),
            prompt_number,
            prompt_text: prompt_text.to_string(),
            created_at_epoch,
        })
    }

    /// Every user prompt, oldest first. Used by the backfill pass.
    pub fn all_user_prompts(&self) -> StoreResult<Vec<UserPromptRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, content_session_id, prompt_number, prompt_text, created_at_epoch
             FROM user_prompts ORDER BY id",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok(UserPromptRecord {
                    id: row.get(0)?,
                    content_session_id: row.get(1)?,
                    prompt_number: row.get(2)?,
                    prompt_text: row.get(3)?,
                    created_at_epoch: row.get(4)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}

fn row_to_summary(row: &Row<'_>) -> rusqlite::Result<SummaryRecord> {
    Ok(SummaryRecord {
        id: row.get(0)?,
        memory_session_id: row.get(1)?,
        content_session_id: row.get(2)?,
        project: row.get(3)?,
        body: ParsedSummary {
            request: row.get(4)?,
            investigated: row.get(5)?,
            learned: row.get(6)?,
            completed: row.get(7)?,
            next_steps: row.get(8)?,
            notes: row.get(9)?,
        },
        created_at_epoch: row.get(10)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_summary(msid: &str) -> NewSummary {
        NewSummary {
            memory_session_id: msid.into(),
            content_session_id: "sess-1".into(),
            project: "memoir".into(),
            body: ParsedSummary {
                request: "fix it".into(),
                completed: "fixed".into(),
                ..Default::default()
            },
            created_at_epoch: 1000,
        }
    }

    #[test]
    fn test_one_summary_per_memory_session() {
        let store = MemoryStore::in_memory().unwrap();

        let first = store.store_summary(&new_summary("mem-1")).unwrap();
        assert!(first.imported);

        let mut replacement = new_summary("mem-1");
        replacement.body.completed = "re-fixed".into();
        let second = store.store_summary(&replacement).unwrap();
        assert!(!second.imported);
        assert_eq!(first.id, second.id);

        let loaded = store.get_summary("mem-1").unwrap().unwrap();
        assert_eq!(loaded.body.completed, "re-fixed");
    }

    #[test]
    fn test_user_prompts_round_trip() {
        let store = MemoryStore::in_memory().unwrap();
        store.store_user_prompt("sess-1", 1, "first prompt").unwrap();
        store.store_user_prompt("sess-1", 2, "second prompt").unwrap();

        let prompts = store.all_user_prompts().unwrap();
        assert_eq!(prompts.len(), 2);
        assert_eq!(prompts[0].prompt_number, 1);
        assert_eq!(prompts[1].prompt_text, "second prompt");
    }
}
