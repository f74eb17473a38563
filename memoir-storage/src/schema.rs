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

//! Schema DDL and row types.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Full schema, idempotent.
pub const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS sessions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    content_session_id TEXT NOT NULL UNIQUE,
    memory_session_id TEXT,
    project TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'active',
    started_at INTEGER NOT NULL,
    user_prompt TEXT NOT NULL DEFAULT ''
);
CREATE INDEX IF NOT EXISTS idx_sessions_memory_session
    ON sessions(memory_session_id);
CREATE INDEX IF NOT EXISTS idx_sessions_project
    ON sessions(project);

CREATE TABLE IF NOT EXISTS observations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    memory_session_id TEXT NOT NULL,
    content_session_id TEXT NOT NULL DEFAULT '',
    project TEXT NOT NULL,
    kind TEXT NOT NULL DEFAULT 'discovery',
    title TEXT NOT NULL,
    subtitle TEXT,
    narrative TEXT,
    facts TEXT NOT NULL DEFAULT '[]',
    concepts TEXT NOT NULL DEFAULT '[]',
    files_read TEXT NOT NULL DEFAULT '[]',
    files_modified TEXT NOT NULL DEFAULT '[]',
    prompt_number INTEGER NOT NULL DEFAULT 0,
    created_at_epoch INTEGER NOT NULL,
    UNIQUE(memory_session_id, title, created_at_epoch)
);
CREATE INDEX IF NOT EXISTS idx_observations_project
    ON observations(project);
CREATE INDEX IF NOT EXISTS idx_observations_memory_session
    ON observations(memory_session_id);
CREATE INDEX IF NOT EXISTS idx_observations_created
    ON observations(created_at_epoch);

CREATE TABLE IF NOT EXISTS session_summaries (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    memory_session_id TEXT NOT NULL UNIQUE,
    content_session_id TEXT NOT NULL DEFAULT '',
    project TEXT NOT NULL,
    request TEXT NOT NULL DEFAULT '',
    investigated TEXT NOT NULL DEFAULT '',
    learned TEXT NOT NULL DEFAULT '',
    completed TEXT NOT NULL DEFAULT '',
    next_steps TEXT NOT NULL DEFAULT '',
    notes TEXT NOT NULL DEFAULT '',
    created_at_epoch INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_summaries_project
    ON session_summaries(project);

CREATE TABLE IF NOT EXISTS user_prompts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    content_session_id TEXT NOT NULL,
    prompt_number INTEGER NOT NULL DEFAULT 0,
    prompt_text TEXT NOT NULL,
    created_at_epoch INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_user_prompts_session
    ON user_prompts(content_session_id);

CREATE TABLE IF NOT EXISTS pending_messages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id INTEGER NOT NULL REFERENCES sessions(id),
    kind TEXT NOT NULL CHECK (kind IN ('observation', 'summarize')),
    tool_name TEXT,
    tool_input TEXT,
    tool_response TEXT,
    prompt_number INTEGER NOT NULL DEFAULT 0,
    cwd TEXT,
    last_assistant_message TEXT,
    enqueued_at INTEGER NOT NULL,
    processed_at INTEGER,
    in_flight INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_pending_session
    ON pending_messages(session_id, processed_at);
"#;

/// Session lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Completed,
    Failed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(SessionStatus::Active),
            "completed" => Ok(SessionStatus::Completed),
            "failed" => Ok(SessionStatus::Failed),
            _ => Err(()),
        }
    }
}

/// One logical conversation with the host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRow {
    pub id: i64,
    pub content_session_id: String,
    pub memory_session_id: Option<String>,
    pub project: String,
    pub status: SessionStatus,
    /// Milliseconds since epoch.
    pub started_at: i64,
    pub user_prompt: String,
}

/// Result of an insert that may have hit the dedup rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredId {
    pub id: i64,
    /// `true` when the row was newly inserted, `false` when an existing row
    /// was returned under the dedup rule.
    pub imported: bool,
}

/// One stored user prompt turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserPromptRecord {
    pub id: i64,
    pub content_session_id: String,
    pub prompt_number: i64,
    pub prompt_text: String,
    pub created_at_epoch: i64,
}

/// Per-project observation counts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectStat {
    pub project: String,
    pub observation_count: i64,
    pub session_count: i64,
}

/// Aggregate row counts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreStats {
    pub sessions: i64,
    pub observations: i64,
    pub summaries: i64,
    pub user_prompts: i64,
    pub pending_messages: i64,
}
