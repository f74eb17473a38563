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

//! Hook ingestion.
//!
//! The host invokes a hook executable with a JSON event on stdin; the hook
//! posts it to `POST /hooks/{platform}/{event}` and exits 0 promptly. Five
//! events exist: `session-init`, `context` (user prompt submit),
//! `observation` (tool executed), `file-edit`, and `summarize` (stop).
//!
//! Ingestion never pushes back: the pending-message table absorbs bursts
//! and the manager's dedup guard keeps one generator per session draining
//! it. Handlers answer 200 even when processing fails, because a hook must
//! never disrupt the host.

use crate::state::SharedState;
use memoir_index::VectorBackend;
use memoir_storage::SessionRow;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{info, warn};

/// Hook event names in the URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookEvent {
    SessionInit,
    Context,
    Observation,
    FileEdit,
    Summarize,
}

impl HookEvent {
    pub fn parse(event: &str) -> Option<Self> {
        match event {
            "session-init" => Some(HookEvent::SessionInit),
            "context" => Some(HookEvent::Context),
            "observation" => Some(HookEvent::Observation),
            "file-edit" => Some(HookEvent::FileEdit),
            "summarize" => Some(HookEvent::Summarize),
            _ => None,
        }
    }
}

/// Platform-normalized hook payload. Hosts differ only in field spelling;
/// the serde aliases absorb the known variants.
#[derive(Debug, Clone, Deserialize)]
pub struct HookPayload {
    #[serde(alias = "sessionId", alias = "session_id")]
    pub session_id: String,
    #[serde(default)]
    pub project: Option<String>,
    #[serde(default, alias = "prompt", alias = "prompt_text")]
    pub user_prompt: Option<String>,
    #[serde(default, alias = "promptNumber")]
    pub prompt_number: Option<i64>,
    #[serde(default, alias = "toolName", alias = "tool")]
    pub tool_name: Option<String>,
    #[serde(default, alias = "toolInput")]
    pub tool_input: Option<Value>,
    #[serde(default, alias = "toolResponse", alias = "tool_output")]
    pub tool_response: Option<Value>,
    #[serde(default, alias = "filePath")]
    pub file_path: Option<String>,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default, alias = "lastAssistantMessage")]
    pub last_assistant_message: Option<String>,
}

/// The small envelope every hook call gets back.
#[derive(Debug, Serialize)]
pub struct HookResult {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_db_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queued: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl HookResult {
    fn ok(session_db_id: i64, queued: Option<i64>) -> Self {
        Self { ok: true, session_db_id: Some(session_db_id), queued, error: None }
    }

    fn error(error: String) -> Self {
        Self { ok: false, session_db_id: None, queued: None, error: Some(error) }
    }
}

/// Dispatch one hook event. Infallible by contract: failures come back as
/// `ok = false` in a 200 response and are logged here.
pub async fn handle_hook(
    state: &SharedState,
    platform: &str,
    event: HookEvent,
    payload: HookPayload,
) -> HookResult {
    match dispatch(state, platform, event, payload).await {
        Ok(result) => result,
        Err(e) => {
            warn!(platform, ?event, error = %e, "hook processing failed");
            HookResult::error(e.to_string())
        }
    }
}

async fn dispatch(
    state: &SharedState,
    platform: &str,
    event: HookEvent,
    payload: HookPayload,
) -> anyhow::Result<HookResult> {
    let session = lookup_or_create_session(state, &payload)?;

    match event {
        HookEvent::SessionInit => {
            info!(platform, content_session_id = %session.content_session_id, "session initialized");
            Ok(HookResult::ok(session.id, None))
        }

        HookEvent::Context => {
            let prompt_number = payload.prompt_number.unwrap_or(0);
            let text = payload.user_prompt.unwrap_or_default();
            let record =
                state.store.store_user_prompt(&session.content_session_id, prompt_number, &text)?;

            // Index the prompt directly; prompts never pass through the
            // extractor.
            let backend = Arc::clone(&state.backend);
            tokio::spawn(async move {
                if let Err(e) = backend.sync_user_prompt(&record).await {
                    warn!(error = %e, "user prompt vector sync failed");
                }
            });
            Ok(HookResult::ok(session.id, None))
        }

        HookEvent::Observation => {
            let queued = state.store.enqueue_observation_message(
                session.id,
                payload.tool_name.as_deref().unwrap_or("unknown"),
                payload.tool_input.as_ref().unwrap_or(&Value::Null),
                payload.tool_response.as_ref().unwrap_or(&Value::Null),
                payload.prompt_number.unwrap_or(0),
                payload.cwd.as_deref().unwrap_or(""),
            )?;
            state.manager.ensure_generator(&session);
            Ok(HookResult::ok(session.id, Some(queued)))
        }

        HookEvent::FileEdit => {
            // Normalized into an observation message with a synthetic Edit
            // invocation.
            let input = serde_json::json!({ "file_path": payload.file_path });
            let queued = state.store.enqueue_observation_message(
                session.id,
                payload.tool_name.as_deref().unwrap_or("Edit"),
                &input,
                payload.tool_response.as_ref().unwrap_or(&Value::Null),
                payload.prompt_number.unwrap_or(0),
                payload.cwd.as_deref().unwrap_or(""),
            )?;
            state.manager.ensure_generator(&session);
            Ok(HookResult::ok(session.id, Some(queued)))
        }

        HookEvent::Summarize => {
            let queued = state.store.enqueue_summary_message(
                session.id,
                payload.prompt_number.unwrap_or(0),
                payload.last_assistant_message.as_deref().unwrap_or(""),
            )?;
            state.manager.ensure_generator(&session);
            Ok(HookResult::ok(session.id, Some(queued)))
        }
    }
}

fn lookup_or_create_session(
    state: &SharedState,
    payload: &HookPayload,
) -> anyhow::Result<SessionRow> {
    let project = payload
        .project
        .clone()
        .or_else(|| {
            payload
                .cwd
                .as_deref()
                .and_then(|cwd| std::path::Path::new(cwd).file_name())
                .map(|name| name.to_string_lossy().to_string())
        })
        .unwrap_or_else(|| "unknown".to_string());

    Ok(state.store.create_session(
        &payload.session_id,
        &project,
        payload.user_prompt.as_deref().unwrap_or(""),
    )?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_parsing() {
        assert_eq!(HookEvent::parse("session-init"), Some(HookEvent::SessionInit));
        assert_eq!(HookEvent::parse("observation"), Some(HookEvent::Observation));
        assert_eq!(HookEvent::parse("summarize"), Some(HookEvent::Summarize));
        assert_eq!(HookEvent::parse("bogus"), None);
    }

    #[test]
    fn test_payload_aliases() {
        let payload: HookPayload = serde_json::from_str(
            r#"{ "sessionId": "s1", "toolName": "Read", "promptNumber": 3 }"#,
        )
        .unwrap();
        assert_eq!(payload.session_id, "s1");
        assert_eq!(payload.tool_name.as_deref(), Some("Read"));
        assert_eq!(payload.prompt_number, Some(3));
    }

    #[test]
    fn test_result_envelope_shape() {
        let ok = serde_json::to_value(HookResult::ok(1, Some(2))).unwrap();
        assert_eq!(ok["ok"], true);
        assert_eq!(ok["queued"], 2);
        assert!(ok.get("error").is_none());

        let err = serde_json::to_value(HookResult::error("nope".into())).unwrap();
        assert_eq!(err["ok"], false);
        assert_eq!(err["error"], "nope");
    }
}
