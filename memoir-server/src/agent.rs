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

//! The per-session extractor agent.
//!
//! A state machine driving the extractor LLM through a continuing
//! conversation:
//!
//! ```text
//! Initializing -> RunningInit -> Draining -> Summarizing -> Done
//!                      |             |            |
//!                      +------- Aborted / Failed -+
//! ```
//!
//! Each pending message becomes one LLM turn; parsed observations are
//! written through the store first (to obtain row ids) and then synced to
//! the vector backend best-effort. The memory session id is persisted
//! before any observation is written.

use crate::llm::{ChatOutcome, ChatProvider, ProviderError};
use memoir_core::agent::{
    build_init_prompt, build_observation_prompt, build_summary_prompt, ConversationHistory,
};
use memoir_core::settings::ContextSettings;
use memoir_core::{ObservationParser, ObservationRecord, SummaryParser, SummaryRecord};
use memoir_index::VectorBackend;
use memoir_storage::{
    MemoryStore, NewObservation, NewSummary, PendingKind, PendingMessage, SessionRow, StoreError,
};
use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Session agent lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    Initializing,
    RunningInit,
    Draining,
    Summarizing,
    Done,
    Aborted,
    Failed,
}

/// Errors terminating a session run.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("session aborted")]
    Aborted,

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// One session's extractor agent.
pub struct SessionAgent {
    store: MemoryStore,
    backend: Arc<dyn VectorBackend>,
    primary: Arc<dyn ChatProvider>,
    fallback: Option<Arc<dyn ChatProvider>>,
    context: ContextSettings,
    state: Mutex<AgentState>,
}

impl SessionAgent {
    pub fn new(
        store: MemoryStore,
        backend: Arc<dyn VectorBackend>,
        primary: Arc<dyn ChatProvider>,
        fallback: Option<Arc<dyn ChatProvider>>,
        context: ContextSettings,
    ) -> Self {
        Self {
            store,
            backend,
            primary,
            fallback,
            context,
            state: Mutex::new(AgentState::Initializing),
        }
    }

    pub fn state(&self) -> AgentState {
        *self.state.lock()
    }

    fn set_state(&self, state: AgentState) {
        *self.state.lock() = state;
    }

    /// Run the session to completion (queue drained or summarized).
    /// Cancellation aborts the in-flight LLM call and stops the message
    /// iteration at the next boundary.
    pub async fn start_session(
        &self,
        session: &SessionRow,
        cancel: CancellationToken,
    ) -> Result<(), AgentError> {
        let result = self.run(session, &cancel).await;
        match &result {
            Ok(()) => {}
            Err(AgentError::Aborted) => {
                self.set_state(AgentState::Aborted);
                info!(session_db_id = session.id, "session aborted");
            }
            Err(e) => {
                self.set_state(AgentState::Failed);
                warn!(session_db_id = session.id, error = %e, "session failed");
                if let Err(mark) = self.store.mark_session_failed(session.id) {
                    warn!(session_db_id = session.id, error = %mark, "failed to mark session");
                }
            }
        }
        result
    }

    async fn run(
        &self,
        session: &SessionRow,
        cancel: &CancellationToken,
    ) -> Result<(), AgentError> {
        self.set_state(AgentState::Initializing);

        // Re-read the row: an earlier generator may have fixed the memory
        // session id after the caller's copy was taken.
        let session = self.store.get_session(session.id)?;

        // The active provider may switch to the fallback mid-session; the
        // conversation history travels with it.
        let mut provider = Arc::clone(&self.primary);
        let mut fallback = self.fallback.clone();

        let mut history =
            ConversationHistory::new(self.context.max_context_messages, self.context.max_tokens);
        history.add_system(build_init_prompt(
            &session.project,
            &session.content_session_id,
            &session.user_prompt,
        ));
        history.add_user(
            "The session is starting. Acknowledge and wait for the first tool invocation.",
        );

        self.set_state(AgentState::RunningInit);
        let outcome = self.call_llm(&mut provider, &mut fallback, &history, cancel).await?;
        history.add_assistant(&outcome.content);

        // The memory session id is fixed before any observation is written.
        let memory_session_id = match &session.memory_session_id {
            Some(existing) => existing.clone(),
            None => {
                let id = outcome
                    .session_id
                    .clone()
                    .unwrap_or_else(|| {
                        format!("{}-{}", provider.name(), session.content_session_id)
                    });
                self.store.update_memory_session_id(session.id, &id)?;
                id
            }
        };

        self.set_state(AgentState::Draining);
        loop {
            if cancel.is_cancelled() {
                return Err(AgentError::Aborted);
            }
            let message = match self.store.next_pending(session.id)? {
                Some(message) => message,
                None => break,
            };

            match message.kind {
                PendingKind::Observation => {
                    self.process_observation(
                        &session,
                        &memory_session_id,
                        &message,
                        &mut history,
                        &mut provider,
                        &mut fallback,
                        cancel,
                    )
                    .await?;
                }
                PendingKind::Summarize => {
                    self.set_state(AgentState::Summarizing);
                    self.process_summary(
                        &session,
                        &memory_session_id,
                        &message,
                        &mut history,
                        &mut provider,
                        &mut fallback,
                        cancel,
                    )
                    .await?;
                    self.store.mark_session_completed(session.id)?;
                    self.set_state(AgentState::Done);
                    return Ok(());
                }
            }
        }

        self.set_state(AgentState::Done);
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn process_observation(
        &self,
        session: &SessionRow,
        memory_session_id: &str,
        message: &PendingMessage,
        history: &mut ConversationHistory,
        provider: &mut Arc<dyn ChatProvider>,
        fallback: &mut Option<Arc<dyn ChatProvider>>,
        cancel: &CancellationToken,
    ) -> Result<(), AgentError> {
        let tool_input = message
            .tool_input
            .as_ref()
            .map(|v| serde_json::to_string_pretty(v).unwrap_or_default())
            .unwrap_or_default();
        let tool_response = message
            .tool_response
            .as_ref()
            .map(|v| serde_json::to_string_pretty(v).unwrap_or_default())
            .unwrap_or_default();

        let prompt = build_observation_prompt(
            message.tool_name.as_deref().unwrap_or("unknown"),
            &tool_input,
            &tool_response,
            message.cwd.as_deref().unwrap_or(""),
        );
        history.add_user(prompt);
        let dropped = history.truncate_to_limits();
        if dropped > 0 {
            debug!(session_db_id = session.id, dropped, "history truncated");
        }

        let outcome = self.call_llm(provider, fallback, history, cancel).await?;
        history.add_assistant(&outcome.content);

        let parsed = ObservationParser::parse_all(&outcome.content);
        if parsed.is_empty() {
            debug!(
                session_db_id = session.id,
                tool = message.tool_name.as_deref().unwrap_or(""),
                "no observations extracted"
            );
        }

        let now = memoir_core::epoch_ms();
        let batch: Vec<NewObservation> = parsed
            .into_iter()
            .map(|body| NewObservation {
                memory_session_id: memory_session_id.to_string(),
                content_session_id: session.content_session_id.clone(),
                project: session.project.clone(),
                body,
                prompt_number: message.prompt_number,
                created_at_epoch: now,
            })
            .collect();

        let stored = self.store.store_observations(&batch)?;
        for (stored_id, new_obs) in stored.iter().zip(batch) {
            if !stored_id.imported {
                continue; // duplicate rows were already indexed
            }
            let record = ObservationRecord {
                id: stored_id.id,
                memory_session_id: new_obs.memory_session_id,
                content_session_id: new_obs.content_session_id,
                project: new_obs.project,
                body: new_obs.body,
                prompt_number: new_obs.prompt_number,
                created_at_epoch: new_obs.created_at_epoch,
            };
            if let Err(e) = self.backend.sync_observation(&record).await {
                warn!(observation_id = record.id, error = %e, "vector sync failed; backfill will reconcile");
            }
        }

        self.store.mark_processed(message.id)?;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn process_summary(
        &self,
        session: &SessionRow,
        memory_session_id: &str,
        message: &PendingMessage,
        history: &mut ConversationHistory,
        provider: &mut Arc<dyn ChatProvider>,
        fallback: &mut Option<Arc<dyn ChatProvider>>,
        cancel: &CancellationToken,
    ) -> Result<(), AgentError> {
        let prompt = build_summary_prompt(
            &session.user_prompt,
            message.last_assistant_message.as_deref().unwrap_or(""),
        );
        history.add_user(prompt);
        history.truncate_to_limits();

        let outcome = self.call_llm(provider, fallback, history, cancel).await?;
        history.add_assistant(&outcome.content);

        let body = SummaryParser::parse(&outcome.content);
        let now = memoir_core::epoch_ms();
        let stored = self.store.store_summary(&NewSummary {
            memory_session_id: memory_session_id.to_string(),
            content_session_id: session.content_session_id.clone(),
            project: session.project.clone(),
            body: body.clone(),
            created_at_epoch: now,
        })?;

        let record = SummaryRecord {
            id: stored.id,
            memory_session_id: memory_session_id.to_string(),
            content_session_id: session.content_session_id.clone(),
            project: session.project.clone(),
            body,
            created_at_epoch: now,
        };
        if let Err(e) = self.backend.sync_summary(&record).await {
            warn!(summary_id = record.id, error = %e, "vector sync failed; backfill will reconcile");
        }

        self.store.mark_processed(message.id)?;
        info!(session_db_id = session.id, "session summarized");
        Ok(())
    }

    /// One LLM call under cancellation. A transient connectivity failure
    /// hands the session off to the fallback provider (once), carrying the
    /// existing history; observations already committed stay committed. A
    /// 4xx is surfaced as-is.
    async fn call_llm(
        &self,
        provider: &mut Arc<dyn ChatProvider>,
        fallback: &mut Option<Arc<dyn ChatProvider>>,
        history: &ConversationHistory,
        cancel: &CancellationToken,
    ) -> Result<ChatOutcome, AgentError> {
        loop {
            let outcome = tokio::select! {
                _ = cancel.cancelled() => return Err(AgentError::Aborted),
                outcome = provider.chat(history.messages()) => outcome,
            };

            match outcome {
                Ok(outcome) => return Ok(outcome),
                Err(e) if e.is_transient() => match fallback.take() {
                    Some(next) => {
                        warn!(
                            from = provider.name(),
                            to = next.name(),
                            error = %e,
                            "transient provider failure; handing off to fallback"
                        );
                        *provider = next;
                    }
                    None => return Err(e.into()),
                },
                Err(e) => return Err(e.into()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::testing::{MockProvider, MockTurn};
    use memoir_core::settings::FederationSettings;
    use memoir_index::{DisabledBackend, EmbeddedVecBackend, HashEmbedder};
    use memoir_storage::SessionStatus;
    use serde_json::json;

    const OBSERVATION_XML: &str = r#"<observation>
        <type>discovery</type>
        <title>Read the failing module</title>
        <narrative>The module reads config lazily.</narrative>
        <facts><fact>Config is read on first use</fact></facts>
        <files_read><file>/tmp/a.ts</file></files_read>
    </observation>"#;

    const SUMMARY_XML: &str = r#"<summary>
        <request>Investigate the module</request>
        <completed>Found the lazy config read</completed>
        <next_steps>None</next_steps>
    </summary>"#;

    fn scripted_provider() -> Arc<MockProvider> {
        Arc::new(MockProvider::new(
            "mock",
            vec![
                MockTurn::ReplyWithSession("READY".into(), "mock-sess-1".into()),
                MockTurn::Reply(OBSERVATION_XML.into()),
                MockTurn::Reply(SUMMARY_XML.into()),
            ],
        ))
    }

    fn enqueue_scenario(store: &MemoryStore) -> SessionRow {
        let session = store.create_session("sess-1", "memoir", "investigate").unwrap();
        store
            .enqueue_observation_message(
                session.id,
                "Read",
                &json!({"file_path": "/tmp/a.ts"}),
                &json!({"content": "export const x = 1"}),
                1,
                "/tmp",
            )
            .unwrap();
        store.enqueue_summary_message(session.id, 1, "done").unwrap();
        session
    }

    #[tokio::test]
    async fn test_init_observation_summary_scenario() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::in_memory().unwrap();
        let backend = Arc::new(
            EmbeddedVecBackend::open(
                &dir.path().join("vectors.db"),
                Arc::new(HashEmbedder::new(16)),
                FederationSettings::default(),
            )
            .unwrap(),
        );
        backend.initialize().await.unwrap();

        let session = enqueue_scenario(&store);
        let agent = SessionAgent::new(
            store.clone(),
            backend.clone(),
            scripted_provider(),
            None,
            ContextSettings::default(),
        );

        agent.start_session(&session, CancellationToken::new()).await.unwrap();
        assert_eq!(agent.state(), AgentState::Done);

        // Memory session id came from the provider, persisted before the
        // observation was written.
        let session = store.get_session(session.id).unwrap();
        assert_eq!(session.memory_session_id.as_deref(), Some("mock-sess-1"));
        assert_eq!(session.status, SessionStatus::Completed);

        let observations = store.all_observations().unwrap();
        assert_eq!(observations.len(), 1);
        assert_eq!(observations[0].body.kind, memoir_core::ObservationKind::Discovery);
        assert_eq!(observations[0].body.files_read, vec!["/tmp/a.ts"]);

        let summary = store.get_summary("mock-sess-1").unwrap().unwrap();
        assert!(!summary.body.completed.is_empty());

        // Vector documents: narrative + 1 fact + 3 non-empty summary fields.
        let stats = backend.get_stats().await.unwrap();
        assert_eq!(stats.documents, 5);

        // Queue fully drained.
        assert_eq!(store.pending_count(session.id).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_connectivity_loss_hands_off_to_fallback() {
        let store = MemoryStore::in_memory().unwrap();
        let session = enqueue_scenario(&store);

        let primary = Arc::new(MockProvider::always("primary", MockTurn::ConnectError));
        let fallback = scripted_provider();

        let agent = SessionAgent::new(
            store.clone(),
            Arc::new(DisabledBackend),
            primary.clone(),
            Some(fallback.clone()),
            ContextSettings::default(),
        );

        agent.start_session(&session, CancellationToken::new()).await.unwrap();

        // Primary was tried, the fallback finished the session.
        assert_eq!(primary.call_count(), 1);
        assert!(fallback.call_count() >= 3);
        assert_eq!(
            store.get_session(session.id).unwrap().status,
            SessionStatus::Completed
        );
    }

    #[tokio::test]
    async fn test_4xx_does_not_invoke_fallback() {
        let store = MemoryStore::in_memory().unwrap();
        let session = enqueue_scenario(&store);

        let primary = Arc::new(MockProvider::always("primary", MockTurn::HttpError(400)));
        let fallback = scripted_provider();

        let agent = SessionAgent::new(
            store.clone(),
            Arc::new(DisabledBackend),
            primary.clone(),
            Some(fallback.clone()),
            ContextSettings::default(),
        );

        let result = agent.start_session(&session, CancellationToken::new()).await;
        assert!(matches!(
            result,
            Err(AgentError::Provider(ProviderError::Status { status: 400, .. }))
        ));
        assert_eq!(fallback.call_count(), 0);
        assert_eq!(agent.state(), AgentState::Failed);
        assert_eq!(store.get_session(session.id).unwrap().status, SessionStatus::Failed);
    }

    #[tokio::test]
    async fn test_cancelled_session_aborts_without_failing() {
        let store = MemoryStore::in_memory().unwrap();
        let session = enqueue_scenario(&store);

        let agent = SessionAgent::new(
            store.clone(),
            Arc::new(DisabledBackend),
            scripted_provider(),
            None,
            ContextSettings::default(),
        );

        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = agent.start_session(&session, cancel).await;
        assert!(matches!(result, Err(AgentError::Aborted)));
        assert_eq!(agent.state(), AgentState::Aborted);
        // Aborted is not failed.
        assert_eq!(store.get_session(session.id).unwrap().status, SessionStatus::Active);
    }

    #[tokio::test]
    async fn test_no_observation_response_is_valid() {
        let store = MemoryStore::in_memory().unwrap();
        let session = store.create_session("sess-1", "memoir", "look around").unwrap();
        store
            .enqueue_observation_message(session.id, "Read", &json!({}), &json!({}), 1, "/")
            .unwrap();

        let provider = Arc::new(MockProvider::new(
            "mock",
            vec![
                MockTurn::Reply("READY".into()),
                MockTurn::Reply("Nothing worth recording here.".into()),
            ],
        ));
        let agent = SessionAgent::new(
            store.clone(),
            Arc::new(DisabledBackend),
            provider,
            None,
            ContextSettings::default(),
        );

        agent.start_session(&session, CancellationToken::new()).await.unwrap();
        assert_eq!(store.all_observations().unwrap().len(), 0);
        assert_eq!(store.pending_count(session.id).unwrap(), 0);
        // Drained without a summarize: session stays active for resumption.
        assert_eq!(store.get_session(session.id).unwrap().status, SessionStatus::Active);

        // Synthesized memory session id: "<provider>-<content_session_id>".
        let session = store.get_session(session.id).unwrap();
        assert_eq!(session.memory_session_id.as_deref(), Some("mock-sess-1"));
    }
}
