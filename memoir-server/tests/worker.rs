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

//! End-to-end worker flows against an in-process state: hook ingestion
//! through the manager and agent into the store and vector backend, and
//! the export snapshot.

use async_trait::async_trait;
use memoir_core::agent::ChatMessage;
use memoir_core::settings::{ContextSettings, FederationSettings, ReplicationSettings};
use memoir_core::Settings;
use memoir_server::agent::SessionAgent;
use memoir_server::hooks::{handle_hook, HookEvent, HookPayload};
use memoir_server::llm::{ChatOutcome, ChatProvider, ProviderError};
use memoir_server::{
    AgentFactory, ObserverRegistry, ReplicationExporter, SessionManager, WorkerState,
};
use memoir_index::{EmbeddedVecBackend, HashEmbedder, VectorBackend};
use memoir_storage::{MemoryStore, NewObservation, SessionStatus};
use std::sync::Arc;

/// Scripted provider: init acknowledgment, then one observation per tool
/// event, then a summary when asked.
struct ScriptedProvider;

#[async_trait]
impl ChatProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn chat(&self, history: &[ChatMessage]) -> Result<ChatOutcome, ProviderError> {
        let last = history.last().map(|m| m.content.as_str()).unwrap_or("");

        let content = if last.contains("<observed_from_primary_session>") {
            r#"<observation>
                <type>discovery</type>
                <title>Read a source file</title>
                <narrative>The file was inspected for context.</narrative>
                <facts><fact>The file exists</fact></facts>
                <files_read><file>/tmp/a.ts</file></files_read>
            </observation>"#
                .to_string()
        } else if last.contains("<summary>") || last.contains("The session is ending") {
            r#"<summary>
                <request>Look at the file</request>
                <completed>File inspected and captured</completed>
                <next_steps>None</next_steps>
            </summary>"#
                .to_string()
        } else {
            "READY".to_string()
        };

        Ok(ChatOutcome { content, session_id: Some("scripted-session".to_string()) })
    }
}

fn test_state(dir: &std::path::Path) -> memoir_server::SharedState {
    let store = MemoryStore::in_memory().unwrap();
    let backend: Arc<dyn VectorBackend> = Arc::new(
        EmbeddedVecBackend::open(
            &dir.join("vectors.db"),
            Arc::new(HashEmbedder::new(16)),
            FederationSettings::default(),
        )
        .unwrap(),
    );

    let factory_store = store.clone();
    let factory_backend = Arc::clone(&backend);
    let factory: AgentFactory = Arc::new(move |_session| {
        SessionAgent::new(
            factory_store.clone(),
            Arc::clone(&factory_backend),
            Arc::new(ScriptedProvider),
            None,
            ContextSettings::default(),
        )
    });
    let manager = SessionManager::new(store.clone(), factory);

    WorkerState::new(
        store,
        backend,
        manager,
        Arc::new(ObserverRegistry::new()),
        Settings::default(),
        dir.to_path_buf(),
    )
}

fn payload(json: serde_json::Value) -> HookPayload {
    serde_json::from_value(json).unwrap()
}

#[tokio::test]
async fn test_hook_pipeline_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(dir.path());
    state.backend.initialize().await.unwrap();

    let init = handle_hook(
        &state,
        "claude-code",
        HookEvent::SessionInit,
        payload(serde_json::json!({
            "session_id": "host-1",
            "project": "memoir",
            "user_prompt": "look at the file",
        })),
    )
    .await;
    assert!(init.ok);
    let session_db_id = init.session_db_id.unwrap();

    let context = handle_hook(
        &state,
        "claude-code",
        HookEvent::Context,
        payload(serde_json::json!({
            "session_id": "host-1",
            "prompt_number": 1,
            "prompt": "look at the file",
        })),
    )
    .await;
    assert!(context.ok);

    let observation = handle_hook(
        &state,
        "claude-code",
        HookEvent::Observation,
        payload(serde_json::json!({
            "session_id": "host-1",
            "toolName": "Read",
            "toolInput": { "file_path": "/tmp/a.ts" },
            "toolResponse": { "content": "export {}" },
            "prompt_number": 1,
            "cwd": "/tmp",
        })),
    )
    .await;
    assert!(observation.ok);

    let summarize = handle_hook(
        &state,
        "claude-code",
        HookEvent::Summarize,
        payload(serde_json::json!({
            "session_id": "host-1",
            "last_assistant_message": "done",
            "prompt_number": 1,
        })),
    )
    .await;
    assert!(summarize.ok);

    state.manager.wait_for_generator(session_db_id).await;

    // One observation with the file recorded, one summary, session done.
    let session = state.store.get_session(session_db_id).unwrap();
    assert_eq!(session.status, SessionStatus::Completed);
    assert_eq!(session.memory_session_id.as_deref(), Some("scripted-session"));

    let observations = state.store.all_observations().unwrap();
    assert_eq!(observations.len(), 1);
    assert_eq!(observations[0].body.files_read, vec!["/tmp/a.ts"]);

    let summary = state.store.get_summary("scripted-session").unwrap().unwrap();
    assert!(summary.body.completed.contains("captured"));

    // Vector documents: user prompt (1) + narrative + fact (2) + summary
    // fields (3). The prompt is indexed from a background task, so poll
    // briefly.
    let mut documents = 0;
    for _ in 0..100 {
        documents = state.backend.get_stats().await.unwrap().documents;
        if documents == 6 {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    assert_eq!(documents, 6);

    assert_eq!(state.store.pending_count(session_db_id).unwrap(), 0);
}

#[tokio::test]
async fn test_second_burst_after_completion_spawns_again() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(dir.path());
    state.backend.initialize().await.unwrap();

    let observation_payload = serde_json::json!({
        "session_id": "host-2",
        "toolName": "Read",
        "toolInput": {},
        "toolResponse": {},
        "prompt_number": 1,
        "cwd": "/",
    });

    let first =
        handle_hook(&state, "claude-code", HookEvent::Observation, payload(observation_payload.clone()))
            .await;
    let session_db_id = first.session_db_id.unwrap();
    state.manager.wait_for_generator(session_db_id).await;
    assert_eq!(state.manager.spawn_count(session_db_id), 1);

    handle_hook(&state, "claude-code", HookEvent::Observation, payload(observation_payload)).await;
    state.manager.wait_for_generator(session_db_id).await;
    assert_eq!(state.manager.spawn_count(session_db_id), 2);
    assert_eq!(state.store.pending_count(session_db_id).unwrap(), 0);
}

#[tokio::test]
async fn test_export_snapshot_carries_all_documents() {
    let dir = tempfile::tempdir().unwrap();
    let vectors_path = dir.path().join("vectors.db");

    // Ten observations synced into the embedded backend.
    let store = MemoryStore::in_memory().unwrap();
    let backend = EmbeddedVecBackend::open(
        &vectors_path,
        Arc::new(HashEmbedder::new(16)),
        FederationSettings::default(),
    )
    .unwrap();
    backend.initialize().await.unwrap();

    for i in 0..10 {
        let stored = store
            .store_observations(&[NewObservation {
                memory_session_id: "mem-1".into(),
                content_session_id: "sess-1".into(),
                project: "memoir".into(),
                body: memoir_core::ParsedObservation {
                    title: format!("observation {i}"),
                    narrative: Some(format!("narrative {i}")),
                    ..Default::default()
                },
                prompt_number: i,
                created_at_epoch: 1000 + i,
            }])
            .unwrap();
        assert!(stored[0].imported);
    }
    let report = backend.ensure_backfilled(&store).await.unwrap();
    assert_eq!(report.synced, 10);

    // Snapshot into a replication workspace.
    let exporter = ReplicationExporter::new(
        dir.path().join("export"),
        ReplicationSettings::default(),
    );
    let report = exporter.export_snapshot(Some(&vectors_path), None).unwrap();
    assert!(report.files.contains(&"vectors.db".to_string()));

    let exported = dir.path().join("export/vectors.db");
    assert!(exported.metadata().unwrap().len() > 0);
    assert!(dir.path().join("export/metadata.json").exists());

    // The exported file is a complete vector store: all ten documents.
    let reopened = EmbeddedVecBackend::open(
        &exported,
        Arc::new(HashEmbedder::new(16)),
        FederationSettings::default(),
    )
    .unwrap();
    assert_eq!(reopened.get_stats().await.unwrap().documents, 10);
}
