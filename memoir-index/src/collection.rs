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

//! Collection-service vector backend.
//!
//! Talks to an external collection service over a subprocess transport:
//! newline-delimited JSON-RPC on the child's standard streams. The service
//! embeds documents itself, so this backend only ships text and filters.
//!
//! Spawning the subprocess opens visible console windows on Windows, so the
//! backend self-disables there and every operation becomes a no-op.

use crate::document::{
    granulate_observation, granulate_summary, granulate_user_prompt, DocType, QueryFilters,
    QueryHit, VectorDocument,
};
use crate::{BackendStats, BackfillReport, IndexError, IndexResult, VectorBackend};
use async_trait::async_trait;
use memoir_core::{ObservationRecord, SummaryRecord};
use memoir_storage::{MemoryStore, UserPromptRecord};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicI64, Ordering};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const COLLECTION_NAME: &str = "memoir";

/// JSON-RPC client over a child process's stdio.
struct RpcClient {
    _child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
    next_id: u64,
}

impl RpcClient {
    async fn spawn(command: &str, args: &[String], data_dir: &PathBuf) -> IndexResult<Self> {
        let mut child = Command::new(command)
            .args(args)
            .arg("--data-dir")
            .arg(data_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| IndexError::Rpc(format!("failed to spawn {command}: {e}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| IndexError::Rpc("child stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .map(BufReader::new)
            .ok_or_else(|| IndexError::Rpc("child stdout unavailable".into()))?;

        info!(command, "collection service spawned");
        Ok(Self { _child: child, stdin, stdout, next_id: 0 })
    }

    /// One request/response exchange. Each frame is a single JSON object
    /// per line.
    async fn call(&mut self, method: &str, params: Value) -> IndexResult<Value> {
        self.next_id += 1;
        let request = json!({
            "jsonrpc": "2.0",
            "id": self.next_id,
            "method": method,
            "params": params,
        });

        let mut line = serde_json::to_string(&request)?;
        line.push('\n');
        self.stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| IndexError::Rpc(format!("write failed: {e}")))?;
        self.stdin.flush().await.map_err(|e| IndexError::Rpc(format!("flush failed: {e}")))?;

        let mut response_line = String::new();
        let read = self
            .stdout
            .read_line(&mut response_line)
            .await
            .map_err(|e| IndexError::Rpc(format!("read failed: {e}")))?;
        if read == 0 {
            return Err(IndexError::Rpc("collection service closed its stdout".into()));
        }

        let response: Value = serde_json::from_str(response_line.trim())?;
        if let Some(error) = response.get("error").filter(|e| !e.is_null()) {
            return Err(IndexError::Rpc(format!("{method} failed: {error}")));
        }
        Ok(response.get("result").cloned().unwrap_or(Value::Null))
    }
}

/// Backend speaking to an external collection service.
pub struct CollectionServiceBackend {
    command: String,
    args: Vec<String>,
    data_dir: PathBuf,
    client: Mutex<Option<RpcClient>>,
    /// Set on Windows; all operations become no-ops.
    disabled: bool,
    last_sync: AtomicI64,
}

impl CollectionServiceBackend {
    pub fn new(command: impl Into<String>, args: Vec<String>, data_dir: PathBuf) -> Self {
        let disabled = cfg!(windows);
        if disabled {
            warn!("collection service backend disabled on this platform");
        }
        Self {
            command: command.into(),
            args,
            data_dir,
            client: Mutex::new(None),
            disabled,
            last_sync: AtomicI64::new(0),
        }
    }

    /// One RPC exchange, spawning the subprocess on first use. A transport
    /// failure drops the client so the next call respawns.
    async fn call(&self, method: &str, params: Value) -> IndexResult<Value> {
        let mut guard = self.client.lock().await;
        if guard.is_none() {
            *guard = Some(RpcClient::spawn(&self.command, &self.args, &self.data_dir).await?);
        }
        let Some(client) = guard.as_mut() else {
            return Err(IndexError::Rpc("transport unavailable".into()));
        };

        match client.call(method, params).await {
            Ok(result) => Ok(result),
            Err(e) => {
                warn!(error = %e, "collection service call failed; resetting transport");
                *guard = None;
                Err(e)
            }
        }
    }

    fn document_payload(doc: &VectorDocument) -> Value {
        json!({
            "id": doc.doc_id,
            "content": doc.content,
            "metadata": {
                "sqlite_id": doc.sqlite_id,
                "doc_type": doc.doc_type.as_str(),
                "memory_session_id": doc.memory_session_id,
                "project": doc.project,
                "created_at_epoch": doc.created_at_epoch,
                "extra": doc.metadata,
            },
        })
    }

    async fn upsert_documents(&self, documents: Vec<VectorDocument>) -> IndexResult<()> {
        if self.disabled || documents.is_empty() {
            return Ok(());
        }
        let payload: Vec<Value> = documents.iter().map(Self::document_payload).collect();
        self.call(
            "documents.upsert",
            json!({ "collection": COLLECTION_NAME, "documents": payload }),
        )
        .await?;
        self.last_sync.store(memoir_core::epoch_ms(), Ordering::Relaxed);
        Ok(())
    }

    fn filters_payload(filters: &QueryFilters) -> Value {
        let mut clauses = serde_json::Map::new();
        if let Some(project) = &filters.project {
            clauses.insert("project".into(), json!(project));
        }
        if let Some(doc_type) = filters.doc_type {
            clauses.insert("doc_type".into(), json!(doc_type.as_str()));
        }
        if let Some(msid) = &filters.memory_session_id {
            clauses.insert("memory_session_id".into(), json!(msid));
        }
        if let Some(min) = filters.min_epoch {
            clauses.insert("min_epoch".into(), json!(min));
        }
        if let Some(max) = filters.max_epoch {
            clauses.insert("max_epoch".into(), json!(max));
        }
        Value::Object(clauses)
    }

    fn parse_hits(result: &Value) -> Vec<QueryHit> {
        let empty = Vec::new();
        result
            .get("hits")
            .and_then(Value::as_array)
            .unwrap_or(&empty)
            .iter()
            .filter_map(|hit| {
                let metadata = hit.get("metadata").cloned().unwrap_or(Value::Null);
                let doc_type = metadata
                    .get("doc_type")
                    .and_then(Value::as_str)
                    .and_then(|s| s.parse::<DocType>().ok())
                    .unwrap_or(DocType::Observation);
                Some(QueryHit {
                    doc_id: hit.get("id")?.as_str()?.to_string(),
                    sqlite_id: metadata.get("sqlite_id").and_then(Value::as_i64).unwrap_or(0),
                    doc_type,
                    distance: hit.get("distance").and_then(Value::as_f64).unwrap_or(1.0) as f32,
                    metadata,
                    content: hit.get("content").and_then(Value::as_str).map(str::to_string),
                })
            })
            .collect()
    }
}

#[async_trait]
impl VectorBackend for CollectionServiceBackend {
    fn name(&self) -> &str {
        "chroma"
    }

    async fn initialize(&self) -> IndexResult<()> {
        if self.disabled {
            return Ok(());
        }
        self.call("collection.create", json!({ "name": COLLECTION_NAME })).await?;
        Ok(())
    }

    async fn sync_observation(&self, observation: &ObservationRecord) -> IndexResult<()> {
        self.upsert_documents(granulate_observation(observation)).await
    }

    async fn sync_summary(&self, summary: &SummaryRecord) -> IndexResult<()> {
        self.upsert_documents(granulate_summary(summary)).await
    }

    async fn sync_user_prompt(&self, prompt: &UserPromptRecord) -> IndexResult<()> {
        self.upsert_documents(granulate_user_prompt(prompt)).await
    }

    async fn query(
        &self,
        query_text: &str,
        limit: usize,
        filters: &QueryFilters,
    ) -> IndexResult<Vec<QueryHit>> {
        if self.disabled {
            return Ok(Vec::new());
        }
        let result = self
            .call(
                "documents.query",
                json!({
                    "collection": COLLECTION_NAME,
                    "query_text": query_text,
                    "n_results": limit * 4,
                    "where": Self::filters_payload(filters),
                }),
            )
            .await?;

        let mut hits = crate::document::dedup_by_sqlite_id(Self::parse_hits(&result));
        hits.truncate(limit);
        Ok(hits)
    }

    async fn ensure_backfilled(&self, store: &MemoryStore) -> IndexResult<BackfillReport> {
        if self.disabled {
            return Ok(BackfillReport::default());
        }

        let result =
            self.call("documents.list_ids", json!({ "collection": COLLECTION_NAME })).await?;
        let existing: HashSet<String> = result
            .get("ids")
            .and_then(Value::as_array)
            .map(|ids| {
                ids.iter().filter_map(Value::as_str).map(str::to_string).collect()
            })
            .unwrap_or_default();

        let mut report = BackfillReport::default();
        let mut missing = Vec::new();

        for observation in store.all_observations()? {
            report.scanned += 1;
            missing.extend(
                granulate_observation(&observation)
                    .into_iter()
                    .filter(|d| !existing.contains(&d.doc_id)),
            );
        }
        for summary in store.all_summaries()? {
            report.scanned += 1;
            missing.extend(
                granulate_summary(&summary).into_iter().filter(|d| !existing.contains(&d.doc_id)),
            );
        }
        for prompt in store.all_user_prompts()? {
            report.scanned += 1;
            missing.extend(
                granulate_user_prompt(&prompt)
                    .into_iter()
                    .filter(|d| !existing.contains(&d.doc_id)),
            );
        }

        report.synced = missing.len();
        if !missing.is_empty() {
            debug!(missing = missing.len(), "backfilling collection service");
            self.upsert_documents(missing).await?;
        }
        Ok(report)
    }

    async fn get_stats(&self) -> IndexResult<BackendStats> {
        if self.disabled {
            return Ok(BackendStats {
                backend: "chroma (disabled)".into(),
                collection: COLLECTION_NAME.into(),
                documents: 0,
                dimensions: 0,
                last_sync_epoch: None,
            });
        }

        let result =
            self.call("collection.stats", json!({ "collection": COLLECTION_NAME })).await?;
        let last_sync = self.last_sync.load(Ordering::Relaxed);
        Ok(BackendStats {
            backend: "chroma".into(),
            collection: COLLECTION_NAME.into(),
            documents: result.get("count").and_then(Value::as_i64).unwrap_or(0),
            dimensions: result.get("dimensions").and_then(Value::as_u64).unwrap_or(0) as usize,
            last_sync_epoch: (last_sync > 0).then_some(last_sync),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc() -> VectorDocument {
        VectorDocument {
            doc_id: "obs_1_narrative".into(),
            sqlite_id: 1,
            doc_type: DocType::Observation,
            content: "text".into(),
            memory_session_id: "mem-1".into(),
            project: "memoir".into(),
            created_at_epoch: 1000,
            metadata: Value::Null,
        }
    }

    #[test]
    fn test_document_payload_shape() {
        let payload = CollectionServiceBackend::document_payload(&doc());
        assert_eq!(payload["id"], "obs_1_narrative");
        assert_eq!(payload["metadata"]["sqlite_id"], 1);
        assert_eq!(payload["metadata"]["doc_type"], "observation");
    }

    #[test]
    fn test_filters_payload_only_set_fields() {
        let filters = QueryFilters {
            project: Some("memoir".into()),
            min_epoch: Some(5),
            ..Default::default()
        };
        let payload = CollectionServiceBackend::filters_payload(&filters);
        assert_eq!(payload["project"], "memoir");
        assert_eq!(payload["min_epoch"], 5);
        assert!(payload.get("doc_type").is_none());
    }

    #[test]
    fn test_parse_hits() {
        let result = json!({
            "hits": [
                {
                    "id": "obs_3_fact_0",
                    "distance": 0.25,
                    "content": "a fact",
                    "metadata": { "sqlite_id": 3, "doc_type": "observation" }
                },
                { "bogus": true }
            ]
        });
        let hits = CollectionServiceBackend::parse_hits(&result);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].sqlite_id, 3);
        assert!((hits[0].distance - 0.25).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_upsert_empty_is_noop() {
        let backend =
            CollectionServiceBackend::new("definitely-missing-binary", vec![], PathBuf::from("."));
        // No documents, no subprocess spawn.
        backend.upsert_documents(Vec::new()).await.unwrap();
    }
}
