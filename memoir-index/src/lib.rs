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

//! Memoir vector indexing layer.
//!
//! A backend-agnostic [`VectorBackend`] abstraction with three variants:
//!
//! - [`embedded::EmbeddedVecBackend`]: a local SQLite file with an ANN
//!   virtual index when the vector extension loads, brute-force cosine
//!   fallback when it does not.
//! - [`collection::CollectionServiceBackend`]: an external collection
//!   service reached over a subprocess JSON-RPC transport; the service
//!   embeds internally.
//! - [`DisabledBackend`]: explicit no-ops.
//!
//! Optional capabilities (document deletion, remote attach, federated
//! query) are separate traits discovered through accessor methods, so a
//! caller never probes for optionally-present methods on the primary
//! interface.

pub mod collection;
pub mod document;
pub mod embedded;
pub mod embedder;
pub mod federation;

pub use collection::CollectionServiceBackend;
pub use document::{granulate_observation, granulate_summary, granulate_user_prompt};
pub use document::{DocType, QueryFilters, QueryHit, VectorDocument};
pub use embedded::EmbeddedVecBackend;
pub use embedder::{Embedding, EmbeddingProvider, HashEmbedder, OpenAiCompatEmbedder};
pub use federation::{validate_federation_config, FederationSource, FederationWeights};

use async_trait::async_trait;
use memoir_core::{ObservationRecord, SummaryRecord};
use memoir_storage::{MemoryStore, UserPromptRecord};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Errors produced by the indexing layer.
#[derive(Debug, Error)]
pub enum IndexError {
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("embedding provider error: {0}")]
    Embedding(String),

    #[error("collection service error: {0}")]
    Rpc(String),

    #[error("federation config error: {0}")]
    Federation(String),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error(transparent)]
    Store(#[from] memoir_storage::StoreError),

    #[error(transparent)]
    Core(#[from] memoir_core::CoreError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type IndexResult<T> = Result<T, IndexError>;

/// Backend identity and document counts for the stats endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendStats {
    pub backend: String,
    pub collection: String,
    pub documents: i64,
    pub dimensions: usize,
    /// Milliseconds since epoch of the last successful sync, if any.
    pub last_sync_epoch: Option<i64>,
}

/// Result of a backfill pass.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackfillReport {
    /// Store rows examined.
    pub scanned: usize,
    /// Documents written because they were missing.
    pub synced: usize,
}

/// The contract every vector backend satisfies.
#[async_trait]
pub trait VectorBackend: Send + Sync {
    /// Name for logs and stats.
    fn name(&self) -> &str;

    /// Create required schema or collections. Tolerates an uninitialized
    /// backing store and repeated calls.
    async fn initialize(&self) -> IndexResult<()>;

    /// Split an observation into documents per the granulation rule and
    /// upsert them.
    async fn sync_observation(&self, observation: &ObservationRecord) -> IndexResult<()>;

    /// Upsert one document per non-empty summary field.
    async fn sync_summary(&self, summary: &SummaryRecord) -> IndexResult<()>;

    /// Upsert the document for one user prompt.
    async fn sync_user_prompt(&self, prompt: &UserPromptRecord) -> IndexResult<()>;

    /// KNN query with conjunctive metadata filters, deduplicated by owning
    /// row (the best-scoring document per `sqlite_id` wins), ordered by
    /// ascending distance.
    async fn query(
        &self,
        query_text: &str,
        limit: usize,
        filters: &QueryFilters,
    ) -> IndexResult<Vec<QueryHit>>;

    /// Scan the store for rows whose expected document ids are absent and
    /// sync them. Idempotent; safe to interrupt and resume.
    async fn ensure_backfilled(&self, store: &MemoryStore) -> IndexResult<BackfillReport>;

    /// Backend name, document count, collection, dimensionality, last sync.
    async fn get_stats(&self) -> IndexResult<BackendStats>;

    /// Optional capability: delete documents by id.
    fn as_document_delete(&self) -> Option<&dyn DocumentDelete> {
        None
    }

    /// Optional capability: attach read-only remote stores.
    fn as_remote_attach(&self) -> Option<&dyn RemoteAttach> {
        None
    }

    /// Optional capability: weighted federated query.
    fn as_federated_query(&self) -> Option<&dyn FederatedQueryCap> {
        None
    }
}

/// Capability: delete documents by id.
#[async_trait]
pub trait DocumentDelete: Send + Sync {
    async fn delete_documents(&self, doc_ids: &[String]) -> IndexResult<usize>;
}

/// Capability: attach a read-only remote store; returns its 1-based
/// federation position.
#[async_trait]
pub trait RemoteAttach: Send + Sync {
    async fn attach_remote(&self, path: &Path) -> IndexResult<usize>;
}

/// Capability: query the local store plus attached remotes with weighted
/// score combination.
#[async_trait]
pub trait FederatedQueryCap: Send + Sync {
    async fn query_federated(
        &self,
        query_text: &str,
        limit: usize,
        filters: &QueryFilters,
    ) -> IndexResult<Vec<QueryHit>>;
}

/// Explicit no-op backend for `vector_backend = "none"`.
#[derive(Debug, Default)]
pub struct DisabledBackend;

#[async_trait]
impl VectorBackend for DisabledBackend {
    fn name(&self) -> &str {
        "disabled"
    }

    async fn initialize(&self) -> IndexResult<()> {
        Ok(())
    }

    async fn sync_observation(&self, _observation: &ObservationRecord) -> IndexResult<()> {
        Ok(())
    }

    async fn sync_summary(&self, _summary: &SummaryRecord) -> IndexResult<()> {
        Ok(())
    }

    async fn sync_user_prompt(&self, _prompt: &UserPromptRecord) -> IndexResult<()> {
        Ok(())
    }

    async fn query(
        &self,
        _query_text: &str,
        _limit: usize,
        _filters: &QueryFilters,
    ) -> IndexResult<Vec<QueryHit>> {
        Ok(Vec::new())
    }

    async fn ensure_backfilled(&self, _store: &MemoryStore) -> IndexResult<BackfillReport> {
        Ok(BackfillReport::default())
    }

    async fn get_stats(&self) -> IndexResult<BackendStats> {
        Ok(BackendStats {
            backend: "disabled".into(),
            collection: String::new(),
            documents: 0,
            dimensions: 0,
            last_sync_epoch: None,
        })
    }
}
