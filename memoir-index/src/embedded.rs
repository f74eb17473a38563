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

//! Embedded vector backend.
//!
//! One row per document in a local `vectors.db`, embeddings stored as
//! little-endian f32 blobs. When the `vec0` SQLite extension loads, an ANN
//! virtual table accelerates KNN; when it does not, queries fall back to a
//! brute-force cosine scan over the filtered rows. Correctness is the same
//! either way.
//!
//! This backend also carries the optional capabilities: document deletion,
//! read-only remote attachment, and weighted federated query.

use crate::document::{
    dedup_by_sqlite_id, granulate_observation, granulate_summary, granulate_user_prompt, DocType,
    QueryFilters, QueryHit, VectorDocument,
};
use crate::embedder::EmbeddingProvider;
use crate::federation::{
    merge_federated, validate_federation_config, FederationSource, FederationWeights,
};
use crate::{
    BackendStats, BackfillReport, DocumentDelete, FederatedQueryCap, IndexError, IndexResult,
    RemoteAttach, VectorBackend,
};
use async_trait::async_trait;
use memoir_core::settings::FederationSettings;
use memoir_core::{cosine_similarity, decode_embedding, encode_embedding};
use memoir_core::{ObservationRecord, SummaryRecord};
use memoir_storage::{MemoryStore, UserPromptRecord};
use parking_lot::Mutex;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection, LoadExtensionGuard, OpenFlags};
use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const DOCUMENTS_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS vector_documents (
    doc_id TEXT PRIMARY KEY,
    sqlite_id INTEGER NOT NULL,
    doc_type TEXT NOT NULL,
    content TEXT NOT NULL,
    memory_session_id TEXT NOT NULL DEFAULT '',
    project TEXT NOT NULL DEFAULT '',
    created_at_epoch INTEGER NOT NULL,
    metadata TEXT NOT NULL DEFAULT '{}',
    embedding BLOB NOT NULL,
    dimensions INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_vector_documents_owner
    ON vector_documents(doc_type, sqlite_id);
"#;

/// ANN candidates fetched per requested result, to survive post-filtering.
const ANN_OVERFETCH: usize = 4;

/// Local-file vector store with optional ANN acceleration.
pub struct EmbeddedVecBackend {
    pool: Pool<SqliteConnectionManager>,
    embedder: Arc<dyn EmbeddingProvider>,
    ann_available: AtomicBool,
    /// Milliseconds since epoch of the last sync; 0 means never.
    last_sync: AtomicI64,
    remotes: Mutex<Vec<FederationSource>>,
    federation: FederationSettings,
}

impl EmbeddedVecBackend {
    /// Open (or create) the vector database at `db_path`.
    pub fn open(
        db_path: &Path,
        embedder: Arc<dyn EmbeddingProvider>,
        federation: FederationSettings,
    ) -> IndexResult<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let manager = SqliteConnectionManager::file(db_path).with_init(|conn| {
            conn.execute_batch(
                "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;
                 PRAGMA busy_timeout = 5000;",
            )?;
            // The ANN extension is optional; every query path has a scan
            // fallback.
            let _ = load_vec_extension(conn);
            Ok(())
        });
        let pool = Pool::builder().max_size(4).build(manager)?;

        Ok(Self {
            pool,
            embedder,
            ann_available: AtomicBool::new(false),
            last_sync: AtomicI64::new(0),
            remotes: Mutex::new(Vec::new()),
            federation,
        })
    }

    fn conn(&self) -> IndexResult<r2d2::PooledConnection<SqliteConnectionManager>> {
        Ok(self.pool.get()?)
    }

    fn ann(&self) -> bool {
        self.ann_available.load(Ordering::Relaxed)
    }

    /// Embed and upsert a set of documents.
    async fn sync_documents(&self, documents: Vec<VectorDocument>) -> IndexResult<()> {
        if documents.is_empty() {
            return Ok(());
        }

        let texts: Vec<String> = documents.iter().map(|d| d.content.clone()).collect();
        let embeddings = self.embedder.embed(&texts).await?;

        let conn = self.conn()?;
        for (doc, embedding) in documents.iter().zip(embeddings.iter()) {
            let blob = encode_embedding(&embedding.vector);
            conn.execute(
                "INSERT OR REPLACE INTO vector_documents
                     (doc_id, sqlite_id, doc_type, content, memory_session_id, project,
                      created_at_epoch, metadata, embedding, dimensions)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    doc.doc_id,
                    doc.sqlite_id,
                    doc.doc_type.as_str(),
                    doc.content,
                    doc.memory_session_id,
                    doc.project,
                    doc.created_at_epoch,
                    doc.metadata.to_string(),
                    blob,
                    embedding.dimensions as i64,
                ],
            )?;

            if self.ann() {
                let _ = conn.execute("DELETE FROM vec_index WHERE doc_id = ?1", [&doc.doc_id]);
                if let Err(e) = conn.execute(
                    "INSERT INTO vec_index (doc_id, embedding) VALUES (?1, ?2)",
                    params![doc.doc_id, blob],
                ) {
                    warn!(error = %e, "ANN index write failed; dropping to scan mode");
                    self.ann_available.store(false, Ordering::Relaxed);
                }
            }
        }

        self.last_sync.store(memoir_core::epoch_ms(), Ordering::Relaxed);
        Ok(())
    }

    fn query_ann(
        &self,
        query: &[f32],
        limit: usize,
        filters: &QueryFilters,
    ) -> IndexResult<Vec<QueryHit>> {
        let conn = self.conn()?;
        let blob = encode_embedding(query);
        let k = (limit.max(1) * ANN_OVERFETCH) as i64;

        let mut stmt = conn.prepare(
            "SELECT doc_id, distance FROM vec_index WHERE embedding MATCH ?1 AND k = ?2",
        )?;
        let candidates = stmt
            .query_map(params![blob, k], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut hits = Vec::new();
        for (doc_id, distance) in candidates {
            if let Some(doc) = load_document(&conn, &doc_id)? {
                if filters.matches(&doc) {
                    hits.push(QueryHit {
                        doc_id: doc.doc_id,
                        sqlite_id: doc.sqlite_id,
                        doc_type: doc.doc_type,
                        distance: distance as f32,
                        metadata: doc.metadata,
                        content: Some(doc.content),
                    });
                }
            }
        }
        Ok(hits)
    }
}

/// Load the `vec0` extension into one connection.
fn load_vec_extension(conn: &Connection) -> rusqlite::Result<()> {
    unsafe {
        let _guard = LoadExtensionGuard::new(conn)?;
        conn.load_extension("vec0", None)
    }
}

/// Read one document row (minus the embedding) by id.
fn load_document(conn: &Connection, doc_id: &str) -> IndexResult<Option<VectorDocument>> {
    use rusqlite::OptionalExtension;
    Ok(conn
        .query_row(
            "SELECT doc_id, sqlite_id, doc_type, content, memory_session_id, project,
                    created_at_epoch, metadata
             FROM vector_documents WHERE doc_id = ?1",
            [doc_id],
            |row| {
                let doc_type: String = row.get(2)?;
                let metadata: String = row.get(7)?;
                Ok(VectorDocument {
                    doc_id: row.get(0)?,
                    sqlite_id: row.get(1)?,
                    doc_type: doc_type.parse().unwrap_or(DocType::Observation),
                    content: row.get(3)?,
                    memory_session_id: row.get(4)?,
                    project: row.get(5)?,
                    created_at_epoch: row.get(6)?,
                    metadata: serde_json::from_str(&metadata)
                        .unwrap_or(serde_json::Value::Null),
                })
            },
        )
        .optional()?)
}

/// Brute-force cosine scan over every document matching the filters.
/// Shared by the fallback query path and remote federation scans.
fn scan_documents(
    conn: &Connection,
    query: &[f32],
    filters: &QueryFilters,
) -> IndexResult<Vec<QueryHit>> {
    let mut stmt = conn.prepare(
        "SELECT doc_id, sqlite_id, doc_type, content, memory_session_id, project,
                created_at_epoch, metadata, embedding
         FROM vector_documents",
    )?;

    let mut rows = stmt.query([])?;
    let mut hits = Vec::new();
    while let Some(row) = rows.next()? {
        let doc_type: String = row.get(2)?;
        let metadata: String = row.get(7)?;
        let doc = VectorDocument {
            doc_id: row.get(0)?,
            sqlite_id: row.get(1)?,
            doc_type: doc_type.parse().unwrap_or(DocType::Observation),
            content: row.get(3)?,
            memory_session_id: row.get(4)?,
            project: row.get(5)?,
            created_at_epoch: row.get(6)?,
            metadata: serde_json::from_str(&metadata).unwrap_or(serde_json::Value::Null),
        };
        if !filters.matches(&doc) {
            continue;
        }

        let blob: Vec<u8> = row.get(8)?;
        let embedding = decode_embedding(&blob)?;
        let distance = 1.0 - cosine_similarity(query, &embedding);
        hits.push(QueryHit {
            doc_id: doc.doc_id,
            sqlite_id: doc.sqlite_id,
            doc_type: doc.doc_type,
            distance,
            metadata: doc.metadata,
            content: Some(doc.content),
        });
    }

    hits.sort_by(|a, b| a.distance.partial_cmp(&b.distance).unwrap_or(std::cmp::Ordering::Equal));
    Ok(hits)
}

#[async_trait]
impl VectorBackend for EmbeddedVecBackend {
    fn name(&self) -> &str {
        "sqlite-vec"
    }

    async fn initialize(&self) -> IndexResult<()> {
        let conn = self.conn()?;
        conn.execute_batch(DOCUMENTS_SCHEMA)?;

        let dims = self.embedder.dimensions();
        match conn.execute_batch(&format!(
            "CREATE VIRTUAL TABLE IF NOT EXISTS vec_index
             USING vec0(doc_id TEXT PRIMARY KEY, embedding FLOAT[{dims}])"
        )) {
            Ok(()) => {
                self.ann_available.store(true, Ordering::Relaxed);
                info!("vector backend initialized with ANN index ({dims} dims)");
            }
            Err(e) => {
                self.ann_available.store(false, Ordering::Relaxed);
                warn!(error = %e, "vec0 extension unavailable; queries will scan");
            }
        }
        Ok(())
    }

    async fn sync_observation(&self, observation: &ObservationRecord) -> IndexResult<()> {
        self.sync_documents(granulate_observation(observation)).await
    }

    async fn sync_summary(&self, summary: &SummaryRecord) -> IndexResult<()> {
        self.sync_documents(granulate_summary(summary)).await
    }

    async fn sync_user_prompt(&self, prompt: &UserPromptRecord) -> IndexResult<()> {
        self.sync_documents(granulate_user_prompt(prompt)).await
    }

    async fn query(
        &self,
        query_text: &str,
        limit: usize,
        filters: &QueryFilters,
    ) -> IndexResult<Vec<QueryHit>> {
        let embedded = self.embedder.embed(&[query_text.to_string()]).await?;
        let query = match embedded.into_iter().next() {
            Some(e) => e.vector,
            None => return Ok(Vec::new()),
        };

        let hits = if self.ann() {
            match self.query_ann(&query, limit, filters) {
                Ok(hits) => hits,
                Err(e) => {
                    warn!(error = %e, "ANN query failed; falling back to scan");
                    {
                        let conn = self.conn()?;
                        scan_documents(&conn, &query, filters)?
                    }
                }
            }
        } else {
            let conn = self.conn()?;
            scan_documents(&conn, &query, filters)?
        };

        let mut deduped = dedup_by_sqlite_id(hits);
        deduped.truncate(limit);
        Ok(deduped)
    }

    async fn ensure_backfilled(&self, store: &MemoryStore) -> IndexResult<BackfillReport> {
        let existing: HashSet<String> = {
            let conn = self.conn()?;
            let mut stmt = conn.prepare("SELECT doc_id FROM vector_documents")?;
            let ids = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<HashSet<_>>>()?;
            ids
        };

        let mut report = BackfillReport::default();
        let mut sync_missing = Vec::new();

        for observation in store.all_observations()? {
            report.scanned += 1;
            sync_missing.extend(
                granulate_observation(&observation)
                    .into_iter()
                    .filter(|d| !existing.contains(&d.doc_id)),
            );
        }
        for summary in store.all_summaries()? {
            report.scanned += 1;
            sync_missing.extend(
                granulate_summary(&summary).into_iter().filter(|d| !existing.contains(&d.doc_id)),
            );
        }
        for prompt in store.all_user_prompts()? {
            report.scanned += 1;
            sync_missing.extend(
                granulate_user_prompt(&prompt)
                    .into_iter()
                    .filter(|d| !existing.contains(&d.doc_id)),
            );
        }

        report.synced = sync_missing.len();
        if !sync_missing.is_empty() {
            debug!(missing = sync_missing.len(), "backfilling vector documents");
            self.sync_documents(sync_missing).await?;
        }
        Ok(report)
    }

    async fn get_stats(&self) -> IndexResult<BackendStats> {
        let conn = self.conn()?;
        let documents: i64 =
            conn.query_row("SELECT COUNT(*) FROM vector_documents", [], |row| row.get(0))?;
        let last_sync = self.last_sync.load(Ordering::Relaxed);

        Ok(BackendStats {
            backend: if self.ann() { "sqlite-vec".into() } else { "sqlite-vec (scan)".into() },
            collection: "vector_documents".into(),
            documents,
            dimensions: self.embedder.dimensions(),
            last_sync_epoch: (last_sync > 0).then_some(last_sync),
        })
    }

    fn as_document_delete(&self) -> Option<&dyn DocumentDelete> {
        Some(self)
    }

    fn as_remote_attach(&self) -> Option<&dyn RemoteAttach> {
        Some(self)
    }

    fn as_federated_query(&self) -> Option<&dyn FederatedQueryCap> {
        Some(self)
    }
}

#[async_trait]
impl DocumentDelete for EmbeddedVecBackend {
    async fn delete_documents(&self, doc_ids: &[String]) -> IndexResult<usize> {
        let conn = self.conn()?;
        let mut deleted = 0;
        for doc_id in doc_ids {
            if self.ann() {
                let _ = conn.execute("DELETE FROM vec_index WHERE doc_id = ?1", [doc_id]);
            }
            deleted += conn.execute("DELETE FROM vector_documents WHERE doc_id = ?1", [doc_id])?;
        }
        Ok(deleted)
    }
}

#[async_trait]
impl RemoteAttach for EmbeddedVecBackend {
    async fn attach_remote(&self, path: &Path) -> IndexResult<usize> {
        let mut remotes = self.remotes.lock();
        validate_federation_config(remotes.len() + 1)?;
        if remotes.len() + 1 > self.federation.max_remotes {
            return Err(IndexError::Federation(format!(
                "configured remote cap is {}",
                self.federation.max_remotes
            )));
        }

        // Verify the remote opens read-only and has the expected shape.
        let conn = open_remote_read_only(path)?;
        conn.query_row("SELECT COUNT(*) FROM vector_documents", [], |row| row.get::<_, i64>(0))
            .map_err(|e| IndexError::Federation(format!("{}: {e}", path.display())))?;

        let position = remotes.len() + 1;
        remotes.push(FederationSource { position, path: path.to_path_buf() });
        info!(position, path = %path.display(), "remote attached read-only");
        Ok(position)
    }
}

#[async_trait]
impl FederatedQueryCap for EmbeddedVecBackend {
    async fn query_federated(
        &self,
        query_text: &str,
        limit: usize,
        filters: &QueryFilters,
    ) -> IndexResult<Vec<QueryHit>> {
        let embedded = self.embedder.embed(&[query_text.to_string()]).await?;
        let query = match embedded.into_iter().next() {
            Some(e) => e.vector,
            None => return Ok(Vec::new()),
        };

        let local = if self.ann() {
            self.query_ann(&query, limit, filters)?
        } else {
            let conn = self.conn()?;
            scan_documents(&conn, &query, filters)?
        };

        let sources: Vec<FederationSource> = self.remotes.lock().clone();
        let per_remote = Duration::from_secs(self.federation.per_remote_timeout_secs);
        let budget = Duration::from_secs(self.federation.overall_budget_secs);
        let started = Instant::now();

        let mut remote_hits = Vec::new();
        for source in sources {
            if started.elapsed() >= budget {
                warn!(position = source.position, "federation budget exhausted; remote skipped");
                break;
            }

            let path = source.path.clone();
            let scan_query = query.clone();
            let scan_filters = filters.clone();
            let scan = tokio::task::spawn_blocking(move || -> IndexResult<Vec<QueryHit>> {
                let conn = open_remote_read_only(&path)?;
                scan_documents(&conn, &scan_query, &scan_filters)
            });

            match tokio::time::timeout(per_remote, scan).await {
                Ok(Ok(Ok(hits))) => remote_hits.push((source.position, hits)),
                Ok(Ok(Err(e))) => {
                    warn!(position = source.position, error = %e, "remote scan failed; dropped")
                }
                Ok(Err(e)) => {
                    warn!(position = source.position, error = %e, "remote scan panicked; dropped")
                }
                Err(_) => {
                    warn!(position = source.position, "remote scan timed out; dropped")
                }
            }
        }

        let weights = FederationWeights::new(self.federation.decay);
        let merged = merge_federated(local, remote_hits, weights, limit * ANN_OVERFETCH);
        let mut deduped = dedup_by_sqlite_id(merged);
        deduped.truncate(limit);
        Ok(deduped)
    }
}

fn open_remote_read_only(path: &Path) -> IndexResult<Connection> {
    Ok(Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )?)
}
