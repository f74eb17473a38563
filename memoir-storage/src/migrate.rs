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

//! Migration pipeline: schema adapter + store importer.
//!
//! Foreign records flow through the adapter into [`ExternalObservation`]s
//! and then into the store, which owns deduplication entirely via the
//! `(memory_session_id, title, created_at_epoch)` uniqueness rule.

use crate::{MemoryStore, StoreResult};
use memoir_core::SchemaAdapter;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Instant;
use tracing::{info, warn};

/// Options for a migration run.
#[derive(Debug, Clone)]
pub struct MigrateOptions {
    /// Project assigned to every imported observation.
    pub target_project: String,
    /// Memory session attributed to the import; defaults to
    /// `import-<adapter id>`.
    pub memory_session_id: Option<String>,
    pub batch_size: usize,
    pub continue_on_error: bool,
    pub dry_run: bool,
}

impl MigrateOptions {
    pub fn new(target_project: impl Into<String>) -> Self {
        Self {
            target_project: target_project.into(),
            memory_session_id: None,
            batch_size: 100,
            continue_on_error: true,
            dry_run: false,
        }
    }
}

/// Per-record outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MigrateOutcome {
    Imported,
    Duplicate,
    Error,
}

/// One migrated record's disposition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigratedRecord {
    pub index: usize,
    pub title: String,
    pub outcome: MigrateOutcome,
    pub stored_id: Option<i64>,
    pub error: Option<String>,
}

/// Aggregate result of a migration run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrateReport {
    pub total: usize,
    pub imported: usize,
    pub duplicates: usize,
    pub errors: usize,
    pub records: Vec<MigratedRecord>,
    pub duration_ms: u64,
}

impl MemoryStore {
    /// Run a batch of foreign records through the adapter and importer.
    pub fn migrate_batch(
        &self,
        adapter: &SchemaAdapter,
        externals: &[Value],
        options: &MigrateOptions,
    ) -> StoreResult<MigrateReport> {
        let start = Instant::now();
        let memory_session_id = options
            .memory_session_id
            .clone()
            .unwrap_or_else(|| format!("import-{}", adapter.config().id));

        let mut report = MigrateReport {
            total: externals.len(),
            imported: 0,
            duplicates: 0,
            errors: 0,
            records: Vec::with_capacity(externals.len()),
            duration_ms: 0,
        };

        for chunk in externals.chunks(options.batch_size.max(1)) {
            for raw in chunk {
                let index = report.records.len();

                let external = match adapter.transform(raw) {
                    Ok(external) => external,
                    Err(e) => {
                        warn!(index, error = %e, "record failed to transform");
                        report.errors += 1;
                        report.records.push(MigratedRecord {
                            index,
                            title: String::new(),
                            outcome: MigrateOutcome::Error,
                            stored_id: None,
                            error: Some(e.to_string()),
                        });
                        if options.continue_on_error {
                            continue;
                        }
                        report.duration_ms = start.elapsed().as_millis() as u64;
                        return Ok(report);
                    }
                };

                if options.dry_run {
                    report.imported += 1;
                    report.records.push(MigratedRecord {
                        index,
                        title: external.title,
                        outcome: MigrateOutcome::Imported,
                        stored_id: None,
                        error: None,
                    });
                    continue;
                }

                match self.import_observation(&external, &memory_session_id, &options.target_project)
                {
                    Ok(stored) if stored.imported => {
                        report.imported += 1;
                        report.records.push(MigratedRecord {
                            index,
                            title: external.title,
                            outcome: MigrateOutcome::Imported,
                            stored_id: Some(stored.id),
                            error: None,
                        });
                    }
                    Ok(stored) => {
                        report.duplicates += 1;
                        report.records.push(MigratedRecord {
                            index,
                            title: external.title,
                            outcome: MigrateOutcome::Duplicate,
                            stored_id: Some(stored.id),
                            error: None,
                        });
                    }
                    Err(e) => {
                        warn!(index, error = %e, "record failed to import");
                        report.errors += 1;
                        report.records.push(MigratedRecord {
                            index,
                            title: external.title,
                            outcome: MigrateOutcome::Error,
                            stored_id: None,
                            error: Some(e.to_string()),
                        });
                        if !options.continue_on_error {
                            report.duration_ms = start.elapsed().as_millis() as u64;
                            return Ok(report);
                        }
                    }
                }
            }
        }

        report.duration_ms = start.elapsed().as_millis() as u64;
        info!(
            total = report.total,
            imported = report.imported,
            duplicates = report.duplicates,
            errors = report.errors,
            "migration batch finished"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use memoir_core::adapter::SchemaAdapterConfig;
    use serde_json::json;

    fn adapter() -> SchemaAdapter {
        SchemaAdapter::new(SchemaAdapterConfig::new("legacy", "Legacy Export"))
    }

    fn record(title: &str, ts: i64) -> Value {
        json!({ "title": title, "timestamp": ts, "type": "discovery" })
    }

    #[test]
    fn test_migrate_counts() {
        let store = MemoryStore::in_memory().unwrap();
        let externals = vec![record("a", 1), record("b", 2), record("a", 1)];

        let report = store
            .migrate_batch(&adapter(), &externals, &MigrateOptions::new("memoir"))
            .unwrap();

        assert_eq!(report.total, 3);
        assert_eq!(report.imported, 2);
        assert_eq!(report.duplicates, 1);
        assert_eq!(report.errors, 0);

        // The duplicate resolved to the first record's id.
        assert_eq!(report.records[0].stored_id, report.records[2].stored_id);
    }

    #[test]
    fn test_dry_run_writes_nothing() {
        let store = MemoryStore::in_memory().unwrap();
        let mut options = MigrateOptions::new("memoir");
        options.dry_run = true;

        let report = store
            .migrate_batch(&adapter(), &[record("a", 1)], &options)
            .unwrap();

        assert_eq!(report.imported, 1);
        assert_eq!(store.get_stats().unwrap().observations, 0);
    }

    #[test]
    fn test_transform_error_counted() {
        let store = MemoryStore::in_memory().unwrap();
        // Malformed: timestamp is a bare word, not a number.
        let externals = vec![json!({ "title": "x", "timestamp": "soon" }), record("ok", 2)];

        let report = store
            .migrate_batch(&adapter(), &externals, &MigrateOptions::new("memoir"))
            .unwrap();

        assert_eq!(report.errors, 1);
        assert_eq!(report.imported, 1);
    }

    #[test]
    fn test_rerun_is_all_duplicates() {
        let store = MemoryStore::in_memory().unwrap();
        let externals = vec![record("a", 1), record("b", 2)];
        let options = MigrateOptions::new("memoir");

        let first = store.migrate_batch(&adapter(), &externals, &options).unwrap();
        assert_eq!(first.imported, 2);

        let second = store.migrate_batch(&adapter(), &externals, &options).unwrap();
        assert_eq!(second.imported, 0);
        assert_eq!(second.duplicates, 2);
    }
}
