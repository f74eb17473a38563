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

//! Observation operations.
//!
//! Observations are append-only. The dedup rule is a UNIQUE index on
//! `(memory_session_id, title, created_at_epoch)`: inserting an identical
//! tuple returns the existing row id with `imported = false`.

use crate::schema::{ProjectStat, StoredId};
use crate::{MemoryStore, StoreResult};
use memoir_core::adapter::ExternalObservation;
use memoir_core::{ObservationRecord, ParsedObservation};
use rusqlite::{params, OptionalExtension, Row};

/// A new observation ready for insertion.
#[derive(Debug, Clone)]
pub struct NewObservation {
    pub memory_session_id: String,
    pub content_session_id: String,
    pub project: String,
    pub body: ParsedObservation,
    pub prompt_number: i64,
    pub created_at_epoch: i64,
}

const OBSERVATION_COLUMNS: &str = "id, memory_session_id, content_session_id, project, kind, \
     title, subtitle, narrative, facts, concepts, files_read, files_modified, \
     prompt_number, created_at_epoch";

impl MemoryStore {
    /// Insert a batch of observations, resolving dedup collisions to the
    /// existing row ids. Returned ids are in batch order.
    pub fn store_observations(&self, batch: &[NewObservation]) -> StoreResult<Vec<StoredId>> {
        let mut ids = Vec::with_capacity(batch.len());
        for obs in batch {
            ids.push(self.insert_observation(obs)?);
        }
        Ok(ids)
    }

    /// Insert one externally-sourced observation (migration path); the
    /// caller supplies the timestamps the foreign system assigned.
    pub fn import_observation(
        &self,
        external: &ExternalObservation,
        memory_session_id: &str,
        project: &str,
    ) -> StoreResult<StoredId> {
        let body = ParsedObservation {
            kind: external.kind,
            title: external.title.clone(),
            subtitle: external.subtitle.clone(),
            narrative: external.narrative.clone(),
            facts: external.facts.clone(),
            concepts: Vec::new(),
            files_read: Vec::new(),
            files_modified: Vec::new(),
        };
        self.insert_observation(&NewObservation {
            memory_session_id: memory_session_id.to_string(),
            content_session_id: String::new(),
            project: project.to_string(),
            body,
            prompt_number: 0,
            created_at_epoch: external.created_at_epoch,
        })
    }

    fn insert_observation(&self, obs: &NewObservation) -> StoreResult<StoredId> {
        let conn = self.conn()?;
        let inserted = conn.execute(
            "INSERT INTO observations
                 (memory_session_id, content_session_id, project, kind, title, subtitle,
                  narrative, facts, concepts, files_read, files_modified,
                  prompt_number, created_at_epoch)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
             ON CONFLICT(memory_session_id, title, created_at_epoch) DO NOTHING",
            params![
                obs.memory_session_id,
                obs.content_session_id,
                obs.project,
                obs.body.kind.as_str(),
                obs.body.title,
                obs.body.subtitle,
                obs.body.narrative,
                serde_json::to_string(&obs.body.facts)?,
                serde_json::to_string(&obs.body.concepts)?,
                serde_json::to_string(&obs.body.files_read)?,
                serde_json::to_string(&obs.body.files_modified)?,
                obs.prompt_number,
                obs.created_at_epoch,
            ],
        )?;

        if inserted > 0 {
            return Ok(StoredId { id: conn.last_insert_rowid(), imported: true });
        }

        // Dedup collision: hand back the existing row.
        let id = conn.query_row(
            "SELECT id FROM observations
             WHERE memory_session_id = ?1 AND title = ?2 AND created_at_epoch = ?3",
            params![obs.memory_session_id, obs.body.title, obs.created_at_epoch],
            |row| row.get(0),
        )?;
        Ok(StoredId { id, imported: false })
    }

    /// Fetch observations by id, in id order. Unknown ids are skipped.
    pub fn get_observations_by_ids(&self, ids: &[i64]) -> StoreResult<Vec<ObservationRecord>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.conn()?;
        let placeholders = vec!["?"; ids.len()].join(",");
        let sql = format!(
            "SELECT {OBSERVATION_COLUMNS} FROM observations WHERE id IN ({placeholders}) ORDER BY id"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(ids), row_to_observation)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Most recent observations, optionally scoped to a project.
    pub fn get_recent_observations(
        &self,
        project: Option<&str>,
        limit: usize,
    ) -> StoreResult<Vec<ObservationRecord>> {
        let conn = self.conn()?;
        let rows = match project {
            Some(project) => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {OBSERVATION_COLUMNS} FROM observations
                     WHERE project = ?1
                     ORDER BY created_at_epoch DESC, id DESC LIMIT ?2"
                ))?;
                let result = stmt
                    .query_map(params![project, limit as i64], row_to_observation)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                result
            }
            None => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {OBSERVATION_COLUMNS} FROM observations
                     ORDER BY created_at_epoch DESC, id DESC LIMIT ?1"
                ))?;
                let result = stmt
                    .query_map([limit as i64], row_to_observation)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                result
            }
        };
        Ok(rows)
    }

    /// Substring search across title, subtitle, narrative, and facts.
    pub fn search_by_text(
        &self,
        query: &str,
        project: Option<&str>,
        limit: usize,
    ) -> StoreResult<Vec<ObservationRecord>> {
        let conn = self.conn()?;
        let pattern = format!("%{query}%");
        let mut sql = format!(
            "SELECT {OBSERVATION_COLUMNS} FROM observations
             WHERE (title LIKE ?1 OR subtitle LIKE ?1 OR narrative LIKE ?1 OR facts LIKE ?1)"
        );
        if project.is_some() {
            sql.push_str(" AND project = ?2");
        }
        sql.push_str(" ORDER BY created_at_epoch DESC, id DESC LIMIT ");
        sql.push_str(&limit.to_string());

        let mut stmt = conn.prepare(&sql)?;
        let rows = match project {
            Some(project) => stmt
                .query_map(params![pattern, project], row_to_observation)?
                .collect::<rusqlite::Result<Vec<_>>>()?,
            None => stmt
                .query_map([pattern], row_to_observation)?
                .collect::<rusqlite::Result<Vec<_>>>()?,
        };
        Ok(rows)
    }

    /// Chronological neighborhood of an anchor observation: up to `radius`
    /// rows on each side plus the anchor itself, oldest first.
    pub fn get_timeline(
        &self,
        anchor_id: i64,
        radius: usize,
    ) -> StoreResult<Vec<ObservationRecord>> {
        let conn = self.conn()?;
        let anchor = conn
            .query_row(
                &format!("SELECT {OBSERVATION_COLUMNS} FROM observations WHERE id = ?1"),
                [anchor_id],
                row_to_observation,
            )
            .optional()?;
        let anchor = match anchor {
            Some(a) => a,
            None => return Ok(Vec::new()),
        };

        let mut before: Vec<ObservationRecord> = {
            let mut stmt = conn.prepare(&format!(
                "SELECT {OBSERVATION_COLUMNS} FROM observations
                 WHERE (created_at_epoch < ?1) OR (created_at_epoch = ?1 AND id < ?2)
                 ORDER BY created_at_epoch DESC, id DESC LIMIT ?3"
            ))?;
            let result = stmt
                .query_map(
                    params![anchor.created_at_epoch, anchor.id, radius as i64],
                    row_to_observation,
                )?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            result
        };
        before.reverse();

        let after: Vec<ObservationRecord> = {
            let mut stmt = conn.prepare(&format!(
                "SELECT {OBSERVATION_COLUMNS} FROM observations
                 WHERE (created_at_epoch > ?1) OR (created_at_epoch = ?1 AND id > ?2)
                 ORDER BY created_at_epoch ASC, id ASC LIMIT ?3"
            ))?;
            let result = stmt
                .query_map(
                    params![anchor.created_at_epoch, anchor.id, radius as i64],
                    row_to_observation,
                )?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            result
        };

        before.push(anchor);
        before.extend(after);
        Ok(before)
    }

    /// Every observation, oldest first. Used by the backfill pass.
    pub fn all_observations(&self) -> StoreResult<Vec<ObservationRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {OBSERVATION_COLUMNS} FROM observations ORDER BY id"
        ))?;
        let rows = stmt
            .query_map([], row_to_observation)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Distinct projects with observation and session counts.
    pub fn get_projects(&self) -> StoreResult<Vec<ProjectStat>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT o.project,
                    COUNT(*),
                    (SELECT COUNT(*) FROM sessions s WHERE s.project = o.project)
             FROM observations o GROUP BY o.project ORDER BY o.project",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok(ProjectStat {
                    project: row.get(0)?,
                    observation_count: row.get(1)?,
                    session_count: row.get(2)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}

fn row_to_observation(row: &Row<'_>) -> rusqlite::Result<ObservationRecord> {
    let kind: String = row.get(4)?;
    let facts: String = row.get(8)?;
    let concepts: String = row.get(9)?;
    let files_read: String = row.get(10)?;
    let files_modified: String = row.get(11)?;

    Ok(ObservationRecord {
        id: row.get(0)?,
        memory_session_id: row.get(1)?,
        content_session_id: row.get(2)?,
        project: row.get(3)?,
        body: ParsedObservation {
            kind: kind.parse().unwrap_or_default(),
            title: row.get(5)?,
            subtitle: row.get(6)?,
            narrative: row.get(7)?,
            facts: serde_json::from_str(&facts).unwrap_or_default(),
            concepts: serde_json::from_str(&concepts).unwrap_or_default(),
            files_read: serde_json::from_str(&files_read).unwrap_or_default(),
            files_modified: serde_json::from_str(&files_modified).unwrap_or_default(),
        },
        prompt_number: row.get(12)?,
        created_at_epoch: row.get(13)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use memoir_core::ObservationKind;

    fn new_obs(title: &str, epoch: i64) -> NewObservation {
        NewObservation {
            memory_session_id: "mem-1".into(),
            content_session_id: "sess-1".into(),
            project: "memoir".into(),
            body: ParsedObservation {
                kind: ObservationKind::Discovery,
                title: title.into(),
                subtitle: None,
                narrative: Some("narrative".into()),
                facts: vec!["fact".into()],
                ..Default::default()
            },
            prompt_number: 1,
            created_at_epoch: epoch,
        }
    }

    #[test]
    fn test_dedup_returns_existing_id() {
        let store = MemoryStore::in_memory().unwrap();
        let obs = new_obs("same title", 1000);

        let first = store.store_observations(&[obs.clone()]).unwrap();
        assert!(first[0].imported);

        let second = store.store_observations(&[obs]).unwrap();
        assert!(!second[0].imported);
        assert_eq!(first[0].id, second[0].id);
    }

    #[test]
    fn test_same_title_different_epoch_is_new_row() {
        let store = MemoryStore::in_memory().unwrap();
        let a = store.store_observations(&[new_obs("t", 1000)]).unwrap();
        let b = store.store_observations(&[new_obs("t", 2000)]).unwrap();
        assert!(a[0].imported && b[0].imported);
        assert_ne!(a[0].id, b[0].id);
    }

    #[test]
    fn test_round_trip_fields() {
        let store = MemoryStore::in_memory().unwrap();
        let mut obs = new_obs("round trip", 1000);
        obs.body.files_read = vec!["/tmp/a.ts".into()];
        obs.body.concepts = vec![memoir_core::Concept::new("rust testing")];

        let id = store.store_observations(&[obs]).unwrap()[0].id;
        let loaded = store.get_observations_by_ids(&[id]).unwrap();

        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].body.title, "round trip");
        assert_eq!(loaded[0].body.files_read, vec!["/tmp/a.ts"]);
        assert_eq!(loaded[0].body.concepts[0].as_str(), "rust-testing");
    }

    #[test]
    fn test_search_by_text() {
        let store = MemoryStore::in_memory().unwrap();
        store.store_observations(&[new_obs("queue ordering bug", 1000)]).unwrap();
        store.store_observations(&[new_obs("unrelated", 2000)]).unwrap();

        let hits = store.search_by_text("ordering", None, 10).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].body.title, "queue ordering bug");

        let scoped = store.search_by_text("ordering", Some("other"), 10).unwrap();
        assert!(scoped.is_empty());
    }

    #[test]
    fn test_timeline_around_anchor() {
        let store = MemoryStore::in_memory().unwrap();
        let mut ids = Vec::new();
        for i in 0..5 {
            let stored = store
                .store_observations(&[new_obs(&format!("obs {i}"), 1000 + i)])
                .unwrap();
            ids.push(stored[0].id);
        }

        let timeline = store.get_timeline(ids[2], 1).unwrap();
        assert_eq!(timeline.len(), 3);
        assert_eq!(timeline[0].id, ids[1]);
        assert_eq!(timeline[1].id, ids[2]);
        assert_eq!(timeline[2].id, ids[3]);
    }

    #[test]
    fn test_timeline_missing_anchor_is_empty() {
        let store = MemoryStore::in_memory().unwrap();
        assert!(store.get_timeline(42, 3).unwrap().is_empty());
    }

    #[test]
    fn test_projects_rollup() {
        let store = MemoryStore::in_memory().unwrap();
        store.create_session("s1", "memoir", "").unwrap();
        store.store_observations(&[new_obs("a", 1), new_obs("b", 2)]).unwrap();

        let projects = store.get_projects().unwrap();
        assert_eq!(projects.len(), 1);
        assert_eq!(projects[0].project, "memoir");
        assert_eq!(projects[0].observation_count, 2);
        assert_eq!(projects[0].session_count, 1);
    }
}
