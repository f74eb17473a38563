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

//! Vector documents and granulation.
//!
//! One store row fans out into several independently embedded documents:
//!
//! - An observation yields `obs_<id>_narrative` plus `obs_<id>_fact_<i>`
//!   per fact; an observation with neither gets a single `obs_<id>_text`
//!   document built from its title and subtitle so it stays searchable.
//! - A summary yields `summary_<id>_<field>` per non-empty field.
//! - A user prompt yields `prompt_<id>_text`.
//!
//! Document ids are stable, so re-syncing a row is an upsert.

use memoir_core::{ObservationRecord, SummaryRecord};
use memoir_storage::UserPromptRecord;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;
use std::str::FromStr;

/// Which store table a document belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocType {
    Observation,
    SessionSummary,
    UserPrompt,
}

impl DocType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocType::Observation => "observation",
            DocType::SessionSummary => "session_summary",
            DocType::UserPrompt => "user_prompt",
        }
    }
}

impl fmt::Display for DocType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for DocType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "observation" => Ok(DocType::Observation),
            "session_summary" => Ok(DocType::SessionSummary),
            "user_prompt" => Ok(DocType::UserPrompt),
            _ => Err(()),
        }
    }
}

/// One indexable text fragment derived from a store row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorDocument {
    /// Composed id, e.g. `obs_12_narrative`.
    pub doc_id: String,
    /// Owning store row.
    pub sqlite_id: i64,
    pub doc_type: DocType,
    /// The text actually embedded.
    pub content: String,
    pub memory_session_id: String,
    pub project: String,
    pub created_at_epoch: i64,
    /// Extra metadata carried alongside the document.
    pub metadata: serde_json::Value,
}

/// Conjunctive metadata filters for queries.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryFilters {
    pub project: Option<String>,
    pub doc_type: Option<DocType>,
    pub memory_session_id: Option<String>,
    pub min_epoch: Option<i64>,
    pub max_epoch: Option<i64>,
}

impl QueryFilters {
    /// Whether a document passes every provided filter.
    pub fn matches(&self, doc: &VectorDocument) -> bool {
        if let Some(project) = &self.project {
            if &doc.project != project {
                return false;
            }
        }
        if let Some(doc_type) = self.doc_type {
            if doc.doc_type != doc_type {
                return false;
            }
        }
        if let Some(msid) = &self.memory_session_id {
            if &doc.memory_session_id != msid {
                return false;
            }
        }
        if let Some(min) = self.min_epoch {
            if doc.created_at_epoch < min {
                return false;
            }
        }
        if let Some(max) = self.max_epoch {
            if doc.created_at_epoch > max {
                return false;
            }
        }
        true
    }
}

/// One query result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryHit {
    pub doc_id: String,
    pub sqlite_id: i64,
    pub doc_type: DocType,
    /// Cosine distance; smaller is closer.
    pub distance: f32,
    pub metadata: serde_json::Value,
    pub content: Option<String>,
}

/// Keep the best-scoring hit per owning row, preserving ascending-distance
/// order.
pub fn dedup_by_sqlite_id(hits: Vec<QueryHit>) -> Vec<QueryHit> {
    let mut seen = std::collections::HashSet::new();
    hits.into_iter()
        .filter(|hit| seen.insert((hit.doc_type, hit.sqlite_id)))
        .collect()
}

/// Split an observation into vector documents.
pub fn granulate_observation(observation: &ObservationRecord) -> Vec<VectorDocument> {
    let mut docs = Vec::new();
    let base = |field: String, content: String| VectorDocument {
        doc_id: format!("obs_{}_{field}", observation.id),
        sqlite_id: observation.id,
        doc_type: DocType::Observation,
        content,
        memory_session_id: observation.memory_session_id.clone(),
        project: observation.project.clone(),
        created_at_epoch: observation.created_at_epoch,
        metadata: json!({
            "kind": observation.body.kind.as_str(),
            "title": observation.body.title,
            "field": field,
            "prompt_number": observation.prompt_number,
        }),
    };

    if let Some(narrative) = &observation.body.narrative {
        if !narrative.is_empty() {
            docs.push(base("narrative".to_string(), narrative.clone()));
        }
    }
    for (i, fact) in observation.body.facts.iter().enumerate() {
        if !fact.is_empty() {
            docs.push(base(format!("fact_{i}"), fact.clone()));
        }
    }

    // Nothing narratable: index title + subtitle as a single text document
    // so the observation remains reachable by search.
    if docs.is_empty() {
        let mut text = observation.body.title.clone();
        if let Some(subtitle) = &observation.body.subtitle {
            text.push_str(". ");
            text.push_str(subtitle);
        }
        docs.push(base("text".to_string(), text));
    }

    docs
}

/// Split a summary into one document per non-empty field.
pub fn granulate_summary(summary: &SummaryRecord) -> Vec<VectorDocument> {
    summary
        .body
        .fields()
        .iter()
        .filter(|(_, value)| !value.is_empty())
        .map(|(field, value)| VectorDocument {
            doc_id: format!("summary_{}_{field}", summary.id),
            sqlite_id: summary.id,
            doc_type: DocType::SessionSummary,
            content: value.to_string(),
            memory_session_id: summary.memory_session_id.clone(),
            project: summary.project.clone(),
            created_at_epoch: summary.created_at_epoch,
            metadata: json!({ "field": field }),
        })
        .collect()
}

/// The single document for a user prompt.
pub fn granulate_user_prompt(prompt: &UserPromptRecord) -> Vec<VectorDocument> {
    if prompt.prompt_text.is_empty() {
        return Vec::new();
    }
    vec![VectorDocument {
        doc_id: format!("prompt_{}_text", prompt.id),
        sqlite_id: prompt.id,
        doc_type: DocType::UserPrompt,
        content: prompt.prompt_text.clone(),
        memory_session_id: String::new(),
        project: String::new(),
        created_at_epoch: prompt.created_at_epoch,
        metadata: json!({
            "content_session_id": prompt.content_session_id,
            "prompt_number": prompt.prompt_number,
        }),
    }]
}

#[cfg(test)]
mod tests {
    use super::*;
    use memoir_core::{ObservationKind, ParsedObservation, ParsedSummary};

    fn observation(narrative: Option<&str>, facts: &[&str]) -> ObservationRecord {
        ObservationRecord {
            id: 7,
            memory_session_id: "mem-1".into(),
            content_session_id: "sess-1".into(),
            project: "memoir".into(),
            body: ParsedObservation {
                kind: ObservationKind::Discovery,
                title: "title".into(),
                subtitle: Some("subtitle".into()),
                narrative: narrative.map(|s| s.to_string()),
                facts: facts.iter().map(|s| s.to_string()).collect(),
                ..Default::default()
            },
            prompt_number: 1,
            created_at_epoch: 1000,
        }
    }

    #[test]
    fn test_narrative_plus_two_facts_is_exactly_three_docs() {
        let docs = granulate_observation(&observation(Some("the narrative"), &["f0", "f1"]));
        let ids: Vec<&str> = docs.iter().map(|d| d.doc_id.as_str()).collect();
        assert_eq!(ids, vec!["obs_7_narrative", "obs_7_fact_0", "obs_7_fact_1"]);
    }

    #[test]
    fn test_bare_observation_gets_text_doc() {
        let docs = granulate_observation(&observation(None, &[]));
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].doc_id, "obs_7_text");
        assert!(docs[0].content.contains("title"));
        assert!(docs[0].content.contains("subtitle"));
    }

    #[test]
    fn test_summary_granulation_skips_empty_fields() {
        let summary = SummaryRecord {
            id: 3,
            memory_session_id: "mem-1".into(),
            content_session_id: "sess-1".into(),
            project: "memoir".into(),
            body: ParsedSummary {
                request: "do it".into(),
                completed: "did it".into(),
                ..Default::default()
            },
            created_at_epoch: 1000,
        };

        let docs = granulate_summary(&summary);
        let ids: Vec<&str> = docs.iter().map(|d| d.doc_id.as_str()).collect();
        assert_eq!(ids, vec!["summary_3_request", "summary_3_completed"]);
    }

    #[test]
    fn test_filters_are_conjunctive() {
        let docs = granulate_observation(&observation(Some("n"), &[]));
        let doc = &docs[0];

        let mut filters = QueryFilters { project: Some("memoir".into()), ..Default::default() };
        assert!(filters.matches(doc));

        filters.memory_session_id = Some("other".into());
        assert!(!filters.matches(doc));

        filters.memory_session_id = Some("mem-1".into());
        filters.min_epoch = Some(2000);
        assert!(!filters.matches(doc));
    }

    #[test]
    fn test_dedup_keeps_best_per_row() {
        let docs = granulate_observation(&observation(Some("n"), &["f"]));
        let hits: Vec<QueryHit> = docs
            .iter()
            .enumerate()
            .map(|(i, d)| QueryHit {
                doc_id: d.doc_id.clone(),
                sqlite_id: d.sqlite_id,
                doc_type: d.doc_type,
                distance: i as f32 * 0.1,
                metadata: serde_json::Value::Null,
                content: None,
            })
            .collect();

        let deduped = dedup_by_sqlite_id(hits);
        assert_eq!(deduped.len(), 1);
        assert_eq!(deduped[0].doc_id, "obs_7_narrative");
    }
}
