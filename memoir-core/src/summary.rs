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

//! End-of-session summaries.
//!
//! One summary is produced per session stop event, rolling the session up
//! into six free-form fields: what was requested, investigated, learned,
//! completed, what remains, and side notes. At most one summary exists per
//! memory session.

use crate::observation::extract_tag;
use serde::{Deserialize, Serialize};

/// A session summary as parsed from extractor output.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParsedSummary {
    /// Original user request that started the session.
    pub request: String,
    /// What was investigated or explored.
    pub investigated: String,
    /// Key discoveries and learnings.
    pub learned: String,
    /// What was accomplished.
    pub completed: String,
    /// Pending work and next steps.
    pub next_steps: String,
    /// Anything else worth carrying forward.
    pub notes: String,
}

impl ParsedSummary {
    /// The six fields as `(name, value)` pairs, in canonical order.
    pub fn fields(&self) -> [(&'static str, &str); 6] {
        [
            ("request", self.request.as_str()),
            ("investigated", self.investigated.as_str()),
            ("learned", self.learned.as_str()),
            ("completed", self.completed.as_str()),
            ("next_steps", self.next_steps.as_str()),
            ("notes", self.notes.as_str()),
        ]
    }

    /// Whether next steps describe real pending work.
    pub fn has_pending_work(&self) -> bool {
        !self.next_steps.is_empty() && !self.next_steps.to_lowercase().contains("none")
    }
}

/// A summary as stored, with its row identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummaryRecord {
    /// Store row id.
    pub id: i64,
    /// The extractor's session identifier.
    pub memory_session_id: String,
    /// The host's session identifier.
    pub content_session_id: String,
    /// Project the session belongs to.
    pub project: String,
    /// Parsed payload.
    #[serde(flatten)]
    pub body: ParsedSummary,
    /// Creation time, milliseconds since epoch.
    pub created_at_epoch: i64,
}

/// Parser for summary XML. Missing fields default to empty strings.
pub struct SummaryParser;

impl SummaryParser {
    /// Parse a summary from extractor output.
    pub fn parse(xml: &str) -> ParsedSummary {
        ParsedSummary {
            request: extract_tag(xml, "request").unwrap_or_default(),
            investigated: extract_tag(xml, "investigated").unwrap_or_default(),
            learned: extract_tag(xml, "learned").unwrap_or_default(),
            completed: extract_tag(xml, "completed").unwrap_or_default(),
            next_steps: extract_tag(xml, "next_steps").unwrap_or_default(),
            notes: extract_tag(xml, "notes").unwrap_or_default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_summary() {
        let xml = r#"
        <summary>
            <request>Fix the queue bug</request>
            <investigated>Pending message ordering</investigated>
            <learned>Rows were consumed out of order under load</learned>
            <completed>Ordering fixed and covered by a test</completed>
            <next_steps>None</next_steps>
            <notes>Watch for the same pattern in the backfill path</notes>
        </summary>
        "#;

        let summary = SummaryParser::parse(xml);
        assert_eq!(summary.request, "Fix the queue bug");
        assert_eq!(summary.completed, "Ordering fixed and covered by a test");
        assert!(!summary.has_pending_work());
    }

    #[test]
    fn test_missing_fields_default_empty() {
        let summary = SummaryParser::parse("<summary><request>r</request></summary>");
        assert_eq!(summary.request, "r");
        assert!(summary.learned.is_empty());
        assert!(summary.notes.is_empty());
    }

    #[test]
    fn test_fields_order() {
        let summary = ParsedSummary {
            request: "a".into(),
            notes: "b".into(),
            ..Default::default()
        };
        let fields = summary.fields();
        assert_eq!(fields[0], ("request", "a"));
        assert_eq!(fields[5], ("notes", "b"));
    }
}
