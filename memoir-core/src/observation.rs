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

//! Structured observation schema with XML parsing.
//!
//! The extractor LLM returns observations in XML:
//!
//! ```xml
//! <observation>
//!     <type>discovery</type>
//!     <title>Short action description</title>
//!     <subtitle>One-sentence explanation</subtitle>
//!     <narrative>1-3 sentences of context</narrative>
//!     <facts>
//!         <fact>Concise factual statement</fact>
//!     </facts>
//!     <concepts>
//!         <concept>category-type-knowledge</concept>
//!     </concepts>
//!     <files_read><file>path/to/file</file></files_read>
//!     <files_modified><file>path/to/file</file></files_modified>
//! </observation>
//! ```
//!
//! The parser is tolerant: unrecognized tags are skipped, missing fields
//! default (`type=discovery`, `title="Untitled"`, empty lists), and a
//! response with no `<observation>` element parses to zero observations.

use crate::kind::ObservationKind;
use serde::{Deserialize, Serialize};

/// Maximum title length; longer titles are clipped at a char boundary.
pub const MAX_TITLE_CHARS: usize = 80;

/// A semantic concept tag extracted from an observation.
///
/// Concepts follow the category-type-knowledge pattern, e.g.
/// `rust-error-handling`, `database-migration-schema`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Concept(pub String);

impl Concept {
    /// Create a normalized concept from a raw string.
    pub fn new(raw: impl Into<String>) -> Self {
        Concept(Self::normalize(&raw.into()))
    }

    /// Normalize a concept string: lowercase, hyphenated, alphanumeric only.
    pub fn normalize(s: &str) -> String {
        s.to_lowercase()
            .replace('_', "-")
            .replace(' ', "-")
            .chars()
            .filter(|c| c.is_alphanumeric() || *c == '-')
            .collect::<String>()
            .split('-')
            .filter(|p| !p.is_empty())
            .collect::<Vec<_>>()
            .join("-")
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Concept {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One observation as parsed from extractor output, before it has a row id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParsedObservation {
    /// What kind of work this observation records.
    pub kind: ObservationKind,
    /// Short action description, clipped to [`MAX_TITLE_CHARS`].
    pub title: String,
    /// Optional one-sentence elaboration.
    pub subtitle: Option<String>,
    /// Optional prose context, 1-3 sentences.
    pub narrative: Option<String>,
    /// Ordered concise factual statements.
    pub facts: Vec<String>,
    /// Normalized concept tags.
    pub concepts: Vec<Concept>,
    /// Files read while doing the work.
    pub files_read: Vec<String>,
    /// Files modified while doing the work.
    pub files_modified: Vec<String>,
}

/// An observation as stored: a [`ParsedObservation`] plus its row identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservationRecord {
    /// Store row id.
    pub id: i64,
    /// The extractor's session identifier.
    pub memory_session_id: String,
    /// The host's session identifier.
    pub content_session_id: String,
    /// Project the observation belongs to.
    pub project: String,
    /// Parsed payload.
    #[serde(flatten)]
    pub body: ParsedObservation,
    /// Turn counter within the session, monotone.
    pub prompt_number: i64,
    /// Creation time, milliseconds since epoch.
    pub created_at_epoch: i64,
}

/// Parser for extractor XML output.
pub struct ObservationParser;

impl ObservationParser {
    /// Parse every `<observation>` block in the response.
    ///
    /// A response with no `<observation>` element yields an empty vec; that
    /// is a valid outcome (the extractor judged nothing worth capturing),
    /// not an error.
    pub fn parse_all(xml: &str) -> Vec<ParsedObservation> {
        extract_blocks(xml, "observation")
            .into_iter()
            .map(|body| Self::parse_block(&body))
            .collect()
    }

    /// Parse a single observation body (the content between the
    /// `<observation>` tags).
    fn parse_block(body: &str) -> ParsedObservation {
        let kind = extract_tag(body, "type")
            .and_then(|t| t.parse::<ObservationKind>().ok())
            .unwrap_or_default();

        let title = extract_tag(body, "title")
            .filter(|t| !t.is_empty())
            .map(|t| clip_title(&t))
            .unwrap_or_else(|| "Untitled".to_string());

        let subtitle = extract_tag(body, "subtitle").filter(|s| !s.is_empty());
        let narrative = extract_tag(body, "narrative").filter(|s| !s.is_empty());

        let facts = extract_list(body, "facts", "fact");
        let concepts = extract_list(body, "concepts", "concept")
            .into_iter()
            .map(Concept::new)
            .filter(|c| !c.0.is_empty())
            .collect();
        let files_read = extract_list(body, "files_read", "file");
        let files_modified = extract_list(body, "files_modified", "file");

        ParsedObservation {
            kind,
            title,
            subtitle,
            narrative,
            facts,
            concepts,
            files_read,
            files_modified,
        }
    }
}

/// Clip a title to [`MAX_TITLE_CHARS`] characters.
fn clip_title(title: &str) -> String {
    if title.chars().count() <= MAX_TITLE_CHARS {
        title.to_string()
    } else {
        title.chars().take(MAX_TITLE_CHARS).collect()
    }
}

/// Extract the content of every `<tag>...</tag>` block, in document order.
pub(crate) fn extract_blocks(xml: &str, tag: &str) -> Vec<String> {
    let open_tag = format!("<{}>", tag);
    let close_tag = format!("</{}>", tag);

    let mut blocks = Vec::new();
    let mut remaining = xml;
    while let Some(start) = remaining.find(&open_tag) {
        remaining = &remaining[start + open_tag.len()..];
        match remaining.find(&close_tag) {
            Some(end) => {
                blocks.push(remaining[..end].to_string());
                remaining = &remaining[end + close_tag.len()..];
            }
            None => break,
        }
    }
    blocks
}

/// Extract content between the first `<tag>` and `</tag>` pair.
pub(crate) fn extract_tag(xml: &str, tag: &str) -> Option<String> {
    let open_tag = format!("<{}>", tag);
    let close_tag = format!("</{}>", tag);

    let start = xml.find(&open_tag)? + open_tag.len();
    let end = xml[start..].find(&close_tag)?;

    Some(xml[start..start + end].trim().to_string())
}

/// Extract trimmed item contents from a nested `<container><item>` list.
pub(crate) fn extract_list(xml: &str, container_tag: &str, item_tag: &str) -> Vec<String> {
    let container = match extract_tag_raw(xml, container_tag) {
        Some(c) => c,
        None => return Vec::new(),
    };

    extract_blocks(&container, item_tag)
        .into_iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Like [`extract_tag`] but without trimming, for nested list scanning.
fn extract_tag_raw(xml: &str, tag: &str) -> Option<String> {
    let open_tag = format!("<{}>", tag);
    let close_tag = format!("</{}>", tag);

    let start = xml.find(&open_tag)? + open_tag.len();
    let end = xml[start..].find(&close_tag)?;

    Some(xml[start..start + end].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL_XML: &str = r#"
    <observation>
        <type>bugfix</type>
        <title>Fixed race in session cleanup</title>
        <subtitle>Generator slot was cleared before the token reset</subtitle>
        <facts>
            <fact>Slot cleanup ran in a detached task</fact>
            <fact>The cancellation token outlived the generator</fact>
        </facts>
        <narrative>The cleanup path now runs in the generator wrapper itself.</narrative>
        <concepts>
            <concept>Rust Async Cleanup</concept>
            <concept>cancellation-tokens</concept>
        </concepts>
        <files_read>
            <file>src/manager.rs</file>
        </files_read>
        <files_modified>
            <file>src/manager.rs</file>
        </files_modified>
    </observation>
    "#;

    #[test]
    fn test_parse_full_observation() {
        let parsed = ObservationParser::parse_all(FULL_XML);
        assert_eq!(parsed.len(), 1);

        let obs = &parsed[0];
        assert_eq!(obs.kind, ObservationKind::Bugfix);
        assert_eq!(obs.title, "Fixed race in session cleanup");
        assert_eq!(obs.facts.len(), 2);
        assert_eq!(obs.concepts[0].as_str(), "rust-async-cleanup");
        assert_eq!(obs.files_read, vec!["src/manager.rs"]);
        assert_eq!(obs.files_modified, vec!["src/manager.rs"]);
    }

    #[test]
    fn test_parse_multiple_observations() {
        let xml = format!("{FULL_XML}\nsome chatter\n{FULL_XML}");
        let parsed = ObservationParser::parse_all(&xml);
        assert_eq!(parsed.len(), 2);
    }

    #[test]
    fn test_no_observation_is_zero_not_error() {
        let parsed = ObservationParser::parse_all("I did not find anything worth recording.");
        assert!(parsed.is_empty());
    }

    #[test]
    fn test_defaults_for_missing_fields() {
        let parsed = ObservationParser::parse_all("<observation><narrative>x</narrative></observation>");
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].kind, ObservationKind::Discovery);
        assert_eq!(parsed[0].title, "Untitled");
        assert!(parsed[0].facts.is_empty());
        assert!(parsed[0].subtitle.is_none());
    }

    #[test]
    fn test_unknown_type_defaults_to_discovery() {
        let parsed =
            ObservationParser::parse_all("<observation><type>epiphany</type><title>t</title></observation>");
        assert_eq!(parsed[0].kind, ObservationKind::Discovery);
    }

    #[test]
    fn test_title_clipped_to_80_chars() {
        let long = "x".repeat(200);
        let xml = format!("<observation><title>{long}</title></observation>");
        let parsed = ObservationParser::parse_all(&xml);
        assert_eq!(parsed[0].title.chars().count(), MAX_TITLE_CHARS);
    }

    #[test]
    fn test_unclosed_block_is_skipped() {
        let parsed = ObservationParser::parse_all("<observation><title>t</title>");
        assert!(parsed.is_empty());
    }

    #[test]
    fn test_concept_normalization() {
        assert_eq!(Concept::normalize("Rust Error Handling"), "rust-error-handling");
        assert_eq!(Concept::normalize("api_authentication"), "api-authentication");
        assert_eq!(Concept::normalize("--multiple--hyphens--"), "multiple-hyphens");
    }
}
