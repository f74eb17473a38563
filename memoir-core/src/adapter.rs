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

//! Schema adapter for externally-shaped records.
//!
//! Remote and migrated records arrive with foreign field names and value
//! encodings. An adapter configuration declares where each internal field
//! lives in the foreign shape (dot-notation paths) and how to decode
//! timestamps, embeddings, and fact lists. Missing paths yield defaults:
//! `kind=discovery`, `project="unknown"`, `timestamp=now`.

use crate::embedding::decode_embedding;
use crate::error::CoreError;
use crate::kind::ObservationKind;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// How the foreign record encodes its timestamp.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimestampFormat {
    #[default]
    EpochMs,
    EpochS,
    Iso8601,
}

/// How the foreign record encodes its embedding vector.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmbeddingFormat {
    /// Native JSON array of numbers.
    #[default]
    Array,
    /// Base64 string of little-endian f32 bytes.
    Base64,
    /// JSON array serialized into a string.
    JsonArray,
    /// Raw byte array of little-endian f32 bytes.
    Binary,
}

/// How the foreign record encodes its fact list.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FactsFormat {
    /// Native JSON array of strings.
    #[default]
    Array,
    /// JSON array serialized into a string.
    Json,
    /// Comma-separated string.
    Csv,
}

/// Dot-notation paths locating each internal field in the foreign shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FieldPaths {
    pub id: String,
    pub title: String,
    pub subtitle: String,
    pub narrative: String,
    pub facts: String,
    pub kind: String,
    pub project: String,
    pub timestamp: String,
    pub embedding: String,
}

impl Default for FieldPaths {
    fn default() -> Self {
        Self {
            id: "id".into(),
            title: "title".into(),
            subtitle: "subtitle".into(),
            narrative: "narrative".into(),
            facts: "facts".into(),
            kind: "type".into(),
            project: "project".into(),
            timestamp: "timestamp".into(),
            embedding: "embedding".into(),
        }
    }
}

/// Value-format transforms for the non-scalar fields.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Transforms {
    pub timestamp: TimestampFormat,
    pub embedding: EmbeddingFormat,
    pub facts: FactsFormat,
}

/// Full adapter configuration for one foreign source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaAdapterConfig {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub fields: FieldPaths,
    #[serde(default)]
    pub transforms: Transforms,
}

impl SchemaAdapterConfig {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            url: None,
            fields: FieldPaths::default(),
            transforms: Transforms::default(),
        }
    }
}

/// An externally-sourced observation normalized into the internal shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalObservation {
    pub external_id: Option<String>,
    pub kind: ObservationKind,
    pub title: String,
    pub subtitle: Option<String>,
    pub narrative: Option<String>,
    pub facts: Vec<String>,
    pub project: String,
    pub created_at_epoch: i64,
    pub embedding: Option<Vec<f32>>,
}

/// Maps foreign records into [`ExternalObservation`]s.
pub struct SchemaAdapter {
    config: SchemaAdapterConfig,
}

impl SchemaAdapter {
    pub fn new(config: SchemaAdapterConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SchemaAdapterConfig {
        &self.config
    }

    /// Normalize one foreign record. Missing paths fall back to defaults;
    /// a present-but-undecodable embedding or timestamp is an error.
    pub fn transform(&self, record: &Value) -> Result<ExternalObservation, CoreError> {
        let fields = &self.config.fields;

        let external_id = lookup(record, &fields.id).map(value_to_string);

        let kind = lookup(record, &fields.kind)
            .and_then(Value::as_str)
            .and_then(|s| s.parse::<ObservationKind>().ok())
            .unwrap_or_default();

        let title = lookup(record, &fields.title)
            .map(value_to_string)
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| "Untitled".to_string());

        let subtitle = lookup(record, &fields.subtitle)
            .map(value_to_string)
            .filter(|s| !s.is_empty());

        let narrative = lookup(record, &fields.narrative)
            .map(value_to_string)
            .filter(|s| !s.is_empty());

        let facts = match lookup(record, &fields.facts) {
            Some(v) => self.decode_facts(v)?,
            None => Vec::new(),
        };

        let project = lookup(record, &fields.project)
            .map(value_to_string)
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| "unknown".to_string());

        let created_at_epoch = match lookup(record, &fields.timestamp) {
            Some(v) => self.decode_timestamp(v)?,
            None => crate::epoch_ms(),
        };

        let embedding = match lookup(record, &fields.embedding) {
            Some(v) if !v.is_null() => Some(self.decode_embedding_value(v)?),
            _ => None,
        };

        Ok(ExternalObservation {
            external_id,
            kind,
            title,
            subtitle,
            narrative,
            facts,
            project,
            created_at_epoch,
            embedding,
        })
    }

    fn decode_timestamp(&self, value: &Value) -> Result<i64, CoreError> {
        match self.config.transforms.timestamp {
            TimestampFormat::EpochMs => numeric_i64(value)
                .ok_or_else(|| CoreError::Adapter(format!("not an epoch-ms timestamp: {value}"))),
            TimestampFormat::EpochS => numeric_i64(value)
                .map(|s| s * 1000)
                .ok_or_else(|| CoreError::Adapter(format!("not an epoch-s timestamp: {value}"))),
            TimestampFormat::Iso8601 => {
                let s = value
                    .as_str()
                    .ok_or_else(|| CoreError::Adapter("iso8601 timestamp must be a string".into()))?;
                chrono::DateTime::parse_from_rfc3339(s)
                    .map(|dt| dt.timestamp_millis())
                    .map_err(|e| CoreError::Adapter(format!("bad iso8601 timestamp {s:?}: {e}")))
            }
        }
    }

    fn decode_embedding_value(&self, value: &Value) -> Result<Vec<f32>, CoreError> {
        match self.config.transforms.embedding {
            EmbeddingFormat::Array => float_array(value)
                .ok_or_else(|| CoreError::Adapter("embedding is not a float array".into())),
            EmbeddingFormat::JsonArray => {
                let s = value
                    .as_str()
                    .ok_or_else(|| CoreError::Adapter("json_array embedding must be a string".into()))?;
                let parsed: Value = serde_json::from_str(s)?;
                float_array(&parsed)
                    .ok_or_else(|| CoreError::Adapter("json_array embedding did not decode to floats".into()))
            }
            EmbeddingFormat::Base64 => {
                let s = value
                    .as_str()
                    .ok_or_else(|| CoreError::Adapter("base64 embedding must be a string".into()))?;
                let bytes = BASE64
                    .decode(s)
                    .map_err(|e| CoreError::Adapter(format!("bad base64 embedding: {e}")))?;
                decode_embedding(&bytes)
            }
            EmbeddingFormat::Binary => {
                let bytes: Vec<u8> = value
                    .as_array()
                    .ok_or_else(|| CoreError::Adapter("binary embedding must be a byte array".into()))?
                    .iter()
                    .map(|b| {
                        b.as_u64()
                            .filter(|&b| b <= u8::MAX as u64)
                            .map(|b| b as u8)
                            .ok_or_else(|| CoreError::Adapter("binary embedding byte out of range".into()))
                    })
                    .collect::<Result<_, _>>()?;
                decode_embedding(&bytes)
            }
        }
    }

    fn decode_facts(&self, value: &Value) -> Result<Vec<String>, CoreError> {
        match self.config.transforms.facts {
            FactsFormat::Array => string_array(value)
                .ok_or_else(|| CoreError::Adapter("facts is not a string array".into())),
            FactsFormat::Json => {
                let s = value
                    .as_str()
                    .ok_or_else(|| CoreError::Adapter("json facts must be a string".into()))?;
                let parsed: Value = serde_json::from_str(s)?;
                string_array(&parsed)
                    .ok_or_else(|| CoreError::Adapter("json facts did not decode to strings".into()))
            }
            FactsFormat::Csv => {
                let s = value
                    .as_str()
                    .ok_or_else(|| CoreError::Adapter("csv facts must be a string".into()))?;
                Ok(s.split(',')
                    .map(|p| p.trim().to_string())
                    .filter(|p| !p.is_empty())
                    .collect())
            }
        }
    }
}

/// Resolve a dot-notation path (`metadata.timestamps.created`) in a JSON
/// value. Returns `None` when any segment is missing.
fn lookup<'a>(record: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return None;
    }
    let mut current = record;
    for segment in path.split('.') {
        current = current.get(segment)?;
    }
    Some(current)
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn numeric_i64(value: &Value) -> Option<i64> {
    value
        .as_i64()
        .or_else(|| value.as_f64().map(|f| f as i64))
        .or_else(|| value.as_str().and_then(|s| s.parse().ok()))
}

fn float_array(value: &Value) -> Option<Vec<f32>> {
    value
        .as_array()?
        .iter()
        .map(|v| v.as_f64().map(|f| f as f32))
        .collect()
}

fn string_array(value: &Value) -> Option<Vec<String>> {
    value
        .as_array()?
        .iter()
        .map(|v| v.as_str().map(|s| s.to_string()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::encode_embedding;
    use serde_json::json;

    fn adapter_with(fields: FieldPaths, transforms: Transforms) -> SchemaAdapter {
        SchemaAdapter::new(SchemaAdapterConfig {
            id: "ext-1".into(),
            name: "legacy".into(),
            url: None,
            fields,
            transforms,
        })
    }

    #[test]
    fn test_declared_paths_populate() {
        let fields = FieldPaths {
            title: "doc.heading".into(),
            narrative: "doc.body".into(),
            timestamp: "metadata.timestamps.created".into(),
            ..Default::default()
        };
        let adapter = adapter_with(fields, Transforms::default());

        let record = json!({
            "id": 42,
            "type": "decision",
            "project": "legacy-app",
            "doc": { "heading": "Chose sqlite", "body": "Single-writer fits the load." },
            "facts": ["one", "two"],
            "metadata": { "timestamps": { "created": 1700000000000i64 } }
        });

        let obs = adapter.transform(&record).unwrap();
        assert_eq!(obs.external_id.as_deref(), Some("42"));
        assert_eq!(obs.kind, ObservationKind::Decision);
        assert_eq!(obs.title, "Chose sqlite");
        assert_eq!(obs.narrative.as_deref(), Some("Single-writer fits the load."));
        assert_eq!(obs.facts, vec!["one", "two"]);
        assert_eq!(obs.project, "legacy-app");
        assert_eq!(obs.created_at_epoch, 1_700_000_000_000);
    }

    #[test]
    fn test_missing_paths_yield_defaults() {
        let adapter = adapter_with(FieldPaths::default(), Transforms::default());
        let before = crate::epoch_ms();
        let obs = adapter.transform(&json!({})).unwrap();

        assert_eq!(obs.kind, ObservationKind::Discovery);
        assert_eq!(obs.project, "unknown");
        assert_eq!(obs.title, "Untitled");
        assert!(obs.facts.is_empty());
        assert!(obs.embedding.is_none());
        assert!(obs.created_at_epoch >= before);
    }

    #[test]
    fn test_epoch_seconds_scaled() {
        let transforms = Transforms { timestamp: TimestampFormat::EpochS, ..Default::default() };
        let adapter = adapter_with(FieldPaths::default(), transforms);
        let obs = adapter.transform(&json!({ "timestamp": 1_700_000_000 })).unwrap();
        assert_eq!(obs.created_at_epoch, 1_700_000_000_000);
    }

    #[test]
    fn test_iso8601_timestamp() {
        let transforms = Transforms { timestamp: TimestampFormat::Iso8601, ..Default::default() };
        let adapter = adapter_with(FieldPaths::default(), transforms);
        let obs = adapter
            .transform(&json!({ "timestamp": "2024-01-01T00:00:00Z" }))
            .unwrap();
        assert_eq!(obs.created_at_epoch, 1_704_067_200_000);
    }

    #[test]
    fn test_base64_embedding_decodes_le_f32() {
        let vector = vec![0.25f32, -1.5, 3.0];
        let encoded = BASE64.encode(encode_embedding(&vector));

        let transforms = Transforms { embedding: EmbeddingFormat::Base64, ..Default::default() };
        let adapter = adapter_with(FieldPaths::default(), transforms);
        let obs = adapter.transform(&json!({ "embedding": encoded })).unwrap();

        let decoded = obs.embedding.unwrap();
        for (a, b) in vector.iter().zip(decoded.iter()) {
            assert!((a - b).abs() < 1e-4);
        }
    }

    #[test]
    fn test_json_array_embedding() {
        let transforms = Transforms { embedding: EmbeddingFormat::JsonArray, ..Default::default() };
        let adapter = adapter_with(FieldPaths::default(), transforms);
        let obs = adapter.transform(&json!({ "embedding": "[0.5, 1.5]" })).unwrap();
        assert_eq!(obs.embedding.unwrap(), vec![0.5, 1.5]);
    }

    #[test]
    fn test_csv_facts() {
        let transforms = Transforms { facts: FactsFormat::Csv, ..Default::default() };
        let adapter = adapter_with(FieldPaths::default(), transforms);
        let obs = adapter.transform(&json!({ "facts": "a, b , ,c" })).unwrap();
        assert_eq!(obs.facts, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_json_facts() {
        let transforms = Transforms { facts: FactsFormat::Json, ..Default::default() };
        let adapter = adapter_with(FieldPaths::default(), transforms);
        let obs = adapter.transform(&json!({ "facts": "[\"x\",\"y\"]" })).unwrap();
        assert_eq!(obs.facts, vec!["x", "y"]);
    }

    #[test]
    fn test_bad_embedding_is_error() {
        let transforms = Transforms { embedding: EmbeddingFormat::Base64, ..Default::default() };
        let adapter = adapter_with(FieldPaths::default(), transforms);
        assert!(adapter.transform(&json!({ "embedding": "%%%" })).is_err());
    }
}
