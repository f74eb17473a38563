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

//! Memoir Core
//!
//! Data model for the Memoir memory service:
//!
//! - **Observations**: structured captures of tool invocations, parsed from
//!   extractor LLM output (XML).
//! - **Session summaries**: end-of-session roll-ups across six fields.
//! - **Conversation history**: the extractor agent's multi-turn history with
//!   token-budgeted truncation that always preserves the system message.
//! - **Prompts**: the extractor system/observation/summary prompt builders.
//! - **Schema adapter**: declarative mapping from foreign record shapes into
//!   the internal observation shape.
//! - **Embedding codec**: the little-endian f32 wire format shared by the
//!   vector backends and the adapter.
//! - **Settings**: the on-disk `settings.json` model and data-dir resolution.

pub mod adapter;
pub mod agent;
pub mod embedding;
pub mod error;
pub mod kind;
pub mod observation;
pub mod settings;
pub mod summary;

pub use adapter::{SchemaAdapter, SchemaAdapterConfig};
pub use embedding::{cosine_similarity, decode_embedding, encode_embedding};
pub use error::CoreError;
pub use kind::ObservationKind;
pub use observation::{Concept, ObservationParser, ObservationRecord, ParsedObservation};
pub use settings::{DecayStrategy, ProviderKind, Settings, VectorBackendKind};
pub use summary::{ParsedSummary, SummaryParser, SummaryRecord};

/// Current epoch time in milliseconds, the timestamp unit used everywhere in
/// the store and the vector documents.
pub fn epoch_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
