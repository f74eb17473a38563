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

//! User settings.
//!
//! One `settings.json` in the data directory holds every recognized option.
//! The data directory itself resolves in precedence order:
//!
//! 1. `CLAUDE_PLUGIN_ROOT` environment override
//! 2. `~/.memory-service`
//! 3. `~/.claude/marketplace/memory-service`
//!
//! The first existing location wins; when none exists the standalone home
//! directory is created.

use crate::error::CoreError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Environment variable overriding the data directory.
pub const DATA_DIR_ENV: &str = "CLAUDE_PLUGIN_ROOT";

/// Default worker port.
pub const DEFAULT_PORT: u16 = 37777;

/// Extractor LLM provider selection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    #[default]
    Claude,
    Lmstudio,
    Openrouter,
    Gemini,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Claude => "claude",
            ProviderKind::Lmstudio => "lmstudio",
            ProviderKind::Openrouter => "openrouter",
            ProviderKind::Gemini => "gemini",
        }
    }
}

/// Vector backend selection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VectorBackendKind {
    Chroma,
    #[default]
    SqliteVec,
    None,
}

/// Weight decay schedule for federated remotes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecayStrategy {
    #[default]
    Golden,
    Exponential,
    Linear,
}

/// Provider endpoints, models, and keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderSettings {
    pub provider: ProviderKind,
    /// Claude CLI binary (the proprietary streaming session API).
    pub claude_binary: String,
    pub claude_model: String,
    /// OpenAI-compatible endpoints.
    pub lmstudio_url: String,
    pub lmstudio_model: String,
    pub openrouter_url: String,
    pub openrouter_model: String,
    pub openrouter_api_key: Option<String>,
    pub gemini_url: String,
    pub gemini_model: String,
    pub gemini_api_key: Option<String>,
    /// Optional fallback provider used on transient connectivity failures.
    pub fallback: Option<ProviderKind>,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            provider: ProviderKind::default(),
            claude_binary: "claude".into(),
            claude_model: "claude-3-5-haiku-20241022".into(),
            lmstudio_url: "http://localhost:1234".into(),
            lmstudio_model: "qwen2.5-7b-instruct".into(),
            openrouter_url: "https://openrouter.ai/api".into(),
            openrouter_model: "anthropic/claude-3.5-haiku".into(),
            openrouter_api_key: None,
            gemini_url: "https://generativelanguage.googleapis.com".into(),
            gemini_model: "gemini-2.0-flash".into(),
            gemini_api_key: None,
            fallback: None,
        }
    }
}

/// Embedding generation settings for the embedded vector backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingSettings {
    /// OpenAI-compatible embeddings endpoint base URL.
    pub base_url: String,
    pub model: String,
    pub dimensions: usize,
    pub api_key: Option<String>,
}

impl Default for EmbeddingSettings {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:1234".into(),
            model: "text-embedding-nomic-embed-text-v1.5".into(),
            dimensions: 768,
            api_key: None,
        }
    }
}

/// Federation options for weighted multi-source query.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FederationSettings {
    pub max_remotes: usize,
    pub per_remote_timeout_secs: u64,
    pub overall_budget_secs: u64,
    pub decay: DecayStrategy,
    /// Paths allowed to be attached as remotes.
    pub allow: Vec<String>,
    pub read_only: bool,
}

impl Default for FederationSettings {
    fn default() -> Self {
        Self {
            max_remotes: 3,
            per_remote_timeout_secs: 5,
            overall_budget_secs: 15,
            decay: DecayStrategy::default(),
            allow: Vec::new(),
            read_only: true,
        }
    }
}

/// Replication (export) options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationSettings {
    pub enabled: bool,
    pub remote_name: String,
    pub remote_url: Option<String>,
    pub auto_push: bool,
    pub idle_push_secs: u64,
}

impl Default for ReplicationSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            remote_name: "origin".into(),
            remote_url: None,
            auto_push: false,
            idle_push_secs: 300,
        }
    }
}

/// Context-truncation caps for the extractor conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextSettings {
    pub max_context_messages: usize,
    pub max_tokens: usize,
}

impl Default for ContextSettings {
    fn default() -> Self {
        Self { max_context_messages: 20, max_tokens: 8000 }
    }
}

/// The complete settings file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub port: Option<u16>,
    pub providers: ProviderSettings,
    pub vector_backend: VectorBackendKind,
    pub embedding: EmbeddingSettings,
    pub federation: FederationSettings,
    pub replication: ReplicationSettings,
    pub context: ContextSettings,
}

impl Settings {
    /// Worker port, defaulting to [`DEFAULT_PORT`].
    pub fn port(&self) -> u16 {
        self.port.unwrap_or(DEFAULT_PORT)
    }

    /// Load settings from `<data_dir>/settings.json`; absent file means
    /// defaults.
    pub fn load(data_dir: &Path) -> Result<Settings, CoreError> {
        let path = data_dir.join("settings.json");
        if !path.exists() {
            return Ok(Settings::default());
        }
        let raw = std::fs::read_to_string(&path)?;
        serde_json::from_str(&raw)
            .map_err(|e| CoreError::Settings(format!("{}: {e}", path.display())))
    }

    /// Persist settings back to `<data_dir>/settings.json`.
    pub fn save(&self, data_dir: &Path) -> Result<(), CoreError> {
        std::fs::create_dir_all(data_dir)?;
        let path = data_dir.join("settings.json");
        std::fs::write(&path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

/// Resolve the data directory. The first existing candidate wins; when none
/// exists, the standalone home directory is created and returned.
pub fn resolve_data_dir() -> Result<PathBuf, CoreError> {
    if let Some(root) = std::env::var_os(DATA_DIR_ENV) {
        let path = PathBuf::from(root);
        if path.exists() {
            return Ok(path);
        }
    }

    let home = std::env::var_os("HOME")
        .map(PathBuf::from)
        .ok_or_else(|| CoreError::Settings("HOME is not set".into()))?;

    let standalone = home.join(".memory-service");
    if standalone.exists() {
        return Ok(standalone);
    }

    let marketplace = home.join(".claude").join("marketplace").join("memory-service");
    if marketplace.exists() {
        return Ok(marketplace);
    }

    std::fs::create_dir_all(&standalone)?;
    Ok(standalone)
}

/// Well-known paths inside the data directory.
pub mod paths {
    use std::path::{Path, PathBuf};

    pub fn store_db(data_dir: &Path) -> PathBuf {
        data_dir.join("claude-mem.db")
    }

    pub fn vectors_db(data_dir: &Path) -> PathBuf {
        data_dir.join("vectors.db")
    }

    pub fn collection_data_dir(data_dir: &Path) -> PathBuf {
        data_dir.join("vector-db")
    }

    pub fn export_dir(data_dir: &Path) -> PathBuf {
        data_dir.join("export")
    }

    pub fn logs_dir(data_dir: &Path) -> PathBuf {
        data_dir.join("logs")
    }
}
