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

//! Extractor LLM providers.
//!
//! The session agent is parameterized by a primary provider and an optional
//! fallback. Errors are classified so the agent can tell transient
//! connectivity (refused connection, DNS failure, timeout; these trigger
//! fallback) from provider rejections (a 4xx is never transient and fails
//! the session).

pub mod providers;

pub use providers::{ClaudeCliProvider, GeminiProvider, OpenAiCompatProvider};

use crate::supervisor::Spawner;
use async_trait::async_trait;
use memoir_core::agent::ChatMessage;
use memoir_core::settings::{ProviderKind, ProviderSettings};
use std::sync::Arc;
use thiserror::Error;

/// Provider failure, classified for the fallback decision.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// Refused connection, DNS failure, unreachable endpoint.
    #[error("connection error: {0}")]
    Connect(String),

    /// Read or request timeout.
    #[error("timeout: {0}")]
    Timeout(String),

    /// The provider answered with an error status.
    #[error("provider returned {status}: {message}")]
    Status { status: u16, message: String },

    /// Anything else (bad response shape, subprocess failure).
    #[error("{0}")]
    Other(String),
}

impl ProviderError {
    /// Whether this failure should trigger the fallback provider.
    pub fn is_transient(&self) -> bool {
        matches!(self, ProviderError::Connect(_) | ProviderError::Timeout(_))
    }

    pub(crate) fn from_reqwest(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ProviderError::Timeout(e.to_string())
        } else if e.is_connect() || e.is_request() {
            ProviderError::Connect(e.to_string())
        } else {
            ProviderError::Other(e.to_string())
        }
    }
}

/// One completed chat turn.
#[derive(Debug, Clone)]
pub struct ChatOutcome {
    pub content: String,
    /// Session identifier echoed by the provider, when it has one.
    pub session_id: Option<String>,
}

/// The contract every extractor provider satisfies.
///
/// `chat` receives the full conversation history; providers with their own
/// session continuity (the Claude CLI) may send only the newest turn and
/// resume server-side.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    /// Short provider name; also used to synthesize memory session ids.
    fn name(&self) -> &str;

    async fn chat(&self, history: &[ChatMessage]) -> Result<ChatOutcome, ProviderError>;
}

/// Build the provider for a selection, wired to one session.
pub fn build_provider(
    kind: ProviderKind,
    settings: &ProviderSettings,
    session_db_id: i64,
    spawner: Arc<Spawner>,
) -> Arc<dyn ChatProvider> {
    match kind {
        ProviderKind::Claude => Arc::new(ClaudeCliProvider::new(
            settings.claude_binary.clone(),
            settings.claude_model.clone(),
            session_db_id,
            spawner,
        )),
        ProviderKind::Lmstudio => Arc::new(OpenAiCompatProvider::new(
            "lmstudio",
            format!("{}/v1", settings.lmstudio_url.trim_end_matches('/')),
            settings.lmstudio_model.clone(),
            None,
        )),
        ProviderKind::Openrouter => Arc::new(OpenAiCompatProvider::new(
            "openrouter",
            format!("{}/v1", settings.openrouter_url.trim_end_matches('/')),
            settings.openrouter_model.clone(),
            settings.openrouter_api_key.clone(),
        )),
        ProviderKind::Gemini => Arc::new(GeminiProvider::new(
            settings.gemini_url.clone(),
            settings.gemini_model.clone(),
            settings.gemini_api_key.clone().unwrap_or_default(),
        )),
    }
}

/// Scripted provider for agent and manager tests.
#[cfg(test)]
pub mod testing {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Clone)]
    pub enum MockTurn {
        Reply(String),
        ReplyWithSession(String, String),
        ConnectError,
        HttpError(u16),
    }

    pub struct MockProvider {
        name: &'static str,
        script: parking_lot::Mutex<VecDeque<MockTurn>>,
        fallback_turn: MockTurn,
        pub calls: AtomicUsize,
        /// When set, each call acquires (and forgets) one permit, letting a
        /// test hold a generator in flight.
        pub gate: Option<std::sync::Arc<tokio::sync::Semaphore>>,
    }

    impl MockProvider {
        pub fn new(name: &'static str, script: Vec<MockTurn>) -> Self {
            Self {
                name,
                script: parking_lot::Mutex::new(script.into()),
                fallback_turn: MockTurn::Reply(String::new()),
                calls: AtomicUsize::new(0),
                gate: None,
            }
        }

        pub fn always(name: &'static str, turn: MockTurn) -> Self {
            Self {
                name,
                script: parking_lot::Mutex::new(VecDeque::new()),
                fallback_turn: turn,
                calls: AtomicUsize::new(0),
                gate: None,
            }
        }

        pub fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ChatProvider for MockProvider {
        fn name(&self) -> &str {
            self.name
        }

        async fn chat(&self, _history: &[ChatMessage]) -> Result<ChatOutcome, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.gate {
                gate.acquire().await.map_err(|_| ProviderError::Other("gate closed".into()))?.forget();
            }

            let turn =
                self.script.lock().pop_front().unwrap_or_else(|| self.fallback_turn.clone());
            match turn {
                MockTurn::Reply(content) => Ok(ChatOutcome { content, session_id: None }),
                MockTurn::ReplyWithSession(content, session_id) => {
                    Ok(ChatOutcome { content, session_id: Some(session_id) })
                }
                MockTurn::ConnectError => {
                    Err(ProviderError::Connect("connection refused".into()))
                }
                MockTurn::HttpError(status) => {
                    Err(ProviderError::Status { status, message: "rejected".into() })
                }
            }
        }
    }
}
