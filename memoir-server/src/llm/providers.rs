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

//! Provider implementations.
//!
//! - [`ClaudeCliProvider`]: the proprietary streaming session API, driven
//!   through the `claude` CLI as a supervised subprocess. The CLI keeps the
//!   conversation server-side and echoes a session id we record as the
//!   memory session id.
//! - [`OpenAiCompatProvider`]: any OpenAI-compatible chat endpoint
//!   (LM Studio, OpenRouter) via `async-openai` with a custom base URL.
//! - [`GeminiProvider`]: the Gemini REST surface.

use super::{ChatOutcome, ChatProvider, ProviderError};
use crate::supervisor::Spawner;
use async_openai::{
    config::OpenAIConfig,
    error::OpenAIError,
    types::{
        ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
        ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
        CreateChatCompletionRequestArgs,
    },
    Client as OpenAIClient,
};
use async_trait::async_trait;
use memoir_core::agent::{ChatMessage, MessageRole};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

/// Subprocess turn deadline.
const CLI_TIMEOUT: Duration = Duration::from_secs(600);

// Claude CLI provider

pub struct ClaudeCliProvider {
    binary: String,
    model: String,
    session_db_id: i64,
    spawner: Arc<Spawner>,
    /// Session id echoed by the CLI on the first turn; later turns resume.
    resume_id: Mutex<Option<String>>,
}

impl ClaudeCliProvider {
    pub fn new(binary: String, model: String, session_db_id: i64, spawner: Arc<Spawner>) -> Self {
        Self { binary, model, session_db_id, spawner, resume_id: Mutex::new(None) }
    }

    /// The CLI holds history server-side: after the first turn only the
    /// newest user message is sent.
    fn compose_prompt(history: &[ChatMessage], resuming: bool) -> String {
        if resuming {
            history
                .iter()
                .rev()
                .find(|m| m.role == MessageRole::User)
                .map(|m| m.content.clone())
                .unwrap_or_default()
        } else {
            history
                .iter()
                .map(|m| m.content.as_str())
                .collect::<Vec<_>>()
                .join("\n\n")
        }
    }
}

#[async_trait]
impl ChatProvider for ClaudeCliProvider {
    fn name(&self) -> &str {
        "claude"
    }

    async fn chat(&self, history: &[ChatMessage]) -> Result<ChatOutcome, ProviderError> {
        let resume = self.resume_id.lock().clone();
        let prompt = Self::compose_prompt(history, resume.is_some());

        let mut command = tokio::process::Command::new(&self.binary);
        command
            .arg("-p")
            .arg("--output-format")
            .arg("json")
            .arg("--model")
            .arg(&self.model)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(resume) = &resume {
            command.arg("--resume").arg(resume);
        }

        let mut child = self
            .spawner
            .spawn(self.session_db_id, &mut command)
            .await
            .map_err(|e| ProviderError::Connect(format!("failed to start {}: {e}", self.binary)))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(prompt.as_bytes())
                .await
                .map_err(|e| ProviderError::Other(format!("stdin write failed: {e}")))?;
            // Close stdin so the CLI sees end of input.
            drop(stdin);
        }

        let output = tokio::time::timeout(CLI_TIMEOUT, child.wait_with_output())
            .await
            .map_err(|_| ProviderError::Timeout(format!("{} turn exceeded deadline", self.binary)))?
            .map_err(|e| ProviderError::Other(format!("wait failed: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ProviderError::Other(format!(
                "{} exited with {}: {}",
                self.binary,
                output.status,
                stderr.trim()
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let parsed: Value = serde_json::from_str(stdout.trim())
            .map_err(|e| ProviderError::Other(format!("bad CLI output: {e}")))?;

        let content = parsed
            .get("result")
            .or_else(|| parsed.get("content"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let session_id = parsed.get("session_id").and_then(Value::as_str).map(str::to_string);

        if let Some(id) = &session_id {
            *self.resume_id.lock() = Some(id.clone());
        }

        debug!(session_db_id = self.session_db_id, "claude CLI turn complete");
        Ok(ChatOutcome { content, session_id })
    }
}

// OpenAI-compatible provider (LM Studio, OpenRouter)

pub struct OpenAiCompatProvider {
    name: &'static str,
    client: OpenAIClient<OpenAIConfig>,
    model: String,
}

impl OpenAiCompatProvider {
    pub fn new(
        name: &'static str,
        api_base: String,
        model: String,
        api_key: Option<String>,
    ) -> Self {
        let mut config = OpenAIConfig::new().with_api_base(api_base);
        if let Some(key) = api_key {
            config = config.with_api_key(key);
        }
        Self { name, client: OpenAIClient::with_config(config), model }
    }

    fn convert_messages(history: &[ChatMessage]) -> Vec<ChatCompletionRequestMessage> {
        history
            .iter()
            .filter_map(|msg| match msg.role {
                MessageRole::System => ChatCompletionRequestSystemMessageArgs::default()
                    .content(msg.content.clone())
                    .build()
                    .ok()
                    .map(ChatCompletionRequestMessage::System),
                MessageRole::User => ChatCompletionRequestUserMessageArgs::default()
                    .content(msg.content.clone())
                    .build()
                    .ok()
                    .map(ChatCompletionRequestMessage::User),
                MessageRole::Assistant => ChatCompletionRequestAssistantMessageArgs::default()
                    .content(msg.content.clone())
                    .build()
                    .ok()
                    .map(ChatCompletionRequestMessage::Assistant),
            })
            .collect()
    }
}

#[async_trait]
impl ChatProvider for OpenAiCompatProvider {
    fn name(&self) -> &str {
        self.name
    }

    async fn chat(&self, history: &[ChatMessage]) -> Result<ChatOutcome, ProviderError> {
        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .messages(Self::convert_messages(history))
            .build()
            .map_err(|e| ProviderError::Other(e.to_string()))?;

        let response = self.client.chat().create(request).await.map_err(|e| match e {
            OpenAIError::Reqwest(e) => ProviderError::from_reqwest(e),
            // The endpoint answered with an error body; these are client
            // rejections, never connectivity.
            OpenAIError::ApiError(api) => {
                ProviderError::Status { status: 400, message: api.message }
            }
            other => ProviderError::Other(other.to_string()),
        })?;

        let content = response
            .choices
            .first()
            .and_then(|choice| choice.message.content.clone())
            .unwrap_or_default();

        Ok(ChatOutcome { content, session_id: None })
    }
}

// Gemini provider

pub struct GeminiProvider {
    base_url: String,
    model: String,
    api_key: String,
    http_client: reqwest::Client,
}

impl GeminiProvider {
    pub fn new(base_url: String, model: String, api_key: String) -> Self {
        Self {
            base_url,
            model,
            api_key,
            http_client: reqwest::Client::builder()
                .timeout(Duration::from_secs(120))
                .build()
                .unwrap_or_default(),
        }
    }
}

#[async_trait]
impl ChatProvider for GeminiProvider {
    fn name(&self) -> &str {
        "gemini"
    }

    async fn chat(&self, history: &[ChatMessage]) -> Result<ChatOutcome, ProviderError> {
        let system: Vec<&ChatMessage> =
            history.iter().filter(|m| m.role == MessageRole::System).collect();
        let contents: Vec<Value> = history
            .iter()
            .filter(|m| m.role != MessageRole::System)
            .map(|m| {
                let role = match m.role {
                    MessageRole::Assistant => "model",
                    _ => "user",
                };
                json!({ "role": role, "parts": [{ "text": m.content }] })
            })
            .collect();

        let mut body = json!({ "contents": contents });
        if !system.is_empty() {
            let text = system.iter().map(|m| m.content.as_str()).collect::<Vec<_>>().join("\n\n");
            body["systemInstruction"] = json!({ "parts": [{ "text": text }] });
        }

        let url = format!(
            "{}/v1beta/models/{}:generateContent",
            self.base_url.trim_end_matches('/'),
            self.model
        );
        let response = self
            .http_client
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(ProviderError::from_reqwest)?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            warn!(%status, "gemini request rejected");
            return Err(ProviderError::Status { status: status.as_u16(), message });
        }

        let parsed: Value = response
            .json()
            .await
            .map_err(|e| ProviderError::Other(format!("bad response body: {e}")))?;
        let content = parsed["candidates"][0]["content"]["parts"]
            .as_array()
            .map(|parts| {
                parts
                    .iter()
                    .filter_map(|p| p["text"].as_str())
                    .collect::<Vec<_>>()
                    .join("")
            })
            .unwrap_or_default();

        Ok(ChatOutcome { content, session_id: None })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compose_prompt_first_turn_includes_system() {
        let history = vec![
            ChatMessage::system("policy text"),
            ChatMessage::user("first event"),
        ];
        let prompt = ClaudeCliProvider::compose_prompt(&history, false);
        assert!(prompt.contains("policy text"));
        assert!(prompt.contains("first event"));
    }

    #[test]
    fn test_compose_prompt_resume_sends_last_user_turn() {
        let history = vec![
            ChatMessage::system("policy text"),
            ChatMessage::user("first event"),
            ChatMessage::assistant("<observation/>"),
            ChatMessage::user("second event"),
        ];
        let prompt = ClaudeCliProvider::compose_prompt(&history, true);
        assert_eq!(prompt, "second event");
    }
}
