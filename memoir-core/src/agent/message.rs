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

//! Conversation history for the extractor agent.
//!
//! The first message is the system prompt carrying the extraction policy; it
//! survives every truncation. Older user/assistant pairs are dropped oldest
//! first when either the message-count cap or the token cap is exceeded.

use serde::{Deserialize, Serialize};

/// Role of a conversation participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::System => "system",
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
        }
    }
}

/// A single message in the extractor conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: MessageRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: MessageRole::System, content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: MessageRole::User, content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: MessageRole::Assistant, content: content.into() }
    }

    /// Rough token estimate: ~4 characters per token.
    pub fn estimated_tokens(&self) -> usize {
        (self.content.len() + 3) / 4
    }
}

/// Append-only conversation history with bounded truncation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationHistory {
    messages: Vec<ChatMessage>,
    /// Maximum number of messages kept (including the system message).
    max_messages: usize,
    /// Maximum estimated token total.
    max_tokens: usize,
}

impl ConversationHistory {
    pub fn new(max_messages: usize, max_tokens: usize) -> Self {
        Self { messages: Vec::new(), max_messages, max_tokens }
    }

    pub fn add(&mut self, message: ChatMessage) {
        self.messages.push(message);
    }

    pub fn add_system(&mut self, content: impl Into<String>) {
        self.add(ChatMessage::system(content));
    }

    pub fn add_user(&mut self, content: impl Into<String>) {
        self.add(ChatMessage::user(content));
    }

    pub fn add_assistant(&mut self, content: impl Into<String>) {
        self.add(ChatMessage::assistant(content));
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Sum of per-message token estimates.
    pub fn estimated_tokens(&self) -> usize {
        self.messages.iter().map(|m| m.estimated_tokens()).sum()
    }

    /// Drop oldest non-system messages until both the message-count and the
    /// token bounds hold. The system message at index 0 is always preserved.
    /// Returns how many messages were dropped; truncation is invisible to
    /// the LLM.
    pub fn truncate_to_limits(&mut self) -> usize {
        let mut dropped = 0;

        while self.exceeds_limits() {
            // First droppable message: index 0 if it is not the system
            // message, otherwise index 1.
            let victim = match self.messages.first() {
                Some(m) if m.role == MessageRole::System => 1,
                Some(_) => 0,
                None => break,
            };
            if victim >= self.messages.len() {
                break;
            }
            self.messages.remove(victim);
            dropped += 1;
        }

        dropped
    }

    fn exceeds_limits(&self) -> bool {
        self.messages.len() > self.max_messages || self.estimated_tokens() > self.max_tokens
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roles() {
        assert_eq!(ChatMessage::system("x").role.as_str(), "system");
        assert_eq!(ChatMessage::user("x").role.as_str(), "user");
        assert_eq!(ChatMessage::assistant("x").role.as_str(), "assistant");
    }

    #[test]
    fn test_token_estimate_is_ceil_chars_over_four() {
        assert_eq!(ChatMessage::user("").estimated_tokens(), 0);
        assert_eq!(ChatMessage::user("abcd").estimated_tokens(), 1);
        assert_eq!(ChatMessage::user("abcde").estimated_tokens(), 2);
    }

    #[test]
    fn test_truncation_preserves_system_message() {
        let mut history = ConversationHistory::new(2, 100_000);
        history.add_system("policy");
        for i in 0..6 {
            history.add_user(format!("turn {i}"));
        }
        assert_eq!(history.len(), 7);

        let dropped = history.truncate_to_limits();
        assert_eq!(dropped, 5);
        assert_eq!(history.len(), 2);
        assert_eq!(history.messages()[0].role, MessageRole::System);
        assert_eq!(history.messages()[0].content, "policy");
        assert_eq!(history.messages()[1].content, "turn 5");
    }

    #[test]
    fn test_truncation_by_token_budget() {
        // 25 tokens per message; budget allows two messages plus the system.
        let mut history = ConversationHistory::new(100, 60);
        history.add_system("sys");
        history.add_user("a".repeat(100));
        history.add_assistant("b".repeat(100));
        history.add_user("c".repeat(100));

        history.truncate_to_limits();
        assert!(history.estimated_tokens() <= 60);
        assert_eq!(history.messages()[0].role, MessageRole::System);
        // Newest message survives.
        assert!(history.messages().last().unwrap().content.starts_with('c'));
    }

    #[test]
    fn test_no_truncation_within_limits() {
        let mut history = ConversationHistory::new(10, 10_000);
        history.add_system("sys");
        history.add_user("hello");
        assert_eq!(history.truncate_to_limits(), 0);
        assert_eq!(history.len(), 2);
    }
}
