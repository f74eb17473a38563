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

//! Extractor agent building blocks: conversation history and prompts.

pub mod message;
pub mod prompts;

pub use message::{ChatMessage, ConversationHistory, MessageRole};
pub use prompts::{
    build_init_prompt, build_observation_prompt, build_summary_prompt, truncate_payload,
    TOOL_PAYLOAD_BUDGET,
};
