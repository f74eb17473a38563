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

//! Extractor prompt builders.
//!
//! Three prompt shapes drive the extractor LLM:
//!
//! - **Init prompt**: the system message carrying the extraction policy,
//!   project and session identifiers, and the user's opening prompt.
//! - **Observation prompt**: one tool invocation wrapped in
//!   `<observed_from_primary_session>` with `<parameters>` and `<outcome>`
//!   payloads truncated to a byte budget.
//! - **Summary prompt**: the end-of-session roll-up request.

/// Byte budget applied to each tool payload before it enters a prompt.
pub const TOOL_PAYLOAD_BUDGET: usize = 4_000;

/// Build the system message for a new extractor session.
pub fn build_init_prompt(project: &str, content_session_id: &str, user_prompt: &str) -> String {
    format!(
        r#"You are a memory extractor observing a developer's AI coding session. You will receive tool invocations from the primary session one at a time. Distill each into zero or more structured observations capturing what was learned, decided, or changed. Skip trivia; record substance.

Project: {project}
Session: {content_session_id}

The developer opened the session with:

{user_prompt}

For each tool invocation, respond with XML observations:

<observation>
  <type>discovery|bugfix|feature|refactor|decision|change</type>
  <title>Short action description, at most 80 characters</title>
  <subtitle>Optional one-sentence elaboration</subtitle>
  <narrative>1-3 sentences of context: what, how, why</narrative>
  <facts>
    <fact>One concrete, verifiable statement</fact>
  </facts>
  <concepts>
    <concept>lowercase-hyphenated-tag</concept>
  </concepts>
  <files_read><file>path</file></files_read>
  <files_modified><file>path</file></files_modified>
</observation>

If an invocation contains nothing worth recording, respond with no <observation> element at all."#,
    )
}

/// Build the observation-extraction prompt for one tool invocation.
///
/// `tool_input` and `tool_output` are truncated to [`TOOL_PAYLOAD_BUDGET`]
/// each; the structural tags always survive truncation.
pub fn build_observation_prompt(
    tool_name: &str,
    tool_input: &str,
    tool_output: &str,
    cwd: &str,
) -> String {
    let input = truncate_payload(tool_input, TOOL_PAYLOAD_BUDGET);
    let output = truncate_payload(tool_output, TOOL_PAYLOAD_BUDGET);

    format!(
        r#"<observed_from_primary_session>
  <tool>{tool_name}</tool>
  <cwd>{cwd}</cwd>
  <parameters>
{input}
  </parameters>
  <outcome>
{output}
  </outcome>
</observed_from_primary_session>

Extract observations from this tool invocation, or respond without an <observation> element if there is nothing worth keeping."#,
    )
}

/// Build the end-of-session summary prompt.
pub fn build_summary_prompt(user_prompt: &str, last_assistant_message: &str) -> String {
    format!(
        r#"The session is ending. Produce one summary of the whole session in this XML format:

<summary>
  <request>What the developer originally asked for</request>
  <investigated>What was explored</investigated>
  <learned>Key discoveries</learned>
  <completed>What was finished</completed>
  <next_steps>What remains, or "None"</next_steps>
  <notes>Anything else worth carrying forward</notes>
</summary>

The session opened with:

{user_prompt}

The assistant's final message was:

{last_assistant_message}"#,
    )
}

/// Truncate `text` to roughly `budget` bytes, keeping the head and tail and
/// inserting a `[TRUNCATED n chars]` marker in the middle. Cuts land on char
/// boundaries; text within budget is returned unchanged.
pub fn truncate_payload(text: &str, budget: usize) -> String {
    if text.len() <= budget {
        return text.to_string();
    }

    let keep = budget / 2;
    let head_end = floor_char_boundary(text, keep);
    let tail_start = ceil_char_boundary(text, text.len() - keep);
    let dropped = text[head_end..tail_start].chars().count();

    format!(
        "{}\n[TRUNCATED {} chars]\n{}",
        &text[..head_end],
        dropped,
        &text[tail_start..]
    )
}

fn floor_char_boundary(s: &str, mut index: usize) -> usize {
    while index > 0 && !s.is_char_boundary(index) {
        index -= 1;
    }
    index
}

fn ceil_char_boundary(s: &str, mut index: usize) -> usize {
    while index < s.len() && !s.is_char_boundary(index) {
        index += 1;
    }
    index
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_payload_untouched() {
        assert_eq!(truncate_payload("hello", 100), "hello");
    }

    #[test]
    fn test_truncation_inserts_marker() {
        let text = "a".repeat(10_000);
        let truncated = truncate_payload(&text, TOOL_PAYLOAD_BUDGET);
        assert!(truncated.contains("[TRUNCATED"));
        assert!(truncated.len() < text.len());
    }

    #[test]
    fn test_truncation_char_boundary_safe() {
        let text = "é".repeat(5_000);
        let truncated = truncate_payload(&text, 1000);
        assert!(truncated.contains("[TRUNCATED"));
    }

    #[test]
    fn test_observation_prompt_preserves_structure_when_truncated() {
        let big = "x".repeat(50_000);
        let prompt = build_observation_prompt("Read", &big, &big, "/tmp");

        assert!(prompt.contains("<observed_from_primary_session>"));
        assert!(prompt.contains("<parameters>"));
        assert!(prompt.contains("<outcome>"));
        assert!(prompt.contains("[TRUNCATED"));
        // Each payload was cut to the budget plus the marker overhead.
        assert!(prompt.len() < 2 * TOOL_PAYLOAD_BUDGET + 2_000);
    }

    #[test]
    fn test_init_prompt_carries_identifiers() {
        let prompt = build_init_prompt("memoir", "sess-1", "fix the tests");
        assert!(prompt.contains("Project: memoir"));
        assert!(prompt.contains("Session: sess-1"));
        assert!(prompt.contains("fix the tests"));
    }

    #[test]
    fn test_summary_prompt_carries_context() {
        let prompt = build_summary_prompt("do the thing", "done");
        assert!(prompt.contains("do the thing"));
        assert!(prompt.contains("done"));
        assert!(prompt.contains("<next_steps>"));
    }
}
