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

//! MCP tool surface.
//!
//! Newline-delimited JSON-RPC over standard streams, exposing three tools
//! to the AI host: `search`, `timeline`, and `get_observations`. All three
//! are thin wrappers over the same reads the HTTP surface serves.

use crate::state::SharedState;
use memoir_index::{QueryFilters, VectorBackend};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, warn};

#[derive(Debug, Deserialize)]
struct RpcRequest {
    #[allow(dead_code)]
    jsonrpc: Option<String>,
    id: Option<Value>,
    method: String,
    #[serde(default)]
    params: Value,
}

/// Serve MCP over stdin/stdout until the host closes the stream.
pub async fn run_mcp(state: SharedState) -> anyhow::Result<()> {
    let stdin = BufReader::new(tokio::io::stdin());
    let mut stdout = tokio::io::stdout();
    let mut lines = stdin.lines();

    while let Some(line) = lines.next_line().await? {
        let line = line.trim().to_string();
        if line.is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<RpcRequest>(&line) {
            Ok(request) => {
                let id = request.id.clone();
                match handle_request(&state, request).await {
                    Ok(result) => json!({ "jsonrpc": "2.0", "id": id, "result": result }),
                    Err(message) => json!({
                        "jsonrpc": "2.0",
                        "id": id,
                        "error": { "code": -32000, "message": message },
                    }),
                }
            }
            Err(e) => json!({
                "jsonrpc": "2.0",
                "id": null,
                "error": { "code": -32700, "message": format!("parse error: {e}") },
            }),
        };

        let mut out = serde_json::to_string(&response)?;
        out.push('\n');
        stdout.write_all(out.as_bytes()).await?;
        stdout.flush().await?;
    }

    debug!("mcp stream closed");
    Ok(())
}

async fn handle_request(state: &SharedState, request: RpcRequest) -> Result<Value, String> {
    match request.method.as_str() {
        "initialize" => Ok(json!({
            "protocolVersion": "2024-11-05",
            "serverInfo": { "name": "memoir", "version": env!("CARGO_PKG_VERSION") },
            "capabilities": { "tools": {} },
        })),
        "notifications/initialized" | "ping" => Ok(json!({})),
        "tools/list" => Ok(tool_list()),
        "tools/call" => {
            let name = request.params.get("name").and_then(Value::as_str).unwrap_or_default();
            let arguments = request.params.get("arguments").cloned().unwrap_or(Value::Null);
            call_tool(state, name, arguments).await
        }
        other => Err(format!("unknown method {other:?}")),
    }
}

fn tool_list() -> Value {
    json!({
        "tools": [
            {
                "name": "search",
                "description": "Semantic search over captured observations, summaries, and prompts.",
                "inputSchema": {
                    "type": "object",
                    "properties": {
                        "query": { "type": "string" },
                        "limit": { "type": "integer", "default": 10 },
                        "project": { "type": "string" },
                        "doc_type": {
                            "type": "string",
                            "enum": ["observation", "session_summary", "user_prompt"]
                        }
                    },
                    "required": ["query"]
                }
            },
            {
                "name": "timeline",
                "description": "Chronological neighborhood of an observation.",
                "inputSchema": {
                    "type": "object",
                    "properties": {
                        "anchor": { "type": "integer" },
                        "radius": { "type": "integer", "default": 5 }
                    },
                    "required": ["anchor"]
                }
            },
            {
                "name": "get_observations",
                "description": "Fetch full observations by id.",
                "inputSchema": {
                    "type": "object",
                    "properties": {
                        "ids": { "type": "array", "items": { "type": "integer" } }
                    },
                    "required": ["ids"]
                }
            }
        ]
    })
}

async fn call_tool(state: &SharedState, name: &str, arguments: Value) -> Result<Value, String> {
    let payload = match name {
        "search" => {
            let query = arguments
                .get("query")
                .and_then(Value::as_str)
                .ok_or_else(|| "search requires a query".to_string())?;
            let limit =
                arguments.get("limit").and_then(Value::as_u64).unwrap_or(10) as usize;
            let filters = QueryFilters {
                project: arguments
                    .get("project")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                doc_type: arguments
                    .get("doc_type")
                    .and_then(Value::as_str)
                    .and_then(|s| s.parse().ok()),
                memory_session_id: arguments
                    .get("memory_session_id")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                min_epoch: arguments.get("min_epoch").and_then(Value::as_i64),
                max_epoch: arguments.get("max_epoch").and_then(Value::as_i64),
            };

            let hits = state
                .backend
                .query(query, limit, &filters)
                .await
                .map_err(|e| e.to_string())?;
            json!({ "hits": hits })
        }

        "timeline" => {
            let anchor = arguments
                .get("anchor")
                .and_then(Value::as_i64)
                .ok_or_else(|| "timeline requires an anchor".to_string())?;
            let radius = arguments.get("radius").and_then(Value::as_u64).unwrap_or(5) as usize;
            let observations =
                state.store.get_timeline(anchor, radius).map_err(|e| e.to_string())?;
            json!({ "timeline": observations })
        }

        "get_observations" => {
            let ids: Vec<i64> = arguments
                .get("ids")
                .and_then(Value::as_array)
                .map(|ids| ids.iter().filter_map(Value::as_i64).collect())
                .unwrap_or_default();
            let observations =
                state.store.get_observations_by_ids(&ids).map_err(|e| e.to_string())?;
            json!({ "observations": observations })
        }

        other => {
            warn!(tool = other, "unknown tool requested");
            return Err(format!("unknown tool {other:?}"));
        }
    };

    // MCP tool results carry their payload as text content.
    Ok(json!({
        "content": [
            {
                "type": "text",
                "text": serde_json::to_string_pretty(&payload).unwrap_or_default(),
            }
        ]
    }))
}
