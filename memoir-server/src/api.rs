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

//! HTTP surface.
//!
//! JSON over HTTP on localhost. Hooks post events; the UI and the MCP
//! tools read observations, timelines, search results, projects, stats,
//! logs, and settings.

use crate::hooks::{handle_hook, HookEvent, HookPayload};
use crate::state::SharedState;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use memoir_core::Settings;
use memoir_index::{QueryFilters, VectorBackend};
use serde::Deserialize;
use serde_json::json;
use tracing::warn;

pub async fn healthz() -> &'static str {
    "OK"
}

pub async fn post_hook(
    State(state): State<SharedState>,
    Path((platform, event)): Path<(String, String)>,
    Json(payload): Json<serde_json::Value>,
) -> impl IntoResponse {
    let Some(event) = HookEvent::parse(&event) else {
        return (
            StatusCode::OK,
            Json(json!({ "ok": false, "error": format!("unknown hook event {event:?}") })),
        );
    };

    let payload: HookPayload = match serde_json::from_value(payload) {
        Ok(payload) => payload,
        Err(e) => {
            warn!(%platform, error = %e, "malformed hook payload");
            return (StatusCode::OK, Json(json!({ "ok": false, "error": e.to_string() })));
        }
    };

    let result = handle_hook(&state, &platform, event, payload).await;
    (StatusCode::OK, Json(serde_json::to_value(result).unwrap_or_default()))
}

#[derive(Debug, Deserialize)]
pub struct ObservationsQuery {
    pub project: Option<String>,
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    50
}

pub async fn get_observations(
    State(state): State<SharedState>,
    Query(query): Query<ObservationsQuery>,
) -> impl IntoResponse {
    match state.store.get_recent_observations(query.project.as_deref(), query.limit) {
        Ok(observations) => Json(json!({ "observations": observations })).into_response(),
        Err(e) => internal_error(e).into_response(),
    }
}

#[derive(Debug, Deserialize)]
pub struct TimelineQuery {
    pub anchor: i64,
    #[serde(default = "default_radius")]
    pub radius: usize,
}

fn default_radius() -> usize {
    5
}

pub async fn get_timeline(
    State(state): State<SharedState>,
    Query(query): Query<TimelineQuery>,
) -> impl IntoResponse {
    match state.store.get_timeline(query.anchor, query.radius) {
        Ok(observations) => Json(json!({ "timeline": observations })).into_response(),
        Err(e) => internal_error(e).into_response(),
    }
}

pub async fn get_observations_by_ids(
    State(state): State<SharedState>,
    Path(ids): Path<String>,
) -> impl IntoResponse {
    let ids: Vec<i64> = ids.split(',').filter_map(|id| id.trim().parse().ok()).collect();
    match state.store.get_observations_by_ids(&ids) {
        Ok(observations) => Json(json!({ "observations": observations })).into_response(),
        Err(e) => internal_error(e).into_response(),
    }
}

#[derive(Debug, Deserialize)]
pub struct SearchQuery {
    #[serde(alias = "query")]
    pub q: String,
    #[serde(default = "default_limit")]
    pub limit: usize,
    pub project: Option<String>,
    pub doc_type: Option<String>,
    pub memory_session_id: Option<String>,
    pub min_epoch: Option<i64>,
    pub max_epoch: Option<i64>,
}

pub async fn search(
    State(state): State<SharedState>,
    Query(query): Query<SearchQuery>,
) -> impl IntoResponse {
    let filters = QueryFilters {
        project: query.project,
        doc_type: query.doc_type.as_deref().and_then(|s| s.parse().ok()),
        memory_session_id: query.memory_session_id,
        min_epoch: query.min_epoch,
        max_epoch: query.max_epoch,
    };

    match state.backend.query(&query.q, query.limit, &filters).await {
        Ok(hits) => Json(json!({ "hits": hits })).into_response(),
        Err(e) => {
            // Semantic search degraded: fall back to substring search so the
            // surface stays usable while the backend is down.
            warn!(error = %e, "vector query failed; falling back to text search");
            match state.store.search_by_text(&query.q, filters.project.as_deref(), query.limit) {
                Ok(observations) => {
                    Json(json!({ "hits": [], "fallback": observations })).into_response()
                }
                Err(e) => internal_error(e).into_response(),
            }
        }
    }
}

pub async fn get_projects(State(state): State<SharedState>) -> impl IntoResponse {
    match state.store.get_projects() {
        Ok(projects) => Json(json!({ "projects": projects })).into_response(),
        Err(e) => internal_error(e).into_response(),
    }
}

pub async fn get_stats(State(state): State<SharedState>) -> impl IntoResponse {
    let store_stats = match state.store.get_stats() {
        Ok(stats) => stats,
        Err(e) => return internal_error(e).into_response(),
    };
    let backend_stats = state.backend.get_stats().await.ok();

    Json(json!({
        "store": store_stats,
        "vector": backend_stats,
        "started_at_epoch": state.started_at_epoch,
        "observers": state.registry.registered_count(),
    }))
    .into_response()
}

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    #[serde(default = "default_log_lines")]
    pub lines: usize,
}

fn default_log_lines() -> usize {
    200
}

pub async fn get_logs(
    State(state): State<SharedState>,
    Query(query): Query<LogsQuery>,
) -> impl IntoResponse {
    let path = memoir_core::settings::paths::logs_dir(&state.data_dir).join("worker.log");
    let tail = match std::fs::read_to_string(&path) {
        Ok(content) => {
            let lines: Vec<&str> = content.lines().collect();
            let start = lines.len().saturating_sub(query.lines);
            lines[start..].join("\n")
        }
        Err(_) => String::new(),
    };
    Json(json!({ "log": tail }))
}

pub async fn get_settings(State(state): State<SharedState>) -> impl IntoResponse {
    Json(state.settings.read().clone())
}

pub async fn put_settings(
    State(state): State<SharedState>,
    Json(settings): Json<Settings>,
) -> impl IntoResponse {
    if let Err(e) = settings.save(&state.data_dir) {
        return internal_error(e).into_response();
    }
    *state.settings.write() = settings;
    Json(json!({ "ok": true })).into_response()
}

fn internal_error(e: impl std::fmt::Display) -> (StatusCode, Json<serde_json::Value>) {
    warn!(error = %e, "request failed");
    (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "error": e.to_string() })))
}
