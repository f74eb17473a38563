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

//! The Memoir worker.
//!
//! One long-lived process owns all mutable state: the relational store,
//! the vector backend, the per-session agents, and the subprocess
//! supervisor. Hook executables and the dashboard reach it over a local
//! HTTP port; the AI host reaches it over MCP on standard streams.

pub mod agent;
pub mod api;
pub mod export;
pub mod hooks;
pub mod llm;
pub mod manager;
pub mod mcp;
pub mod state;
pub mod supervisor;

pub use export::ReplicationExporter;
pub use manager::{AgentFactory, SessionManager};
pub use state::{SharedState, WorkerState};
pub use supervisor::{ObserverRegistry, Reaper, Spawner};

use agent::SessionAgent;
use axum::routing::{get, post};
use axum::Router;
use memoir_core::settings::paths;
use memoir_core::{Settings, VectorBackendKind};
use memoir_index::{
    CollectionServiceBackend, DisabledBackend, EmbeddedVecBackend, HashEmbedder,
    OpenAiCompatEmbedder, VectorBackend,
};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

/// Initialize tracing: env-filtered stdout plus a best-effort file sink
/// under `<data_dir>/logs/` that the `/logs` endpoint tails.
pub fn init_tracing(data_dir: &Path) {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "memoir_server=info,memoir_storage=info,memoir_index=info,tower_http=info".into());

    let logs_dir = paths::logs_dir(data_dir);
    let file_layer = std::fs::create_dir_all(&logs_dir)
        .ok()
        .and_then(|_| {
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(logs_dir.join("worker.log"))
                .ok()
        })
        .map(|file| {
            tracing_subscriber::fmt::layer().with_ansi(false).with_writer(Arc::new(file))
        });

    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer());

    // A second init (tests, embedded runs) is tolerated.
    let _ = match file_layer {
        Some(file_layer) => registry.with(file_layer).try_init(),
        None => registry.try_init(),
    };
}

/// Build the vector backend selected in settings.
pub fn build_backend(settings: &Settings, data_dir: &Path) -> Arc<dyn VectorBackend> {
    match settings.vector_backend {
        VectorBackendKind::None => Arc::new(DisabledBackend),
        VectorBackendKind::Chroma => Arc::new(CollectionServiceBackend::new(
            "chroma-mcp",
            vec!["serve".to_string()],
            paths::collection_data_dir(data_dir),
        )),
        VectorBackendKind::SqliteVec => {
            let embedding = &settings.embedding;
            let embedder: Arc<dyn memoir_index::EmbeddingProvider> = if embedding.base_url.is_empty()
            {
                // No endpoint configured: deterministic offline embeddings.
                Arc::new(HashEmbedder::new(embedding.dimensions))
            } else {
                Arc::new(OpenAiCompatEmbedder::new(
                    embedding.base_url.clone(),
                    embedding.model.clone(),
                    embedding.dimensions,
                    embedding.api_key.clone(),
                ))
            };

            match EmbeddedVecBackend::open(
                &paths::vectors_db(data_dir),
                embedder,
                settings.federation.clone(),
            ) {
                Ok(backend) => Arc::new(backend),
                Err(e) => {
                    warn!(error = %e, "embedded vector backend unavailable; continuing without");
                    Arc::new(DisabledBackend)
                }
            }
        }
    }
}

/// The worker's HTTP router.
pub fn build_router(state: SharedState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            axum::http::Method::GET,
            axum::http::Method::POST,
            axum::http::Method::PUT,
        ])
        .allow_headers(Any);

    Router::new()
        .route("/healthz", get(api::healthz))
        .route("/hooks/:platform/:event", post(api::post_hook))
        .route("/observations", get(api::get_observations))
        .route("/observations/:ids", get(api::get_observations_by_ids))
        .route("/timeline", get(api::get_timeline))
        .route("/search", get(api::search))
        .route("/projects", get(api::get_projects))
        .route("/stats", get(api::get_stats))
        .route("/logs", get(api::get_logs))
        .route("/settings", get(api::get_settings).put(api::put_settings))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(Duration::from_secs(60)))
        .with_state(state)
}

/// Assemble every component against a data directory. Shared by the
/// worker entrypoint and the MCP mode.
pub fn build_worker_state(data_dir: &Path, settings: Settings) -> anyhow::Result<SharedState> {
    let store = memoir_storage::MemoryStore::open(&paths::store_db(data_dir))?;

    // Resurrect rows a crashed generator left claimed.
    let reset = store.reset_stuck_messages()?;
    if reset > 0 {
        info!(reset, "stuck pending messages reset on startup");
    }

    let backend = build_backend(&settings, data_dir);

    let registry = Arc::new(ObserverRegistry::new());
    let spawner = Arc::new(Spawner::new(Arc::clone(&registry)));

    // Per-session agent factory; providers are wired to the session so the
    // supervisor can track every spawn.
    let provider_settings = settings.providers.clone();
    let context_settings = settings.context.clone();
    let factory_store = store.clone();
    let factory_backend = Arc::clone(&backend);
    let factory: AgentFactory = Arc::new(move |session| {
        let primary = llm::build_provider(
            provider_settings.provider,
            &provider_settings,
            session.id,
            Arc::clone(&spawner),
        );
        let fallback = provider_settings.fallback.map(|kind| {
            llm::build_provider(kind, &provider_settings, session.id, Arc::clone(&spawner))
        });
        SessionAgent::new(
            factory_store.clone(),
            Arc::clone(&factory_backend),
            primary,
            fallback,
            context_settings.clone(),
        )
    });

    let manager = SessionManager::new(store.clone(), factory);

    Ok(WorkerState::new(store, backend, manager, registry, settings, data_dir.to_path_buf()))
}

/// Run the worker: HTTP until shutdown, reaper in the background.
pub async fn run_worker(data_dir: &Path, settings: Settings) -> anyhow::Result<()> {
    let port = settings.port();
    let state = build_worker_state(data_dir, settings)?;

    if let Err(e) = state.backend.initialize().await {
        warn!(error = %e, "vector backend initialization failed; sync is best-effort");
    }

    // Reconcile store rows the backend missed (crash, earlier outage).
    {
        let backend = Arc::clone(&state.backend);
        let store = state.store.clone();
        tokio::spawn(async move {
            match backend.ensure_backfilled(&store).await {
                Ok(report) if report.synced > 0 => {
                    info!(scanned = report.scanned, synced = report.synced, "vector backfill done")
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "vector backfill failed"),
            }
        });
    }

    let reaper = Reaper::new(Arc::clone(&state.registry));
    reaper.start();

    let addr = format!("127.0.0.1:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(%addr, "worker listening");

    let router = build_router(Arc::clone(&state));
    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await?;

    // Worker shutdown: stop the reaper, then take every observer with us.
    reaper.stop();
    state.registry.kill_all().await;
    info!("worker stopped");
    Ok(())
}
