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

//! Shared worker state.
//!
//! One explicit context object wired at worker start and handed to the
//! HTTP handlers, the MCP loop, and the hook dispatcher. Tests build their
//! own; nothing here is a process-wide singleton.

use crate::manager::SessionManager;
use crate::supervisor::ObserverRegistry;
use memoir_core::Settings;
use memoir_index::VectorBackend;
use memoir_storage::MemoryStore;
use parking_lot::RwLock;
use std::path::PathBuf;
use std::sync::Arc;

/// Everything a request handler can reach.
pub struct WorkerState {
    pub store: MemoryStore,
    pub backend: Arc<dyn VectorBackend>,
    pub manager: SessionManager,
    pub registry: Arc<ObserverRegistry>,
    pub settings: RwLock<Settings>,
    pub data_dir: PathBuf,
    pub started_at_epoch: i64,
}

pub type SharedState = Arc<WorkerState>;

impl WorkerState {
    pub fn new(
        store: MemoryStore,
        backend: Arc<dyn VectorBackend>,
        manager: SessionManager,
        registry: Arc<ObserverRegistry>,
        settings: Settings,
        data_dir: PathBuf,
    ) -> SharedState {
        Arc::new(Self {
            store,
            backend,
            manager,
            registry,
            settings: RwLock::new(settings),
            data_dir,
            started_at_epoch: memoir_core::epoch_ms(),
        })
    }
}
