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

//! The session manager.
//!
//! Sits between the HTTP layer and the agents. Enqueued work lands in the
//! store; the manager guarantees **at most one active generator per
//! session** (the dedup guard): an enqueue while a generator is in flight
//! returns immediately, and the queue absorbs the burst.
//!
//! Generator cleanup runs on every exit path. On a natural exit the
//! session's cancellation token is replaced with a fresh one, so the next
//! generator is not born already cancelled.

use crate::agent::SessionAgent;
use dashmap::DashMap;
use memoir_storage::{MemoryStore, SessionRow};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Builds a fresh agent for one generator run.
pub type AgentFactory = Arc<dyn Fn(&SessionRow) -> SessionAgent + Send + Sync>;

struct SessionSlot {
    handle: JoinHandle<()>,
}

impl SessionSlot {
    fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

struct ManagerInner {
    store: MemoryStore,
    factory: AgentFactory,
    slots: DashMap<i64, SessionSlot>,
    tokens: DashMap<i64, CancellationToken>,
    spawn_counts: DashMap<i64, Arc<AtomicU64>>,
}

/// Per-session generator bookkeeping. Cheap to clone.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<ManagerInner>,
}

impl SessionManager {
    pub fn new(store: MemoryStore, factory: AgentFactory) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                store,
                factory,
                slots: DashMap::new(),
                tokens: DashMap::new(),
                spawn_counts: DashMap::new(),
            }),
        }
    }

    /// The session's current cancellation token.
    pub fn cancellation_token(&self, session_db_id: i64) -> CancellationToken {
        self.inner
            .tokens
            .entry(session_db_id)
            .or_insert_with(CancellationToken::new)
            .clone()
    }

    /// How many generators have been spawned for a session.
    pub fn spawn_count(&self, session_db_id: i64) -> u64 {
        self.inner
            .spawn_counts
            .get(&session_db_id)
            .map(|c| c.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    /// Whether a generator is currently in flight.
    pub fn generator_running(&self, session_db_id: i64) -> bool {
        self.inner.slots.get(&session_db_id).map(|s| !s.is_finished()).unwrap_or(false)
    }

    /// Cancel the session's current generator.
    pub fn cancel_session(&self, session_db_id: i64) {
        if let Some(token) = self.inner.tokens.get(&session_db_id) {
            token.cancel();
        }
    }

    /// Ensure a generator is draining this session's queue. The dedup
    /// guard: when one is already in flight this returns immediately.
    pub fn ensure_generator(&self, session: &SessionRow) {
        use dashmap::mapref::entry::Entry;

        let entry = self.inner.slots.entry(session.id);
        if let Entry::Occupied(occupied) = &entry {
            if !occupied.get().is_finished() {
                return;
            }
        }

        let token = self.cancellation_token(session.id);
        self.inner
            .spawn_counts
            .entry(session.id)
            .or_insert_with(|| Arc::new(AtomicU64::new(0)))
            .fetch_add(1, Ordering::SeqCst);

        let agent = (self.inner.factory)(session);
        let inner = Arc::clone(&self.inner);
        let session = session.clone();

        let handle = tokio::spawn(async move {
            debug!(session_db_id = session.id, "generator started");
            let result = agent.start_session(&session, token).await;

            // Scope-exit duties on every termination path: free the slot,
            // and on a natural exit re-arm the cancellation token so the
            // next run is not born cancelled.
            inner.slots.remove(&session.id);
            match result {
                Ok(()) => {
                    inner.tokens.insert(session.id, CancellationToken::new());
                    let remaining = inner.store.pending_count(session.id).unwrap_or_default();
                    debug!(session_db_id = session.id, remaining, "generator finished");
                }
                Err(e) => {
                    // Unprocessed rows stay queued; they are retried when
                    // re-consumed after a worker restart.
                    warn!(session_db_id = session.id, error = %e, "generator ended with error");
                }
            }
        });

        match entry {
            Entry::Occupied(mut occupied) => {
                occupied.insert(SessionSlot { handle });
            }
            Entry::Vacant(vacant) => {
                vacant.insert(SessionSlot { handle });
            }
        }
    }

    /// Wait for the session's generator (if any) to finish. Test helper.
    pub async fn wait_for_generator(&self, session_db_id: i64) {
        loop {
            if !self.generator_running(session_db_id) {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::testing::{MockProvider, MockTurn};
    use memoir_core::settings::ContextSettings;
    use memoir_index::DisabledBackend;
    use serde_json::json;
    use tokio::sync::Semaphore;

    fn manager_with(store: &MemoryStore, provider: Arc<MockProvider>) -> SessionManager {
        let store_for_agent = store.clone();
        let factory: AgentFactory = Arc::new(move |_session| {
            SessionAgent::new(
                store_for_agent.clone(),
                Arc::new(DisabledBackend),
                provider.clone(),
                None,
                ContextSettings::default(),
            )
        });
        SessionManager::new(store.clone(), factory)
    }

    fn enqueue_burst(store: &MemoryStore, session: &SessionRow, n: usize) {
        for i in 0..n {
            store
                .enqueue_observation_message(
                    session.id,
                    "Read",
                    &json!({"i": i}),
                    &json!({}),
                    i as i64,
                    "/",
                )
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_dedup_guard_single_generator_under_burst() {
        let store = MemoryStore::in_memory().unwrap();
        let session = store.create_session("sess-1", "memoir", "").unwrap();

        // Gate with zero permits: the generator blocks inside its first
        // LLM call, staying in flight for the whole burst.
        let gate = Arc::new(Semaphore::new(0));
        let mut provider = MockProvider::always("mock", MockTurn::Reply(String::new()));
        provider.gate = Some(gate.clone());
        let provider = Arc::new(provider);

        let manager = manager_with(&store, provider);

        enqueue_burst(&store, &session, 100);
        for _ in 0..100 {
            manager.ensure_generator(&session);
        }
        assert_eq!(manager.spawn_count(session.id), 1);
        assert!(manager.generator_running(session.id));

        // Release the generator: init + 100 observation turns.
        gate.add_permits(1000);
        manager.wait_for_generator(session.id).await;
        assert_eq!(store.pending_count(session.id).unwrap(), 0);

        // A second burst after completion starts a second generator.
        enqueue_burst(&store, &session, 5);
        manager.ensure_generator(&session);
        manager.wait_for_generator(session.id).await;
        assert_eq!(manager.spawn_count(session.id), 2);
    }

    #[tokio::test]
    async fn test_token_replaced_after_natural_completion() {
        let store = MemoryStore::in_memory().unwrap();
        let session = store.create_session("sess-1", "memoir", "").unwrap();
        let provider = Arc::new(MockProvider::always("mock", MockTurn::Reply(String::new())));
        let manager = manager_with(&store, provider);

        enqueue_burst(&store, &session, 1);
        manager.ensure_generator(&session);
        manager.wait_for_generator(session.id).await;

        // After a natural completion the session's token is fresh, not
        // cancelled; a subsequent generator can run.
        assert!(!manager.cancellation_token(session.id).is_cancelled());

        enqueue_burst(&store, &session, 1);
        manager.ensure_generator(&session);
        manager.wait_for_generator(session.id).await;
        assert_eq!(store.pending_count(session.id).unwrap(), 0);
        assert_eq!(manager.spawn_count(session.id), 2);
    }

    #[tokio::test]
    async fn test_cancel_stops_generator_and_restart_drains() {
        let store = MemoryStore::in_memory().unwrap();
        let session = store.create_session("sess-1", "memoir", "").unwrap();

        let gate = Arc::new(Semaphore::new(0));
        let mut provider = MockProvider::always("mock", MockTurn::Reply(String::new()));
        provider.gate = Some(gate.clone());
        let provider = Arc::new(provider);
        let manager = manager_with(&store, provider);

        enqueue_burst(&store, &session, 2);
        manager.ensure_generator(&session);
        assert!(manager.generator_running(session.id));

        manager.cancel_session(session.id);
        manager.wait_for_generator(session.id).await;

        // Worker restart: stuck claims reset, a fresh manager drains the
        // remainder.
        store.reset_stuck_messages().unwrap();
        let restarted = manager_with(
            &store,
            Arc::new(MockProvider::always("mock", MockTurn::Reply(String::new()))),
        );
        restarted.ensure_generator(&session);
        restarted.wait_for_generator(session.id).await;
        assert_eq!(store.pending_count(session.id).unwrap(), 0);
    }
}
