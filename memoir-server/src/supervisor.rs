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

//! Subprocess supervision.
//!
//! Extractor sessions spawn child processes (the Claude CLI). Every spawn
//! goes through the [`Spawner`], which registers the child PID with the
//! [`ObserverRegistry`] before the handle reaches the caller; that closes
//! the orphan-by-crash window to the interval between fork and register,
//! which the [`Reaper`] covers.
//!
//! The registry is an explicit context object created at worker start and
//! injected where needed; tests build their own.

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use sysinfo::{Pid, Signal, System};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Environment marker stamped on every supervised child, used to discover
/// orphans from a previously crashed worker.
pub const OBSERVER_ENV: &str = "MEMOIR_OBSERVER";

/// Soft-terminate deadline before the hard kill.
const KILL_DEADLINE: Duration = Duration::from_secs(3);
const KILL_POLL: Duration = Duration::from_millis(100);

/// Default reaper cadence.
pub const REAPER_INTERVAL: Duration = Duration::from_secs(60);

/// Registry mapping session row ids to the PIDs their extractors spawned.
pub struct ObserverRegistry {
    observers: Mutex<HashMap<i64, HashSet<u32>>>,
    system: Mutex<System>,
}

impl Default for ObserverRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ObserverRegistry {
    pub fn new() -> Self {
        Self { observers: Mutex::new(HashMap::new()), system: Mutex::new(System::new()) }
    }

    /// OS-level children of this worker process.
    pub fn snapshot_child_pids(&self) -> Vec<u32> {
        let own = Pid::from_u32(std::process::id());
        let mut system = self.system.lock();
        system.refresh_processes();
        system
            .processes()
            .iter()
            .filter(|(_, process)| process.parent() == Some(own))
            .map(|(pid, _)| pid.as_u32())
            .collect()
    }

    /// Union-add PIDs for a session.
    pub fn register_observers(&self, session_db_id: i64, pids: &[u32]) {
        let mut observers = self.observers.lock();
        let entry = observers.entry(session_db_id).or_default();
        for pid in pids {
            entry.insert(*pid);
        }
        debug!(session_db_id, count = entry.len(), "observers registered");
    }

    /// Registered PIDs for a session (empty when unknown).
    pub fn session_observers(&self, session_db_id: i64) -> Vec<u32> {
        self.observers
            .lock()
            .get(&session_db_id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Total registered PIDs across sessions.
    pub fn registered_count(&self) -> usize {
        self.observers.lock().values().map(HashSet::len).sum()
    }

    /// Soft-terminate a session's observers, wait up to the deadline, hard
    /// kill survivors, and forget the session. Missing PIDs are ignored.
    pub async fn kill_session_observers(&self, session_db_id: i64) {
        let pids: Vec<u32> = match self.observers.lock().remove(&session_db_id) {
            Some(set) => set.into_iter().collect(),
            None => return,
        };
        if pids.is_empty() {
            return;
        }
        info!(session_db_id, count = pids.len(), "terminating session observers");
        self.kill_pids(&pids).await;
    }

    /// Kill every registered observer across all sessions in parallel.
    pub async fn kill_all(&self) {
        let sessions: Vec<i64> = self.observers.lock().keys().copied().collect();
        let kills = sessions.into_iter().map(|session| self.kill_session_observers(session));
        futures::future::join_all(kills).await;
    }

    /// TERM, poll, then KILL. Any individual failure is absorbed.
    pub async fn kill_pids(&self, pids: &[u32]) {
        {
            let mut system = self.system.lock();
            system.refresh_processes();
            for pid in pids {
                if let Some(process) = system.process(Pid::from_u32(*pid)) {
                    // Fall back to SIGKILL where TERM is unsupported.
                    if process.kill_with(Signal::Term).is_none() && !process.kill() {
                        warn!(pid, "failed to signal process");
                    }
                }
            }
        }

        let deadline = tokio::time::Instant::now() + KILL_DEADLINE;
        loop {
            tokio::time::sleep(KILL_POLL).await;
            let alive: Vec<u32> = {
                let mut system = self.system.lock();
                system.refresh_processes();
                pids.iter()
                    .copied()
                    .filter(|pid| system.process(Pid::from_u32(*pid)).is_some())
                    .collect()
            };
            if alive.is_empty() {
                return;
            }
            if tokio::time::Instant::now() >= deadline {
                let mut system = self.system.lock();
                system.refresh_processes();
                for pid in alive {
                    if let Some(process) = system.process(Pid::from_u32(pid)) {
                        if !process.kill() {
                            warn!(pid, "survivor resisted hard kill");
                        }
                    }
                }
                return;
            }
        }
    }

    /// Drop PIDs that no longer exist; sessions emptied by the prune are
    /// removed. Returns how many PIDs were pruned.
    pub fn prune_dead_pids(&self) -> usize {
        let mut system = self.system.lock();
        system.refresh_processes();

        let mut observers = self.observers.lock();
        let mut pruned = 0;
        observers.retain(|_, pids| {
            pids.retain(|pid| {
                let alive = system.process(Pid::from_u32(*pid)).is_some();
                if !alive {
                    pruned += 1;
                }
                alive
            });
            !pids.is_empty()
        });
        if pruned > 0 {
            debug!(pruned, "dead observer pids pruned");
        }
        pruned
    }

    /// Processes carrying the observer marker that no session registered;
    /// these are orphans from a crashed worker or a leaked spawn.
    pub fn find_unregistered_observers(&self) -> Vec<u32> {
        let registered: HashSet<u32> = {
            let observers = self.observers.lock();
            observers.values().flat_map(|set| set.iter().copied()).collect()
        };

        let marker = format!("{OBSERVER_ENV}=");
        let mut system = self.system.lock();
        system.refresh_processes();
        system
            .processes()
            .iter()
            .filter(|(pid, process)| {
                !registered.contains(&pid.as_u32())
                    && process.environ().iter().any(|kv| kv.starts_with(&marker))
            })
            .map(|(pid, _)| pid.as_u32())
            .collect()
    }
}

/// One reaper cycle: prune dead registrations, then kill orphans.
pub async fn reap_once(registry: &ObserverRegistry) {
    let pruned = registry.prune_dead_pids();
    let orphans = registry.find_unregistered_observers();
    if pruned > 0 || !orphans.is_empty() {
        info!(pruned, orphans = orphans.len(), "reaper cycle");
    }
    if !orphans.is_empty() {
        registry.kill_pids(&orphans).await;
    }
}

/// Periodic task driving [`reap_once`]. `start` twice is a no-op; `stop`
/// is idempotent. The reaper absorbs every failure and never takes the
/// worker down.
pub struct Reaper {
    registry: Arc<ObserverRegistry>,
    interval: Duration,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Reaper {
    pub fn new(registry: Arc<ObserverRegistry>) -> Self {
        Self::with_interval(registry, REAPER_INTERVAL)
    }

    pub fn with_interval(registry: Arc<ObserverRegistry>, interval: Duration) -> Self {
        Self { registry, interval, handle: Mutex::new(None) }
    }

    pub fn start(&self) {
        let mut handle = self.handle.lock();
        if handle.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }

        let registry = Arc::clone(&self.registry);
        let interval = self.interval;
        *handle = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await; // immediate first tick
            loop {
                ticker.tick().await;
                reap_once(&registry).await;
            }
        }));
        info!(interval_secs = self.interval.as_secs(), "reaper started");
    }

    pub fn stop(&self) {
        if let Some(handle) = self.handle.lock().take() {
            handle.abort();
            info!("reaper stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.lock().as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl Drop for Reaper {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Routes every extractor spawn through the registry, so the PID is known
/// before the handle reaches the caller.
pub struct Spawner {
    registry: Arc<ObserverRegistry>,
}

impl Spawner {
    pub fn new(registry: Arc<ObserverRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<ObserverRegistry> {
        &self.registry
    }

    /// Spawn a supervised child for a session. The observer marker is
    /// stamped into the environment and the PID registered before return.
    pub async fn spawn(
        &self,
        session_db_id: i64,
        command: &mut tokio::process::Command,
    ) -> std::io::Result<tokio::process::Child> {
        command.env(OBSERVER_ENV, session_db_id.to_string());
        let child = command.spawn()?;
        if let Some(pid) = child.id() {
            self.registry.register_observers(session_db_id, &[pid]);
        }
        Ok(child)
    }
}
