//! Graceful shutdown coordinator
//!
//! Every long-running task of a node is spawned on the coordinator's tracker and
//! watches one of its cancellation tokens. Shutdown happens in two phases so the
//! timers stop before the peer loops they feed:
//!
//! 1. `sync` token cancelled, sync/housekeeping tasks drained
//! 2. `peers` token cancelled, peer loops drained
//!
//! Each drain is bounded by the configured timeout.

use std::future::Future;
use std::sync::{PoisonError, RwLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

/// Shutdown state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownState {
    Running,
    ShuttingDown,
    Shutdown,
}

/// Which group a supervised task belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskGroup {
    /// Timers: anti-entropy, pending retries, housekeeping
    Sync,
    /// One reader/writer loop per connection
    Peers,
}

pub struct ShutdownCoordinator {
    state: RwLock<ShutdownState>,
    sync_token: CancellationToken,
    peer_token: CancellationToken,
    sync_tasks: TaskTracker,
    peer_tasks: TaskTracker,
    timeout: Duration,
}

impl ShutdownCoordinator {
    pub fn new(timeout: Duration) -> Self {
        Self {
            state: RwLock::new(ShutdownState::Running),
            sync_token: CancellationToken::new(),
            peer_token: CancellationToken::new(),
            sync_tasks: TaskTracker::new(),
            peer_tasks: TaskTracker::new(),
            timeout,
        }
    }

    pub fn token(&self, group: TaskGroup) -> CancellationToken {
        match group {
            TaskGroup::Sync => self.sync_token.clone(),
            TaskGroup::Peers => self.peer_token.clone(),
        }
    }

    fn tracker(&self, group: TaskGroup) -> &TaskTracker {
        match group {
            TaskGroup::Sync => &self.sync_tasks,
            TaskGroup::Peers => &self.peer_tasks,
        }
    }

    /// Spawn a tracked task. Returns false (and drops the future) once
    /// shutdown has started.
    pub fn spawn<F>(&self, group: TaskGroup, task: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.is_shutting_down() {
            return false;
        }
        self.tracker(group).spawn(task);
        true
    }

    pub fn state(&self) -> ShutdownState {
        *self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.state() != ShutdownState::Running
    }

    /// Stop timers, then peers; `close_peers` runs between the two phases.
    /// Returns false if some task outlived the timeout.
    pub async fn shutdown<F>(&self, close_peers: F) -> bool
    where
        F: FnOnce(),
    {
        {
            let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
            if *state != ShutdownState::Running {
                warn!("Shutdown already in progress");
                return true;
            }
            *state = ShutdownState::ShuttingDown;
        }
        info!("Initiating graceful shutdown");

        self.sync_token.cancel();
        let sync_clean = self.drain(TaskGroup::Sync).await;

        close_peers();
        self.peer_token.cancel();
        let peers_clean = self.drain(TaskGroup::Peers).await;

        *self.state.write().unwrap_or_else(PoisonError::into_inner) = ShutdownState::Shutdown;
        info!(clean = sync_clean && peers_clean, "Shutdown complete");
        sync_clean && peers_clean
    }

    async fn drain(&self, group: TaskGroup) -> bool {
        let tracker = self.tracker(group);
        tracker.close();
        match tokio::time::timeout(self.timeout, tracker.wait()).await {
            Ok(()) => true,
            Err(_) => {
                warn!(group = ?group, remaining = tracker.len(), "Tasks still running after shutdown timeout");
                false
            }
        }
    }

    /// Resolves once shutdown has begun
    pub async fn wait_for_shutdown(&self) {
        self.sync_token.cancelled().await
    }
}

/// Run `f` until it finishes or `token` is cancelled
pub async fn run_until_cancelled<F>(name: &str, token: CancellationToken, f: F)
where
    F: Future<Output = ()>,
{
    tokio::select! {
        _ = f => {
            info!("Component {} completed normally", name);
        }
        _ = token.cancelled() => {
            info!("Component {} received shutdown signal", name);
        }
    }
}
