//! Shared application state for the HTTP server.

use reconcile::manager::Tick;
use reconcile::scheduler::Trigger;
use reconcile::status::State as Snapshot;
use tokio::sync::watch;

/// Shared state accessible from all request handlers.
///
/// Handlers never touch the manager: they read the last published snapshot
/// and hand fetch requests to the worker through the coalescing trigger.
#[derive(Clone)]
pub struct AppState {
    pub status: watch::Receiver<Snapshot>,
    pub trigger: Trigger<Tick>,
}

impl AppState {
    pub fn new(status: watch::Receiver<Snapshot>, trigger: Trigger<Tick>) -> Self {
        Self { status, trigger }
    }

    /// Copy of the latest snapshot.
    pub fn snapshot(&self) -> Snapshot {
        self.status.borrow().clone()
    }

    pub fn knows_remote(&self, name: &str) -> bool {
        self.status
            .borrow()
            .fetcher
            .repository_status
            .remote(name)
            .is_some()
    }
}
