//! Workload readiness observation: state tracking, decision policies, the
//! event driven watcher and the time bounded poll loop.

pub mod policy;
pub mod poll;
pub mod state;
pub mod watcher;

pub use poll::{Deadline, PollLoop, PollResult, TickOutcome};
pub use state::{ReadinessState, ReadyCount, StateTracker};
pub use watcher::{EventWatcher, Notification, WatchHandle, WatchOptions, WatchOutcome};

use std::sync::Arc;

use tokio::sync::watch;

/// Shared stop flag. Once stopped it stays stopped.
#[derive(Debug, Clone)]
pub struct StopSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl StopSignal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn stop(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once [`StopSignal::stop`] has been called.
    pub async fn stopped(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|stopped| *stopped).await;
    }
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}
