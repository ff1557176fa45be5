use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Last known status of every observed pod plus the set of ready pods.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReadinessState {
    statuses: HashMap<String, String>,
    ready: HashSet<String>,
    target: usize,
}

impl ReadinessState {
    pub fn status(&self, name: &str) -> Option<&str> {
        self.statuses.get(name).map(String::as_str)
    }

    pub fn ready_count(&self) -> usize {
        self.ready.len()
    }

    pub fn is_ready(&self, name: &str) -> bool {
        self.ready.contains(name)
    }

    pub fn target(&self) -> usize {
        self.target
    }

    /// Sorted names of the ready pods.
    pub fn ready_pods(&self) -> Vec<String> {
        let mut names: Vec<String> = self.ready.iter().cloned().collect();
        names.sort();
        names
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadyCount {
    pub count: usize,
    pub target: usize,
}

impl ReadyCount {
    pub fn reached(&self) -> bool {
        self.count >= self.target
    }
}

/// Tracks observed pod state for one verification run.
///
/// Watch dispatch and poll ticks may call in from different tasks, so all
/// state sits behind a mutex.
#[derive(Debug, Default)]
pub struct StateTracker {
    inner: Mutex<ReadinessState>,
}

impl StateTracker {
    pub fn new(target: usize) -> Self {
        Self {
            inner: Mutex::new(ReadinessState {
                target,
                ..Default::default()
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ReadinessState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records `status` for `name`. Returns true on the first observation of a
    /// name and whenever the status differs from the one recorded before.
    pub fn observe(&self, name: &str, status: &str) -> bool {
        let mut state = self.lock();
        match state.statuses.get(name) {
            Some(previous) if previous == status => false,
            _ => {
                state.statuses.insert(name.to_string(), status.to_string());
                true
            }
        }
    }

    /// Adds or removes `name` from the ready set according to its latest
    /// observation.
    pub fn record_readiness(&self, name: &str, ready: bool) -> ReadyCount {
        let mut state = self.lock();
        if ready {
            state.ready.insert(name.to_string());
        } else {
            state.ready.remove(name);
        }
        ReadyCount {
            count: state.ready.len(),
            target: state.target,
        }
    }

    /// Drops a pod that no longer exists.
    pub fn forget(&self, name: &str) -> ReadyCount {
        let mut state = self.lock();
        state.statuses.remove(name);
        state.ready.remove(name);
        ReadyCount {
            count: state.ready.len(),
            target: state.target,
        }
    }

    pub fn snapshot(&self) -> ReadinessState {
        self.lock().clone()
    }
}
