//! Event driven readiness verification.
//!
//! Pod and Event notifications for a namespace are merged into one stream and
//! consumed by a single dispatcher task. The dispatcher feeds pods through the
//! readiness policy and the [`StateTracker`], evicts pods stuck on image pulls
//! and finishes once the ready target is reached.

use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, BoxStream};
use futures::StreamExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::policy;
use super::state::StateTracker;
use super::StopSignal;
use crate::kubernetes::{Change, EventChange, EventRecord, PodChange, ResourceClient};
use crate::metrics;
use crate::{Error, Result};

/// A single notification from either watch.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    Pod(PodChange),
    Event(EventChange),
}

#[derive(Debug, Clone)]
pub struct WatchOptions {
    /// Number of ready pods required before the watch completes.
    pub target_ready: usize,
    /// How long `start` waits for the initial snapshots.
    pub sync_timeout: Duration,
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self {
            target_ready: 2,
            sync_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchOutcome {
    /// The ready target was reached; holds the ready pod names, sorted.
    TargetReached { ready: Vec<String> },
    Stopped,
    /// Both watch streams ended before the target was reached.
    StreamEnded,
}

pub struct EventWatcher<C: ResourceClient + ?Sized> {
    client: Arc<C>,
    namespace: String,
    options: WatchOptions,
    selector: String,
    tracker: Arc<StateTracker>,
}

impl<C: ResourceClient + ?Sized + 'static> EventWatcher<C> {
    pub fn new(client: Arc<C>, namespace: &str, options: WatchOptions) -> Self {
        let tracker = Arc::new(StateTracker::new(options.target_ready));
        Self {
            client,
            namespace: namespace.to_string(),
            options,
            selector: String::new(),
            tracker,
        }
    }

    /// Only watches pods matching the label selector. Events are not
    /// filtered.
    pub fn with_selector(mut self, selector: &str) -> Self {
        self.selector = selector.trim().to_string();
        self
    }

    pub fn tracker(&self) -> Arc<StateTracker> {
        self.tracker.clone()
    }

    /// Merged pod and event notifications for the watched namespace.
    pub fn subscribe(&self) -> BoxStream<'static, Result<Notification>> {
        let pods = self
            .client
            .watch_pods(&self.namespace, &self.selector)
            .map(|change| change.map(Notification::Pod));
        let events = self
            .client
            .watch_events(&self.namespace)
            .map(|change| change.map(Notification::Event));
        stream::select(pods, events).boxed()
    }

    /// Subscribes, spawns the dispatcher and waits for the initial snapshots.
    ///
    /// A sync that does not finish within the configured timeout is logged
    /// and the watch carries on with whatever it has seen.
    pub async fn start(self, stop: StopSignal) -> WatchHandle {
        info!("watching pods and events in namespace {}", self.namespace);

        let notifications = self.subscribe();
        let (synced_tx, mut synced_rx) = watch::channel(false);
        let sync_timeout = self.options.sync_timeout;
        let tracker = self.tracker.clone();
        let task = tokio::spawn(self.dispatch(notifications, stop.clone(), synced_tx));

        let wait_synced = async {
            tokio::time::timeout(sync_timeout, synced_rx.wait_for(|synced| *synced))
                .await
                .map(|res| res.is_ok())
        };
        let synced = tokio::select! {
            res = wait_synced => match res {
                Ok(synced) => synced,
                Err(_) => {
                    error!(
                        "timed out after {} waiting for pod and event caches to sync",
                        humantime::format_duration(sync_timeout)
                    );
                    false
                }
            },
            _ = stop.stopped() => {
                error!("stopped while waiting for pod and event caches to sync");
                false
            }
        };
        if synced {
            debug!("pod and event caches synced");
        }

        WatchHandle {
            synced,
            stop,
            task,
            tracker,
        }
    }

    /// Runs the dispatcher over an existing notification stream until it
    /// completes, is stopped or the stream ends.
    pub async fn run(
        self,
        notifications: BoxStream<'static, Result<Notification>>,
        stop: StopSignal,
    ) -> WatchOutcome {
        let (synced_tx, _synced_rx) = watch::channel(false);
        self.dispatch(notifications, stop, synced_tx).await
    }

    async fn dispatch(
        self,
        mut notifications: BoxStream<'static, Result<Notification>>,
        stop: StopSignal,
        synced: watch::Sender<bool>,
    ) -> WatchOutcome {
        let mut pods_synced = false;
        let mut events_synced = false;

        loop {
            let next = tokio::select! {
                biased;
                _ = stop.stopped() => {
                    info!("stopping watch of namespace {}", self.namespace);
                    return WatchOutcome::Stopped;
                }
                next = notifications.next() => next,
            };

            match next {
                None => {
                    warn!("watch streams for namespace {} ended", self.namespace);
                    return WatchOutcome::StreamEnded;
                }
                Some(Err(e)) => warn!("watch error in namespace {}: {}", self.namespace, e),
                Some(Ok(Notification::Pod(Change::Synced))) => {
                    pods_synced = true;
                    if events_synced {
                        synced.send_replace(true);
                    }
                }
                Some(Ok(Notification::Event(Change::Synced))) => {
                    events_synced = true;
                    if pods_synced {
                        synced.send_replace(true);
                    }
                }
                Some(Ok(Notification::Pod(change))) => {
                    if let Some(outcome) = self.on_pod(change) {
                        return outcome;
                    }
                }
                Some(Ok(Notification::Event(change))) => self.on_event(change).await,
            }
        }
    }

    fn on_pod(&self, change: PodChange) -> Option<WatchOutcome> {
        match change {
            Change::Added(pod) | Change::Updated(pod) => {
                let status = pod.status();
                if self.tracker.observe(&pod.name, &status) {
                    metrics::STATUS_TRANSITIONS_TOTAL.inc();
                    debug!("pod {} has status {}", pod.name, status);
                }

                let count = self
                    .tracker
                    .record_readiness(&pod.name, policy::is_pod_ready(&pod));
                metrics::READY_PODS.set(count.count as i64);
                if !count.reached() {
                    return None;
                }

                info!("has {} ready pods now", count.count);
                Some(WatchOutcome::TargetReached {
                    ready: self.tracker.snapshot().ready_pods(),
                })
            }
            Change::Deleted(pod) => {
                let count = self.tracker.forget(&pod.name);
                metrics::READY_PODS.set(count.count as i64);
                debug!("pod {} deleted", pod.name);
                None
            }
            Change::Synced => None,
        }
    }

    async fn on_event(&self, change: EventChange) {
        match change {
            Change::Added(event) | Change::Updated(event) => self.evict_if_unrecoverable(&event).await,
            Change::Deleted(_) | Change::Synced => {}
        }
    }

    /// Deletes the pod an image pull failure event refers to. Best effort: a
    /// failed delete is logged and the watch carries on.
    async fn evict_if_unrecoverable(&self, event: &EventRecord) {
        if !policy::is_unrecoverable(event) {
            if event.involved_object.kind == "Pod" {
                debug!("ignoring pod message {}", event.message);
            }
            return;
        }

        let involved = &event.involved_object;
        let namespace = if involved.namespace.is_empty() {
            self.namespace.as_str()
        } else {
            involved.namespace.as_str()
        };
        info!("found pod {} with message {}", involved.name, event.message);

        match self.client.delete_pod(namespace, &involved.name).await {
            Ok(()) => {
                metrics::PODS_EVICTED_TOTAL.inc();
                info!("deleted pod {} in namespace {}", involved.name, namespace);
            }
            Err(e) => {
                metrics::POD_EVICTION_FAILURES_TOTAL.inc();
                error!(
                    "failed to delete Pod {} in namespace {} : {}",
                    involved.name, namespace, e
                );
            }
        }
    }
}

/// A running watch started by [`EventWatcher::start`].
pub struct WatchHandle {
    synced: bool,
    stop: StopSignal,
    task: JoinHandle<WatchOutcome>,
    tracker: Arc<StateTracker>,
}

impl WatchHandle {
    /// False when the watch runs degraded because the initial sync did not
    /// finish.
    pub fn is_synced(&self) -> bool {
        self.synced
    }

    pub fn tracker(&self) -> &StateTracker {
        &self.tracker
    }

    pub fn stop(&self) {
        self.stop.stop();
    }

    /// Waits for the dispatcher to finish.
    pub async fn wait(self) -> Result<WatchOutcome> {
        self.task
            .await
            .map_err(|e| Error::Internal(format!("watch dispatcher failed: {}", e)))
    }
}
