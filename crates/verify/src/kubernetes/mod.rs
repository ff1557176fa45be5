//! Cluster access used by the watchers, poll loops and the job coordinator.
//!
//! Everything talks to the cluster through [`ResourceClient`] so the
//! observation engine can run against a live cluster or an in-memory one.

mod client;
#[cfg(any(test, feature = "test-utils"))]
mod memory;
mod resources;
#[cfg(any(test, feature = "test-utils"))]
mod selector;

pub use client::KubeResourceClient;
#[cfg(any(test, feature = "test-utils"))]
pub use memory::InMemoryClient;
pub use resources::*;
#[cfg(any(test, feature = "test-utils"))]
pub use selector::LabelSelector;

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
#[cfg(test)]
use mockall::automock;

use crate::sinks::LogSink;
use crate::Result;

/// A notification delivered by a watch subscription.
///
/// `Synced` is emitted once the initial snapshot of the stream has been
/// delivered, and again after the stream re-lists following a reconnect.
#[derive(Debug, Clone, PartialEq)]
pub enum Change<T> {
    Added(T),
    Updated(T),
    Deleted(T),
    Synced,
}

impl<T> Change<T> {
    pub fn object(&self) -> Option<&T> {
        match self {
            Change::Added(obj) | Change::Updated(obj) | Change::Deleted(obj) => Some(obj),
            Change::Synced => None,
        }
    }
}

pub type PodChange = Change<PodRecord>;
pub type EventChange = Change<EventRecord>;

/// Minimal capability surface over the cluster API.
///
/// Selectors are passed as strings in the usual Kubernetes syntax; an empty
/// string selects everything. List calls treat a missing resource as an empty
/// result, get calls return `None`.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ResourceClient: Send + Sync {
    async fn list_pods(&self, namespace: &str, label_selector: &str) -> Result<Vec<PodRecord>>;

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<PodRecord>>;

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()>;

    /// Follows the log of a container, writing each line to the sink until the
    /// container stops or the stream breaks.
    async fn stream_logs(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        sink: Arc<dyn LogSink>,
    ) -> Result<()>;

    /// Reads the complete log of a container.
    async fn read_logs(&self, namespace: &str, pod: &str, container: &str) -> Result<String>;

    async fn list_jobs(
        &self,
        namespace: &str,
        label_selector: &str,
        field_selector: &str,
    ) -> Result<Vec<JobRecord>>;

    async fn get_job(&self, namespace: &str, name: &str) -> Result<Option<JobRecord>>;

    /// Watches the pods matching `label_selector`. A pod that stops matching
    /// is reported as deleted.
    fn watch_pods(&self, namespace: &str, label_selector: &str) -> BoxStream<'static, Result<PodChange>>;

    fn watch_events(&self, namespace: &str) -> BoxStream<'static, Result<EventChange>>;
}
