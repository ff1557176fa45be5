use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures::channel::mpsc;
use futures::stream::{self, BoxStream};
use futures::StreamExt;

use super::{EventChange, JobRecord, LabelSelector, PodChange, PodRecord, ResourceClient};
use crate::sinks::{LogLine, LogSink};
use crate::{Error, Result};

type Key = (String, String);

fn key(namespace: &str, name: &str) -> Key {
    (namespace.to_string(), name.to_string())
}

#[derive(Default)]
struct Cluster {
    pods: BTreeMap<Key, PodRecord>,
    jobs: BTreeMap<Key, JobRecord>,
    logs: HashMap<(String, String, String), String>,
    /// Scripted job states handed out by successive `get_job` calls.
    job_scripts: HashMap<Key, Vec<JobRecord>>,
    pod_scripts: HashMap<Key, Vec<PodRecord>>,
    pod_watches: Vec<(String, LabelSelector, mpsc::UnboundedSender<Result<PodChange>>)>,
    event_watches: Vec<(String, mpsc::UnboundedSender<Result<EventChange>>)>,
    deleted: Vec<Key>,
    tailed: Vec<(String, String)>,
    fail_deletes: bool,
    fail_tails: bool,
}

/// In-memory cluster implementing [`ResourceClient`].
///
/// Objects are stored per namespace. Watches replay the current objects,
/// emit `Synced` and then deliver whatever is pushed with
/// [`InMemoryClient::emit_pod`] / [`InMemoryClient::emit_event`]. Like the API
/// server, a pod watch with a selector reports a pod that stops matching as
/// deleted.
#[derive(Clone, Default)]
pub struct InMemoryClient {
    cluster: Arc<Mutex<Cluster>>,
}

impl InMemoryClient {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Cluster> {
        self.cluster.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_pod(&self, pod: PodRecord) {
        self.lock().pods.insert(key(&pod.namespace, &pod.name), pod);
    }

    pub fn add_job(&self, job: JobRecord) {
        self.lock().jobs.insert(key(&job.namespace, &job.name), job);
    }

    pub fn set_logs(&self, namespace: &str, pod: &str, container: &str, logs: &str) {
        self.lock().logs.insert(
            (namespace.to_string(), pod.to_string(), container.to_string()),
            logs.to_string(),
        );
    }

    /// Queues job states returned by successive `get_job` calls. The last
    /// state sticks and becomes the stored job.
    pub fn script_job(&self, states: Vec<JobRecord>) {
        if let Some(first) = states.first() {
            let k = key(&first.namespace, &first.name);
            let mut cluster = self.lock();
            cluster.jobs.insert(k.clone(), first.clone());
            cluster.job_scripts.insert(k, states);
        }
    }

    /// Queues pod states returned by successive `get_pod` and `list_pods`
    /// lookups of that pod.
    pub fn script_pod(&self, states: Vec<PodRecord>) {
        if let Some(first) = states.first() {
            let k = key(&first.namespace, &first.name);
            let mut cluster = self.lock();
            cluster.pods.insert(k.clone(), first.clone());
            cluster.pod_scripts.insert(k, states);
        }
    }

    pub fn fail_deletes(&self, fail: bool) {
        self.lock().fail_deletes = fail;
    }

    pub fn fail_tails(&self, fail: bool) {
        self.lock().fail_tails = fail;
    }

    /// Pods deleted through the client, as `(namespace, name)`.
    pub fn deleted_pods(&self) -> Vec<(String, String)> {
        self.lock().deleted.clone()
    }

    /// Pods whose logs were tailed, in order.
    pub fn tailed_pods(&self) -> Vec<(String, String)> {
        self.lock().tailed.clone()
    }

    pub fn pod_count(&self, namespace: &str) -> usize {
        self.lock().pods.keys().filter(|(ns, _)| ns == namespace).count()
    }

    /// Stores the pod and notifies pod watches of its namespace.
    pub fn emit_pod(&self, change: PodChange) {
        let mut cluster = self.lock();
        let pod = change.object().cloned();
        if let Some(pod) = &pod {
            let k = key(&pod.namespace, &pod.name);
            if let PodChange::Deleted(_) = change {
                cluster.pods.remove(&k);
            } else {
                cluster.pods.insert(k, pod.clone());
            }
        }
        cluster.pod_watches.retain(|(ns, selector, tx)| {
            let delivered = match &pod {
                None => change.clone(),
                Some(pod) if &pod.namespace != ns => return !tx.is_closed(),
                Some(pod) if !selector.matches(&pod.labels) => PodChange::Deleted(pod.clone()),
                Some(_) => change.clone(),
            };
            tx.unbounded_send(Ok(delivered)).is_ok()
        });
    }

    pub fn emit_event(&self, change: EventChange) {
        let mut cluster = self.lock();
        let namespace = change
            .object()
            .map(|e| e.involved_object.namespace.clone())
            .unwrap_or_default();
        cluster.event_watches.retain(|(ns, tx)| {
            if namespace.is_empty() || &namespace == ns {
                tx.unbounded_send(Ok(change.clone())).is_ok()
            } else {
                !tx.is_closed()
            }
        });
    }

    /// Ends every open watch stream.
    pub fn close_watches(&self) {
        let mut cluster = self.lock();
        cluster.pod_watches.clear();
        cluster.event_watches.clear();
    }

    fn next_pod_state(cluster: &mut Cluster, k: &Key) -> Option<PodRecord> {
        if let Some(states) = cluster.pod_scripts.get_mut(k) {
            if states.len() > 1 {
                let state = states.remove(0);
                cluster.pods.insert(k.clone(), state.clone());
                return Some(state);
            }
            if let Some(last) = states.first().cloned() {
                cluster.pod_scripts.remove(k);
                cluster.pods.insert(k.clone(), last.clone());
                return Some(last);
            }
        }
        cluster.pods.get(k).cloned()
    }
}

fn field_matches(job: &JobRecord, field_selector: &str) -> bool {
    field_selector
        .split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .all(|term| match term.split_once('=') {
            Some(("metadata.name", value)) => job.name == value,
            Some(("metadata.namespace", value)) => job.namespace == value,
            _ => true,
        })
}

#[async_trait]
impl ResourceClient for InMemoryClient {
    async fn list_pods(&self, namespace: &str, label_selector: &str) -> Result<Vec<PodRecord>> {
        let selector = LabelSelector::parse(label_selector)?;
        let mut cluster = self.lock();
        let keys: Vec<Key> = cluster
            .pods
            .iter()
            .filter(|((ns, _), pod)| ns == namespace && selector.matches(&pod.labels))
            .map(|(k, _)| k.clone())
            .collect();
        Ok(keys
            .iter()
            .filter_map(|k| Self::next_pod_state(&mut cluster, k))
            .collect())
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<PodRecord>> {
        let mut cluster = self.lock();
        Ok(Self::next_pod_state(&mut cluster, &key(namespace, name)))
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()> {
        let mut cluster = self.lock();
        if cluster.fail_deletes {
            return Err(Error::Kubernetes(format!(
                "pods \"{}\" is forbidden: cannot delete in namespace {}",
                name, namespace
            )));
        }
        let k = key(namespace, name);
        match cluster.pods.remove(&k) {
            Some(_) => {
                cluster.deleted.push(k);
                Ok(())
            }
            None => Err(Error::NotFound(format!("pods \"{}\" not found", name))),
        }
    }

    async fn stream_logs(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        sink: Arc<dyn LogSink>,
    ) -> Result<()> {
        let logs = {
            let mut cluster = self.lock();
            cluster.tailed.push((namespace.to_string(), pod.to_string()));
            if cluster.fail_tails {
                return Err(Error::Kubernetes(format!(
                    "container {} in pod {} is waiting to start",
                    container, pod
                )));
            }
            cluster
                .logs
                .get(&(namespace.to_string(), pod.to_string(), container.to_string()))
                .cloned()
                .unwrap_or_default()
        };
        for text in logs.lines() {
            sink.write_line(&LogLine {
                pod,
                container,
                text,
            })?;
        }
        Ok(())
    }

    async fn read_logs(&self, namespace: &str, pod: &str, container: &str) -> Result<String> {
        Ok(self
            .lock()
            .logs
            .get(&(namespace.to_string(), pod.to_string(), container.to_string()))
            .cloned()
            .unwrap_or_default())
    }

    async fn list_jobs(
        &self,
        namespace: &str,
        label_selector: &str,
        field_selector: &str,
    ) -> Result<Vec<JobRecord>> {
        let selector = LabelSelector::parse(label_selector)?;
        Ok(self
            .lock()
            .jobs
            .iter()
            .filter(|((ns, _), job)| {
                ns == namespace && selector.matches(&job.labels) && field_matches(job, field_selector)
            })
            .map(|(_, job)| job.clone())
            .collect())
    }

    async fn get_job(&self, namespace: &str, name: &str) -> Result<Option<JobRecord>> {
        let mut cluster = self.lock();
        let k = key(namespace, name);
        if let Some(states) = cluster.job_scripts.get_mut(&k) {
            let state = if states.len() > 1 {
                states.remove(0)
            } else {
                states[0].clone()
            };
            cluster.jobs.insert(k.clone(), state);
        }
        Ok(cluster.jobs.get(&k).cloned())
    }

    fn watch_pods(&self, namespace: &str, label_selector: &str) -> BoxStream<'static, Result<PodChange>> {
        let selector = match LabelSelector::parse(label_selector) {
            Ok(selector) => selector,
            Err(e) => return stream::iter(vec![Err(e)]).boxed(),
        };
        let (tx, rx) = mpsc::unbounded();
        let mut cluster = self.lock();
        let initial: Vec<Result<PodChange>> = cluster
            .pods
            .iter()
            .filter(|((ns, _), pod)| ns == namespace && selector.matches(&pod.labels))
            .map(|(_, pod)| Ok(PodChange::Added(pod.clone())))
            .chain(std::iter::once(Ok(PodChange::Synced)))
            .collect();
        cluster.pod_watches.push((namespace.to_string(), selector, tx));
        stream::iter(initial).chain(rx).boxed()
    }

    fn watch_events(&self, namespace: &str) -> BoxStream<'static, Result<EventChange>> {
        let (tx, rx) = mpsc::unbounded();
        self.lock().event_watches.push((namespace.to_string(), tx));
        stream::iter(vec![Ok(EventChange::Synced)])
            .chain(rx)
            .boxed()
    }
}
