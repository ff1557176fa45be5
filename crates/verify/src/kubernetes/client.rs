use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use futures::{AsyncBufReadExt, StreamExt};
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{Event, Pod};
use kube::{
    api::{Api, DeleteParams, ListParams, LogParams},
    runtime::{watcher, WatchStreamExt},
    Client, Resource, ResourceExt,
};
use tracing::debug;

use super::{Change, EventRecord, JobRecord, PodRecord, ResourceClient};
use crate::sinks::{LogLine, LogSink};
use crate::{Error, Result};

/// [`ResourceClient`] backed by a live API server.
#[derive(Clone)]
pub struct KubeResourceClient {
    client: Client,
}

impl KubeResourceClient {
    pub async fn new() -> Result<Self> {
        let client = Client::try_default().await?;
        Ok(Self { client })
    }

    pub fn from_client(client: Client) -> Self {
        Self { client }
    }

    /// Namespace of the current kube context.
    pub fn default_namespace(&self) -> &str {
        self.client.default_namespace()
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn jobs(&self, namespace: &str) -> Api<Job> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

fn list_params(label_selector: &str, field_selector: &str) -> ListParams {
    let mut lp = ListParams::default();
    if !label_selector.is_empty() {
        lp = lp.labels(label_selector);
    }
    if !field_selector.is_empty() {
        lp = lp.fields(field_selector);
    }
    lp
}

/// Turns a watcher stream into add/update/delete notifications.
///
/// The watcher only reports "applied" objects, so the objects seen since the
/// last re-list decide between `Added` and `Updated`. Objects missing from a
/// re-list were deleted while the watch was down and are reported as such.
fn changes<K, T, F>(
    events: impl futures::Stream<Item = std::result::Result<watcher::Event<K>, watcher::Error>>
        + Send
        + 'static,
    convert: F,
) -> BoxStream<'static, Result<Change<T>>>
where
    K: Resource + Send + 'static,
    T: Clone + Send + 'static,
    F: Fn(&K) -> T + Send + 'static,
{
    let mut seen: HashMap<String, T> = HashMap::new();
    events
        .flat_map(move |event| {
            let out: Vec<Result<Change<T>>> = match event {
                Ok(watcher::Event::Applied(obj)) => {
                    let record = convert(&obj);
                    let change = match seen.insert(obj.name_any(), record.clone()) {
                        None => Change::Added(record),
                        Some(_) => Change::Updated(record),
                    };
                    vec![Ok(change)]
                }
                Ok(watcher::Event::Deleted(obj)) => {
                    seen.remove(&obj.name_any());
                    vec![Ok(Change::Deleted(convert(&obj)))]
                }
                Ok(watcher::Event::Restarted(objs)) => {
                    let mut current = HashMap::with_capacity(objs.len());
                    let mut applied = Vec::with_capacity(objs.len());
                    for obj in &objs {
                        let name = obj.name_any();
                        let record = convert(obj);
                        if seen.remove(&name).is_some() {
                            applied.push(Ok(Change::Updated(record.clone())));
                        } else {
                            applied.push(Ok(Change::Added(record.clone())));
                        }
                        current.insert(name, record);
                    }

                    let mut gone: Vec<(String, T)> = std::mem::replace(&mut seen, current)
                        .into_iter()
                        .collect();
                    gone.sort_by(|a, b| a.0.cmp(&b.0));
                    for (name, _) in &gone {
                        debug!("{} vanished while the watch was re-listing", name);
                    }

                    let mut out: Vec<Result<Change<T>>> = gone
                        .into_iter()
                        .map(|(_, record)| Ok(Change::Deleted(record)))
                        .collect();
                    out.extend(applied);
                    out.push(Ok(Change::Synced));
                    out
                }
                Err(e) => vec![Err(Error::Kubernetes(e.to_string()))],
            };
            stream::iter(out)
        })
        .boxed()
}

#[async_trait]
impl ResourceClient for KubeResourceClient {
    async fn list_pods(&self, namespace: &str, label_selector: &str) -> Result<Vec<PodRecord>> {
        match self.pods(namespace).list(&list_params(label_selector, "")).await {
            Ok(list) => Ok(list.items.iter().map(PodRecord::from).collect()),
            Err(e) => match Error::from(e) {
                Error::NotFound(_) => Ok(Vec::new()),
                err => Err(err.context(format!(
                    "failed to list pods in namespace {} with selector {}",
                    namespace, label_selector
                ))),
            },
        }
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<PodRecord>> {
        let pod = self.pods(namespace).get_opt(name).await.map_err(|e| {
            Error::from(e).context(format!("failed to get pod {} in namespace {}", name, namespace))
        })?;
        Ok(pod.as_ref().map(PodRecord::from))
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()> {
        self.pods(namespace)
            .delete(name, &DeleteParams::default())
            .await?;
        Ok(())
    }

    async fn stream_logs(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        sink: Arc<dyn LogSink>,
    ) -> Result<()> {
        let lp = LogParams {
            container: Some(container.to_string()),
            follow: true,
            ..Default::default()
        };
        let reader = self.pods(namespace).log_stream(pod, &lp).await?;
        let mut lines = Box::pin(reader.lines());
        while let Some(line) = lines.next().await {
            let text = line?;
            sink.write_line(&LogLine {
                pod,
                container,
                text: &text,
            })?;
        }
        debug!("log stream of pod {} container {} ended", pod, container);
        Ok(())
    }

    async fn read_logs(&self, namespace: &str, pod: &str, container: &str) -> Result<String> {
        let lp = LogParams {
            container: Some(container.to_string()),
            ..Default::default()
        };
        let logs = self.pods(namespace).logs(pod, &lp).await.map_err(|e| {
            Error::from(e).context(format!("failed to read log of pod {} in namespace {}", pod, namespace))
        })?;
        Ok(logs)
    }

    async fn list_jobs(
        &self,
        namespace: &str,
        label_selector: &str,
        field_selector: &str,
    ) -> Result<Vec<JobRecord>> {
        let lp = list_params(label_selector, field_selector);
        match self.jobs(namespace).list(&lp).await {
            Ok(list) => Ok(list.items.iter().map(JobRecord::from).collect()),
            Err(e) => match Error::from(e) {
                Error::NotFound(_) => Ok(Vec::new()),
                err => Err(err.context(format!(
                    "failed to list jobs in namespace {} selector {}",
                    namespace, label_selector
                ))),
            },
        }
    }

    async fn get_job(&self, namespace: &str, name: &str) -> Result<Option<JobRecord>> {
        let job = self.jobs(namespace).get_opt(name).await.map_err(|e| {
            Error::from(e).context(format!("failed to get job {} in namespace {}", name, namespace))
        })?;
        Ok(job.as_ref().map(JobRecord::from))
    }

    fn watch_pods(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> BoxStream<'static, Result<Change<PodRecord>>> {
        let api = self.pods(namespace);
        let mut config = watcher::Config::default();
        if !label_selector.is_empty() {
            config = config.labels(label_selector);
        }
        changes(
            watcher(api, config).default_backoff(),
            |pod: &Pod| PodRecord::from(pod),
        )
    }

    fn watch_events(&self, namespace: &str) -> BoxStream<'static, Result<Change<EventRecord>>> {
        let api: Api<Event> = Api::namespaced(self.client.clone(), namespace);
        changes(
            watcher(api, watcher::Config::default()).default_backoff(),
            |event: &Event| EventRecord::from(event),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn pod(name: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    async fn collect(events: Vec<watcher::Event<Pod>>) -> Vec<Change<String>> {
        let input = stream::iter(events.into_iter().map(Ok::<_, watcher::Error>));
        changes(input, |p: &Pod| p.name_any())
            .map(|change| change.unwrap())
            .collect()
            .await
    }

    #[tokio::test]
    async fn test_applied_objects_are_added_then_updated() {
        let out = collect(vec![
            watcher::Event::Applied(pod("a")),
            watcher::Event::Applied(pod("a")),
            watcher::Event::Deleted(pod("a")),
            watcher::Event::Applied(pod("a")),
        ])
        .await;
        assert_eq!(
            out,
            vec![
                Change::Added("a".to_string()),
                Change::Updated("a".to_string()),
                Change::Deleted("a".to_string()),
                Change::Added("a".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_relist_reports_vanished_objects_as_deleted() {
        let out = collect(vec![
            watcher::Event::Restarted(vec![pod("a"), pod("b")]),
            watcher::Event::Applied(pod("c")),
            watcher::Event::Restarted(vec![pod("b"), pod("d")]),
        ])
        .await;
        assert_eq!(
            out,
            vec![
                Change::Added("a".to_string()),
                Change::Added("b".to_string()),
                Change::Synced,
                Change::Added("c".to_string()),
                Change::Deleted("a".to_string()),
                Change::Deleted("c".to_string()),
                Change::Updated("b".to_string()),
                Change::Added("d".to_string()),
                Change::Synced,
            ]
        );
    }

    #[tokio::test]
    async fn test_watch_errors_are_passed_through() {
        let input = stream::iter(vec![Err::<watcher::Event<Pod>, _>(
            watcher::Error::WatchError(kube::core::ErrorResponse {
                status: "Failure".to_string(),
                message: "too old resource version".to_string(),
                reason: "Expired".to_string(),
                code: 410,
            }),
        )]);
        let out: Vec<Result<Change<String>>> =
            changes(input, |p: &Pod| p.name_any()).collect().await;
        assert_eq!(out.len(), 1);
        assert!(matches!(out[0], Err(Error::Kubernetes(_))));
    }
}
