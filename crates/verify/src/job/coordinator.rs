use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use super::result::{parse_result, PodResult};
use super::{resolve_container, sorted_jobs};
use crate::kubernetes::{JobRecord, PodRecord, ResourceClient};
use crate::observe::policy::{self, JobPhase};
use crate::observe::{Deadline, PollLoop, PollResult};
use crate::sinks::LogSink;
use crate::{Error, Result};

/// Which Job to verify.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobTarget {
    /// An exact Job name. Its pods are matched with `job-name=<name>`.
    Name(String),
    /// A label selector; the newest matching Job is verified and its pods are
    /// matched with the same selector.
    Selector(String),
}

impl JobTarget {
    pub fn pod_selector(&self) -> String {
        match self {
            JobTarget::Name(name) => format!("job-name={}", name),
            JobTarget::Selector(selector) => selector.clone(),
        }
    }
}

impl fmt::Display for JobTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobTarget::Name(name) => write!(f, "name {}", name),
            JobTarget::Selector(selector) => write!(f, "selector {}", selector),
        }
    }
}

#[derive(Debug, Clone)]
pub struct JobVerifyOptions {
    pub namespace: String,
    pub target: JobTarget,
    /// Container to tail; the first container of the pod when unset.
    pub container: Option<String>,
    /// Bound on the whole verification.
    pub duration: Duration,
    pub poll_period: Duration,
    /// Check the result line in the log of the last pod once the Job succeeds.
    pub verify_result: bool,
    /// Report failures as a result line instead of failing the run.
    pub log_fail: bool,
    pub no_tail: bool,
}

impl JobVerifyOptions {
    pub fn new(namespace: &str, target: JobTarget) -> Self {
        Self {
            namespace: namespace.to_string(),
            target,
            container: None,
            duration: Duration::from_secs(60 * 60),
            poll_period: Duration::from_secs(1),
            verify_result: false,
            log_fail: false,
            no_tail: false,
        }
    }

    pub fn validate(&self) -> Result<()> {
        let empty = match &self.target {
            JobTarget::Name(name) => name.trim().is_empty(),
            JobTarget::Selector(selector) => selector.trim().is_empty(),
        };
        if empty {
            return Err(Error::Validation(
                "missing option: either a job name or a selector is required".to_string(),
            ));
        }
        if self.poll_period.is_zero() {
            return Err(Error::Validation("poll period must be greater than zero".to_string()));
        }
        Ok(())
    }
}

/// Follows a Job to completion, tailing each pod it starts.
///
/// The run finds the Job, then alternates between polling for an active pod,
/// tailing that pod's logs and re-checking the pod, until the Job finishes or
/// the deadline passes. A finished log does not mean a finished Job: a Job
/// may retry with a new pod.
pub struct JobLogCoordinator<C: ResourceClient + ?Sized> {
    client: Arc<C>,
    options: JobVerifyOptions,
    sink: Arc<dyn LogSink>,
}

impl<C: ResourceClient + ?Sized> JobLogCoordinator<C> {
    pub fn new(client: Arc<C>, options: JobVerifyOptions, sink: Arc<dyn LogSink>) -> Self {
        Self {
            client,
            options,
            sink,
        }
    }

    pub fn options(&self) -> &JobVerifyOptions {
        &self.options
    }

    /// Runs the verification and writes the result line to the sink.
    ///
    /// With `log_fail` set a failure is only reported through the result
    /// line and the run itself succeeds.
    pub async fn run_reporting(&self) -> Result<()> {
        match self.run().await {
            Ok(job) => {
                info!("job {} verified", job.name);
                self.sink.write_result(&PodResult::Ok.to_string())
            }
            Err(e) => {
                let line = PodResult::Failed(e.to_string()).to_string();
                if !self.options.log_fail {
                    if let Err(sink_err) = self.sink.write_result(&line) {
                        warn!("failed to write result to {}: {}", self.sink.name(), sink_err);
                    }
                    return Err(e);
                }
                warn!("job verification failed: {}", e);
                self.sink.write_result(&line)
            }
        }
    }

    /// Runs the verification, returning the finished Job on success.
    pub async fn run(&self) -> Result<JobRecord> {
        self.options.validate()?;
        let deadline = Deadline::after(self.options.duration);

        let job = self.find_job(&deadline).await?;
        info!("verifying job {} which is {}", job.name, JobPhase::from(&job));

        let poll = PollLoop::new(self.client.clone(), &self.options.namespace, &job.name, deadline)
            .with_pod_selector(&self.options.target.pod_selector())
            .with_poll_period(self.options.poll_period);

        let mut tailed: HashSet<String> = HashSet::new();
        loop {
            let pod = match poll.wait().await? {
                PollResult::Complete(job) => {
                    self.check_result(&job).await?;
                    return Ok(job);
                }
                PollResult::Pod(pod) => pod,
            };

            if deadline.expired() {
                return Err(deadline.timeout_error());
            }

            let container = resolve_container(&pod, self.options.container.as_deref())?;
            if self.options.no_tail || tailed.contains(&pod.name) {
                tokio::time::sleep(self.options.poll_period).await;
            } else if self.tail(&pod, &container).await {
                tailed.insert(pod.name.clone());
            }

            self.recheck(&pod.name).await?;
        }
    }

    /// AwaitingJob. By name the Job is polled until it exists; by selector
    /// the newest Job must already exist.
    async fn find_job(&self, deadline: &Deadline) -> Result<JobRecord> {
        let ns = &self.options.namespace;
        match &self.options.target {
            JobTarget::Name(name) => loop {
                if let Some(job) = self.client.get_job(ns, name).await.map_err(|e| {
                    e.context(format!("failed to get Job {} in namespace {}", name, ns))
                })? {
                    return Ok(job);
                }
                debug!("job {} does not exist yet", name);
                if deadline.expired() {
                    return Err(deadline.timeout_error());
                }
                tokio::time::sleep(self.options.poll_period).await;
            },
            JobTarget::Selector(selector) => {
                let jobs = sorted_jobs(self.client.as_ref(), ns, selector).await?;
                jobs.into_iter().next().ok_or_else(|| {
                    Error::NotFound(format!(
                        "no jobs in namespace {} with selector {}",
                        ns, selector
                    ))
                })
            }
        }
    }

    /// Streams the logs of a pod into the sink. Returns false when the tail
    /// broke, which is only worth a warning.
    async fn tail(&self, pod: &PodRecord, container: &str) -> bool {
        info!("tailing job pod {} container {}", pod.name, container);
        match self
            .client
            .stream_logs(&self.options.namespace, &pod.name, container, self.sink.clone())
            .await
        {
            Ok(()) => true,
            Err(e) => {
                warn!("failed to tail log: {}", e);
                false
            }
        }
    }

    async fn recheck(&self, pod_name: &str) -> Result<()> {
        let ns = &self.options.namespace;
        let pod = self.client.get_pod(ns, pod_name).await.map_err(|e| {
            e.context(format!("failed to get pod {} in namespace {}", pod_name, ns))
        })?;

        match pod {
            Some(pod) if pod.is_completed() => {
                info!("job pod {} has {}", pod.name, pod.phase)
            }
            Some(pod) if pod.deletion_requested => info!("job pod {} is Terminating", pod.name),
            Some(pod) => debug!("job pod {} is {}", pod.name, pod.status()),
            None => debug!("job pod {} no longer exists", pod_name),
        }
        Ok(())
    }

    /// Checks the result line of the newest pod when result verification is
    /// enabled.
    async fn check_result(&self, job: &JobRecord) -> Result<()> {
        if !self.options.verify_result {
            return Ok(());
        }

        let ns = &self.options.namespace;
        let selector = self.options.target.pod_selector();
        let pods = self.client.list_pods(ns, &selector).await.map_err(|e| {
            e.context(format!(
                "failed to list pods in namespace {} with selector {}",
                ns, selector
            ))
        })?;
        let pod = policy::latest_pod(&pods).ok_or_else(|| {
            Error::NotFound(format!(
                "no pod found for job {} in namespace {} with selector {}",
                job.name, ns, selector
            ))
        })?;

        let container = resolve_container(pod, self.options.container.as_deref())?;
        let log = self
            .client
            .read_logs(ns, &pod.name, &container)
            .await
            .map_err(|e| e.context(format!("failed to read the log of pod {}", pod.name)))?;

        match parse_result(&log) {
            Some(result) => {
                debug!("pod {} reported {}", pod.name, result);
                result.into_result()
            }
            None => Err(Error::ResultMarkerMissing {
                pod: pod.name.clone(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kubernetes::{InMemoryClient, JobCondition, MockResourceClient, PodPhase};
    use crate::sinks::CaptureSink;

    const NS: &str = "jx";

    fn options(target: JobTarget) -> JobVerifyOptions {
        JobVerifyOptions {
            duration: Duration::from_secs(5),
            poll_period: Duration::from_millis(5),
            ..JobVerifyOptions::new(NS, target)
        }
    }

    fn boot_pod() -> PodRecord {
        PodRecord::new("boot-abc", NS)
            .with_label("job-name", "boot")
            .with_containers(&["boot", "sidecar"])
            .with_phase(PodPhase::Running)
    }

    fn running_then_complete(client: &InMemoryClient) {
        client.script_job(vec![
            JobRecord::new("boot", NS).with_active(1),
            JobRecord::new("boot", NS).with_active(1),
            JobRecord::new("boot", NS).with_condition(JobCondition::Complete),
        ]);
        client.add_pod(boot_pod());
        client.set_logs(NS, "boot-abc", "boot", "installing\nPOD RESULT: OK\n");
    }

    fn coordinator(
        client: Arc<InMemoryClient>,
        options: JobVerifyOptions,
    ) -> (JobLogCoordinator<InMemoryClient>, Arc<CaptureSink>) {
        let sink = Arc::new(CaptureSink::new("capture"));
        (JobLogCoordinator::new(client, options, sink.clone()), sink)
    }

    #[tokio::test]
    async fn test_tails_running_pod_until_job_completes() {
        let client = Arc::new(InMemoryClient::new());
        running_then_complete(&client);

        let (coordinator, sink) = coordinator(client.clone(), options(JobTarget::Name("boot".into())));
        let job = coordinator.run().await.unwrap();

        assert!(job.is_succeeded());
        assert_eq!(client.tailed_pods(), vec![(NS.to_string(), "boot-abc".to_string())]);
        assert_eq!(sink.lines(), vec!["installing", "POD RESULT: OK"]);
    }

    #[tokio::test]
    async fn test_no_tail_never_streams_logs() {
        let client = Arc::new(InMemoryClient::new());
        running_then_complete(&client);

        let opts = JobVerifyOptions {
            no_tail: true,
            ..options(JobTarget::Name("boot".into()))
        };
        let (coordinator, sink) = coordinator(client.clone(), opts);
        coordinator.run().await.unwrap();

        assert!(client.tailed_pods().is_empty());
        assert!(sink.lines().is_empty());
    }

    #[tokio::test]
    async fn test_name_and_selector_reach_same_outcome() {
        for target in [
            JobTarget::Name("boot".to_string()),
            JobTarget::Selector("job-name=boot".to_string()),
        ] {
            let client = Arc::new(InMemoryClient::new());
            client.add_job(JobRecord::new("boot", NS).with_condition(JobCondition::Failed));

            let (coordinator, _) = coordinator(client, options(target.clone()));
            let err = coordinator.run().await.unwrap_err();
            assert!(
                matches!(&err, Error::JobFailed(name) if name == "boot"),
                "{}: {}",
                target,
                err
            );
        }

        for target in [
            JobTarget::Name("boot".to_string()),
            JobTarget::Selector("job-name=boot".to_string()),
        ] {
            let client = Arc::new(InMemoryClient::new());
            running_then_complete(&client);

            let (coordinator, _) = coordinator(client, options(target));
            assert_eq!(coordinator.run().await.unwrap().name, "boot");
        }
    }

    #[tokio::test]
    async fn test_missing_job_by_selector_is_not_found() {
        let client = Arc::new(InMemoryClient::new());
        let (coordinator, _) = coordinator(client, options(JobTarget::Selector("app=boot".into())));

        assert!(matches!(coordinator.run().await, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_missing_job_by_name_times_out() {
        let client = Arc::new(InMemoryClient::new());
        let opts = JobVerifyOptions {
            duration: Duration::from_millis(20),
            ..options(JobTarget::Name("boot".into()))
        };
        let (coordinator, _) = coordinator(client, opts);

        let err = coordinator.run().await.unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn test_job_by_name_appears_later() {
        let mut client = MockResourceClient::new();
        let mut calls = 0;
        client.expect_get_job().returning(move |ns, name| {
            calls += 1;
            Ok(match calls {
                1 | 2 => None,
                _ => Some(JobRecord::new(name, ns).with_condition(JobCondition::Complete)),
            })
        });

        let sink = Arc::new(CaptureSink::new("capture"));
        let coordinator = JobLogCoordinator::new(
            Arc::new(client),
            options(JobTarget::Name("boot".into())),
            sink,
        );
        assert!(coordinator.run().await.unwrap().is_succeeded());
    }

    #[tokio::test]
    async fn test_invalid_container_fails_fast() {
        let client = Arc::new(InMemoryClient::new());
        client.add_job(JobRecord::new("boot", NS).with_active(1));
        client.add_pod(
            PodRecord::new("build-abc", NS)
                .with_label("job-name", "boot")
                .with_containers(&["sidecar", "build"])
                .with_phase(PodPhase::Running),
        );

        let opts = JobVerifyOptions {
            container: Some("missing".to_string()),
            ..options(JobTarget::Name("boot".into()))
        };
        let (coordinator, _) = coordinator(client.clone(), opts);

        let err = coordinator.run().await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid container name missing for pod build-abc. Available names: build, sidecar"
        );
        assert!(client.tailed_pods().is_empty());
    }

    #[tokio::test]
    async fn test_tail_failure_is_not_fatal() {
        let client = Arc::new(InMemoryClient::new());
        running_then_complete(&client);
        client.fail_tails(true);

        let (coordinator, _) = coordinator(client.clone(), options(JobTarget::Name("boot".into())));
        assert!(coordinator.run().await.is_ok());
        assert!(!client.tailed_pods().is_empty());
    }

    #[tokio::test]
    async fn test_verify_result_ok() {
        let client = Arc::new(InMemoryClient::new());
        running_then_complete(&client);

        let opts = JobVerifyOptions {
            verify_result: true,
            ..options(JobTarget::Name("boot".into()))
        };
        let (coordinator, _) = coordinator(client, opts);
        assert!(coordinator.run().await.is_ok());
    }

    #[tokio::test]
    async fn test_verify_result_failed_carries_reason() {
        let client = Arc::new(InMemoryClient::new());
        running_then_complete(&client);
        client.set_logs(NS, "boot-abc", "boot", "checking\nPOD RESULT: FAILED: disk full\n");

        let opts = JobVerifyOptions {
            verify_result: true,
            ..options(JobTarget::Name("boot".into()))
        };
        let (coordinator, _) = coordinator(client, opts);

        let err = coordinator.run().await.unwrap_err();
        assert!(matches!(&err, Error::ResultMarkerFailed(reason) if reason == "disk full"));
        assert_eq!(err.to_string(), "disk full");
    }

    #[tokio::test]
    async fn test_verify_result_without_marker() {
        let client = Arc::new(InMemoryClient::new());
        running_then_complete(&client);
        client.set_logs(NS, "boot-abc", "boot", "done\n");

        let opts = JobVerifyOptions {
            verify_result: true,
            ..options(JobTarget::Name("boot".into()))
        };
        let (coordinator, _) = coordinator(client, opts);

        assert!(matches!(
            coordinator.run().await,
            Err(Error::ResultMarkerMissing { pod }) if pod == "boot-abc"
        ));
    }

    #[tokio::test]
    async fn test_log_fail_reports_failure_as_result_line() {
        let client = Arc::new(InMemoryClient::new());
        client.add_job(JobRecord::new("boot", NS).with_condition(JobCondition::Failed));

        let opts = JobVerifyOptions {
            log_fail: true,
            ..options(JobTarget::Name("boot".into()))
        };
        let (coordinator, sink) = coordinator(client, opts);

        assert!(coordinator.run_reporting().await.is_ok());
        assert_eq!(sink.results(), vec!["POD RESULT: FAILED: job boot failed"]);
    }

    #[tokio::test]
    async fn test_failure_without_log_fail_is_returned() {
        let client = Arc::new(InMemoryClient::new());
        client.add_job(JobRecord::new("boot", NS).with_condition(JobCondition::Failed));

        let (coordinator, sink) = coordinator(client, options(JobTarget::Name("boot".into())));

        assert!(matches!(
            coordinator.run_reporting().await,
            Err(Error::JobFailed(_))
        ));
        assert_eq!(sink.results(), vec!["POD RESULT: FAILED: job boot failed"]);
    }

    #[tokio::test]
    async fn test_success_reports_ok_line() {
        let client = Arc::new(InMemoryClient::new());
        running_then_complete(&client);

        let (coordinator, sink) = coordinator(client, options(JobTarget::Name("boot".into())));
        coordinator.run_reporting().await.unwrap();
        assert_eq!(sink.results(), vec!["POD RESULT: OK"]);
    }

    #[test]
    fn test_empty_target_is_rejected() {
        let opts = JobVerifyOptions::new(NS, JobTarget::Selector(" ".into()));
        assert!(matches!(opts.validate(), Err(Error::Validation(_))));
    }
}
