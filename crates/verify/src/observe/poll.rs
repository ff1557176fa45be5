use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info};

use super::policy::{self, JobPhase};
use super::state::StateTracker;
use crate::kubernetes::{JobRecord, PodRecord, ResourceClient};
use crate::metrics;
use crate::{Error, Result};

/// Absolute end of a time bounded wait.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    end: Instant,
    duration: Duration,
}

impl Deadline {
    pub fn after(duration: Duration) -> Self {
        Self {
            end: Instant::now() + duration,
            duration,
        }
    }

    pub fn expired(&self) -> bool {
        Instant::now() >= self.end
    }

    pub fn remaining(&self) -> Duration {
        self.end.saturating_duration_since(Instant::now())
    }

    /// The configured length of the wait, not the time left.
    pub fn duration(&self) -> Duration {
        self.duration
    }

    pub fn timeout_error(&self) -> Error {
        Error::timeout(self.duration)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    JobFinished(JobRecord),
    PodActive(PodRecord),
    Waiting,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PollResult {
    /// The job succeeded.
    Complete(JobRecord),
    /// A running or ready pod of the job appeared.
    Pod(PodRecord),
}

/// Polls a job and its pods until the job finishes or a pod becomes active.
pub struct PollLoop<C: ResourceClient + ?Sized> {
    client: Arc<C>,
    namespace: String,
    job_name: String,
    pod_selector: String,
    poll_period: Duration,
    deadline: Deadline,
    statuses: StateTracker,
    status_changes: AtomicU64,
}

impl<C: ResourceClient + ?Sized> PollLoop<C> {
    /// Pods are matched with `job-name=<job_name>` unless
    /// [`PollLoop::with_pod_selector`] says otherwise.
    pub fn new(client: Arc<C>, namespace: &str, job_name: &str, deadline: Deadline) -> Self {
        Self {
            client,
            namespace: namespace.to_string(),
            job_name: job_name.to_string(),
            pod_selector: format!("job-name={}", job_name),
            poll_period: Duration::from_secs(1),
            deadline,
            statuses: StateTracker::new(0),
            status_changes: AtomicU64::new(0),
        }
    }

    pub fn with_pod_selector(mut self, selector: &str) -> Self {
        self.pod_selector = selector.to_string();
        self
    }

    pub fn with_poll_period(mut self, poll_period: Duration) -> Self {
        self.poll_period = poll_period;
        self
    }

    pub fn deadline(&self) -> &Deadline {
        &self.deadline
    }

    pub fn pod_selector(&self) -> &str {
        &self.pod_selector
    }

    /// Number of pod status lines logged so far.
    pub fn status_changes(&self) -> u64 {
        self.status_changes.load(Ordering::Relaxed)
    }

    /// One poll. The job is fetched first; once it has finished no pod is
    /// consulted in the same tick.
    pub async fn tick(&self) -> Result<TickOutcome> {
        metrics::POLL_TICKS_TOTAL.inc();

        let job = self
            .client
            .get_job(&self.namespace, &self.job_name)
            .await
            .and_then(|job| {
                job.ok_or_else(|| {
                    Error::NotFound(format!(
                        "job {} in namespace {}",
                        self.job_name, self.namespace
                    ))
                })
            })
            .map_err(|e| e.context(format!("failed to check for Job {} complete", self.job_name)))?;

        if job.is_finished() {
            info!("job {} has {}", job.name, JobPhase::from(&job));
            return Ok(TickOutcome::JobFinished(job));
        }
        debug!("job {} is not completed yet", job.name);

        let pods = self
            .client
            .list_pods(&self.namespace, &self.pod_selector)
            .await
            .map_err(|e| {
                e.context(format!(
                    "failed to query ready pod in namespace {} with selector {}",
                    self.namespace, self.pod_selector
                ))
            })?;

        let pod = match policy::pick_pod(&pods) {
            Some(pod) => pod,
            None => return Ok(TickOutcome::Waiting),
        };

        if !pod.is_completed() && !pod.deletion_requested {
            let status = pod.status();
            if self.statuses.observe(&pod.name, &status) {
                self.status_changes.fetch_add(1, Ordering::Relaxed);
                metrics::STATUS_TRANSITIONS_TOTAL.inc();
                info!("pod {} has status {}", pod.name, status);
            }
        }

        if policy::is_pod_active(pod) {
            Ok(TickOutcome::PodActive(pod.clone()))
        } else {
            Ok(TickOutcome::Waiting)
        }
    }

    /// Ticks every poll period until the job finishes, a pod becomes active
    /// or the deadline passes. The deadline is only checked after a tick
    /// found nothing.
    pub async fn wait(&self) -> Result<PollResult> {
        loop {
            match self.tick().await? {
                TickOutcome::JobFinished(job) if job.is_succeeded() => {
                    return Ok(PollResult::Complete(job))
                }
                TickOutcome::JobFinished(job) => return Err(Error::JobFailed(job.name)),
                TickOutcome::PodActive(pod) => return Ok(PollResult::Pod(pod)),
                TickOutcome::Waiting => {}
            }

            if self.deadline.expired() {
                return Err(self.deadline.timeout_error());
            }
            tokio::time::sleep(self.poll_period).await;
        }
    }
}
