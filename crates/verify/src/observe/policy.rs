//! Pure decisions over observed records. Nothing in here performs I/O.

use std::fmt;

use crate::kubernetes::{EventRecord, JobRecord, PodPhase, PodRecord};

/// Event message when the kubelet cannot pull an image.
pub const ERR_IMAGE_PULL_MESSAGE: &str = "Error: ErrImagePull";

/// Event message when the kubelet is backing off pulling an image.
pub const ERR_IMAGE_PULL_BACKOFF_MESSAGE: &str = "Error: ImagePullBackOff";

const UNRECOVERABLE_MESSAGES: [&str; 2] = [ERR_IMAGE_PULL_MESSAGE, ERR_IMAGE_PULL_BACKOFF_MESSAGE];

/// A pod counts as ready once it has completed or its Ready condition holds.
pub fn is_pod_ready(pod: &PodRecord) -> bool {
    pod.is_completed() || pod.ready
}

/// True when the event reports a pod stuck on an image pull. The message must
/// match exactly.
pub fn is_unrecoverable(event: &EventRecord) -> bool {
    event.involved_object.kind == "Pod" && UNRECOVERABLE_MESSAGES.contains(&event.message.as_str())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl JobPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobPhase::Succeeded | JobPhase::Failed)
    }
}

impl fmt::Display for JobPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobPhase::Pending => write!(f, "Pending"),
            JobPhase::Running => write!(f, "Running"),
            JobPhase::Succeeded => write!(f, "Succeeded"),
            JobPhase::Failed => write!(f, "Failed"),
        }
    }
}

impl From<&JobRecord> for JobPhase {
    fn from(job: &JobRecord) -> Self {
        if job.is_succeeded() {
            JobPhase::Succeeded
        } else if job.is_finished() {
            JobPhase::Failed
        } else if job.active > 0 {
            JobPhase::Running
        } else {
            JobPhase::Pending
        }
    }
}

impl From<&PodRecord> for JobPhase {
    fn from(pod: &PodRecord) -> Self {
        match pod.phase {
            PodPhase::Succeeded => JobPhase::Succeeded,
            PodPhase::Failed => JobPhase::Failed,
            PodPhase::Running => JobPhase::Running,
            PodPhase::Pending | PodPhase::Unknown => JobPhase::Pending,
        }
    }
}

/// Whether a pod is far enough along to tail its logs.
pub fn is_pod_active(pod: &PodRecord) -> bool {
    pod.phase == PodPhase::Running || pod.ready
}

/// Picks the pod to follow among the pods matching a job selector: the newest
/// ready pod, else the newest running pod, else the newest pod that has not
/// completed yet. Pods being deleted are never picked.
pub fn pick_pod(pods: &[PodRecord]) -> Option<&PodRecord> {
    let mut sorted: Vec<&PodRecord> = pods.iter().collect();
    sorted.sort_by(|a, b| b.created.cmp(&a.created).then_with(|| a.name.cmp(&b.name)));
    sorted
        .iter()
        .find(|p| p.ready && !p.deletion_requested)
        .or_else(|| {
            sorted
                .iter()
                .find(|p| p.phase == PodPhase::Running && !p.deletion_requested)
        })
        .or_else(|| {
            sorted
                .iter()
                .find(|p| !p.is_completed() && !p.deletion_requested)
        })
        .copied()
}

/// The most recently created pod, regardless of state.
pub fn latest_pod(pods: &[PodRecord]) -> Option<&PodRecord> {
    pods.iter()
        .max_by(|a, b| a.created.cmp(&b.created).then_with(|| b.name.cmp(&a.name)))
}
