use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{Event, Pod};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PodPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

impl PodPhase {
    pub fn is_completed(&self) -> bool {
        matches!(self, PodPhase::Succeeded | PodPhase::Failed)
    }
}

impl fmt::Display for PodPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PodPhase::Pending => write!(f, "Pending"),
            PodPhase::Running => write!(f, "Running"),
            PodPhase::Succeeded => write!(f, "Succeeded"),
            PodPhase::Failed => write!(f, "Failed"),
            PodPhase::Unknown => write!(f, "Unknown"),
        }
    }
}

impl From<&str> for PodPhase {
    fn from(s: &str) -> Self {
        match s {
            "Pending" => PodPhase::Pending,
            "Running" => PodPhase::Running,
            "Succeeded" => PodPhase::Succeeded,
            "Failed" => PodPhase::Failed,
            _ => PodPhase::Unknown,
        }
    }
}

/// Snapshot of a pod as seen by a list, get or watch call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PodRecord {
    pub name: String,
    pub namespace: String,
    pub phase: PodPhase,
    pub ready: bool,
    pub deletion_requested: bool,
    pub containers: Vec<String>,
    /// Reason the first waiting container gives, e.g. `ErrImagePull`.
    pub waiting_reason: Option<String>,
    pub labels: BTreeMap<String, String>,
    pub created: Option<DateTime<Utc>>,
}

impl PodRecord {
    pub fn new(name: &str, namespace: &str) -> Self {
        Self {
            name: name.to_string(),
            namespace: namespace.to_string(),
            phase: PodPhase::Pending,
            ready: false,
            deletion_requested: false,
            containers: Vec::new(),
            waiting_reason: None,
            labels: BTreeMap::new(),
            created: None,
        }
    }

    pub fn with_phase(mut self, phase: PodPhase) -> Self {
        self.phase = phase;
        self
    }

    pub fn with_ready(mut self, ready: bool) -> Self {
        self.ready = ready;
        self
    }

    pub fn with_containers(mut self, containers: &[&str]) -> Self {
        self.containers = containers.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn with_label(mut self, key: &str, value: &str) -> Self {
        self.labels.insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_created(mut self, created: DateTime<Utc>) -> Self {
        self.created = Some(created);
        self
    }

    pub fn is_completed(&self) -> bool {
        self.phase.is_completed()
    }

    /// Short human readable status, used for change detection while polling.
    pub fn status(&self) -> String {
        if self.deletion_requested {
            return "Terminating".to_string();
        }
        if let Some(reason) = &self.waiting_reason {
            return reason.clone();
        }
        if self.phase == PodPhase::Running && self.ready {
            return "Ready".to_string();
        }
        self.phase.to_string()
    }
}

impl From<&Pod> for PodRecord {
    fn from(pod: &Pod) -> Self {
        let status = pod.status.as_ref();
        let phase = status
            .and_then(|s| s.phase.as_deref())
            .map(PodPhase::from)
            .unwrap_or(PodPhase::Unknown);
        let ready = status
            .and_then(|s| s.conditions.as_ref())
            .map(|conds| conds.iter().any(|c| c.type_ == "Ready" && c.status == "True"))
            .unwrap_or(false);
        let waiting_reason = status
            .and_then(|s| s.container_statuses.as_ref())
            .and_then(|statuses| {
                statuses
                    .iter()
                    .filter_map(|cs| cs.state.as_ref()?.waiting.as_ref()?.reason.clone())
                    .next()
            });

        Self {
            name: pod.metadata.name.clone().unwrap_or_default(),
            namespace: pod.metadata.namespace.clone().unwrap_or_default(),
            phase,
            ready,
            deletion_requested: pod.metadata.deletion_timestamp.is_some(),
            containers: pod
                .spec
                .as_ref()
                .map(|spec| spec.containers.iter().map(|c| c.name.clone()).collect())
                .unwrap_or_default(),
            waiting_reason,
            labels: pod.metadata.labels.clone().unwrap_or_default(),
            created: pod.metadata.creation_timestamp.as_ref().map(|t| t.0),
        }
    }
}

/// Finished condition of a job. Only conditions with status `True` are kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobCondition {
    Complete,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub name: String,
    pub namespace: String,
    pub labels: BTreeMap<String, String>,
    pub active: i32,
    pub succeeded: i32,
    pub failed: i32,
    pub conditions: Vec<JobCondition>,
    pub created: Option<DateTime<Utc>>,
}

impl JobRecord {
    pub fn new(name: &str, namespace: &str) -> Self {
        let mut labels = BTreeMap::new();
        labels.insert("job-name".to_string(), name.to_string());
        Self {
            name: name.to_string(),
            namespace: namespace.to_string(),
            labels,
            active: 0,
            succeeded: 0,
            failed: 0,
            conditions: Vec::new(),
            created: None,
        }
    }

    pub fn with_active(mut self, active: i32) -> Self {
        self.active = active;
        self
    }

    pub fn with_condition(mut self, condition: JobCondition) -> Self {
        match condition {
            JobCondition::Complete => self.succeeded += 1,
            JobCondition::Failed => self.failed += 1,
        }
        self.conditions.push(condition);
        self
    }

    pub fn with_label(mut self, key: &str, value: &str) -> Self {
        self.labels.insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_created(mut self, created: DateTime<Utc>) -> Self {
        self.created = Some(created);
        self
    }

    pub fn is_finished(&self) -> bool {
        !self.conditions.is_empty()
    }

    pub fn is_succeeded(&self) -> bool {
        self.conditions.contains(&JobCondition::Complete)
    }
}

impl From<&Job> for JobRecord {
    fn from(job: &Job) -> Self {
        let status = job.status.as_ref();
        let conditions = status
            .and_then(|s| s.conditions.as_ref())
            .map(|conds| {
                conds
                    .iter()
                    .filter(|c| c.status == "True")
                    .filter_map(|c| match c.type_.as_str() {
                        "Complete" => Some(JobCondition::Complete),
                        "Failed" => Some(JobCondition::Failed),
                        _ => None,
                    })
                    .collect()
            })
            .unwrap_or_default();

        Self {
            name: job.metadata.name.clone().unwrap_or_default(),
            namespace: job.metadata.namespace.clone().unwrap_or_default(),
            labels: job.metadata.labels.clone().unwrap_or_default(),
            active: status.and_then(|s| s.active).unwrap_or(0),
            succeeded: status.and_then(|s| s.succeeded).unwrap_or(0),
            failed: status.and_then(|s| s.failed).unwrap_or(0),
            conditions,
            created: job.metadata.creation_timestamp.as_ref().map(|t| t.0),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectRef {
    pub kind: String,
    pub name: String,
    pub namespace: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord {
    pub involved_object: ObjectRef,
    pub message: String,
}

impl EventRecord {
    pub fn new(kind: &str, name: &str, namespace: &str, message: &str) -> Self {
        Self {
            involved_object: ObjectRef {
                kind: kind.to_string(),
                name: name.to_string(),
                namespace: namespace.to_string(),
            },
            message: message.to_string(),
        }
    }
}

impl From<&Event> for EventRecord {
    fn from(event: &Event) -> Self {
        let involved = &event.involved_object;
        Self {
            involved_object: ObjectRef {
                kind: involved.kind.clone().unwrap_or_default(),
                name: involved.name.clone().unwrap_or_default(),
                namespace: involved.namespace.clone().unwrap_or_default(),
            },
            message: event.message.clone().unwrap_or_default(),
        }
    }
}
