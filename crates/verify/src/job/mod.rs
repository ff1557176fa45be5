//! Job verification: follow a Job until it finishes, tailing the logs of its
//! pods along the way.

mod coordinator;
mod result;

pub use coordinator::{JobLogCoordinator, JobTarget, JobVerifyOptions};
pub use result::{parse_result, PodResult, RESULT_PREFIX};

use crate::kubernetes::{JobRecord, PodRecord, ResourceClient};
use crate::{Error, Result};

/// Jobs matching `selector`, newest first.
pub async fn sorted_jobs<C: ResourceClient + ?Sized>(
    client: &C,
    namespace: &str,
    selector: &str,
) -> Result<Vec<JobRecord>> {
    let mut jobs = client
        .list_jobs(namespace, selector, "")
        .await
        .map_err(|e| {
            e.context(format!(
                "failed to list jobs in namespace {} selector {}",
                namespace, selector
            ))
        })?;
    jobs.sort_by(|a, b| b.created.cmp(&a.created).then_with(|| a.name.cmp(&b.name)));
    Ok(jobs)
}

/// The container whose logs to follow: `requested` when given, else the
/// first container of the pod.
pub fn resolve_container(pod: &PodRecord, requested: Option<&str>) -> Result<String> {
    let name = match requested.filter(|c| !c.is_empty()) {
        Some(name) => name,
        None => pod.containers.first().map(String::as_str).ok_or_else(|| {
            Error::Validation(format!("pod {} has no containers", pod.name))
        })?,
    };

    if pod.containers.iter().any(|c| c == name) {
        return Ok(name.to_string());
    }

    let mut available = pod.containers.clone();
    available.sort();
    Err(Error::InvalidContainer {
        container: name.to_string(),
        pod: pod.name.clone(),
        available,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kubernetes::InMemoryClient;
    use chrono::{Duration, Utc};

    #[tokio::test]
    async fn test_sorted_jobs_newest_first() {
        let client = InMemoryClient::new();
        let now = Utc::now();
        client.add_job(
            JobRecord::new("boot-1", "jx")
                .with_label("app", "boot")
                .with_created(now - Duration::minutes(10)),
        );
        client.add_job(
            JobRecord::new("boot-3", "jx")
                .with_label("app", "boot")
                .with_created(now),
        );
        client.add_job(
            JobRecord::new("boot-2", "jx")
                .with_label("app", "boot")
                .with_created(now - Duration::minutes(5)),
        );
        client.add_job(JobRecord::new("other", "jx").with_created(now));

        let names: Vec<String> = sorted_jobs(&client, "jx", "app=boot")
            .await
            .unwrap()
            .into_iter()
            .map(|j| j.name)
            .collect();
        assert_eq!(names, vec!["boot-3", "boot-2", "boot-1"]);
    }

    #[test]
    fn test_resolve_container_defaults_to_first() {
        let pod = PodRecord::new("build-abc", "jx").with_containers(&["step", "build"]);
        assert_eq!(resolve_container(&pod, None).unwrap(), "step");
        assert_eq!(resolve_container(&pod, Some("")).unwrap(), "step");
        assert_eq!(resolve_container(&pod, Some("build")).unwrap(), "build");
    }

    #[test]
    fn test_unknown_container_lists_sorted_names() {
        let pod = PodRecord::new("build-abc", "jx").with_containers(&["sidecar", "build"]);
        let err = resolve_container(&pod, Some("missing")).unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid container name missing for pod build-abc. Available names: build, sidecar"
        );
    }

    #[test]
    fn test_pod_without_containers_is_rejected() {
        let pod = PodRecord::new("empty", "jx");
        assert!(matches!(
            resolve_container(&pod, None),
            Err(Error::Validation(_))
        ));
    }
}
