//! Checks that every pod of an installation is ready.

use std::collections::BTreeMap;
use std::fmt;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::job::resolve_container;
use crate::kubernetes::{PodPhase, PodRecord, ResourceClient};
use crate::observe::policy;
use crate::observe::Deadline;
use crate::{Error, Result};

/// Label carried by pipeline build pods, which are skipped by default.
pub const PIPELINE_RUN_LABEL: &str = "tekton.dev/pipelineRun";

#[derive(Debug, Clone)]
pub struct InstallOptions {
    pub namespace: String,
    /// Replaces the default selector when set.
    pub selector: Option<String>,
    pub include_build_pods: bool,
    /// How long to keep retrying. Zero checks once.
    pub wait: Duration,
    pub poll_period: Duration,
    /// Rewritten on every attempt with the logs of the pods in phase Failed.
    pub log_file: Option<PathBuf>,
}

impl InstallOptions {
    pub fn new(namespace: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            selector: None,
            include_build_pods: false,
            wait: Duration::from_secs(2 * 60),
            poll_period: Duration::from_secs(10),
            log_file: None,
        }
    }

    pub fn label_selector(&self) -> String {
        match &self.selector {
            Some(selector) if !selector.is_empty() => selector.clone(),
            _ if self.include_build_pods => String::new(),
            _ => format!("!{}", PIPELINE_RUN_LABEL),
        }
    }
}

/// Pods seen by the last check, as `(name, phase)` rows.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstallReport {
    pub pods: Vec<(String, String)>,
}

impl fmt::Display for InstallReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let width = self
            .pods
            .iter()
            .map(|(name, _)| name.len())
            .max()
            .unwrap_or(0)
            .max("POD".len());
        writeln!(f, "{:<width$} STATUS", "POD", width = width)?;
        for (name, phase) in &self.pods {
            writeln!(f, "{:<width$} {}", name, phase, width = width)?;
        }
        Ok(())
    }
}

pub struct InstallCheck<C: ResourceClient + ?Sized> {
    client: Arc<C>,
    options: InstallOptions,
}

impl<C: ResourceClient + ?Sized> InstallCheck<C> {
    pub fn new(client: Arc<C>, options: InstallOptions) -> Self {
        Self { client, options }
    }

    /// Retries [`InstallCheck::check`] until every pod is ready or the wait
    /// time elapses. The report of the last attempt is returned either way.
    pub async fn run(&self) -> (InstallReport, Result<()>) {
        info!("checking pod statuses in namespace {}", self.options.namespace);
        let deadline = Deadline::after(self.options.wait);
        let mut logged_waiting = false;

        loop {
            let (report, result) = self.check().await;
            let err = match result {
                Ok(()) => return (report, Ok(())),
                Err(e) => e,
            };

            if self.options.wait.is_zero() {
                return (report, Err(err));
            }
            if deadline.expired() {
                let message = format!(
                    "timed out after waiting {} for the pods to become ready",
                    humantime::format_duration(self.options.wait)
                );
                return (report, Err(err.context(message)));
            }

            if !logged_waiting {
                logged_waiting = true;
                info!(
                    "waiting up to {} for pods to be ready",
                    humantime::format_duration(self.options.wait)
                );
            }
            debug!("{}", err);
            tokio::time::sleep(self.options.poll_period).await;
        }
    }

    /// A single attempt. Fails with the not ready pods grouped by phase.
    pub async fn check(&self) -> (InstallReport, Result<()>) {
        let ns = &self.options.namespace;
        let pods = match self.client.list_pods(ns, &self.options.label_selector()).await {
            Ok(pods) => pods,
            Err(e) => {
                let e = e.context(format!("failed to list the pods in namespace '{}'", ns));
                return (InstallReport::default(), Err(e));
            }
        };

        let report = InstallReport {
            pods: pods
                .iter()
                .map(|p| (p.name.clone(), p.phase.to_string()))
                .collect(),
        };
        if let Some(path) = &self.options.log_file {
            if let Err(e) = self.write_failed_logs(path, &pods).await {
                return (report, Err(e));
            }
        }
        (report, not_ready_error(&pods))
    }

    async fn write_failed_logs(&self, path: &Path, pods: &[PodRecord]) -> Result<()> {
        debug!("writing logs of failed pods to {}", path.display());
        let mut file = File::create(path)
            .map_err(|e| Error::from(e).context(format!("failed to create log file {}", path.display())))?;

        for pod in pods.iter().filter(|p| p.phase == PodPhase::Failed) {
            let container = resolve_container(pod, None)?;
            let logs = self
                .client
                .read_logs(&pod.namespace, &pod.name, &container)
                .await
                .map_err(|e| e.context(format!("failed to get the logs of pod {}", pod.name)))?;
            writeln!(file, "Logs for pod {}:", pod.name)?;
            writeln!(file, "{}", logs.trim_end())?;
        }
        Ok(())
    }
}

fn not_ready_error(pods: &[PodRecord]) -> Result<()> {
    let mut by_phase: BTreeMap<String, Vec<&str>> = BTreeMap::new();
    for pod in pods.iter().filter(|p| !policy::is_pod_ready(p)) {
        by_phase
            .entry(pod.phase.to_string())
            .or_default()
            .push(pod.name.as_str());
    }
    if by_phase.is_empty() {
        return Ok(());
    }

    let listing: Vec<String> = by_phase
        .iter()
        .map(|(phase, names)| format!("{}: {}", phase, names.join(", ")))
        .collect();
    Err(Error::PodsNotReady(listing.join("\n")))
}
