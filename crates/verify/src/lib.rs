pub mod config;
pub mod install;
pub mod job;
pub mod kubernetes;
pub mod metrics;
pub mod observe;
pub mod sinks;

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Kubernetes error: {0}")]
    Kubernetes(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("timed out after waiting for duration {}", humantime::format_duration(*.duration))]
    Timeout { duration: Duration },
    #[error("invalid container name {container} for pod {pod}. Available names: {}", .available.join(", "))]
    InvalidContainer {
        container: String,
        pod: String,
        available: Vec<String>,
    },
    #[error("job {0} failed")]
    JobFailed(String),
    #[error("no line starting with the result marker found in the log of pod {pod}")]
    ResultMarkerMissing { pod: String },
    #[error("{0}")]
    ResultMarkerFailed(String),
    #[error("the following pods are not ready:\n{0}")]
    PodsNotReady(String),
    #[error("{message}: {source}")]
    Context {
        message: String,
        #[source]
        source: Box<Error>,
    },
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    SerdeJson(#[from] serde_json::Error),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn timeout(duration: Duration) -> Self {
        Error::Timeout { duration }
    }

    /// Wraps the error with a message describing the operation that failed.
    pub fn context(self, message: impl Into<String>) -> Self {
        Error::Context {
            message: message.into(),
            source: Box::new(self),
        }
    }

    /// The innermost error, skipping any context wrappers.
    pub fn root(&self) -> &Error {
        match self {
            Error::Context { source, .. } => source.root(),
            other => other,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self.root(), Error::Timeout { .. })
    }
}

impl From<kube::Error> for Error {
    fn from(err: kube::Error) -> Self {
        match &err {
            kube::Error::Api(resp) if resp.code == 404 => Error::NotFound(resp.message.clone()),
            _ => Error::Kubernetes(err.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_names_the_configured_duration() {
        let err = Error::timeout(Duration::from_secs(90));
        assert_eq!(err.to_string(), "timed out after waiting for duration 1m 30s");
        assert!(err.is_timeout());
    }

    #[test]
    fn context_keeps_the_root_error() {
        let err = Error::JobFailed("build".to_string()).context("failed to check for Job build complete");
        assert_eq!(
            err.to_string(),
            "failed to check for Job build complete: job build failed"
        );
        assert!(matches!(err.root(), Error::JobFailed(name) if name == "build"));
        assert!(!err.is_timeout());
    }

    #[test]
    fn invalid_container_lists_available_names() {
        let err = Error::InvalidContainer {
            container: "missing".to_string(),
            pod: "build-abc".to_string(),
            available: vec!["build".to_string(), "sidecar".to_string()],
        };
        assert_eq!(
            err.to_string(),
            "invalid container name missing for pod build-abc. Available names: build, sidecar"
        );
    }
}
