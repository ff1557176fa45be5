use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

use crate::sinks::SinkFormat;
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    #[serde(rename = "text")]
    Text,
    #[serde(rename = "json")]
    Json,
}

impl FromStr for LogFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "text" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => Err(Error::Config(format!(
                "invalid log format: {}. Must be 'text' or 'json'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub kube: KubeConfig,
    pub timing: TimingConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone)]
pub struct KubeConfig {
    /// Namespace to verify. Unset means the client's default namespace.
    pub namespace: Option<String>,
}

#[derive(Debug, Clone)]
pub struct TimingConfig {
    pub poll_period: Duration,
    pub job_duration: Duration,
    pub sync_timeout: Duration,
    pub install_wait: Duration,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub format: LogFormat,
    pub level: String,
    pub sink_format: SinkFormat,
}

impl Config {
    pub fn load() -> Result<Self> {
        // Load environment variables from .env file if it exists
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from a variable lookup, falling back to defaults for
    /// anything unset or empty.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let defaults = Config::default();

        let duration = |key: &str, default: Duration| -> Result<Duration> {
            match var(key) {
                Some(value) => parse_duration(key, &value),
                None => Ok(default),
            }
        };

        let config = Config {
            kube: KubeConfig {
                namespace: var("VERIFY_NAMESPACE"),
            },
            timing: TimingConfig {
                poll_period: duration("VERIFY_POLL_PERIOD", defaults.timing.poll_period)?,
                job_duration: duration("VERIFY_JOB_DURATION", defaults.timing.job_duration)?,
                sync_timeout: duration("VERIFY_SYNC_TIMEOUT", defaults.timing.sync_timeout)?,
                install_wait: duration("VERIFY_INSTALL_WAIT", defaults.timing.install_wait)?,
            },
            logging: LoggingConfig {
                format: var("VERIFY_LOG_FORMAT")
                    .map(|v| v.parse::<LogFormat>())
                    .transpose()?
                    .unwrap_or_default(),
                level: var("VERIFY_LOG_LEVEL").unwrap_or(defaults.logging.level),
                sink_format: var("VERIFY_SINK_FORMAT")
                    .map(|v| v.parse::<SinkFormat>())
                    .transpose()?
                    .unwrap_or_default(),
            },
        };

        if config.timing.poll_period.is_zero() {
            return Err(Error::Config(
                "VERIFY_POLL_PERIOD must be greater than zero".to_string(),
            ));
        }

        Ok(config)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            kube: KubeConfig { namespace: None },
            timing: TimingConfig {
                poll_period: Duration::from_secs(1),
                job_duration: Duration::from_secs(60 * 60),
                sync_timeout: Duration::from_secs(60),
                install_wait: Duration::from_secs(2 * 60),
            },
            logging: LoggingConfig {
                format: LogFormat::Text,
                level: "info".to_string(),
                sink_format: SinkFormat::Text,
            },
        }
    }
}

/// Parses durations such as `1s`, `10m` or `1h 30m`.
pub fn parse_duration(key: &str, value: &str) -> Result<Duration> {
    humantime::parse_duration(value.trim())
        .map_err(|e| Error::Config(format!("invalid duration for {}: '{}': {}", key, value, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults_when_unset() {
        let config = tokio_test::assert_ok!(Config::from_lookup(lookup(&[])));
        assert_eq!(config.kube.namespace, None);
        assert_eq!(config.timing.poll_period, Duration::from_secs(1));
        assert_eq!(config.timing.job_duration, Duration::from_secs(3600));
        assert_eq!(config.timing.install_wait, Duration::from_secs(120));
        assert_eq!(config.logging.format, LogFormat::Text);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_reads_overrides() {
        let config = Config::from_lookup(lookup(&[
            ("VERIFY_NAMESPACE", "jx-staging"),
            ("VERIFY_POLL_PERIOD", "250ms"),
            ("VERIFY_JOB_DURATION", "1h 30m"),
            ("VERIFY_LOG_FORMAT", "JSON"),
            ("VERIFY_SINK_FORMAT", "json"),
            ("VERIFY_LOG_LEVEL", "debug"),
        ]))
        .unwrap();
        assert_eq!(config.kube.namespace.as_deref(), Some("jx-staging"));
        assert_eq!(config.timing.poll_period, Duration::from_millis(250));
        assert_eq!(config.timing.job_duration, Duration::from_secs(5400));
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.logging.sink_format, SinkFormat::Json);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_empty_values_fall_back_to_defaults() {
        let config = Config::from_lookup(lookup(&[("VERIFY_NAMESPACE", " ")])).unwrap();
        assert_eq!(config.kube.namespace, None);
    }

    #[test]
    fn test_invalid_values_are_config_errors() {
        let err = Config::from_lookup(lookup(&[("VERIFY_SYNC_TIMEOUT", "soon")])).unwrap_err();
        assert!(matches!(err, Error::Config(msg) if msg.contains("VERIFY_SYNC_TIMEOUT")));

        let err = Config::from_lookup(lookup(&[("VERIFY_LOG_FORMAT", "xml")])).unwrap_err();
        assert!(matches!(err, Error::Config(_)));

        let err = Config::from_lookup(lookup(&[("VERIFY_POLL_PERIOD", "0s")])).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
