//! Destinations for tailed container logs and the final result line.

mod capture;
mod stdout;

pub use capture::CaptureSink;
pub use stdout::{FileSink, StdoutSink};

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// One line of container output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogLine<'a> {
    pub pod: &'a str,
    pub container: &'a str,
    pub text: &'a str,
}

pub trait LogSink: Send + Sync {
    fn name(&self) -> &str;

    fn write_line(&self, line: &LogLine<'_>) -> Result<()>;

    /// Writes the machine readable result line of a verification run.
    fn write_result(&self, result: &str) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SinkFormat {
    #[default]
    Text,
    Json,
}

impl FromStr for SinkFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "text" => Ok(SinkFormat::Text),
            "json" => Ok(SinkFormat::Json),
            other => Err(Error::Config(format!(
                "invalid sink format: {}. Must be 'text' or 'json'",
                other
            ))),
        }
    }
}

impl fmt::Display for SinkFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SinkFormat::Text => write!(f, "text"),
            SinkFormat::Json => write!(f, "json"),
        }
    }
}

/// Renders a line in the given format, without a trailing newline.
pub fn render_line(format: SinkFormat, line: &LogLine<'_>) -> Result<String> {
    match format {
        SinkFormat::Text => Ok(line.text.to_string()),
        SinkFormat::Json => Ok(serde_json::to_string(line)?),
    }
}

/// Forwards every line to each inner sink. A failing sink does not stop the
/// others; the first error is returned.
pub struct FanoutSink {
    sinks: Vec<Arc<dyn LogSink>>,
}

impl FanoutSink {
    pub fn new(sinks: Vec<Arc<dyn LogSink>>) -> Self {
        Self { sinks }
    }

    fn each(&self, f: impl Fn(&dyn LogSink) -> Result<()>) -> Result<()> {
        let mut first_err = None;
        for sink in &self.sinks {
            if let Err(e) = f(sink.as_ref()) {
                tracing::warn!("sink {} failed: {}", sink.name(), e);
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

impl LogSink for FanoutSink {
    fn name(&self) -> &str {
        "fanout"
    }

    fn write_line(&self, line: &LogLine<'_>) -> Result<()> {
        self.each(|sink| sink.write_line(line))
    }

    fn write_result(&self, result: &str) -> Result<()> {
        self.each(|sink| sink.write_result(result))
    }
}
