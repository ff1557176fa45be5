use std::sync::{Mutex, PoisonError};

use super::{LogLine, LogSink};
use crate::Result;

/// Keeps everything in memory.
#[derive(Debug, Default)]
pub struct CaptureSink {
    name: String,
    lines: Mutex<Vec<String>>,
    results: Mutex<Vec<String>>,
}

impl CaptureSink {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn results(&self) -> Vec<String> {
        self.results.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl LogSink for CaptureSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn write_line(&self, line: &LogLine<'_>) -> Result<()> {
        self.lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(line.text.to_string());
        Ok(())
    }

    fn write_result(&self, result: &str) -> Result<()> {
        self.results
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(result.to_string());
        Ok(())
    }
}
