use std::fmt;

use crate::{Error, Result};

/// Prefix of the machine readable result line.
pub const RESULT_PREFIX: &str = "POD RESULT: ";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PodResult {
    Ok,
    Failed(String),
}

impl PodResult {
    /// Turns a parsed marker into the outcome of the verification.
    pub fn into_result(self) -> Result<()> {
        match self {
            PodResult::Ok => Ok(()),
            PodResult::Failed(reason) => Err(Error::ResultMarkerFailed(reason)),
        }
    }
}

impl fmt::Display for PodResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PodResult::Ok => write!(f, "{}OK", RESULT_PREFIX),
            PodResult::Failed(reason) => write!(f, "{}FAILED: {}", RESULT_PREFIX, reason),
        }
    }
}

/// Finds the last result line in a log.
///
/// `OK` is success. `FAILED: <reason>` fails with the reason, any other text
/// after the prefix fails with that text.
pub fn parse_result(log: &str) -> Option<PodResult> {
    log.lines()
        .rev()
        .find_map(|line| line.trim_end().strip_prefix(RESULT_PREFIX))
        .map(|rest| match rest.trim() {
            "OK" => PodResult::Ok,
            other => PodResult::Failed(
                other
                    .strip_prefix("FAILED:")
                    .map(str::trim)
                    .unwrap_or(other)
                    .to_string(),
            ),
        })
}
