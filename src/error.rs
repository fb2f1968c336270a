//! Crate-wide error type.
//!
//! Mirrors the error taxonomy from the scheduler design: malformed
//! input, a t-tuple collision on a non-replacing schedule, a sign
//! queue that could not make room within its retry budget, and
//! unrecoverable system-resource failures (mutex/condvar/signal setup).

use std::fmt;

use crate::task::Task;

/// Errors produced by the scheduler core.
#[derive(thiserror::Error, Debug)]
pub enum ScheduleError {
    /// A required argument was missing, or a duration string could not
    /// be parsed.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// `schedule(..., replace = false)` was called for a t-tuple that
    /// is already present. The caller gets the rejected task back so
    /// ownership of it is never ambiguous.
    #[error("task already present for this t-tuple")]
    AlreadyPresent(Task),

    /// The sign queue could not make room for a new item within its
    /// retry budget. The caller is expected to drain with `wait_for`
    /// and retry.
    #[error("sign queue push exhausted its retry budget")]
    ResourceExhausted,

    /// A mutex, condition variable, or signal handler could not be
    /// set up. The process is not expected to continue past this.
    #[error("fatal system error: {0}")]
    Fatal(String),
}

impl ScheduleError {
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        ScheduleError::InvalidArgument(msg.into())
    }
}

/// A duration string failed to parse. Kept distinct from
/// `ScheduleError` so that `duration` module consumers that don't
/// otherwise touch the scheduler don't need to pull in the rest of
/// the error enum's variants (the `Task` payload in particular).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DurationParseError(pub String);

impl fmt::Display for DurationParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cannot parse duration string: {}", self.0)
    }
}

impl std::error::Error for DurationParseError {}

impl From<DurationParseError> for ScheduleError {
    fn from(e: DurationParseError) -> Self {
        ScheduleError::InvalidArgument(e.0)
    }
}
