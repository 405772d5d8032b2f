pub mod pbs;

use crate::manifest::JobSpec;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SubmissionError {
    #[error("failed to render job artifacts")]
    Render(#[source] std::io::Error),
    #[error("failed to invoke the submit command")]
    Spawn(#[source] std::io::Error),
    #[error("submit command exited with code {0}")]
    Failed(i32),
    #[error("submit command timed out")]
    Timeout,
    #[error("submit command produced no parsable job handle: {0:?}")]
    BadHandle(String),
}

/// Opaque identifier the external scheduler returns for a submitted job
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
pub struct JobHandle(String);

impl JobHandle {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Narrow interface over the external batch scheduler.
///
/// `submit` renders one job's artifacts and enters it into the queue. The two
/// query operations return whatever free-text report the external tooling
/// produced: `query_status` is the live, authoritative source, `query_trace`
/// a historical, lower-fidelity one. Either may come back `None` at any time
/// (tool unreachable, job purged from history); interpreting the text is the
/// reconciler's business, not the scheduler's.
pub trait Scheduler {
    fn submit(&self, spec: &JobSpec) -> Result<JobHandle, SubmissionError>;

    fn query_status(&self, handle: &JobHandle) -> Option<String>;

    fn query_trace(&self, handle: &JobHandle) -> Option<String>;
}
