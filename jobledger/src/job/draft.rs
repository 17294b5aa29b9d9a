//! Builder for the partial job records reported by the queue engine.
//!
//! The engine reports whatever it knows about a job on every state change;
//! required fields are therefore carried as [`Option`]s and checked by
//! [`crate::service::JobLedger::persist`] before anything is written.

use chrono::TimeDelta;

use super::{BackoffKind, ExternalJobId, JobStatus};

/// A partially specified job record, as reported by the queue engine.
///
/// # Example
///
/// ```
/// # use jobledger::job::{draft::JobDraft, JobStatus};
/// let draft = JobDraft::new()
///     .with_external_id("job-1")
///     .with_task_id("t1")
///     .with_queue("default")
///     .with_status(JobStatus::Waiting)
///     .with_priority(5);
/// ```
#[derive(Debug, Clone, Default)]
pub struct JobDraft {
    pub(crate) external_id: Option<ExternalJobId>,
    pub(crate) queue: Option<String>,
    pub(crate) task_id: Option<String>,
    pub(crate) status: Option<JobStatus>,
    pub(crate) priority: Option<i32>,
    pub(crate) max_attempts: Option<u16>,
    pub(crate) backoff: Option<BackoffKind>,
    pub(crate) backoff_delay: Option<TimeDelta>,
    pub(crate) payload: Option<serde_json::Value>,
    pub(crate) options: Option<serde_json::Value>,
    pub(crate) result: Option<serde_json::Value>,
    pub(crate) error: Option<String>,
}

impl JobDraft {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_external_id(self, external_id: impl Into<ExternalJobId>) -> Self {
        Self {
            external_id: Some(external_id.into()),
            ..self
        }
    }

    pub fn with_queue(self, queue: impl Into<String>) -> Self {
        Self {
            queue: Some(queue.into()),
            ..self
        }
    }

    pub fn with_task_id(self, task_id: impl Into<String>) -> Self {
        Self {
            task_id: Some(task_id.into()),
            ..self
        }
    }

    pub fn with_status(self, status: JobStatus) -> Self {
        Self {
            status: Some(status),
            ..self
        }
    }

    pub fn with_priority(self, priority: i32) -> Self {
        Self {
            priority: Some(priority),
            ..self
        }
    }

    pub fn with_max_attempts(self, max_attempts: u16) -> Self {
        Self {
            max_attempts: Some(max_attempts),
            ..self
        }
    }

    pub fn with_backoff(self, backoff: BackoffKind, delay: TimeDelta) -> Self {
        Self {
            backoff: Some(backoff),
            backoff_delay: Some(delay),
            ..self
        }
    }

    pub fn with_payload(self, payload: serde_json::Value) -> Self {
        Self {
            payload: Some(payload),
            ..self
        }
    }

    pub fn with_options(self, options: serde_json::Value) -> Self {
        Self {
            options: Some(options),
            ..self
        }
    }

    pub fn with_result(self, result: serde_json::Value) -> Self {
        Self {
            result: Some(result),
            ..self
        }
    }

    /// The engine's error text for a failed job.
    pub fn with_error(self, error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..self
        }
    }
}
