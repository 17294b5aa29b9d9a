//! The core data model: job records and their per-attempt history.

use std::fmt::Display;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::backoff::BackoffStrategy;

pub mod draft;

/// The store-generated identifier of a [`JobRecord`].
#[derive(Debug, Eq, PartialEq, Hash, Clone, Copy)]
pub struct JobId(i64);

impl From<i64> for JobId {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

impl From<JobId> for i64 {
    fn from(value: JobId) -> Self {
        value.0
    }
}

impl Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "JobId({})", self.0)
    }
}

/// The identifier assigned to a job by the external queue engine.
///
/// Globally unique and immutable after creation; the engine may redeliver
/// notifications for the same external id, which resolve as upserts.
#[derive(Debug, Eq, PartialEq, Hash, Clone, Serialize, Deserialize)]
pub struct ExternalJobId(String);

impl ExternalJobId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for ExternalJobId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for ExternalJobId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl Display for ExternalJobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The lifecycle state of a [`JobRecord`].
///
/// `Waiting → Active → {Completed, Failed}` with side branches
/// `Active → Paused → Waiting`, `Waiting → Delayed → Waiting`, and the
/// recovery-only `Active → Stuck → Waiting`.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Waiting,
    Active,
    Completed,
    Failed,
    Paused,
    Delayed,
    Stuck,
}

impl JobStatus {
    /// Whether no further automatic transitions are expected from this state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Waiting => "waiting",
            JobStatus::Active => "active",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Paused => "paused",
            JobStatus::Delayed => "delayed",
            JobStatus::Stuck => "stuck",
        }
    }
}

impl Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The declared retry backoff policy of a job.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    Fixed,
    Exponential,
    Linear,
}

impl Display for BackoffKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let val = match self {
            BackoffKind::Fixed => "fixed",
            BackoffKind::Exponential => "exponential",
            BackoffKind::Linear => "linear",
        };
        write!(f, "{val}")
    }
}

/// One row per unit of dispatched work.
///
/// Invariants maintained by the store:
///
/// - `started_at` is set iff the job has ever entered [`JobStatus::Active`],
/// - `finished_at` is set iff the status is terminal,
/// - `external_id` is unique and immutable after creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRecord {
    pub id: JobId,
    pub external_id: ExternalJobId,
    pub queue: String,
    pub task_id: String,
    pub status: JobStatus,
    pub priority: i32,
    pub max_attempts: u16,
    pub backoff: BackoffKind,
    pub backoff_delay: TimeDelta,
    pub payload: serde_json::Value,
    pub options: serde_json::Value,
    pub result: Option<serde_json::Value>,
    pub delayed_until: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl JobRecord {
    /// The delay to apply before the given (1-based) attempt is retried,
    /// according to the job's declared backoff policy.
    pub fn retry_delay(&self, attempt: u16) -> TimeDelta {
        let strategy = match self.backoff {
            BackoffKind::Fixed => BackoffStrategy::fixed(self.backoff_delay),
            BackoffKind::Exponential => BackoffStrategy::exponential(self.backoff_delay),
            BackoffKind::Linear => BackoffStrategy::linear(self.backoff_delay),
        };
        strategy.delay(attempt)
    }
}

/// A fully resolved job ready to be written via
/// [`crate::store::JobStore::upsert_by_external_id`].
///
/// Constructed by the persistence service after validating a
/// [`draft::JobDraft`] and applying defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewJob {
    pub external_id: ExternalJobId,
    pub queue: String,
    pub task_id: String,
    pub status: JobStatus,
    pub priority: i32,
    pub max_attempts: u16,
    pub backoff: BackoffKind,
    pub backoff_delay: TimeDelta,
    pub payload: serde_json::Value,
    pub options: serde_json::Value,
    pub result: Option<serde_json::Value>,
    /// Error text reported by the queue engine; recorded on the attempt a
    /// `Failed` transition closes.
    pub error: Option<String>,
}

impl NewJob {
    pub const DEFAULT_PRIORITY: i32 = 0;
    pub const DEFAULT_MAX_ATTEMPTS: u16 = 3;
    pub const DEFAULT_BACKOFF: BackoffKind = BackoffKind::Exponential;
    pub const DEFAULT_BACKOFF_DELAY: TimeDelta = TimeDelta::milliseconds(2000);
}

/// One execution try of a job, numbered sequentially from 1.
///
/// Attempt rows are append-only history: only the most recent attempt of a
/// job may be in [`AttemptStatus::Processing`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobAttempt {
    pub job_id: JobId,
    pub number: u16,
    pub status: AttemptStatus,
    pub error: Option<String>,
    pub result: Option<serde_json::Value>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl Display for AttemptStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let val = match self {
            AttemptStatus::Processing => "processing",
            AttemptStatus::Completed => "completed",
            AttemptStatus::Failed => "failed",
            AttemptStatus::Cancelled => "cancelled",
        };
        write!(f, "{val}")
    }
}
