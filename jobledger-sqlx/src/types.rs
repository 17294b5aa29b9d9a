use chrono::{DateTime, TimeDelta, Utc};
use jobledger::{
    audit::AuditLogEntry,
    job::{JobAttempt, JobRecord},
    store::StoreError,
};
use sqlx::{
    postgres::{PgHasArrayType, PgTypeInfo},
    prelude::FromRow,
};

#[derive(sqlx::Type, Debug, Clone, Copy, PartialEq, Eq)]
#[sqlx(type_name = "jobledger_job_state", rename_all = "lowercase")]
pub(crate) enum JobStatus {
    Waiting,
    Active,
    Completed,
    Failed,
    Paused,
    Delayed,
    Stuck,
}

impl PgHasArrayType for JobStatus {
    fn array_type_info() -> PgTypeInfo {
        PgTypeInfo::with_name("jobledger_job_state[]")
    }
}

impl From<JobStatus> for jobledger::job::JobStatus {
    fn from(value: JobStatus) -> Self {
        match value {
            JobStatus::Waiting => Self::Waiting,
            JobStatus::Active => Self::Active,
            JobStatus::Completed => Self::Completed,
            JobStatus::Failed => Self::Failed,
            JobStatus::Paused => Self::Paused,
            JobStatus::Delayed => Self::Delayed,
            JobStatus::Stuck => Self::Stuck,
        }
    }
}

impl From<jobledger::job::JobStatus> for JobStatus {
    fn from(value: jobledger::job::JobStatus) -> Self {
        match value {
            jobledger::job::JobStatus::Waiting => Self::Waiting,
            jobledger::job::JobStatus::Active => Self::Active,
            jobledger::job::JobStatus::Completed => Self::Completed,
            jobledger::job::JobStatus::Failed => Self::Failed,
            jobledger::job::JobStatus::Paused => Self::Paused,
            jobledger::job::JobStatus::Delayed => Self::Delayed,
            jobledger::job::JobStatus::Stuck => Self::Stuck,
        }
    }
}

#[derive(sqlx::Type, Debug, Clone, Copy, PartialEq, Eq)]
#[sqlx(type_name = "jobledger_attempt_state", rename_all = "lowercase")]
pub(crate) enum AttemptStatus {
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl From<AttemptStatus> for jobledger::job::AttemptStatus {
    fn from(value: AttemptStatus) -> Self {
        match value {
            AttemptStatus::Processing => Self::Processing,
            AttemptStatus::Completed => Self::Completed,
            AttemptStatus::Failed => Self::Failed,
            AttemptStatus::Cancelled => Self::Cancelled,
        }
    }
}

impl From<jobledger::job::AttemptStatus> for AttemptStatus {
    fn from(value: jobledger::job::AttemptStatus) -> Self {
        match value {
            jobledger::job::AttemptStatus::Processing => Self::Processing,
            jobledger::job::AttemptStatus::Completed => Self::Completed,
            jobledger::job::AttemptStatus::Failed => Self::Failed,
            jobledger::job::AttemptStatus::Cancelled => Self::Cancelled,
        }
    }
}

#[derive(sqlx::Type, Debug, Clone, Copy, PartialEq, Eq)]
#[sqlx(type_name = "jobledger_backoff_kind", rename_all = "lowercase")]
pub(crate) enum BackoffKind {
    Fixed,
    Exponential,
    Linear,
}

impl From<BackoffKind> for jobledger::job::BackoffKind {
    fn from(value: BackoffKind) -> Self {
        match value {
            BackoffKind::Fixed => Self::Fixed,
            BackoffKind::Exponential => Self::Exponential,
            BackoffKind::Linear => Self::Linear,
        }
    }
}

impl From<jobledger::job::BackoffKind> for BackoffKind {
    fn from(value: jobledger::job::BackoffKind) -> Self {
        match value {
            jobledger::job::BackoffKind::Fixed => Self::Fixed,
            jobledger::job::BackoffKind::Exponential => Self::Exponential,
            jobledger::job::BackoffKind::Linear => Self::Linear,
        }
    }
}

#[derive(sqlx::Type, Debug, Clone, Copy, PartialEq, Eq)]
#[sqlx(type_name = "jobledger_subject_kind", rename_all = "lowercase")]
pub(crate) enum SubjectKind {
    Job,
    System,
}

impl From<SubjectKind> for jobledger::audit::SubjectKind {
    fn from(value: SubjectKind) -> Self {
        match value {
            SubjectKind::Job => Self::Job,
            SubjectKind::System => Self::System,
        }
    }
}

impl From<jobledger::audit::SubjectKind> for SubjectKind {
    fn from(value: jobledger::audit::SubjectKind) -> Self {
        match value {
            jobledger::audit::SubjectKind::Job => Self::Job,
            jobledger::audit::SubjectKind::System => Self::System,
        }
    }
}

#[derive(sqlx::Type, Debug, Clone, Copy, PartialEq, Eq)]
#[sqlx(type_name = "jobledger_severity", rename_all = "lowercase")]
pub(crate) enum Severity {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
}

impl From<Severity> for jobledger::audit::Severity {
    fn from(value: Severity) -> Self {
        match value {
            Severity::Trace => Self::Trace,
            Severity::Debug => Self::Debug,
            Severity::Info => Self::Info,
            Severity::Warn => Self::Warn,
            Severity::Error => Self::Error,
            Severity::Fatal => Self::Fatal,
        }
    }
}

impl From<jobledger::audit::Severity> for Severity {
    fn from(value: jobledger::audit::Severity) -> Self {
        match value {
            jobledger::audit::Severity::Trace => Self::Trace,
            jobledger::audit::Severity::Debug => Self::Debug,
            jobledger::audit::Severity::Info => Self::Info,
            jobledger::audit::Severity::Warn => Self::Warn,
            jobledger::audit::Severity::Error => Self::Error,
            jobledger::audit::Severity::Fatal => Self::Fatal,
        }
    }
}

#[derive(Debug, FromRow)]
pub(crate) struct JobRow {
    pub id: i64,
    pub external_id: String,
    pub queue: String,
    pub task_id: String,
    pub status: JobStatus,
    pub priority: i32,
    pub max_attempts: i32,
    pub backoff: BackoffKind,
    pub backoff_delay_ms: i64,
    pub payload: serde_json::Value,
    pub options: serde_json::Value,
    pub result: Option<serde_json::Value>,
    pub delayed_until: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl TryFrom<JobRow> for JobRecord {
    type Error = StoreError;

    fn try_from(value: JobRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: value.id.into(),
            external_id: value.external_id.into(),
            queue: value.queue,
            task_id: value.task_id,
            status: value.status.into(),
            priority: value.priority,
            max_attempts: u16::try_from(value.max_attempts).map_err(|_| StoreError::BadState)?,
            backoff: value.backoff.into(),
            backoff_delay: TimeDelta::milliseconds(value.backoff_delay_ms),
            payload: value.payload,
            options: value.options,
            result: value.result,
            delayed_until: value.delayed_until,
            created_at: value.created_at,
            started_at: value.started_at,
            finished_at: value.finished_at,
        })
    }
}

#[derive(Debug, FromRow)]
pub(crate) struct AttemptRow {
    pub job_id: i64,
    pub number: i32,
    pub status: AttemptStatus,
    pub error: Option<String>,
    pub result: Option<serde_json::Value>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl TryFrom<AttemptRow> for JobAttempt {
    type Error = StoreError;

    fn try_from(value: AttemptRow) -> Result<Self, Self::Error> {
        Ok(Self {
            job_id: value.job_id.into(),
            number: u16::try_from(value.number).map_err(|_| StoreError::BadState)?,
            status: value.status.into(),
            error: value.error,
            result: value.result,
            started_at: value.started_at,
            finished_at: value.finished_at,
        })
    }
}

#[derive(Debug, FromRow)]
pub(crate) struct AuditRow {
    pub id: i64,
    pub subject: SubjectKind,
    pub subject_id: String,
    pub severity: Severity,
    pub message: String,
    pub metadata: serde_json::Value,
    pub correlation_id: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

impl From<AuditRow> for AuditLogEntry {
    fn from(value: AuditRow) -> Self {
        Self {
            id: value.id,
            subject: value.subject.into(),
            subject_id: value.subject_id,
            severity: value.severity.into(),
            message: value.message,
            metadata: value.metadata,
            correlation_id: value.correlation_id.map(Into::into),
            recorded_at: value.recorded_at,
        }
    }
}
