//! Store contracts for job records and the audit log.
//!
//! All domain logic depends only on these traits; concrete adapters (the
//! in-memory store here, PostgreSQL in `jobledger-sqlx`) are injected by the
//! host process at startup. Correctness under concurrent callers relies on
//! the adapter's per-row atomicity for [`JobStore::upsert_by_external_id`]
//! and [`JobStore::transition_status`], not on any in-process lock.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::{
    audit::{AuditFilter, AuditLogEntry, NewAuditEntry},
    job::{ExternalJobId, JobAttempt, JobId, JobRecord, JobStatus, NewJob},
};

pub mod memory;
pub mod testing;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("No job found with id {0}")]
    JobNotFound(JobId),
    #[error("No job found with external id {0}")]
    ExternalJobNotFound(ExternalJobId),
    #[error("A job with external id {0} already exists")]
    Conflict(ExternalJobId),
    #[error("Error encoding or decoding stored data")]
    EncodeDecode(#[from] serde_json::Error),
    #[error("System in bad state")]
    BadState,
    #[error("Underlying storage failure")]
    Storage(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// Durable repository for [`JobRecord`]s and their attempt sub-records.
#[async_trait]
pub trait JobStore: Clone + Send + Sync {
    /// Create the job if no row with its external id exists, otherwise
    /// update all mutable fields while preserving `created_at`.
    ///
    /// Must be atomic per row: a racing create that hits the unique
    /// constraint is retried as an update, never surfaced as
    /// [`StoreError::Conflict`]. When the upsert changes the stored status,
    /// the transition engine's patch (timestamps, attempt bookkeeping)
    /// applies exactly as it does for [`JobStore::transition_status`].
    async fn upsert_by_external_id(&self, job: NewJob) -> Result<JobRecord, StoreError>;

    async fn find_by_external_id(
        &self,
        external_id: &ExternalJobId,
    ) -> Result<Option<JobRecord>, StoreError>;

    async fn find_by_status(&self, status: JobStatus) -> Result<Vec<JobRecord>, StoreError>;

    async fn find_by_statuses(&self, statuses: &[JobStatus])
        -> Result<Vec<JobRecord>, StoreError>;

    /// Jobs `active` with `started_at` older than the threshold.
    async fn find_stuck(&self, threshold: DateTime<Utc>) -> Result<Vec<JobRecord>, StoreError>;

    /// Atomically apply the transition engine's field patch for `target`,
    /// including the implied attempt bookkeeping, and return the updated
    /// record.
    async fn transition_status(
        &self,
        id: JobId,
        target: JobStatus,
    ) -> Result<JobRecord, StoreError>;

    /// The attempt history of a job, ordered by attempt number.
    async fn attempts(&self, id: JobId) -> Result<Vec<JobAttempt>, StoreError>;

    async fn attempt_count(&self, id: JobId) -> Result<u16, StoreError>;

    /// Delete jobs in the given terminal status finished before `cutoff`,
    /// cascading to their attempt rows. Returns the number deleted.
    async fn delete_terminal_before(
        &self,
        status: JobStatus,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, StoreError>;

    /// Count twin of [`JobStore::delete_terminal_before`], for dry runs.
    async fn count_terminal_before(
        &self,
        status: JobStatus,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, StoreError>;
}

/// Append-only repository for [`AuditLogEntry`]s.
///
/// No update API exists; only [`AuditStore::delete_older_than`] removes
/// entries, and only the retention manager calls it.
#[async_trait]
pub trait AuditStore: Clone + Send + Sync {
    async fn append(&self, entry: NewAuditEntry) -> Result<AuditLogEntry, StoreError>;

    /// Entries for the given subject id, newest first, narrowed by the
    /// filter.
    async fn find_by_subject(
        &self,
        subject_id: &str,
        filter: &AuditFilter,
    ) -> Result<Vec<AuditLogEntry>, StoreError>;

    async fn find_older_than(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<AuditLogEntry>, StoreError>;

    async fn count_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;

    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;
}
