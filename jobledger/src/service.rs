//! The job persistence service: the write path the queue engine calls on
//! every observed state change.

use thiserror::Error;

use crate::{
    audit::{event, AuditFilter, AuditLogEntry, NewAuditEntry, Severity},
    job::{draft::JobDraft, ExternalJobId, JobRecord, NewJob},
    store::{AuditStore, JobStore, StoreError},
};

#[derive(Debug, Error)]
pub enum PersistError {
    /// A required field was missing from the draft; nothing was written.
    #[error("Missing required field `{0}`")]
    MissingField(&'static str),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Options for [`JobLedger::persist`].
#[derive(Debug, Clone, Copy)]
pub struct PersistOpts {
    include_audit: bool,
}

impl Default for PersistOpts {
    fn default() -> Self {
        Self { include_audit: true }
    }
}

impl PersistOpts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Skip the audit entry for this write.
    pub fn without_audit(self) -> Self {
        Self {
            include_audit: false,
        }
    }
}

/// Orchestrates upsert-by-external-id persistence with its audit trail.
///
/// Collaborators are injected by the host process at startup; all logic here
/// depends only on the store traits.
#[derive(Debug, Clone)]
pub struct JobLedger<J, A> {
    jobs: J,
    audit: A,
}

impl<J, A> JobLedger<J, A>
where
    J: JobStore,
    A: AuditStore,
{
    pub fn new(jobs: J, audit: A) -> Self {
        Self { jobs, audit }
    }

    /// Persist a state-change notification from the queue engine.
    ///
    /// Validates required fields, applies creation defaults, and upserts by
    /// external id, so redelivered notifications are safe. The audit write
    /// is best effort: a failure there is logged and swallowed, never
    /// allowed to undo or mask the job-state write.
    pub async fn persist(
        &self,
        draft: JobDraft,
        opts: PersistOpts,
    ) -> Result<JobRecord, PersistError> {
        let new = validate(draft)?;
        let previous = self
            .jobs
            .find_by_external_id(&new.external_id)
            .await?
            .map(|job| job.status);

        let job = self.jobs.upsert_by_external_id(new).await?;

        if opts.include_audit {
            let message = match previous {
                Some(previous) if previous == job.status => {
                    format!("Notification redelivered, status unchanged at {previous}")
                }
                Some(previous) => format!("Status changed from {previous} to {}", job.status),
                None => format!("Job record created as {}", job.status),
            };
            let entry = NewAuditEntry::for_job(&job.external_id, Severity::Info, message)
                .with_metadata(serde_json::json!({
                    "queue": job.queue,
                    "task_id": job.task_id,
                    "previous_status": previous,
                    "status": job.status,
                }))
                .with_event(event::STATUS_CHANGE);
            if let Err(error) = self.audit.append(entry).await {
                tracing::warn!(
                    ?error,
                    external_id = %job.external_id,
                    "Failed to append audit entry for persisted state change"
                );
            }
        }

        Ok(job)
    }

    /// Append a custom lifecycle annotation for a job, correlated by its
    /// external id.
    pub async fn record_history(
        &self,
        job: &JobRecord,
        severity: Severity,
        message: impl Into<String>,
        metadata: serde_json::Value,
    ) -> Result<AuditLogEntry, StoreError> {
        self.audit
            .append(
                NewAuditEntry::for_job(&job.external_id, severity, message)
                    .with_metadata(metadata),
            )
            .await
    }

    /// The audit trail of a job in creation order, for forensics.
    pub async fn get_history(
        &self,
        external_id: &ExternalJobId,
        filter: &AuditFilter,
    ) -> Result<Vec<AuditLogEntry>, StoreError> {
        if self.jobs.find_by_external_id(external_id).await?.is_none() {
            return Err(StoreError::ExternalJobNotFound(external_id.clone()));
        }
        let mut entries = self
            .audit
            .find_by_subject(external_id.as_str(), filter)
            .await?;
        entries.reverse();
        Ok(entries)
    }

    pub fn jobs(&self) -> &J {
        &self.jobs
    }

    pub fn audit(&self) -> &A {
        &self.audit
    }
}

fn validate(draft: JobDraft) -> Result<NewJob, PersistError> {
    Ok(NewJob {
        external_id: draft
            .external_id
            .ok_or(PersistError::MissingField("external_id"))?,
        task_id: draft.task_id.ok_or(PersistError::MissingField("task_id"))?,
        queue: draft.queue.ok_or(PersistError::MissingField("queue"))?,
        status: draft.status.ok_or(PersistError::MissingField("status"))?,
        priority: draft.priority.unwrap_or(NewJob::DEFAULT_PRIORITY),
        max_attempts: draft.max_attempts.unwrap_or(NewJob::DEFAULT_MAX_ATTEMPTS),
        backoff: draft.backoff.unwrap_or(NewJob::DEFAULT_BACKOFF),
        backoff_delay: draft
            .backoff_delay
            .unwrap_or(NewJob::DEFAULT_BACKOFF_DELAY),
        payload: draft.payload.unwrap_or(serde_json::Value::Null),
        options: draft.options.unwrap_or(serde_json::Value::Null),
        result: draft.result,
        error: draft.error,
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::job::{BackoffKind, JobStatus};
    use crate::store::memory::InMemoryStore;
    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use chrono::{DateTime, TimeDelta, Utc};

    fn ledger() -> JobLedger<InMemoryStore, InMemoryStore> {
        let store = InMemoryStore::new();
        JobLedger::new(store.clone(), store)
    }

    fn draft(external_id: &str) -> JobDraft {
        JobDraft::new()
            .with_external_id(external_id)
            .with_task_id("t1")
            .with_queue("q")
            .with_status(JobStatus::Waiting)
    }

    #[tokio::test]
    async fn persist_rejects_missing_required_fields() {
        let ledger = ledger();

        let missing = JobDraft::new()
            .with_task_id("t1")
            .with_queue("q")
            .with_status(JobStatus::Waiting);
        let result = ledger.persist(missing, PersistOpts::new()).await;
        assert_matches!(result, Err(PersistError::MissingField("external_id")));

        let missing = JobDraft::new().with_external_id("job-1");
        let result = ledger.persist(missing, PersistOpts::new()).await;
        assert_matches!(result, Err(PersistError::MissingField(_)));

        // Nothing was written.
        let found = ledger.jobs().find_by_external_id(&"job-1".into()).await.unwrap();
        assert!(found.is_none());
    }

    #[tokio::test]
    async fn persist_applies_defaults_on_create() {
        let ledger = ledger();

        let job = ledger.persist(draft("job-1"), PersistOpts::new()).await.unwrap();

        assert_eq!(job.priority, 0);
        assert_eq!(job.max_attempts, 3);
        assert_eq!(job.backoff, BackoffKind::Exponential);
        assert_eq!(job.backoff_delay, TimeDelta::milliseconds(2000));
        assert_eq!(job.status, JobStatus::Waiting);
    }

    #[tokio::test]
    async fn persist_is_idempotent_by_external_id() {
        let ledger = ledger();

        let first = ledger.persist(draft("job-1"), PersistOpts::new()).await.unwrap();
        let second = ledger
            .persist(draft("job-1").with_priority(7), PersistOpts::new())
            .await
            .unwrap();

        assert_eq!(second.id, first.id);
        assert_eq!(second.created_at, first.created_at);
        assert_eq!(second.priority, 7);
        assert_eq!(
            ledger
                .jobs()
                .find_by_status(JobStatus::Waiting)
                .await
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn persist_writes_audit_entries_with_previous_status() {
        let ledger = ledger();

        ledger.persist(draft("job-1"), PersistOpts::new()).await.unwrap();
        ledger
            .persist(
                draft("job-1").with_status(JobStatus::Active),
                PersistOpts::new(),
            )
            .await
            .unwrap();

        let history = ledger
            .get_history(&"job-1".into(), &AuditFilter::new())
            .await
            .unwrap();
        assert_eq!(history.len(), 2);
        // Creation order.
        assert_eq!(history[0].message, "Job record created as waiting");
        assert_eq!(history[1].message, "Status changed from waiting to active");
        assert_eq!(history[1].metadata["previous_status"], "waiting");
        assert_eq!(history[1].event(), Some(event::STATUS_CHANGE));
    }

    #[tokio::test]
    async fn persist_redelivery_with_unchanged_status_is_recorded_distinctly() {
        let ledger = ledger();

        ledger.persist(draft("job-1"), PersistOpts::new()).await.unwrap();
        ledger.persist(draft("job-1"), PersistOpts::new()).await.unwrap();

        let history = ledger
            .get_history(&"job-1".into(), &AuditFilter::new())
            .await
            .unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(
            history[1].message,
            "Notification redelivered, status unchanged at waiting"
        );
        assert_eq!(history[1].metadata["previous_status"], "waiting");
        assert_eq!(history[1].metadata["status"], "waiting");
    }

    #[tokio::test]
    async fn persist_failed_carries_the_engine_error_to_the_attempt() {
        let ledger = ledger();

        ledger
            .persist(draft("job-1").with_status(JobStatus::Active), PersistOpts::new())
            .await
            .unwrap();
        let job = ledger
            .persist(
                draft("job-1")
                    .with_status(JobStatus::Failed)
                    .with_error("worker timed out"),
                PersistOpts::new(),
            )
            .await
            .unwrap();

        let attempts = ledger.jobs().attempts(job.id).await.unwrap();
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].error.as_deref(), Some("worker timed out"));
    }

    #[tokio::test]
    async fn persist_without_audit_writes_no_entry() {
        let ledger = ledger();

        ledger
            .persist(draft("job-1"), PersistOpts::new().without_audit())
            .await
            .unwrap();

        let history = ledger
            .get_history(&"job-1".into(), &AuditFilter::new())
            .await
            .unwrap();
        assert!(history.is_empty());
    }

    #[tokio::test]
    async fn get_history_for_unknown_job_is_not_found() {
        let ledger = ledger();

        let result = ledger.get_history(&"nope".into(), &AuditFilter::new()).await;

        assert_matches!(result, Err(StoreError::ExternalJobNotFound(_)));
    }

    #[tokio::test]
    async fn record_history_tags_the_external_id() {
        let ledger = ledger();
        let job = ledger.persist(draft("job-1"), PersistOpts::new()).await.unwrap();

        let entry = ledger
            .record_history(
                &job,
                Severity::Debug,
                "requeued by operator",
                serde_json::json!({ "operator": "alice" }),
            )
            .await
            .unwrap();

        assert_eq!(entry.correlation_id, Some("job-1".into()));
        assert_eq!(entry.metadata["operator"], "alice");
    }

    /// An audit store whose appends always fail.
    #[derive(Clone)]
    struct BrokenAudit;

    #[async_trait]
    impl AuditStore for BrokenAudit {
        async fn append(&self, _entry: NewAuditEntry) -> Result<AuditLogEntry, StoreError> {
            Err(StoreError::BadState)
        }
        async fn find_by_subject(
            &self,
            _subject_id: &str,
            _filter: &AuditFilter,
        ) -> Result<Vec<AuditLogEntry>, StoreError> {
            Ok(vec![])
        }
        async fn find_older_than(
            &self,
            _cutoff: DateTime<Utc>,
        ) -> Result<Vec<AuditLogEntry>, StoreError> {
            Ok(vec![])
        }
        async fn count_older_than(&self, _cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
            Ok(0)
        }
        async fn delete_older_than(&self, _cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
            Ok(0)
        }
    }

    #[tokio::test]
    async fn audit_failure_does_not_fail_the_state_write() {
        let ledger = JobLedger::new(InMemoryStore::new(), BrokenAudit);

        let job = ledger.persist(draft("job-1"), PersistOpts::new()).await.unwrap();

        assert_eq!(job.status, JobStatus::Waiting);
        let found = ledger
            .jobs()
            .find_by_external_id(&"job-1".into())
            .await
            .unwrap();
        assert!(found.is_some());
    }
}
