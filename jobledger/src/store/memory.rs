//! An in memory implementation of the store traits.
//!
//! Provided as a correct (but not optimized) implementation primarily for
//! use in tests and embedded setups. Locks are taken in a fixed order
//! (jobs, then attempts, then audit entries) so compound operations cannot
//! deadlock.

use std::sync::{
    atomic::{AtomicI64, Ordering},
    Arc, RwLock,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{
    audit::{AuditFilter, AuditLogEntry, NewAuditEntry},
    job::{AttemptStatus, ExternalJobId, JobAttempt, JobId, JobRecord, JobStatus, NewJob},
    transition::{compute_transition, AttemptAction},
};

use super::{AuditStore, JobStore, StoreError};

/// An in memory [`JobStore`] and [`AuditStore`].
///
/// **This is not designed for production load.**
#[derive(Clone, Default)]
pub struct InMemoryStore {
    jobs: Arc<RwLock<Vec<JobRecord>>>,
    attempts: Arc<RwLock<Vec<JobAttempt>>>,
    entries: Arc<RwLock<Vec<AuditLogEntry>>>,
    job_ids: Arc<AtomicI64>,
    entry_ids: Arc<AtomicI64>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn matching_jobs(&self, predicate: impl Fn(&JobRecord) -> bool) -> Result<Vec<JobRecord>, StoreError> {
        Ok(self
            .jobs
            .read()
            .map_err(|_| StoreError::BadState)?
            .iter()
            .filter(|job| predicate(job))
            .cloned()
            .collect())
    }

    /// Applies the transition patch and its attempt bookkeeping under the
    /// already-held locks. `error` is the engine's error text, recorded on
    /// the attempt a `Failed` transition closes.
    fn apply_transition(
        job: &mut JobRecord,
        attempts: &mut Vec<JobAttempt>,
        target: JobStatus,
        now: DateTime<Utc>,
        error: Option<String>,
    ) {
        let count = attempts.iter().filter(|a| a.job_id == job.id).count() as u16;
        let patch = compute_transition(job, target, now, count);
        match patch.attempt {
            AttemptAction::None => {}
            AttemptAction::Open => attempts.push(JobAttempt {
                job_id: job.id,
                number: count + 1,
                status: AttemptStatus::Processing,
                error: None,
                result: None,
                started_at: now,
                finished_at: None,
            }),
            AttemptAction::Close(status) => {
                if let Some(open) = attempts
                    .iter_mut()
                    .rev()
                    .find(|a| a.job_id == job.id && a.status == AttemptStatus::Processing)
                {
                    open.status = status;
                    open.finished_at = Some(now);
                    if status == AttemptStatus::Completed {
                        open.result = job.result.clone();
                    }
                    if status == AttemptStatus::Failed {
                        open.error = error;
                    }
                }
            }
        }
        patch.apply(job);
    }
}

#[async_trait]
impl JobStore for InMemoryStore {
    async fn upsert_by_external_id(&self, new: NewJob) -> Result<JobRecord, StoreError> {
        let now = Utc::now();
        let mut jobs = self.jobs.write().map_err(|_| StoreError::BadState)?;
        let mut attempts = self.attempts.write().map_err(|_| StoreError::BadState)?;
        match jobs.iter_mut().find(|job| job.external_id == new.external_id) {
            Some(job) => {
                job.queue = new.queue;
                job.task_id = new.task_id;
                job.priority = new.priority;
                job.max_attempts = new.max_attempts;
                job.backoff = new.backoff;
                job.backoff_delay = new.backoff_delay;
                job.payload = new.payload;
                job.options = new.options;
                job.result = new.result;
                if job.status != new.status {
                    Self::apply_transition(job, &mut attempts, new.status, now, new.error);
                }
                Ok(job.clone())
            }
            None => {
                // Rows are born waiting; reported non-waiting statuses go
                // through the engine so the timestamp invariants hold even
                // for the first notification we see.
                let target = new.status;
                let mut job = JobRecord {
                    id: self.job_ids.fetch_add(1, Ordering::SeqCst).into(),
                    external_id: new.external_id,
                    queue: new.queue,
                    task_id: new.task_id,
                    status: JobStatus::Waiting,
                    priority: new.priority,
                    max_attempts: new.max_attempts,
                    backoff: new.backoff,
                    backoff_delay: new.backoff_delay,
                    payload: new.payload,
                    options: new.options,
                    result: new.result,
                    delayed_until: None,
                    created_at: now,
                    started_at: None,
                    finished_at: None,
                };
                if target != JobStatus::Waiting {
                    Self::apply_transition(&mut job, &mut attempts, target, now, new.error);
                }
                jobs.push(job.clone());
                Ok(job)
            }
        }
    }

    async fn find_by_external_id(
        &self,
        external_id: &ExternalJobId,
    ) -> Result<Option<JobRecord>, StoreError> {
        Ok(self
            .matching_jobs(|job| &job.external_id == external_id)?
            .into_iter()
            .next())
    }

    async fn find_by_status(&self, status: JobStatus) -> Result<Vec<JobRecord>, StoreError> {
        self.matching_jobs(|job| job.status == status)
    }

    async fn find_by_statuses(
        &self,
        statuses: &[JobStatus],
    ) -> Result<Vec<JobRecord>, StoreError> {
        self.matching_jobs(|job| statuses.contains(&job.status))
    }

    async fn find_stuck(&self, threshold: DateTime<Utc>) -> Result<Vec<JobRecord>, StoreError> {
        self.matching_jobs(|job| {
            job.status == JobStatus::Active
                && job.started_at.is_some_and(|started| started < threshold)
        })
    }

    async fn transition_status(
        &self,
        id: JobId,
        target: JobStatus,
    ) -> Result<JobRecord, StoreError> {
        let now = Utc::now();
        let mut jobs = self.jobs.write().map_err(|_| StoreError::BadState)?;
        let mut attempts = self.attempts.write().map_err(|_| StoreError::BadState)?;
        match jobs.iter_mut().find(|job| job.id == id) {
            None => Err(StoreError::JobNotFound(id)),
            Some(job) => {
                Self::apply_transition(job, &mut attempts, target, now, None);
                Ok(job.clone())
            }
        }
    }

    async fn attempts(&self, id: JobId) -> Result<Vec<JobAttempt>, StoreError> {
        let mut attempts: Vec<_> = self
            .attempts
            .read()
            .map_err(|_| StoreError::BadState)?
            .iter()
            .filter(|attempt| attempt.job_id == id)
            .cloned()
            .collect();
        attempts.sort_by_key(|attempt| attempt.number);
        Ok(attempts)
    }

    async fn attempt_count(&self, id: JobId) -> Result<u16, StoreError> {
        Ok(self
            .attempts
            .read()
            .map_err(|_| StoreError::BadState)?
            .iter()
            .filter(|attempt| attempt.job_id == id)
            .count() as u16)
    }

    async fn delete_terminal_before(
        &self,
        status: JobStatus,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let mut jobs = self.jobs.write().map_err(|_| StoreError::BadState)?;
        let mut attempts = self.attempts.write().map_err(|_| StoreError::BadState)?;
        let doomed: Vec<JobId> = jobs
            .iter()
            .filter(|job| {
                job.status == status && job.finished_at.is_some_and(|finished| finished < cutoff)
            })
            .map(|job| job.id)
            .collect();
        jobs.retain(|job| !doomed.contains(&job.id));
        attempts.retain(|attempt| !doomed.contains(&attempt.job_id));
        Ok(doomed.len() as u64)
    }

    async fn count_terminal_before(
        &self,
        status: JobStatus,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        Ok(self
            .matching_jobs(|job| {
                job.status == status && job.finished_at.is_some_and(|finished| finished < cutoff)
            })?
            .len() as u64)
    }
}

#[async_trait]
impl AuditStore for InMemoryStore {
    async fn append(&self, entry: NewAuditEntry) -> Result<AuditLogEntry, StoreError> {
        let stored = AuditLogEntry {
            id: self.entry_ids.fetch_add(1, Ordering::SeqCst),
            subject: entry.subject,
            subject_id: entry.subject_id,
            severity: entry.severity,
            message: entry.message,
            metadata: entry.metadata,
            correlation_id: entry.correlation_id,
            recorded_at: Utc::now(),
        };
        self.entries
            .write()
            .map_err(|_| StoreError::BadState)?
            .push(stored.clone());
        Ok(stored)
    }

    async fn find_by_subject(
        &self,
        subject_id: &str,
        filter: &AuditFilter,
    ) -> Result<Vec<AuditLogEntry>, StoreError> {
        let mut entries: Vec<_> = self
            .entries
            .read()
            .map_err(|_| StoreError::BadState)?
            .iter()
            .filter(|entry| entry.subject_id == subject_id && filter.matches(entry))
            .cloned()
            .collect();
        entries.sort_by(|a, b| b.recorded_at.cmp(&a.recorded_at).then(b.id.cmp(&a.id)));
        if let Some(limit) = filter.limit {
            entries.truncate(limit as usize);
        }
        Ok(entries)
    }

    async fn find_older_than(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<AuditLogEntry>, StoreError> {
        Ok(self
            .entries
            .read()
            .map_err(|_| StoreError::BadState)?
            .iter()
            .filter(|entry| entry.recorded_at < cutoff)
            .cloned()
            .collect())
    }

    async fn count_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        Ok(self.find_older_than(cutoff).await?.len() as u64)
    }

    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut entries = self.entries.write().map_err(|_| StoreError::BadState)?;
        let before = entries.len();
        entries.retain(|entry| entry.recorded_at >= cutoff);
        Ok((before - entries.len()) as u64)
    }
}

#[cfg(test)]
mod test {
    use super::super::testing;
    use super::*;
    use crate::audit::Severity;
    use crate::test_suite;
    use assert_matches::assert_matches;

    test_suite!(for: InMemoryStore::new());

    #[tokio::test]
    async fn poisoned_lock_reports_bad_state() {
        let store = InMemoryStore::new();
        tokio::task::spawn({
            let store = store.clone();
            async move {
                let _guard = store.jobs.write();
                panic!()
            }
        })
        .await
        .unwrap_err();

        assert_matches!(
            store.find_by_status(JobStatus::Waiting).await,
            Err(StoreError::BadState)
        );
        assert_matches!(
            store
                .transition_status(JobId::from(0), JobStatus::Active)
                .await,
            Err(StoreError::BadState)
        );
    }

    #[tokio::test]
    async fn audit_entries_survive_job_deletion() {
        let store = InMemoryStore::new();
        let job = store
            .upsert_by_external_id(testing::mock_job("job-1"))
            .await
            .unwrap();
        store.transition_status(job.id, JobStatus::Active).await.unwrap();
        store
            .transition_status(job.id, JobStatus::Completed)
            .await
            .unwrap();
        store
            .append(NewAuditEntry::for_job(
                &job.external_id,
                Severity::Info,
                "completed",
            ))
            .await
            .unwrap();

        let deleted = store
            .delete_terminal_before(JobStatus::Completed, Utc::now() + chrono::TimeDelta::hours(1))
            .await
            .unwrap();
        assert_eq!(deleted, 1);

        let history = store
            .find_by_subject("job-1", &AuditFilter::new())
            .await
            .unwrap();
        assert_eq!(history.len(), 1);
    }
}
