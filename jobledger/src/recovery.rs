//! The startup recovery pass.
//!
//! After a crash the store may hold jobs in `active` that no worker owns any
//! more. The coordinator scans for them, repairs them through the state
//! transition engine, and records an audit entry for every corrective
//! action. Recovery is best effort per job: one failing job is counted and
//! logged, never allowed to halt the pass. Only an outright query failure
//! propagates, so the host can fail startup when the store is unreachable.

use chrono::{TimeDelta, Utc};

use crate::{
    audit::{event, NewAuditEntry, Severity},
    job::{JobRecord, JobStatus},
    store::{AuditStore, JobStore, StoreError},
};

/// Knobs for a recovery pass.
#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    recover_active: bool,
    recover_stuck: bool,
    stuck_threshold: TimeDelta,
    max_recovery_attempts: u16,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            recover_active: true,
            recover_stuck: true,
            stuck_threshold: TimeDelta::minutes(60),
            max_recovery_attempts: 3,
        }
    }
}

impl RecoveryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn recover_active(self, recover_active: bool) -> Self {
        Self {
            recover_active,
            ..self
        }
    }

    pub fn recover_stuck(self, recover_stuck: bool) -> Self {
        Self {
            recover_stuck,
            ..self
        }
    }

    /// How long a job may sit in `active` before it counts as stuck.
    pub fn with_stuck_threshold(self, stuck_threshold: TimeDelta) -> Self {
        Self {
            stuck_threshold,
            ..self
        }
    }

    /// Jobs with at least this many recorded attempts are parked in `stuck`
    /// for operator attention instead of being requeued.
    pub fn with_max_recovery_attempts(self, max_recovery_attempts: u16) -> Self {
        Self {
            max_recovery_attempts,
            ..self
        }
    }
}

/// What a recovery pass did, for logging and metrics by the host.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoverySummary {
    pub active_jobs_recovered: u32,
    pub stuck_jobs_recovered: u32,
    pub failed_recoveries: u32,
    pub total_processed: u32,
}

/// Runs once at process startup, and may be invoked again on demand.
pub struct RecoveryCoordinator<J, A> {
    jobs: J,
    audit: A,
    config: RecoveryConfig,
}

impl<J, A> RecoveryCoordinator<J, A>
where
    J: JobStore,
    A: AuditStore,
{
    pub fn new(jobs: J, audit: A, config: RecoveryConfig) -> Self {
        Self {
            jobs,
            audit,
            config,
        }
    }

    /// Run the pass to completion and return its summary.
    ///
    /// Each step queries the store fresh rather than reusing an earlier
    /// snapshot, so active-job recovery running first empties the stuck set
    /// rather than double-processing it.
    pub async fn run(&self) -> Result<RecoverySummary, StoreError> {
        let mut summary = RecoverySummary::default();

        if self.config.recover_active {
            for job in self.jobs.find_by_status(JobStatus::Active).await? {
                summary.total_processed += 1;
                match self.recover_active_job(&job).await {
                    Ok(()) => summary.active_jobs_recovered += 1,
                    Err(error) => {
                        tracing::error!(
                            ?error,
                            external_id = %job.external_id,
                            "Failed to recover active job"
                        );
                        summary.failed_recoveries += 1;
                    }
                }
            }
        }

        if self.config.recover_stuck {
            let threshold = Utc::now() - self.config.stuck_threshold;
            for job in self.jobs.find_stuck(threshold).await? {
                summary.total_processed += 1;
                match self.recover_stuck_job(&job).await {
                    Ok(()) => summary.stuck_jobs_recovered += 1,
                    Err(error) => {
                        tracing::error!(
                            ?error,
                            external_id = %job.external_id,
                            "Failed to recover stuck job"
                        );
                        summary.failed_recoveries += 1;
                    }
                }
            }
        }

        self.append_summary(&summary).await;
        tracing::info!(?summary, "Startup recovery pass finished");
        Ok(summary)
    }

    /// The previous owner may have crashed mid-processing with no guarantee
    /// of completion, so the only safe repair is to requeue.
    async fn recover_active_job(&self, job: &JobRecord) -> Result<(), StoreError> {
        self.jobs
            .transition_status(job.id, JobStatus::Waiting)
            .await?;
        self.append_best_effort(
            NewAuditEntry::for_job(
                &job.external_id,
                Severity::Warn,
                "Job reset to waiting after unclean shutdown",
            )
            .with_metadata(serde_json::json!({
                "queue": job.queue,
                "previous_status": JobStatus::Active,
            }))
            .with_event(event::JOB_RECOVERED),
        )
        .await;
        Ok(())
    }

    /// Mark the job `stuck` (a forensic marker distinct from plain active
    /// recovery), then requeue it unless its attempt history has already
    /// reached the recovery limit, in which case it stays parked.
    async fn recover_stuck_job(&self, job: &JobRecord) -> Result<(), StoreError> {
        let stuck_for = job
            .started_at
            .map(|started| Utc::now() - started)
            .unwrap_or_else(TimeDelta::zero);

        self.jobs.transition_status(job.id, JobStatus::Stuck).await?;

        let attempts = self.jobs.attempt_count(job.id).await?;
        let requeued = attempts < self.config.max_recovery_attempts;

        self.append_best_effort(
            NewAuditEntry::for_job(
                &job.external_id,
                Severity::Warn,
                if requeued {
                    "Stuck job detected, requeueing"
                } else {
                    "Stuck job parked for operator attention"
                },
            )
            .with_metadata(serde_json::json!({
                "queue": job.queue,
                "stuck_for_seconds": stuck_for.num_seconds(),
                "attempts": attempts,
                "max_recovery_attempts": self.config.max_recovery_attempts,
                "requeued": requeued,
            }))
            .with_event(event::STUCK_JOB_RECOVERED),
        )
        .await;

        if requeued {
            self.jobs
                .transition_status(job.id, JobStatus::Waiting)
                .await?;
            self.append_best_effort(
                NewAuditEntry::for_job(
                    &job.external_id,
                    Severity::Info,
                    "Status changed from stuck to waiting",
                )
                .with_metadata(serde_json::json!({
                    "queue": job.queue,
                    "previous_status": JobStatus::Stuck,
                    "status": JobStatus::Waiting,
                }))
                .with_event(event::STATUS_CHANGE),
            )
            .await;
        }
        Ok(())
    }

    async fn append_summary(&self, summary: &RecoverySummary) {
        let severity = if summary.failed_recoveries > 0 {
            Severity::Warn
        } else {
            Severity::Info
        };
        self.append_best_effort(
            NewAuditEntry::for_system("startup_recovery", severity, "Startup recovery completed")
                .with_metadata(serde_json::json!({
                    "active_jobs_recovered": summary.active_jobs_recovered,
                    "stuck_jobs_recovered": summary.stuck_jobs_recovered,
                    "failed_recoveries": summary.failed_recoveries,
                    "total_processed": summary.total_processed,
                }))
                .with_event(event::SYSTEM_STARTUP_RECOVERY),
        )
        .await;
    }

    async fn append_best_effort(&self, entry: NewAuditEntry) {
        if let Err(error) = self.audit.append(entry).await {
            tracing::warn!(?error, "Failed to append recovery audit entry");
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::audit::AuditFilter;
    use crate::job::{ExternalJobId, JobAttempt, JobId, NewJob};
    use crate::store::memory::InMemoryStore;
    use crate::store::testing::mock_job;
    use async_trait::async_trait;
    use chrono::DateTime;

    async fn active_job(store: &InMemoryStore, external_id: &str) -> JobRecord {
        let job = store
            .upsert_by_external_id(mock_job(external_id))
            .await
            .unwrap();
        store
            .transition_status(job.id, JobStatus::Active)
            .await
            .unwrap()
    }

    fn coordinator(store: &InMemoryStore, config: RecoveryConfig) -> RecoveryCoordinator<InMemoryStore, InMemoryStore> {
        RecoveryCoordinator::new(store.clone(), store.clone(), config)
    }

    #[tokio::test]
    async fn active_jobs_are_reset_to_waiting() {
        let store = InMemoryStore::new();
        for i in 0..3 {
            active_job(&store, &format!("job-{i}")).await;
        }

        let summary = coordinator(&store, RecoveryConfig::new())
            .run()
            .await
            .unwrap();

        assert_eq!(
            summary,
            RecoverySummary {
                active_jobs_recovered: 3,
                stuck_jobs_recovered: 0,
                failed_recoveries: 0,
                total_processed: 3,
            }
        );

        let waiting = store.find_by_status(JobStatus::Waiting).await.unwrap();
        assert_eq!(waiting.len(), 3);
        for job in &waiting {
            assert_eq!(job.started_at, None);
            let history = store
                .find_by_subject(job.external_id.as_str(), &AuditFilter::new())
                .await
                .unwrap();
            assert!(history
                .iter()
                .any(|entry| entry.event() == Some(event::JOB_RECOVERED)));
        }
    }

    #[tokio::test]
    async fn stuck_job_under_attempt_limit_is_requeued() {
        let store = InMemoryStore::new();
        let job = active_job(&store, "job-1").await;

        // Zero threshold makes a freshly started job count as stuck.
        let config = RecoveryConfig::new()
            .recover_active(false)
            .with_stuck_threshold(TimeDelta::zero());
        // started_at == threshold boundary is excluded, so nudge the clock.
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let summary = coordinator(&store, config).run().await.unwrap();

        assert_eq!(summary.stuck_jobs_recovered, 1);
        assert_eq!(summary.failed_recoveries, 0);

        let job = store
            .find_by_external_id(&job.external_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(job.status, JobStatus::Waiting);
        assert_eq!(job.started_at, None);

        let history = store
            .find_by_subject("job-1", &AuditFilter::new())
            .await
            .unwrap();
        let entry = history
            .iter()
            .find(|entry| entry.event() == Some(event::STUCK_JOB_RECOVERED))
            .expect("Should record a stuck recovery entry");
        assert_eq!(entry.metadata["requeued"], true);
        // The requeue itself is also recorded.
        assert!(history.iter().any(|entry| {
            entry.event() == Some(event::STATUS_CHANGE)
                && entry.metadata["previous_status"] == "stuck"
        }));
    }

    #[tokio::test]
    async fn stuck_job_at_attempt_limit_stays_parked() {
        let store = InMemoryStore::new();
        let job = store.upsert_by_external_id(mock_job("job-1")).await.unwrap();
        // Burn through the recovery attempt budget.
        for _ in 0..3 {
            store
                .transition_status(job.id, JobStatus::Active)
                .await
                .unwrap();
            store
                .transition_status(job.id, JobStatus::Waiting)
                .await
                .unwrap();
        }
        store
            .transition_status(job.id, JobStatus::Active)
            .await
            .unwrap();

        let config = RecoveryConfig::new()
            .recover_active(false)
            .with_stuck_threshold(TimeDelta::zero())
            .with_max_recovery_attempts(3);
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let summary = coordinator(&store, config).run().await.unwrap();

        assert_eq!(summary.stuck_jobs_recovered, 1);

        let job = store
            .find_by_external_id(&"job-1".into())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(job.status, JobStatus::Stuck);

        let history = store
            .find_by_subject("job-1", &AuditFilter::new())
            .await
            .unwrap();
        let entry = history
            .iter()
            .find(|entry| entry.event() == Some(event::STUCK_JOB_RECOVERED))
            .unwrap();
        assert_eq!(entry.metadata["requeued"], false);
    }

    /// A store whose status transitions fail for one designated job.
    #[derive(Clone)]
    struct FailingTransitions {
        inner: InMemoryStore,
        failing: JobId,
    }

    #[async_trait]
    impl JobStore for FailingTransitions {
        async fn upsert_by_external_id(&self, job: NewJob) -> Result<JobRecord, StoreError> {
            self.inner.upsert_by_external_id(job).await
        }
        async fn find_by_external_id(
            &self,
            external_id: &ExternalJobId,
        ) -> Result<Option<JobRecord>, StoreError> {
            self.inner.find_by_external_id(external_id).await
        }
        async fn find_by_status(&self, status: JobStatus) -> Result<Vec<JobRecord>, StoreError> {
            self.inner.find_by_status(status).await
        }
        async fn find_by_statuses(
            &self,
            statuses: &[JobStatus],
        ) -> Result<Vec<JobRecord>, StoreError> {
            self.inner.find_by_statuses(statuses).await
        }
        async fn find_stuck(
            &self,
            threshold: DateTime<Utc>,
        ) -> Result<Vec<JobRecord>, StoreError> {
            self.inner.find_stuck(threshold).await
        }
        async fn transition_status(
            &self,
            id: JobId,
            target: JobStatus,
        ) -> Result<JobRecord, StoreError> {
            if id == self.failing {
                return Err(StoreError::BadState);
            }
            self.inner.transition_status(id, target).await
        }
        async fn attempts(&self, id: JobId) -> Result<Vec<JobAttempt>, StoreError> {
            self.inner.attempts(id).await
        }
        async fn attempt_count(&self, id: JobId) -> Result<u16, StoreError> {
            self.inner.attempt_count(id).await
        }
        async fn delete_terminal_before(
            &self,
            status: JobStatus,
            cutoff: DateTime<Utc>,
        ) -> Result<u64, StoreError> {
            self.inner.delete_terminal_before(status, cutoff).await
        }
        async fn count_terminal_before(
            &self,
            status: JobStatus,
            cutoff: DateTime<Utc>,
        ) -> Result<u64, StoreError> {
            self.inner.count_terminal_before(status, cutoff).await
        }
    }

    #[tokio::test]
    async fn per_job_failure_is_counted_and_does_not_halt_the_pass() {
        let store = InMemoryStore::new();
        let healthy = active_job(&store, "job-1").await;
        let broken = active_job(&store, "job-2").await;

        let jobs = FailingTransitions {
            inner: store.clone(),
            failing: broken.id,
        };
        let summary = RecoveryCoordinator::new(jobs, store.clone(), RecoveryConfig::new())
            .run()
            .await
            .unwrap();

        assert_eq!(summary.active_jobs_recovered, 1);
        assert_eq!(summary.failed_recoveries, 1);
        assert_eq!(summary.total_processed, 2);

        let healthy = store
            .find_by_external_id(&healthy.external_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(healthy.status, JobStatus::Waiting);
        let broken = store
            .find_by_external_id(&broken.external_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(broken.status, JobStatus::Active);

        // Any failure downgrades the summary entry to a warning.
        let entries = store
            .find_by_subject("startup_recovery", &AuditFilter::new())
            .await
            .unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].severity, Severity::Warn);
    }

    #[tokio::test]
    async fn summary_entry_is_emitted_even_when_idle() {
        let store = InMemoryStore::new();

        let summary = coordinator(&store, RecoveryConfig::new())
            .run()
            .await
            .unwrap();

        assert_eq!(summary, RecoverySummary::default());

        let entries = store
            .find_by_subject("startup_recovery", &AuditFilter::new())
            .await
            .unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].event(), Some(event::SYSTEM_STARTUP_RECOVERY));
        assert_eq!(entries[0].severity, Severity::Info);
    }

    #[tokio::test]
    async fn disabled_steps_do_nothing() {
        let store = InMemoryStore::new();
        active_job(&store, "job-1").await;

        let config = RecoveryConfig::new().recover_active(false).recover_stuck(false);
        let summary = coordinator(&store, config).run().await.unwrap();

        assert_eq!(summary.total_processed, 0);
        let job = store
            .find_by_external_id(&"job-1".into())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(job.status, JobStatus::Active);
    }

    #[tokio::test]
    async fn active_recovery_empties_the_stuck_scan() {
        let store = InMemoryStore::new();
        active_job(&store, "job-1").await;

        let config = RecoveryConfig::new().with_stuck_threshold(TimeDelta::zero());
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let summary = coordinator(&store, config).run().await.unwrap();

        // The fresh stuck query runs after active recovery already requeued
        // the job, so it is not processed twice.
        assert_eq!(summary.active_jobs_recovered, 1);
        assert_eq!(summary.stuck_jobs_recovered, 0);
        assert_eq!(summary.total_processed, 1);
    }
}
