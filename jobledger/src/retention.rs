//! Retention of terminal job records and the audit log.
//!
//! Deletes completed and failed jobs (with their attempt rows) and audit
//! entries past a cutoff age. Supports a dry run that reports what a real
//! run would delete without touching anything.

use chrono::{TimeDelta, Utc};

use crate::{
    audit::{event, NewAuditEntry, Severity},
    job::JobStatus,
    store::{AuditStore, JobStore, StoreError},
};

pub mod runner;

/// Options for a cleanup run.
///
/// The defaults retain failed jobs (they are the interesting ones for
/// debugging) and drop successful ones older than thirty days.
#[derive(Debug, Clone, Copy)]
pub struct CleanupOptions {
    older_than: TimeDelta,
    keep_successful: bool,
    keep_failed: bool,
    dry_run: bool,
}

impl Default for CleanupOptions {
    fn default() -> Self {
        Self {
            older_than: TimeDelta::days(30),
            keep_successful: false,
            keep_failed: true,
            dry_run: false,
        }
    }
}

impl CleanupOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Only records older than this are eligible.
    pub fn older_than(self, older_than: TimeDelta) -> Self {
        Self { older_than, ..self }
    }

    pub fn keep_successful(self, keep_successful: bool) -> Self {
        Self {
            keep_successful,
            ..self
        }
    }

    pub fn keep_failed(self, keep_failed: bool) -> Self {
        Self { keep_failed, ..self }
    }

    /// Count what would be deleted without deleting anything.
    pub fn dry_run(self) -> Self {
        Self {
            dry_run: true,
            ..self
        }
    }
}

/// What a cleanup run deleted, or would delete under `dry_run`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupSummary {
    pub completed_deleted: u64,
    pub failed_deleted: u64,
    pub logs_deleted: u64,
}

impl CleanupSummary {
    pub fn total_deleted(&self) -> u64 {
        self.completed_deleted + self.failed_deleted + self.logs_deleted
    }
}

/// Deletes aged-out terminal jobs and audit entries.
///
/// Constructed by the host and either invoked directly or driven on a cron
/// schedule by [`runner`].
#[derive(Debug, Clone)]
pub struct RetentionManager<J, A> {
    jobs: J,
    audit: A,
}

impl<J, A> RetentionManager<J, A>
where
    J: JobStore,
    A: AuditStore,
{
    pub fn new(jobs: J, audit: A) -> Self {
        Self { jobs, audit }
    }

    /// Run one cleanup pass and record a summary audit entry.
    ///
    /// Only jobs in a terminal state are ever touched, and only those whose
    /// `finished_at` is older than the cutoff. Deleting a job cascades to
    /// its attempt rows but leaves its audit entries in place; those age
    /// out independently through the audit cutoff.
    pub async fn cleanup(&self, options: CleanupOptions) -> Result<CleanupSummary, StoreError> {
        let cutoff = Utc::now() - options.older_than;
        let mut summary = CleanupSummary::default();

        if !options.keep_successful {
            summary.completed_deleted = if options.dry_run {
                self.jobs
                    .count_terminal_before(JobStatus::Completed, cutoff)
                    .await?
            } else {
                self.jobs
                    .delete_terminal_before(JobStatus::Completed, cutoff)
                    .await?
            };
        }

        if !options.keep_failed {
            summary.failed_deleted = if options.dry_run {
                self.jobs
                    .count_terminal_before(JobStatus::Failed, cutoff)
                    .await?
            } else {
                self.jobs
                    .delete_terminal_before(JobStatus::Failed, cutoff)
                    .await?
            };
        }

        summary.logs_deleted = if options.dry_run {
            self.audit.count_older_than(cutoff).await?
        } else {
            self.audit.delete_older_than(cutoff).await?
        };

        let entry = NewAuditEntry::for_system(
            "retention",
            Severity::Info,
            if options.dry_run {
                "History cleanup dry run completed"
            } else {
                "History cleanup completed"
            },
        )
        .with_metadata(serde_json::json!({
            "older_than_days": options.older_than.num_days(),
            "keep_successful": options.keep_successful,
            "keep_failed": options.keep_failed,
            "completed_deleted": summary.completed_deleted,
            "failed_deleted": summary.failed_deleted,
            "logs_deleted": summary.logs_deleted,
            "total_deleted": summary.total_deleted(),
        }))
        .with_event(if options.dry_run {
            event::HISTORY_CLEANUP_DRY_RUN
        } else {
            event::HISTORY_CLEANUP
        });
        if let Err(error) = self.audit.append(entry).await {
            tracing::warn!(?error, "Failed to append cleanup audit entry");
        }

        tracing::info!(
            dry_run = options.dry_run,
            completed_deleted = summary.completed_deleted,
            failed_deleted = summary.failed_deleted,
            logs_deleted = summary.logs_deleted,
            "History cleanup finished"
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::audit::AuditFilter;
    use crate::job::JobRecord;
    use crate::store::memory::InMemoryStore;
    use crate::store::testing::mock_job;
    use crate::store::JobStore;

    async fn terminal_job(store: &InMemoryStore, external_id: &str, status: JobStatus) -> JobRecord {
        let job = store
            .upsert_by_external_id(mock_job(external_id))
            .await
            .unwrap();
        store
            .transition_status(job.id, JobStatus::Active)
            .await
            .unwrap();
        store.transition_status(job.id, status).await.unwrap()
    }

    fn manager(store: &InMemoryStore) -> RetentionManager<InMemoryStore, InMemoryStore> {
        RetentionManager::new(store.clone(), store.clone())
    }

    // Everything in these tests finished "just now", so a negative cutoff
    // makes it all eligible and the default thirty days makes none of it so.
    fn eligible_now() -> CleanupOptions {
        CleanupOptions::new().older_than(TimeDelta::milliseconds(-100))
    }

    #[tokio::test]
    async fn defaults_keep_failed_and_recent() {
        let store = InMemoryStore::new();
        terminal_job(&store, "done", JobStatus::Completed).await;
        terminal_job(&store, "broken", JobStatus::Failed).await;

        // Everything is far younger than thirty days.
        let summary = manager(&store).cleanup(CleanupOptions::new()).await.unwrap();
        assert_eq!(summary.total_deleted(), 0);

        // Old enough, but failed jobs are kept by default.
        let summary = manager(&store).cleanup(eligible_now()).await.unwrap();
        assert_eq!(summary.completed_deleted, 1);
        assert_eq!(summary.failed_deleted, 0);

        let failed = store.find_by_status(JobStatus::Failed).await.unwrap();
        assert_eq!(failed.len(), 1);
    }

    #[tokio::test]
    async fn keep_flags_invert_the_selection() {
        let store = InMemoryStore::new();
        terminal_job(&store, "done", JobStatus::Completed).await;
        terminal_job(&store, "broken", JobStatus::Failed).await;

        let options = eligible_now().keep_successful(true).keep_failed(false);
        let summary = manager(&store).cleanup(options).await.unwrap();

        assert_eq!(summary.completed_deleted, 0);
        assert_eq!(summary.failed_deleted, 1);
        assert!(store.find_by_status(JobStatus::Failed).await.unwrap().is_empty());
        assert_eq!(
            store.find_by_status(JobStatus::Completed).await.unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn non_terminal_jobs_are_never_touched() {
        let store = InMemoryStore::new();
        store.upsert_by_external_id(mock_job("waiting")).await.unwrap();
        let active = store.upsert_by_external_id(mock_job("active")).await.unwrap();
        store
            .transition_status(active.id, JobStatus::Active)
            .await
            .unwrap();

        let options = eligible_now().keep_failed(false);
        let summary = manager(&store).cleanup(options).await.unwrap();

        assert_eq!(summary.completed_deleted, 0);
        assert_eq!(summary.failed_deleted, 0);
        assert!(store
            .find_by_external_id(&"waiting".into())
            .await
            .unwrap()
            .is_some());
        assert!(store
            .find_by_external_id(&"active".into())
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn dry_run_counts_match_the_real_run_and_delete_nothing() {
        let store = InMemoryStore::new();
        terminal_job(&store, "done-1", JobStatus::Completed).await;
        terminal_job(&store, "done-2", JobStatus::Completed).await;
        terminal_job(&store, "broken", JobStatus::Failed).await;

        let options = eligible_now().keep_failed(false);
        let dry = manager(&store).cleanup(options.dry_run()).await.unwrap();

        assert_eq!(dry.completed_deleted, 2);
        assert_eq!(dry.failed_deleted, 1);
        assert_eq!(
            store.find_by_status(JobStatus::Completed).await.unwrap().len(),
            2
        );

        // The dry run's own audit entry lands after its count, so allow for
        // it when comparing log deletions.
        let real = manager(&store).cleanup(options).await.unwrap();
        assert_eq!(real.completed_deleted, dry.completed_deleted);
        assert_eq!(real.failed_deleted, dry.failed_deleted);
        assert!(real.logs_deleted >= dry.logs_deleted);
        assert!(store.find_by_status(JobStatus::Completed).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn audit_entries_age_out_with_the_same_cutoff() {
        let store = InMemoryStore::new();
        let job = terminal_job(&store, "done", JobStatus::Completed).await;
        store
            .append(NewAuditEntry::for_job(
                &job.external_id,
                Severity::Info,
                "completed",
            ))
            .await
            .unwrap();

        let summary = manager(&store).cleanup(eligible_now()).await.unwrap();

        assert_eq!(summary.logs_deleted, 1);
        assert!(store
            .find_by_subject("done", &AuditFilter::new())
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn summary_entry_is_tagged_by_run_kind() {
        let store = InMemoryStore::new();

        manager(&store)
            .cleanup(CleanupOptions::new().dry_run())
            .await
            .unwrap();
        manager(&store).cleanup(CleanupOptions::new()).await.unwrap();

        let entries = store
            .find_by_subject("retention", &AuditFilter::new())
            .await
            .unwrap();
        assert_eq!(entries.len(), 2);
        // Newest first from the store.
        assert_eq!(entries[0].event(), Some(event::HISTORY_CLEANUP));
        assert_eq!(entries[1].event(), Some(event::HISTORY_CLEANUP_DRY_RUN));
        assert_eq!(entries[1].metadata["total_deleted"], 0);
    }
}
