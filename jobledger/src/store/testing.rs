//! Test suite for ensuring a correct implementation of the store traits.
//!
//! Store adapters should include this as part of their test suites; see
//! [`crate::test_suite`].

use chrono::{TimeDelta, Utc};

use crate::audit::{event, AuditFilter, NewAuditEntry, Severity};
use crate::job::{AttemptStatus, BackoffKind, JobStatus, NewJob};

use super::{AuditStore, JobStore, StoreError};

/// A minimal valid job for exercising a store.
pub fn mock_job(external_id: &str) -> NewJob {
    NewJob {
        external_id: external_id.into(),
        queue: "default".to_owned(),
        task_id: "task-1".to_owned(),
        status: JobStatus::Waiting,
        priority: NewJob::DEFAULT_PRIORITY,
        max_attempts: NewJob::DEFAULT_MAX_ATTEMPTS,
        backoff: NewJob::DEFAULT_BACKOFF,
        backoff_delay: NewJob::DEFAULT_BACKOFF_DELAY,
        payload: serde_json::json!({ "kind": "mock" }),
        options: serde_json::Value::Object(Default::default()),
        result: None,
        error: None,
    }
}

pub async fn upsert_creates(store: impl JobStore) {
    let job = store.upsert_by_external_id(mock_job("job-1")).await.unwrap();

    assert_eq!(job.external_id.as_str(), "job-1");
    assert_eq!(job.queue, "default");
    assert_eq!(job.status, JobStatus::Waiting);
    assert_eq!(job.started_at, None);
    assert_eq!(job.finished_at, None);

    let found = store
        .find_by_external_id(&"job-1".into())
        .await
        .unwrap()
        .expect("Should find the created job");
    assert_eq!(found, job);
}

pub async fn upsert_twice_updates_in_place(store: impl JobStore) {
    let first = store.upsert_by_external_id(mock_job("job-1")).await.unwrap();

    let redelivered = NewJob {
        priority: 9,
        max_attempts: 5,
        backoff: BackoffKind::Linear,
        payload: serde_json::json!({ "kind": "updated" }),
        ..mock_job("job-1")
    };
    let second = store.upsert_by_external_id(redelivered).await.unwrap();

    assert_eq!(second.id, first.id);
    assert_eq!(second.created_at, first.created_at);
    assert_eq!(second.priority, 9);
    assert_eq!(second.max_attempts, 5);
    assert_eq!(second.backoff, BackoffKind::Linear);
    assert_eq!(second.payload, serde_json::json!({ "kind": "updated" }));

    let all = store.find_by_status(JobStatus::Waiting).await.unwrap();
    assert_eq!(all.len(), 1);
}

pub async fn upsert_with_status_change_goes_through_the_engine(store: impl JobStore) {
    let job = store.upsert_by_external_id(mock_job("job-1")).await.unwrap();

    let reported_active = NewJob {
        status: JobStatus::Active,
        ..mock_job("job-1")
    };
    let job = store.upsert_by_external_id(reported_active).await.unwrap();

    assert_eq!(job.status, JobStatus::Active);
    assert!(job.started_at.is_some());
    assert_eq!(store.attempt_count(job.id).await.unwrap(), 1);
}

pub async fn upsert_created_active_honors_timestamp_invariant(store: impl JobStore) {
    let reported_active = NewJob {
        status: JobStatus::Active,
        ..mock_job("job-1")
    };
    let job = store.upsert_by_external_id(reported_active).await.unwrap();

    assert_eq!(job.status, JobStatus::Active);
    assert!(job.started_at.is_some());
    assert_eq!(job.finished_at, None);
}

pub async fn transition_to_active_sets_started(store: impl JobStore) {
    let job = store.upsert_by_external_id(mock_job("job-1")).await.unwrap();

    let job = store
        .transition_status(job.id, JobStatus::Active)
        .await
        .unwrap();

    assert_eq!(job.status, JobStatus::Active);
    assert!(job.started_at.is_some());
    assert_eq!(job.finished_at, None);
}

pub async fn transition_to_completed_sets_finished(store: impl JobStore) {
    let job = store.upsert_by_external_id(mock_job("job-1")).await.unwrap();
    let job = store
        .transition_status(job.id, JobStatus::Active)
        .await
        .unwrap();
    let started = job.started_at;

    let job = store
        .transition_status(job.id, JobStatus::Completed)
        .await
        .unwrap();

    assert_eq!(job.status, JobStatus::Completed);
    assert!(job.finished_at.is_some());
    assert_eq!(job.started_at, started);
}

pub async fn transition_recovery_to_waiting_clears_started(store: impl JobStore) {
    let job = store.upsert_by_external_id(mock_job("job-1")).await.unwrap();
    let job = store
        .transition_status(job.id, JobStatus::Active)
        .await
        .unwrap();

    let job = store
        .transition_status(job.id, JobStatus::Waiting)
        .await
        .unwrap();

    assert_eq!(job.status, JobStatus::Waiting);
    assert_eq!(job.started_at, None);

    let attempts = store.attempts(job.id).await.unwrap();
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].status, AttemptStatus::Cancelled);
    assert!(attempts[0].finished_at.is_some());
}

pub async fn transition_not_found(store: impl JobStore) {
    let result = store
        .transition_status(4242.into(), JobStatus::Active)
        .await;

    assert!(matches!(result, Err(StoreError::JobNotFound(_))));
}

pub async fn attempts_are_contiguous_with_single_open(store: impl JobStore) {
    let job = store.upsert_by_external_id(mock_job("job-1")).await.unwrap();

    store
        .transition_status(job.id, JobStatus::Active)
        .await
        .unwrap();
    store
        .transition_status(job.id, JobStatus::Waiting)
        .await
        .unwrap();
    store
        .transition_status(job.id, JobStatus::Active)
        .await
        .unwrap();
    store
        .transition_status(job.id, JobStatus::Completed)
        .await
        .unwrap();

    let attempts = store.attempts(job.id).await.unwrap();
    assert_eq!(attempts.len(), 2);
    assert_eq!(attempts[0].number, 1);
    assert_eq!(attempts[0].status, AttemptStatus::Cancelled);
    assert_eq!(attempts[1].number, 2);
    assert_eq!(attempts[1].status, AttemptStatus::Completed);
    assert_eq!(store.attempt_count(job.id).await.unwrap(), 2);
}

pub async fn failed_upsert_records_the_attempt_error(store: impl JobStore) {
    store
        .upsert_by_external_id(NewJob {
            status: JobStatus::Active,
            ..mock_job("job-1")
        })
        .await
        .unwrap();

    let job = store
        .upsert_by_external_id(NewJob {
            status: JobStatus::Failed,
            error: Some("connection reset by peer".to_owned()),
            ..mock_job("job-1")
        })
        .await
        .unwrap();

    assert_eq!(job.status, JobStatus::Failed);
    let attempts = store.attempts(job.id).await.unwrap();
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].status, AttemptStatus::Failed);
    assert_eq!(attempts[0].error.as_deref(), Some("connection reset by peer"));
}

pub async fn find_by_statuses_filters(store: impl JobStore) {
    let waiting = store.upsert_by_external_id(mock_job("job-1")).await.unwrap();
    let active = store.upsert_by_external_id(mock_job("job-2")).await.unwrap();
    let active = store
        .transition_status(active.id, JobStatus::Active)
        .await
        .unwrap();
    let done = store.upsert_by_external_id(mock_job("job-3")).await.unwrap();
    store
        .transition_status(done.id, JobStatus::Active)
        .await
        .unwrap();
    store
        .transition_status(done.id, JobStatus::Completed)
        .await
        .unwrap();

    let found = store
        .find_by_statuses(&[JobStatus::Waiting, JobStatus::Active])
        .await
        .unwrap();
    assert_eq!(found.len(), 2);
    assert!(found.iter().any(|job| job.id == waiting.id));
    assert!(found.iter().any(|job| job.id == active.id));

    let found = store.find_by_status(JobStatus::Completed).await.unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].id, done.id);
}

pub async fn find_stuck_honors_threshold(store: impl JobStore) {
    let job = store.upsert_by_external_id(mock_job("job-1")).await.unwrap();
    store
        .transition_status(job.id, JobStatus::Active)
        .await
        .unwrap();

    // Threshold after the job started: the job counts as stuck.
    let stuck = store
        .find_stuck(Utc::now() + TimeDelta::hours(1))
        .await
        .unwrap();
    assert_eq!(stuck.len(), 1);
    assert_eq!(stuck[0].id, job.id);

    // Threshold before it started: it does not.
    let stuck = store
        .find_stuck(Utc::now() - TimeDelta::hours(1))
        .await
        .unwrap();
    assert!(stuck.is_empty());
}

pub async fn find_stuck_ignores_non_active(store: impl JobStore) {
    let job = store.upsert_by_external_id(mock_job("job-1")).await.unwrap();
    store
        .transition_status(job.id, JobStatus::Active)
        .await
        .unwrap();
    store
        .transition_status(job.id, JobStatus::Paused)
        .await
        .unwrap();

    let stuck = store
        .find_stuck(Utc::now() + TimeDelta::hours(1))
        .await
        .unwrap();
    assert!(stuck.is_empty());
}

pub async fn delete_terminal_before_only_removes_matching(store: impl JobStore) {
    let completed = store.upsert_by_external_id(mock_job("job-1")).await.unwrap();
    store
        .transition_status(completed.id, JobStatus::Active)
        .await
        .unwrap();
    store
        .transition_status(completed.id, JobStatus::Completed)
        .await
        .unwrap();

    let failed = store.upsert_by_external_id(mock_job("job-2")).await.unwrap();
    store
        .transition_status(failed.id, JobStatus::Active)
        .await
        .unwrap();
    store
        .transition_status(failed.id, JobStatus::Failed)
        .await
        .unwrap();

    store.upsert_by_external_id(mock_job("job-3")).await.unwrap();

    let cutoff = Utc::now() + TimeDelta::hours(1);
    assert_eq!(
        store
            .count_terminal_before(JobStatus::Completed, cutoff)
            .await
            .unwrap(),
        1
    );
    assert_eq!(
        store
            .delete_terminal_before(JobStatus::Completed, cutoff)
            .await
            .unwrap(),
        1
    );

    // The completed job and its attempts are gone; everything else stays.
    assert!(store
        .find_by_external_id(&"job-1".into())
        .await
        .unwrap()
        .is_none());
    assert!(store.attempts(completed.id).await.unwrap().is_empty());
    assert!(store
        .find_by_external_id(&"job-2".into())
        .await
        .unwrap()
        .is_some());
    assert!(store
        .find_by_external_id(&"job-3".into())
        .await
        .unwrap()
        .is_some());

    // A cutoff in the past matches nothing.
    assert_eq!(
        store
            .delete_terminal_before(JobStatus::Failed, Utc::now() - TimeDelta::hours(1))
            .await
            .unwrap(),
        0
    );
}

pub async fn audit_append_and_find_by_subject(store: impl AuditStore) {
    store
        .append(
            NewAuditEntry::for_job(&"job-1".into(), Severity::Info, "created")
                .with_event(event::STATUS_CHANGE),
        )
        .await
        .unwrap();
    store
        .append(
            NewAuditEntry::for_job(&"job-1".into(), Severity::Warn, "recovered")
                .with_event(event::JOB_RECOVERED),
        )
        .await
        .unwrap();
    store
        .append(NewAuditEntry::for_job(&"job-2".into(), Severity::Info, "created"))
        .await
        .unwrap();

    let entries = store
        .find_by_subject("job-1", &AuditFilter::new())
        .await
        .unwrap();
    assert_eq!(entries.len(), 2);
    // Newest first.
    assert_eq!(entries[0].message, "recovered");
    assert_eq!(entries[0].event(), Some(event::JOB_RECOVERED));
    assert_eq!(entries[0].correlation_id, Some("job-1".into()));

    let entries = store
        .find_by_subject("job-1", &AuditFilter::new().with_severity(Severity::Warn))
        .await
        .unwrap();
    assert_eq!(entries.len(), 1);

    let entries = store
        .find_by_subject("job-1", &AuditFilter::new().with_limit(1))
        .await
        .unwrap();
    assert_eq!(entries.len(), 1);
}

pub async fn audit_retention_queries(store: impl AuditStore) {
    store
        .append(NewAuditEntry::for_system("startup", Severity::Info, "summary"))
        .await
        .unwrap();
    store
        .append(NewAuditEntry::for_job(&"job-1".into(), Severity::Info, "created"))
        .await
        .unwrap();

    let past = Utc::now() - TimeDelta::hours(1);
    assert_eq!(store.count_older_than(past).await.unwrap(), 0);
    assert!(store.find_older_than(past).await.unwrap().is_empty());
    assert_eq!(store.delete_older_than(past).await.unwrap(), 0);

    let future = Utc::now() + TimeDelta::hours(1);
    assert_eq!(store.count_older_than(future).await.unwrap(), 2);
    assert_eq!(store.find_older_than(future).await.unwrap().len(), 2);
    assert_eq!(store.delete_older_than(future).await.unwrap(), 2);
    assert_eq!(store.count_older_than(future).await.unwrap(), 0);
}

/// Create the contract test suite for a store implementation.
///
/// # Example
///
/// ```
/// # #[cfg(test)]
/// # mod suite {
/// use jobledger::store::memory::InMemoryStore;
/// use jobledger::test_suite;
/// test_suite!(for: InMemoryStore::new());
/// # }
/// ```
///
/// When using a different async test attribute, for example `sqlx::test`:
///
/// ```ignore
/// use jobledger::test_suite;
/// test_suite!(
///     attr: sqlx::test,
///     args: (pool: PgPool),
///     store: PgStore::from(pool)
/// );
/// ```
#[macro_export]
macro_rules! test_suite {
    (for: $store:expr) => {
        $crate::test_suite!(attr: tokio::test, args: (), store: $store);
    };
    (attr: $attr:meta, args: $args:tt, store: $store:expr) => {
        #[$attr]
        async fn upsert_creates $args {
            let store = $store;
            $crate::store::testing::upsert_creates(store).await;
        }
        #[$attr]
        async fn upsert_twice_updates_in_place $args {
            let store = $store;
            $crate::store::testing::upsert_twice_updates_in_place(store).await;
        }
        #[$attr]
        async fn upsert_with_status_change_goes_through_the_engine $args {
            let store = $store;
            $crate::store::testing::upsert_with_status_change_goes_through_the_engine(store).await;
        }
        #[$attr]
        async fn upsert_created_active_honors_timestamp_invariant $args {
            let store = $store;
            $crate::store::testing::upsert_created_active_honors_timestamp_invariant(store).await;
        }
        #[$attr]
        async fn transition_to_active_sets_started $args {
            let store = $store;
            $crate::store::testing::transition_to_active_sets_started(store).await;
        }
        #[$attr]
        async fn transition_to_completed_sets_finished $args {
            let store = $store;
            $crate::store::testing::transition_to_completed_sets_finished(store).await;
        }
        #[$attr]
        async fn transition_recovery_to_waiting_clears_started $args {
            let store = $store;
            $crate::store::testing::transition_recovery_to_waiting_clears_started(store).await;
        }
        #[$attr]
        async fn transition_not_found $args {
            let store = $store;
            $crate::store::testing::transition_not_found(store).await;
        }
        #[$attr]
        async fn attempts_are_contiguous_with_single_open $args {
            let store = $store;
            $crate::store::testing::attempts_are_contiguous_with_single_open(store).await;
        }
        #[$attr]
        async fn failed_upsert_records_the_attempt_error $args {
            let store = $store;
            $crate::store::testing::failed_upsert_records_the_attempt_error(store).await;
        }
        #[$attr]
        async fn find_by_statuses_filters $args {
            let store = $store;
            $crate::store::testing::find_by_statuses_filters(store).await;
        }
        #[$attr]
        async fn find_stuck_honors_threshold $args {
            let store = $store;
            $crate::store::testing::find_stuck_honors_threshold(store).await;
        }
        #[$attr]
        async fn find_stuck_ignores_non_active $args {
            let store = $store;
            $crate::store::testing::find_stuck_ignores_non_active(store).await;
        }
        #[$attr]
        async fn delete_terminal_before_only_removes_matching $args {
            let store = $store;
            $crate::store::testing::delete_terminal_before_only_removes_matching(store).await;
        }
        #[$attr]
        async fn audit_append_and_find_by_subject $args {
            let store = $store;
            $crate::store::testing::audit_append_and_find_by_subject(store).await;
        }
        #[$attr]
        async fn audit_retention_queries $args {
            let store = $store;
            $crate::store::testing::audit_retention_queries(store).await;
        }
    };
}
