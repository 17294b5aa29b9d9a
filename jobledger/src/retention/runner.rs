//! Drives [`RetentionManager`] on a cron schedule.

use std::{ops::Sub, str::FromStr, time::Duration};

use chrono::{TimeDelta, Utc};
use futures::{stream::FuturesOrdered, StreamExt};
use tokio_util::sync::CancellationToken;

use crate::store::{AuditStore, JobStore};

use super::{CleanupOptions, RetentionManager};

/// When to run cleanup and with which option sets.
///
/// Several option sets can be registered to apply different retention
/// windows per run, for example a short window for successful jobs and a
/// long one for failed jobs.
///
/// # Example
///
/// ```
/// # use jobledger::retention::runner::RetentionSchedule;
/// # use jobledger::retention::CleanupOptions;
/// # use chrono::TimeDelta;
/// # use std::str::FromStr;
/// let schedule = RetentionSchedule::new(cron::Schedule::from_str("0 0 3 * * *").unwrap())
///     .with_run(CleanupOptions::new().older_than(TimeDelta::days(7)))
///     .with_run(
///         CleanupOptions::new()
///             .older_than(TimeDelta::days(90))
///             .keep_successful(true)
///             .keep_failed(false),
///     );
/// ```
#[derive(Debug, Clone)]
pub struct RetentionSchedule {
    schedule: cron::Schedule,
    runs: Vec<CleanupOptions>,
}

impl Default for RetentionSchedule {
    /// Daily at 03:00 UTC with [`CleanupOptions::default`].
    fn default() -> Self {
        Self::new(cron::Schedule::from_str("0 0 3 * * *").expect("valid cron expression"))
            .with_run(CleanupOptions::default())
    }
}

impl RetentionSchedule {
    pub fn new(schedule: cron::Schedule) -> Self {
        Self {
            schedule,
            runs: Vec::new(),
        }
    }

    pub fn with_run(mut self, options: CleanupOptions) -> Self {
        self.runs.push(options);
        self
    }
}

pub(crate) struct RetentionRunner<J, A> {
    manager: RetentionManager<J, A>,
    schedule: RetentionSchedule,
}

impl<J, A> RetentionRunner<J, A>
where
    J: JobStore + 'static,
    A: AuditStore + 'static,
{
    pub fn new(manager: RetentionManager<J, A>, schedule: RetentionSchedule) -> Self {
        Self { manager, schedule }
    }

    pub fn spawn(self, cancellation_token: CancellationToken) {
        tokio::spawn({
            async move {
                loop {
                    let Some(next) = self.schedule.schedule.upcoming(Utc).next() else {
                        tracing::warn!("No future scheduled time for history cleanup");
                        break;
                    };
                    let delay = next
                        .sub(Utc::now())
                        .sub(TimeDelta::milliseconds(10))
                        .to_std()
                        .unwrap_or(Duration::ZERO);
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {
                            self.cleanup_all().await;
                            let delay = next - Utc::now();
                            if delay > TimeDelta::zero() {
                                tokio::time::sleep(delay.to_std().unwrap_or(Duration::ZERO)).await;
                            }
                        }
                        _ = cancellation_token.cancelled() => {
                            tracing::debug!("Shutting down the history cleanup runner");
                            break;
                        },
                    }
                }
            }
        });
    }

    async fn cleanup_all(&self) {
        self.schedule
            .runs
            .iter()
            .map(|options| self.manager.cleanup(*options))
            .collect::<FuturesOrdered<_>>()
            .filter_map(|result| async { result.err() })
            .for_each(|error| async move {
                tracing::error!(?error, "Failed to clean up history with error {error}");
            })
            .await;
    }
}

/// Spawn a background task running `manager` per `schedule` until the token
/// is cancelled.
pub fn spawn<J, A>(
    manager: RetentionManager<J, A>,
    schedule: RetentionSchedule,
    cancellation_token: CancellationToken,
) where
    J: JobStore + 'static,
    A: AuditStore + 'static,
{
    RetentionRunner::new(manager, schedule).spawn(cancellation_token);
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::audit::{event, AuditFilter};
    use crate::store::memory::InMemoryStore;
    use crate::store::AuditStore;

    #[tokio::test]
    async fn runs_every_due_tick_until_cancelled() {
        let store = InMemoryStore::new();
        let manager = RetentionManager::new(store.clone(), store.clone());
        let schedule = RetentionSchedule::new(
            cron::Schedule::from_str("* * * * * *").unwrap(),
        )
        .with_run(CleanupOptions::new());
        let token = CancellationToken::new();

        spawn(manager, schedule, token.clone());
        tokio::time::sleep(Duration::from_millis(1100)).await;
        token.cancel();

        let entries = store
            .find_by_subject("retention", &AuditFilter::new())
            .await
            .unwrap();
        assert!(!entries.is_empty());
        assert!(entries
            .iter()
            .all(|entry| entry.event() == Some(event::HISTORY_CLEANUP)));

        // No further runs after cancellation.
        let count = entries.len();
        tokio::time::sleep(Duration::from_millis(1100)).await;
        let entries = store
            .find_by_subject("retention", &AuditFilter::new())
            .await
            .unwrap();
        assert_eq!(entries.len(), count);
    }

    #[tokio::test]
    async fn each_registered_run_executes() {
        let store = InMemoryStore::new();
        let manager = RetentionManager::new(store.clone(), store.clone());
        let schedule = RetentionSchedule::new(
            cron::Schedule::from_str("* * * * * *").unwrap(),
        )
        .with_run(CleanupOptions::new())
        .with_run(CleanupOptions::new().dry_run());
        let token = CancellationToken::new();

        spawn(manager, schedule, token.clone());
        tokio::time::sleep(Duration::from_millis(1100)).await;
        token.cancel();

        let entries = store
            .find_by_subject("retention", &AuditFilter::new())
            .await
            .unwrap();
        assert!(entries
            .iter()
            .any(|entry| entry.event() == Some(event::HISTORY_CLEANUP)));
        assert!(entries
            .iter()
            .any(|entry| entry.event() == Some(event::HISTORY_CLEANUP_DRY_RUN)));
    }
}
