use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jobledger::{
    audit::{AuditFilter, AuditLogEntry, NewAuditEntry},
    job::{ExternalJobId, JobAttempt, JobId, JobRecord, JobStatus, NewJob},
    store::{AuditStore, JobStore, StoreError},
    transition::{compute_transition, AttemptAction},
};
use sqlx::{Postgres, Transaction};

use crate::{map_err, query, types, PgStore};

const JOB_COLUMNS: &str = "id, external_id, queue, task_id, status, priority, max_attempts, \
     backoff, backoff_delay_ms, payload, options, result, delayed_until, created_at, \
     started_at, finished_at";

const ATTEMPT_COLUMNS: &str =
    "job_id, number, status, error, result, started_at, finished_at";

impl PgStore {
    /// Apply the transition engine's patch for `target` inside `tx`.
    ///
    /// The caller must hold the row lock on the job, either from an insert
    /// or update in the same transaction or from `SELECT ... FOR UPDATE`.
    /// `error` is the engine's error text, recorded on the attempt a
    /// `Failed` transition closes.
    async fn apply_transition(
        tx: &mut Transaction<'_, Postgres>,
        mut record: JobRecord,
        target: JobStatus,
        error: Option<&str>,
    ) -> Result<JobRecord, StoreError> {
        let now = Utc::now();
        let count: i64 = sqlx::query_scalar(
            "SELECT count(*) FROM jobledger_job_attempts WHERE job_id = $1",
        )
        .bind(i64::from(record.id))
        .fetch_one(&mut **tx)
        .await
        .map_err(map_err)?;

        let patch = compute_transition(&record, target, now, count as u16);
        match patch.attempt {
            AttemptAction::None => {}
            AttemptAction::Open => {
                sqlx::query(
                    "INSERT INTO jobledger_job_attempts (job_id, number, status, started_at)
                     VALUES ($1, $2, 'processing', $3)",
                )
                .bind(i64::from(record.id))
                .bind(count as i32 + 1)
                .bind(now)
                .execute(&mut **tx)
                .await
                .map_err(map_err)?;
            }
            AttemptAction::Close(status) => {
                let result = (status == jobledger::job::AttemptStatus::Completed)
                    .then(|| record.result.clone())
                    .flatten();
                let error = (status == jobledger::job::AttemptStatus::Failed)
                    .then_some(error)
                    .flatten();
                sqlx::query(
                    "UPDATE jobledger_job_attempts
                     SET status = $2, finished_at = $3, result = $4, error = $5
                     WHERE id = (
                        SELECT id FROM jobledger_job_attempts
                        WHERE job_id = $1 AND status = 'processing'
                        ORDER BY number DESC
                        LIMIT 1
                     )",
                )
                .bind(i64::from(record.id))
                .bind(types::AttemptStatus::from(status))
                .bind(now)
                .bind(result)
                .bind(error)
                .execute(&mut **tx)
                .await
                .map_err(map_err)?;
            }
        }

        patch.apply(&mut record);
        sqlx::query(
            "UPDATE jobledger_jobs
             SET status = $2, started_at = $3, finished_at = $4, delayed_until = $5
             WHERE id = $1",
        )
        .bind(i64::from(record.id))
        .bind(types::JobStatus::from(record.status))
        .bind(record.started_at)
        .bind(record.finished_at)
        .bind(record.delayed_until)
        .execute(&mut **tx)
        .await
        .map_err(map_err)?;

        Ok(record)
    }
}

#[async_trait]
impl JobStore for PgStore {
    async fn upsert_by_external_id(&self, new: NewJob) -> Result<JobRecord, StoreError> {
        let mut tx = self.pool.begin().await.map_err(map_err)?;

        // New rows are born waiting; a reported non-waiting status goes
        // through the engine below so the timestamp and attempt invariants
        // hold even for the first notification we see. A racing create
        // loses the conflict and falls through to the update branch.
        let sql = format!(
            "INSERT INTO jobledger_jobs
                (external_id, queue, task_id, priority, max_attempts, backoff,
                 backoff_delay_ms, payload, options, result)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
             ON CONFLICT (external_id) DO NOTHING
             RETURNING {JOB_COLUMNS}"
        );
        let inserted: Option<types::JobRow> = sqlx::query_as(&sql)
            .bind(new.external_id.as_str())
            .bind(&new.queue)
            .bind(&new.task_id)
            .bind(new.priority)
            .bind(i32::from(new.max_attempts))
            .bind(types::BackoffKind::from(new.backoff))
            .bind(new.backoff_delay.num_milliseconds())
            .bind(&new.payload)
            .bind(&new.options)
            .bind(&new.result)
            .fetch_optional(&mut *tx)
            .await
            .map_err(map_err)?;

        let record: JobRecord = match inserted {
            Some(row) => row.try_into()?,
            None => {
                let sql = format!(
                    "UPDATE jobledger_jobs
                     SET queue = $2, task_id = $3, priority = $4, max_attempts = $5,
                         backoff = $6, backoff_delay_ms = $7, payload = $8, options = $9,
                         result = $10
                     WHERE external_id = $1
                     RETURNING {JOB_COLUMNS}"
                );
                let row: types::JobRow = sqlx::query_as(&sql)
                    .bind(new.external_id.as_str())
                    .bind(&new.queue)
                    .bind(&new.task_id)
                    .bind(new.priority)
                    .bind(i32::from(new.max_attempts))
                    .bind(types::BackoffKind::from(new.backoff))
                    .bind(new.backoff_delay.num_milliseconds())
                    .bind(&new.payload)
                    .bind(&new.options)
                    .bind(&new.result)
                    .fetch_optional(&mut *tx)
                    .await
                    .map_err(map_err)?
                    .ok_or(StoreError::BadState)?;
                row.try_into()?
            }
        };

        let record = if record.status != new.status {
            Self::apply_transition(&mut tx, record, new.status, new.error.as_deref()).await?
        } else {
            record
        };

        tx.commit().await.map_err(map_err)?;
        Ok(record)
    }

    async fn find_by_external_id(
        &self,
        external_id: &ExternalJobId,
    ) -> Result<Option<JobRecord>, StoreError> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobledger_jobs WHERE external_id = $1");
        sqlx::query_as::<_, types::JobRow>(&sql)
            .bind(external_id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(map_err)?
            .map(TryInto::try_into)
            .transpose()
    }

    async fn find_by_status(&self, status: JobStatus) -> Result<Vec<JobRecord>, StoreError> {
        self.find_by_statuses(&[status]).await
    }

    async fn find_by_statuses(
        &self,
        statuses: &[JobStatus],
    ) -> Result<Vec<JobRecord>, StoreError> {
        let statuses: Vec<types::JobStatus> =
            statuses.iter().copied().map(Into::into).collect();
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobledger_jobs WHERE status = ANY($1)");
        sqlx::query_as::<_, types::JobRow>(&sql)
            .bind(statuses)
            .fetch_all(&self.pool)
            .await
            .map_err(map_err)?
            .into_iter()
            .map(TryInto::try_into)
            .collect()
    }

    async fn find_stuck(&self, threshold: DateTime<Utc>) -> Result<Vec<JobRecord>, StoreError> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM jobledger_jobs
             WHERE status = 'active' AND started_at < $1"
        );
        sqlx::query_as::<_, types::JobRow>(&sql)
            .bind(threshold)
            .fetch_all(&self.pool)
            .await
            .map_err(map_err)?
            .into_iter()
            .map(TryInto::try_into)
            .collect()
    }

    async fn transition_status(
        &self,
        id: JobId,
        target: JobStatus,
    ) -> Result<JobRecord, StoreError> {
        let mut tx = self.pool.begin().await.map_err(map_err)?;
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobledger_jobs WHERE id = $1 FOR UPDATE");
        let record: JobRecord = sqlx::query_as::<_, types::JobRow>(&sql)
            .bind(i64::from(id))
            .fetch_optional(&mut *tx)
            .await
            .map_err(map_err)?
            .ok_or(StoreError::JobNotFound(id))?
            .try_into()?;

        let record = Self::apply_transition(&mut tx, record, target, None).await?;
        tx.commit().await.map_err(map_err)?;
        Ok(record)
    }

    async fn attempts(&self, id: JobId) -> Result<Vec<JobAttempt>, StoreError> {
        let sql = format!(
            "SELECT {ATTEMPT_COLUMNS} FROM jobledger_job_attempts
             WHERE job_id = $1 ORDER BY number"
        );
        sqlx::query_as::<_, types::AttemptRow>(&sql)
            .bind(i64::from(id))
            .fetch_all(&self.pool)
            .await
            .map_err(map_err)?
            .into_iter()
            .map(TryInto::try_into)
            .collect()
    }

    async fn attempt_count(&self, id: JobId) -> Result<u16, StoreError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT count(*) FROM jobledger_job_attempts WHERE job_id = $1",
        )
        .bind(i64::from(id))
        .fetch_one(&self.pool)
        .await
        .map_err(map_err)?;
        Ok(count as u16)
    }

    async fn delete_terminal_before(
        &self,
        status: JobStatus,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        // Attempt rows go with the job through the FK cascade.
        let result =
            sqlx::query("DELETE FROM jobledger_jobs WHERE status = $1 AND finished_at < $2")
                .bind(types::JobStatus::from(status))
                .bind(cutoff)
                .execute(&self.pool)
                .await
                .map_err(map_err)?;
        Ok(result.rows_affected())
    }

    async fn count_terminal_before(
        &self,
        status: JobStatus,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT count(*) FROM jobledger_jobs WHERE status = $1 AND finished_at < $2",
        )
        .bind(types::JobStatus::from(status))
        .bind(cutoff)
        .fetch_one(&self.pool)
        .await
        .map_err(map_err)?;
        Ok(count as u64)
    }
}

#[async_trait]
impl AuditStore for PgStore {
    async fn append(&self, entry: NewAuditEntry) -> Result<AuditLogEntry, StoreError> {
        let sql = format!(
            "INSERT INTO jobledger_audit_log
                (subject, subject_id, severity, message, metadata, correlation_id)
             VALUES ($1, $2, $3, $4, $5, $6)
             RETURNING {}",
            query::AUDIT_COLUMNS
        );
        let row: types::AuditRow = sqlx::query_as(&sql)
            .bind(types::SubjectKind::from(entry.subject))
            .bind(&entry.subject_id)
            .bind(types::Severity::from(entry.severity))
            .bind(&entry.message)
            .bind(&entry.metadata)
            .bind(entry.correlation_id.as_ref().map(|id| id.as_str()))
            .fetch_one(&self.pool)
            .await
            .map_err(map_err)?;
        Ok(row.into())
    }

    async fn find_by_subject(
        &self,
        subject_id: &str,
        filter: &AuditFilter,
    ) -> Result<Vec<AuditLogEntry>, StoreError> {
        Ok(query::subject_history(subject_id, filter)
            .build_query_as::<types::AuditRow>()
            .fetch_all(&self.pool)
            .await
            .map_err(map_err)?
            .into_iter()
            .map(Into::into)
            .collect())
    }

    async fn find_older_than(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<AuditLogEntry>, StoreError> {
        let sql = format!(
            "SELECT {} FROM jobledger_audit_log WHERE recorded_at < $1 ORDER BY recorded_at",
            query::AUDIT_COLUMNS
        );
        Ok(sqlx::query_as::<_, types::AuditRow>(&sql)
            .bind(cutoff)
            .fetch_all(&self.pool)
            .await
            .map_err(map_err)?
            .into_iter()
            .map(Into::into)
            .collect())
    }

    async fn count_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let count: i64 =
            sqlx::query_scalar("SELECT count(*) FROM jobledger_audit_log WHERE recorded_at < $1")
                .bind(cutoff)
                .fetch_one(&self.pool)
                .await
                .map_err(map_err)?;
        Ok(count as u64)
    }

    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM jobledger_audit_log WHERE recorded_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .map_err(map_err)?;
        Ok(result.rows_affected())
    }
}
