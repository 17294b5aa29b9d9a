//! PostgreSQL implementation of the `jobledger` store traits.
//!
//! [`PgStore`] implements both [`jobledger::store::JobStore`] and
//! [`jobledger::store::AuditStore`] on top of a [`PgPool`]. Compound
//! operations (upserts that change status, transitions with their attempt
//! bookkeeping) run in a transaction holding the job's row lock, so the
//! invariants of the core model hold under concurrent callers.
//!
//! Schema migrations are embedded; [`PgStore::from_pool`] applies them on
//! construction, or call [`PgStore::migrate`] yourself if the host owns the
//! migration step.

use jobledger::store::StoreError;
use sqlx::PgPool;

mod query;
mod store;
mod types;

#[derive(Clone, Debug)]
pub struct PgStore {
    pool: PgPool,
}

impl From<PgPool> for PgStore {
    fn from(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl From<&PgPool> for PgStore {
    fn from(pool: &PgPool) -> Self {
        Self {
            pool: pool.to_owned(),
        }
    }
}

impl PgStore {
    /// Connect and bring the schema up to date.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let pool = PgPool::connect(url).await.map_err(map_err)?;
        Self::from_pool(pool).await
    }

    /// Wrap an existing pool and bring the schema up to date.
    pub async fn from_pool(pool: PgPool) -> Result<Self, StoreError> {
        let this = Self { pool };
        this.migrate().await?;
        Ok(this)
    }

    /// Apply the embedded migrations.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!()
            .run(&self.pool)
            .await
            .map_err(|error| StoreError::Storage(Box::new(error)))
    }
}

pub(crate) fn map_err(error: sqlx::Error) -> StoreError {
    tracing::error!(?error, "Postgres store operation failed");
    StoreError::Storage(Box::new(error))
}
