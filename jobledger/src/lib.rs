//! Durable persistence for job lifecycle state.
//!
//! A queue engine reports every state change it observes; this crate records
//! those changes durably (jobs, their attempt history, and an append-only
//! audit log), repairs the record after an unclean shutdown, and ages out
//! old history on a schedule.
//!
//! The storage seams are the [`store::JobStore`] and [`store::AuditStore`]
//! traits. [`store::memory::InMemoryStore`] implements both for tests and
//! embedded setups; the `jobledger-sqlx` crate provides the Postgres
//! implementation.
//!
//! # Example
//!
//! ```
//! use jobledger::prelude::*;
//! use jobledger::store::memory::InMemoryStore;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let store = InMemoryStore::new();
//! let ledger = JobLedger::new(store.clone(), store.clone());
//!
//! // Startup: repair anything left behind by the previous run.
//! RecoveryCoordinator::new(store.clone(), store.clone(), RecoveryConfig::new())
//!     .run()
//!     .await?;
//!
//! // Record a state change reported by the queue engine.
//! let job = ledger
//!     .persist(
//!         JobDraft::new()
//!             .with_external_id("job-42")
//!             .with_queue("emails")
//!             .with_task_id("send_welcome")
//!             .with_status(JobStatus::Waiting),
//!         PersistOpts::new(),
//!     )
//!     .await?;
//! assert_eq!(job.status, JobStatus::Waiting);
//! # Ok(())
//! # }
//! ```

pub mod audit;
pub mod backoff;
pub mod job;
pub mod prelude;
pub mod recovery;
pub mod retention;
pub mod service;
pub mod store;
pub mod transition;
