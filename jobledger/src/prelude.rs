//! The purpose of this module is to alleviate the need to import many of the `[jobledger]` types.
//!
//! ```
//! # #![allow(unused_imports)]
//! use jobledger::prelude::*;
//! ```
pub use crate::audit::{AuditFilter, AuditLogEntry, NewAuditEntry, Severity, SubjectKind};
pub use crate::backoff::BackoffStrategy;
pub use crate::backoff::Jitter;
pub use crate::job::draft::JobDraft;
pub use crate::job::{BackoffKind, ExternalJobId, JobId, JobRecord, JobStatus};
pub use crate::recovery::{RecoveryConfig, RecoveryCoordinator, RecoverySummary};
pub use crate::retention::runner::RetentionSchedule;
pub use crate::retention::{CleanupOptions, CleanupSummary, RetentionManager};
pub use crate::service::{JobLedger, PersistOpts};
pub use crate::store::{AuditStore, JobStore, StoreError};
