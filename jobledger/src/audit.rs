//! The append-only audit trail model.
//!
//! Every persisted status change and every recovery action leaves an entry
//! here. Entries outlive the job records they reference and are only ever
//! removed by the retention manager.

use std::fmt::Display;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::job::ExternalJobId;

/// Well-known event tags recorded under the `"event"` metadata key.
pub mod event {
    /// A persisted status change reported by the queue engine.
    pub const STATUS_CHANGE: &str = "STATUS_CHANGE";
    /// An `active` job reset to `waiting` by the startup recovery pass.
    pub const JOB_RECOVERED: &str = "JOB_RECOVERED";
    /// A job that exceeded the stuck threshold, repaired or parked.
    pub const STUCK_JOB_RECOVERED: &str = "STUCK_JOB_RECOVERED";
    /// The per-run summary emitted by the recovery coordinator.
    pub const SYSTEM_STARTUP_RECOVERY: &str = "SYSTEM_STARTUP_RECOVERY";
    /// The summary emitted by a destructive retention run.
    pub const HISTORY_CLEANUP: &str = "HISTORY_CLEANUP";
    /// The summary emitted by a dry retention run.
    pub const HISTORY_CLEANUP_DRY_RUN: &str = "HISTORY_CLEANUP_DRY_RUN";
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubjectKind {
    Job,
    System,
}

impl Display for SubjectKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let val = match self {
            SubjectKind::Job => "job",
            SubjectKind::System => "system",
        };
        write!(f, "{val}")
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Trace => "trace",
            Severity::Debug => "debug",
            Severity::Info => "info",
            Severity::Warn => "warn",
            Severity::Error => "error",
            Severity::Fatal => "fatal",
        }
    }
}

impl Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// An entry ready to be appended via [`crate::store::AuditStore::append`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewAuditEntry {
    pub subject: SubjectKind,
    pub subject_id: String,
    pub severity: Severity,
    pub message: String,
    pub metadata: serde_json::Value,
    pub correlation_id: Option<ExternalJobId>,
}

impl NewAuditEntry {
    /// A job-scoped entry, correlated by the job's external id.
    pub fn for_job(
        external_id: &ExternalJobId,
        severity: Severity,
        message: impl Into<String>,
    ) -> Self {
        Self {
            subject: SubjectKind::Job,
            subject_id: external_id.to_string(),
            severity,
            message: message.into(),
            metadata: serde_json::Value::Object(Default::default()),
            correlation_id: Some(external_id.clone()),
        }
    }

    /// A system-scoped entry, e.g. a recovery or cleanup summary.
    pub fn for_system(
        subject_id: impl Into<String>,
        severity: Severity,
        message: impl Into<String>,
    ) -> Self {
        Self {
            subject: SubjectKind::System,
            subject_id: subject_id.into(),
            severity,
            message: message.into(),
            metadata: serde_json::Value::Object(Default::default()),
            correlation_id: None,
        }
    }

    pub fn with_metadata(self, metadata: serde_json::Value) -> Self {
        Self { metadata, ..self }
    }

    /// Tag the entry with one of the [`event`] constants.
    pub fn with_event(mut self, event: &str) -> Self {
        match self.metadata {
            serde_json::Value::Object(ref mut map) => {
                map.insert("event".to_owned(), event.into());
            }
            _ => {
                self.metadata = serde_json::json!({ "event": event });
            }
        }
        self
    }
}

/// An immutable, stored audit entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditLogEntry {
    pub id: i64,
    pub subject: SubjectKind,
    pub subject_id: String,
    pub severity: Severity,
    pub message: String,
    pub metadata: serde_json::Value,
    pub correlation_id: Option<ExternalJobId>,
    pub recorded_at: DateTime<Utc>,
}

impl AuditLogEntry {
    /// The event tag, if the entry carries one.
    pub fn event(&self) -> Option<&str> {
        self.metadata.get("event").and_then(|value| value.as_str())
    }
}

/// Filters for [`crate::store::AuditStore::find_by_subject`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuditFilter {
    pub severity: Option<Severity>,
    pub event: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: Option<u32>,
}

impl AuditFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_severity(self, severity: Severity) -> Self {
        Self {
            severity: Some(severity),
            ..self
        }
    }

    pub fn with_event(self, event: impl Into<String>) -> Self {
        Self {
            event: Some(event.into()),
            ..self
        }
    }

    pub fn since(self, since: DateTime<Utc>) -> Self {
        Self {
            since: Some(since),
            ..self
        }
    }

    pub fn until(self, until: DateTime<Utc>) -> Self {
        Self {
            until: Some(until),
            ..self
        }
    }

    pub fn with_limit(self, limit: u32) -> Self {
        Self {
            limit: Some(limit),
            ..self
        }
    }

    /// Whether the entry passes every configured filter. Subject matching is
    /// the store's concern; this only checks the entry's own fields.
    pub fn matches(&self, entry: &AuditLogEntry) -> bool {
        self.severity.map_or(true, |severity| entry.severity == severity)
            && self
                .event
                .as_deref()
                .map_or(true, |event| entry.event() == Some(event))
            && self.since.map_or(true, |since| entry.recorded_at >= since)
            && self.until.map_or(true, |until| entry.recorded_at < until)
    }
}
