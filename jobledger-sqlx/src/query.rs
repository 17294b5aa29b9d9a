use jobledger::audit::AuditFilter;
use sqlx::{Postgres, QueryBuilder};

use crate::types::Severity;

pub(crate) const AUDIT_COLUMNS: &str =
    "id, subject, subject_id, severity, message, metadata, correlation_id, recorded_at";

/// Build the subject-history query, narrowed by the filter's clauses.
pub(crate) fn subject_history<'a>(
    subject_id: &'a str,
    filter: &'a AuditFilter,
) -> QueryBuilder<'a, Postgres> {
    let mut builder = QueryBuilder::new(format!(
        "SELECT {AUDIT_COLUMNS} FROM jobledger_audit_log WHERE subject_id = "
    ));
    builder.push_bind(subject_id);
    if let Some(severity) = filter.severity {
        builder.push(" AND severity = ");
        builder.push_bind(Severity::from(severity));
    }
    if let Some(event) = filter.event.as_deref() {
        builder.push(" AND metadata->>'event' = ");
        builder.push_bind(event);
    }
    if let Some(since) = filter.since {
        builder.push(" AND recorded_at >= ");
        builder.push_bind(since);
    }
    if let Some(until) = filter.until {
        builder.push(" AND recorded_at < ");
        builder.push_bind(until);
    }
    builder.push(" ORDER BY recorded_at DESC, id DESC");
    if let Some(limit) = filter.limit {
        builder.push(" LIMIT ");
        builder.push_bind(i64::from(limit));
    }
    builder
}
