//! The state transition engine.
//!
//! Maps a requested status change to the concrete field mutations that must
//! be applied atomically alongside it. Keeping this a pure function over
//! `(current, target)` keeps the timestamp invariants centralized and
//! testable without a store; both the persistence path and the recovery
//! coordinator go through it.

use chrono::{DateTime, Utc};

use crate::job::{AttemptStatus, JobRecord, JobStatus};

/// Whether to leave a field as is or overwrite it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field<T> {
    Keep,
    Set(T),
}

impl<T: Copy> Field<T> {
    fn apply_to(&self, slot: &mut T) {
        if let Field::Set(value) = self {
            *slot = *value;
        }
    }
}

/// What the transition means for the job's attempt history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptAction {
    /// Leave the attempt rows untouched.
    None,
    /// Open a new `processing` attempt numbered `count + 1`.
    Open,
    /// Close the currently open attempt, if any, with the given status.
    Close(AttemptStatus),
}

/// The atomic set of mutations a status change implies.
///
/// Produced by [`compute_transition`]; applied by the stores in the same
/// transaction (or under the same lock) as the status write itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldPatch {
    pub status: JobStatus,
    pub started_at: Field<Option<DateTime<Utc>>>,
    pub finished_at: Field<Option<DateTime<Utc>>>,
    pub delayed_until: Field<Option<DateTime<Utc>>>,
    pub attempt: AttemptAction,
}

impl FieldPatch {
    fn unchanged(status: JobStatus) -> Self {
        Self {
            status,
            started_at: Field::Keep,
            finished_at: Field::Keep,
            delayed_until: Field::Keep,
            attempt: AttemptAction::None,
        }
    }

    /// Apply the patch to an owned record. The store is responsible for the
    /// attempt bookkeeping described by [`FieldPatch::attempt`].
    pub fn apply(&self, job: &mut JobRecord) {
        job.status = self.status;
        self.started_at.apply_to(&mut job.started_at);
        self.finished_at.apply_to(&mut job.finished_at);
        self.delayed_until.apply_to(&mut job.delayed_until);
    }
}

/// Compute the field mutations for transitioning `current` to `target`.
///
/// `attempts` is the number of attempt rows recorded for the job so far; it
/// is only consulted for `* → Delayed`, where the next retry's backoff delay
/// determines `delayed_until`.
///
/// Rules:
///
/// - into `Active`: set `started_at = now`, open a new attempt;
/// - into `Completed` or `Failed`: set `finished_at = now`, close the open
///   attempt (the invariant "`finished_at` set iff terminal" holds on every
///   path into a terminal state, not only from `Active`);
/// - into `Waiting`: clear `started_at` and `delayed_until`, and close any
///   open attempt as `cancelled` (this covers both the direct recovery path
///   `Active → Waiting` and the two-step `Active → Stuck → Waiting`);
/// - into `Delayed`: set `delayed_until = now + retry delay`, touch nothing
///   else;
/// - into `Paused` or `Stuck`: status only.
///
/// A transition to the current status is the identity patch.
pub fn compute_transition(
    current: &JobRecord,
    target: JobStatus,
    now: DateTime<Utc>,
    attempts: u16,
) -> FieldPatch {
    if current.status == target {
        return FieldPatch::unchanged(target);
    }
    let mut patch = FieldPatch::unchanged(target);
    match target {
        JobStatus::Active => {
            patch.started_at = Field::Set(Some(now));
            patch.attempt = AttemptAction::Open;
        }
        JobStatus::Completed => {
            patch.finished_at = Field::Set(Some(now));
            patch.attempt = AttemptAction::Close(AttemptStatus::Completed);
        }
        JobStatus::Failed => {
            patch.finished_at = Field::Set(Some(now));
            patch.attempt = AttemptAction::Close(AttemptStatus::Failed);
        }
        JobStatus::Waiting => {
            patch.started_at = Field::Set(None);
            patch.delayed_until = Field::Set(None);
            patch.attempt = AttemptAction::Close(AttemptStatus::Cancelled);
        }
        JobStatus::Delayed => {
            let delay = current.retry_delay(attempts.saturating_add(1));
            patch.delayed_until = Field::Set(Some(now + delay));
        }
        JobStatus::Paused | JobStatus::Stuck => {}
    }
    patch
}
