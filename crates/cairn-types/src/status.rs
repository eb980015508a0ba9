//! Execution status taxonomy shared by plans and nodes.
//!
//! `Status` is a closed enum. Every classification used by the engine
//! (final, active, resumable, flowing, blocking) is a pure predicate here,
//! and every status carries the set of statuses it may legally be reached
//! from. The transition guard in `cairn-core` uses that set as the
//! precondition of its conditional write.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Status of a plan execution or node execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Queued,
    Running,
    AsyncWaiting,
    Paused,
    InterventionWaiting,
    ApprovalWaiting,
    Suspended,
    Discontinuing,
    Succeeded,
    Failed,
    Aborted,
    Errored,
    Skipped,
    Expired,
    IgnoreFailed,
}

impl Status {
    /// Every status, in declaration order.
    pub const ALL: [Status; 15] = [
        Status::Queued,
        Status::Running,
        Status::AsyncWaiting,
        Status::Paused,
        Status::InterventionWaiting,
        Status::ApprovalWaiting,
        Status::Suspended,
        Status::Discontinuing,
        Status::Succeeded,
        Status::Failed,
        Status::Aborted,
        Status::Errored,
        Status::Skipped,
        Status::Expired,
        Status::IgnoreFailed,
    ];

    /// Terminal statuses. No transition leaves them.
    pub const FINAL: StatusSet = StatusSet::of(&[
        Status::Succeeded,
        Status::Failed,
        Status::Aborted,
        Status::Errored,
        Status::Skipped,
        Status::Expired,
        Status::IgnoreFailed,
    ]);

    /// Statuses whose outcome may be copied into an identity node on resume.
    pub const RESUMABLE: StatusSet =
        StatusSet::of(&[Status::Succeeded, Status::Skipped, Status::IgnoreFailed]);

    /// Statuses of work that is actively progressing on its own.
    pub const FLOWING: StatusSet =
        StatusSet::of(&[Status::Running, Status::AsyncWaiting, Status::Discontinuing]);

    /// Non-final statuses that wait on an operator decision.
    pub const BLOCKING: StatusSet = StatusSet::of(&[
        Status::InterventionWaiting,
        Status::ApprovalWaiting,
        Status::Paused,
        Status::Suspended,
    ]);

    /// Negative terminal statuses.
    pub const BROKEN: StatusSet = StatusSet::of(&[
        Status::Failed,
        Status::Errored,
        Status::Aborted,
        Status::Expired,
    ]);

    pub fn is_final(self) -> bool {
        Self::FINAL.contains(self)
    }

    pub fn is_active(self) -> bool {
        !self.is_final()
    }

    pub fn is_resumable(self) -> bool {
        Self::RESUMABLE.contains(self)
    }

    pub fn is_flowing(self) -> bool {
        Self::FLOWING.contains(self)
    }

    pub fn is_blocking(self) -> bool {
        Self::BLOCKING.contains(self)
    }

    pub fn is_broken(self) -> bool {
        Self::BROKEN.contains(self)
    }

    /// The set of statuses a record must currently be in for a guarded
    /// transition into `self` to succeed.
    pub fn allowed_predecessors(self) -> StatusSet {
        let active = Self::FINAL.complement();
        match self {
            Status::Queued => StatusSet::of(&[Status::Queued]),
            Status::Running => StatusSet::of(&[
                Status::Queued,
                Status::Running,
                Status::AsyncWaiting,
            ])
            .union(Self::BLOCKING),
            Status::AsyncWaiting => {
                StatusSet::of(&[Status::Queued, Status::Running, Status::AsyncWaiting])
            }
            Status::Paused
            | Status::InterventionWaiting
            | Status::ApprovalWaiting
            | Status::Suspended => {
                StatusSet::of(&[Status::Queued, Status::Running, Status::AsyncWaiting])
                    .union(Self::BLOCKING)
            }
            Status::Discontinuing => active,
            Status::Succeeded
            | Status::Failed
            | Status::Aborted
            | Status::Errored
            | Status::Skipped
            | Status::Expired
            | Status::IgnoreFailed => active.with(self),
        }
    }

    /// Snake-case name, identical to the serde representation.
    pub fn as_str(self) -> &'static str {
        match self {
            Status::Queued => "queued",
            Status::Running => "running",
            Status::AsyncWaiting => "async_waiting",
            Status::Paused => "paused",
            Status::InterventionWaiting => "intervention_waiting",
            Status::ApprovalWaiting => "approval_waiting",
            Status::Suspended => "suspended",
            Status::Discontinuing => "discontinuing",
            Status::Succeeded => "succeeded",
            Status::Failed => "failed",
            Status::Aborted => "aborted",
            Status::Errored => "errored",
            Status::Skipped => "skipped",
            Status::Expired => "expired",
            Status::IgnoreFailed => "ignore_failed",
        }
    }

    const fn bit(self) -> u32 {
        1 << (self as u32)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown status name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown status '{0}'")]
pub struct ParseStatusError(pub String);

impl FromStr for Status {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        Status::ALL
            .into_iter()
            .find(|status| status.as_str() == normalized)
            .ok_or_else(|| ParseStatusError(s.to_string()))
    }
}

// ---------------------------------------------------------------------------
// StatusSet
// ---------------------------------------------------------------------------

/// Compact, copyable set of statuses backed by a bitmask.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct StatusSet(u32);

impl StatusSet {
    pub const EMPTY: StatusSet = StatusSet(0);
    pub const ALL: StatusSet = StatusSet::EMPTY.complement();

    /// Build a set from a slice of statuses. Usable in const context.
    pub const fn of(statuses: &[Status]) -> Self {
        let mut bits = 0;
        let mut i = 0;
        while i < statuses.len() {
            bits |= statuses[i].bit();
            i += 1;
        }
        StatusSet(bits)
    }

    pub const fn contains(self, status: Status) -> bool {
        self.0 & status.bit() != 0
    }

    pub const fn with(self, status: Status) -> Self {
        StatusSet(self.0 | status.bit())
    }

    pub const fn union(self, other: StatusSet) -> Self {
        StatusSet(self.0 | other.0)
    }

    pub const fn complement(self) -> Self {
        let all = (1u32 << Status::ALL.len()) - 1;
        StatusSet(!self.0 & all)
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn len(self) -> usize {
        self.0.count_ones() as usize
    }

    /// Iterate the members in declaration order.
    pub fn iter(self) -> impl Iterator<Item = Status> {
        Status::ALL.into_iter().filter(move |s| self.contains(*s))
    }

    /// Member names, for building `IN (...)` clauses and log fields.
    pub fn names(self) -> Vec<&'static str> {
        self.iter().map(Status::as_str).collect()
    }
}

impl FromIterator<Status> for StatusSet {
    fn from_iter<I: IntoIterator<Item = Status>>(iter: I) -> Self {
        iter.into_iter().fold(StatusSet::EMPTY, StatusSet::with)
    }
}

impl fmt::Debug for StatusSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}
