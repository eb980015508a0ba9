//! Transition guard.
//!
//! Every status write is described by a [`Transition`]: the target status,
//! the fields written with it and the statuses the record must currently be
//! in. Repositories turn it into a single conditional write. A write that
//! matches nothing yields [`TransitionOutcome::Stale`], which is how a slow or
//! duplicate actor is kept from regressing a newer status.

use uuid::Uuid;

use cairn_types::status::{Status, StatusSet};

/// A requested status change plus the fields written with it.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition<U> {
    pub target: Status,
    pub update: U,
    /// Skip the precondition entirely. Reserved for privileged paths (abort).
    pub forced: bool,
    /// Overrides the target's default predecessor set.
    pub allowed_from: Option<StatusSet>,
}

impl<U: Default> Transition<U> {
    pub fn to(target: Status) -> Self {
        Self {
            target,
            update: U::default(),
            forced: false,
            allowed_from: None,
        }
    }
}

impl<U> Transition<U> {
    pub fn with_update(mut self, update: U) -> Self {
        self.update = update;
        self
    }

    pub fn forced(mut self) -> Self {
        self.forced = true;
        self
    }

    pub fn from_any_of(mut self, allowed: StatusSet) -> Self {
        self.allowed_from = Some(allowed);
        self
    }

    /// Statuses the record must be in for the write to apply; `None` when forced.
    pub fn precondition(&self) -> Option<StatusSet> {
        if self.forced {
            None
        } else {
            Some(
                self.allowed_from
                    .unwrap_or_else(|| self.target.allowed_predecessors()),
            )
        }
    }

    /// Whether a record currently in `current` would accept this transition.
    pub fn admits(&self, current: Status) -> bool {
        self.precondition().is_none_or(|allowed| allowed.contains(current))
    }
}

/// Result of a guarded write.
#[derive(Debug, Clone, PartialEq)]
pub enum TransitionOutcome<T> {
    Applied(T),
    /// The precondition did not match (or the record is gone). Not an error.
    Stale,
}

impl<T> TransitionOutcome<T> {
    pub fn applied(self) -> Option<T> {
        match self {
            TransitionOutcome::Applied(record) => Some(record),
            TransitionOutcome::Stale => None,
        }
    }

    pub fn is_applied(&self) -> bool {
        matches!(self, TransitionOutcome::Applied(_))
    }
}

/// Wrap a repository result, logging the stale case at debug.
pub(crate) fn settle<T>(
    entity: &'static str,
    id: Uuid,
    target: Status,
    written: Option<T>,
) -> TransitionOutcome<T> {
    match written {
        Some(record) => TransitionOutcome::Applied(record),
        None => {
            tracing::debug!(entity, id = %id, target = %target, "stale transition ignored");
            TransitionOutcome::Stale
        }
    }
}
