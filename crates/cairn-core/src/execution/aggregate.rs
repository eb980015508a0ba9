//! Child-to-parent status aggregation.

use cairn_types::status::Status;

/// Blocking statuses from strongest to weakest.
const BLOCKING_PRIORITY: [Status; 4] = [
    Status::InterventionWaiting,
    Status::ApprovalWaiting,
    Status::Paused,
    Status::Suspended,
];

/// Broken statuses from worst to least severe.
const SEVERITY: [Status; 4] = [
    Status::Aborted,
    Status::Errored,
    Status::Failed,
    Status::Expired,
];

/// Reduce the statuses of a node's children to the parent's status.
///
/// Priority order: no children means RUNNING; a pending operator decision
/// wins; then an abort in progress; then any unfinished work; then the worst
/// failure; otherwise SUCCEEDED. The result depends only on which statuses
/// are present, so it is independent of input order.
pub fn aggregate(statuses: &[Status]) -> Status {
    if statuses.is_empty() {
        return Status::Running;
    }
    let present = |wanted: Status| statuses.contains(&wanted);

    if let Some(blocking) = BLOCKING_PRIORITY.into_iter().find(|s| present(*s)) {
        return blocking;
    }
    if present(Status::Discontinuing) {
        return Status::Discontinuing;
    }
    if statuses.iter().any(|s| s.is_active()) {
        return Status::Running;
    }
    if let Some(worst) = SEVERITY.into_iter().find(|s| present(*s)) {
        return worst;
    }
    Status::Succeeded
}
