//! Durable wait records and the payloads delivered to waiters.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::node::{AdviserResponse, StepResponse};
use crate::status::Status;

/// Lifecycle of a correlation id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitState {
    /// Registered, nothing delivered yet.
    Waiting,
    /// A payload arrived and has not been handed to a waiter.
    Delivered,
    /// The payload was handed to a waiter. Further deliveries are ignored.
    Consumed,
}

/// Payload handed to whoever waits on a correlation id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NotifyPayload {
    /// Result of an externally executed step.
    StepResult(StepResponse),
    /// A child node (or the tail of a child chain) finished.
    NodeFinished {
        node_execution_id: Uuid,
        status: Status,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        adviser_response: Option<AdviserResponse>,
        end_ts: DateTime<Utc>,
    },
    /// The plan reached a final status.
    PlanFinished { plan_execution_id: Uuid, status: Status },
    /// The wait was abandoned because the plan was aborted.
    Aborted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaitRecord {
    pub correlation_id: String,
    pub state: WaitState,
    pub payload: Option<NotifyPayload>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_is_tagged() {
        let payload = NotifyPayload::PlanFinished {
            plan_execution_id: Uuid::nil(),
            status: Status::Failed,
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["type"], "plan_finished");
        assert_eq!(json["status"], "failed");
        let back: NotifyPayload = serde_json::from_value(json).unwrap();
        assert_eq!(back, payload);
    }
}
