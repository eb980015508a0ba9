//! Notify engine backed by a durable [`WaitRepository`].
//!
//! The repository decides who wins: `mark_delivered` admits exactly one
//! payload per id and `mark_consumed` hands it out exactly once. The
//! in-process map only routes a consumed payload to the task that is
//! currently waiting for it.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::oneshot;
use uuid::Uuid;

use cairn_types::error::RepositoryError;
use cairn_types::notify::{NotifyPayload, WaitState};

use crate::repository::Backend;
use crate::repository::wait::WaitRepository;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("correlation id '{0}' was already consumed")]
    AlreadyConsumed(String),

    #[error("wait on '{0}' was cancelled")]
    Cancelled(String),

    #[error("timed out waiting on '{0}'")]
    Timeout(String),

    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

/// What happened to a delivered payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Handed to a waiter in this process.
    Resumed,
    /// Stored. The next registration of the id picks it up.
    Parked,
    /// A payload was already delivered for this id. Ignored.
    Duplicate,
}

/// Correlation id a caller waits on for the final status of a plan.
pub fn plan_callback_id(plan_execution_id: &Uuid) -> String {
    format!("callback:{plan_execution_id}")
}

/// Handle returned by [`NotifyEngine::register`].
#[derive(Debug)]
pub enum WaitHandle {
    /// The payload had already arrived.
    Ready(NotifyPayload),
    Pending {
        correlation_id: String,
        receiver: oneshot::Receiver<NotifyPayload>,
    },
}

impl WaitHandle {
    pub fn is_ready(&self) -> bool {
        matches!(self, WaitHandle::Ready(_))
    }

    pub async fn wait(self) -> Result<NotifyPayload, NotifyError> {
        match self {
            WaitHandle::Ready(payload) => Ok(payload),
            WaitHandle::Pending {
                correlation_id,
                receiver,
            } => receiver
                .await
                .map_err(|_| NotifyError::Cancelled(correlation_id)),
        }
    }

    pub async fn wait_timeout(self, timeout: Duration) -> Result<NotifyPayload, NotifyError> {
        let correlation_id = match &self {
            WaitHandle::Ready(_) => String::new(),
            WaitHandle::Pending { correlation_id, .. } => correlation_id.clone(),
        };
        tokio::time::timeout(timeout, self.wait())
            .await
            .map_err(|_| NotifyError::Timeout(correlation_id))?
    }
}

/// A route to an in-process waiter, tagged with its registration.
type Route = (u64, oneshot::Sender<NotifyPayload>);

pub struct NotifyEngine<B: Backend> {
    backend: Arc<B>,
    waiters: DashMap<String, Route>,
    next_token: AtomicU64,
}

impl<B: Backend> NotifyEngine<B> {
    pub fn new(backend: Arc<B>) -> Self {
        Self {
            backend,
            waiters: DashMap::new(),
            next_token: AtomicU64::new(0),
        }
    }

    /// Register interest in `correlation_id`.
    ///
    /// If a payload was delivered before this call the handle is ready at
    /// once. A later registration of the same id replaces the earlier waiter,
    /// whose handle then resolves to [`NotifyError::Cancelled`].
    pub async fn register(&self, correlation_id: &str) -> Result<WaitHandle, NotifyError> {
        let (tx, rx) = oneshot::channel();
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        // Install the route first so a concurrent delivery can find it.
        self.waiters.insert(correlation_id.to_string(), (token, tx));

        let record = match self.backend.waits().insert_waiting(correlation_id).await {
            Ok(record) => record,
            Err(e) => {
                self.drop_route(correlation_id, token);
                return Err(e.into());
            }
        };

        match record.state {
            WaitState::Waiting => Ok(pending(correlation_id, rx)),
            WaitState::Delivered => {
                match self.backend.waits().mark_consumed(correlation_id).await? {
                    Some(payload) => {
                        self.drop_route(correlation_id, token);
                        tracing::debug!(correlation_id, "payload was waiting, resuming at once");
                        Ok(WaitHandle::Ready(payload))
                    }
                    // Consumed by a concurrent delivery through our route.
                    None => Ok(pending(correlation_id, rx)),
                }
            }
            WaitState::Consumed => {
                if self.drop_route(correlation_id, token) {
                    Err(NotifyError::AlreadyConsumed(correlation_id.to_string()))
                } else {
                    // A delivery took our route between insert and lookup; the
                    // payload is on its way through `rx`.
                    Ok(pending(correlation_id, rx))
                }
            }
        }
    }

    /// Deliver `payload` for `correlation_id`. The first delivery wins.
    pub async fn deliver(
        &self,
        correlation_id: &str,
        payload: NotifyPayload,
    ) -> Result<Delivery, NotifyError> {
        if !self.backend.waits().mark_delivered(correlation_id, &payload).await? {
            tracing::warn!(correlation_id, "duplicate delivery ignored");
            return Ok(Delivery::Duplicate);
        }

        let Some((_, (_, tx))) = self.waiters.remove(correlation_id) else {
            tracing::debug!(correlation_id, "no local waiter, payload parked");
            return Ok(Delivery::Parked);
        };
        if tx.is_closed() {
            tracing::debug!(correlation_id, "waiter gone, payload parked");
            return Ok(Delivery::Parked);
        }

        match self.backend.waits().mark_consumed(correlation_id).await? {
            Some(payload) => {
                if tx.send(payload).is_err() {
                    tracing::warn!(correlation_id, "waiter dropped after consume, payload lost");
                    return Ok(Delivery::Parked);
                }
                Ok(Delivery::Resumed)
            }
            None => Ok(Delivery::Parked),
        }
    }

    /// Drop the in-process waiter for `correlation_id`, if any.
    ///
    /// The durable record stays; a later delivery is parked.
    pub fn cancel(&self, correlation_id: &str) -> bool {
        self.waiters.remove(correlation_id).is_some()
    }

    /// Remove the route only if it still belongs to registration `token`.
    fn drop_route(&self, correlation_id: &str, token: u64) -> bool {
        self.waiters
            .remove_if(correlation_id, |_, (owner, _)| *owner == token)
            .is_some()
    }
}

fn pending(correlation_id: &str, receiver: oneshot::Receiver<NotifyPayload>) -> WaitHandle {
    WaitHandle::Pending {
        correlation_id: correlation_id.to_string(),
        receiver,
    }
}

impl<B: Backend> std::fmt::Debug for NotifyEngine<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotifyEngine")
            .field("pending", &self.waiters.len())
            .finish()
    }
}
