//! Observer fan-out plus a broadcast channel for plan status events.
//!
//! Observers run in registration order. A failing observer is logged and
//! skipped; it never fails the status write that triggered it or blocks the
//! observers after it. Live subscribers (CLI watchers, `await_plan`) receive
//! every event through a `tokio::sync::broadcast` channel; publishing with no
//! subscribers is a no-op.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::broadcast;
use uuid::Uuid;

use cairn_types::event::PlanStatusEvent;

pub type ObserverFuture<'a> = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + 'a>>;

/// Reacts to committed plan status changes.
pub trait PlanStatusObserver: Send + Sync {
    fn name(&self) -> &str;

    fn on_status_changed<'a>(&'a self, event: &'a PlanStatusEvent) -> ObserverFuture<'a>;
}

/// Reacts to plan executions about to be physically deleted.
pub trait PlanExecutionDeleteObserver: Send + Sync {
    fn name(&self) -> &str;

    fn on_plans_deleted<'a>(&'a self, plan_execution_ids: &'a [Uuid]) -> ObserverFuture<'a>;
}

struct Inner {
    status_observers: Vec<Arc<dyn PlanStatusObserver>>,
    delete_observers: Vec<Arc<dyn PlanExecutionDeleteObserver>>,
    sender: broadcast::Sender<PlanStatusEvent>,
}

/// Cheap to clone; clones share observers and the broadcast channel.
#[derive(Clone)]
pub struct StatusEventBus {
    inner: Arc<Inner>,
}

impl StatusEventBus {
    pub fn builder(capacity: usize) -> StatusEventBusBuilder {
        StatusEventBusBuilder {
            capacity,
            status_observers: Vec::new(),
            delete_observers: Vec::new(),
        }
    }

    /// Bus without observers.
    pub fn new(capacity: usize) -> Self {
        Self::builder(capacity).build()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PlanStatusEvent> {
        self.inner.sender.subscribe()
    }

    pub async fn fire_status(&self, event: &PlanStatusEvent) {
        for observer in &self.inner.status_observers {
            if let Err(e) = observer.on_status_changed(event).await {
                tracing::warn!(
                    observer = observer.name(),
                    plan_execution_id = %event.plan_execution_id,
                    status = %event.status,
                    error = %e,
                    "status observer failed"
                );
            }
        }
        let _ = self.inner.sender.send(event.clone());
    }

    pub async fn fire_deleted(&self, plan_execution_ids: &[Uuid]) {
        if plan_execution_ids.is_empty() {
            return;
        }
        for observer in &self.inner.delete_observers {
            if let Err(e) = observer.on_plans_deleted(plan_execution_ids).await {
                tracing::warn!(
                    observer = observer.name(),
                    count = plan_execution_ids.len(),
                    error = %e,
                    "delete observer failed"
                );
            }
        }
    }
}

impl std::fmt::Debug for StatusEventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatusEventBus")
            .field("status_observers", &self.inner.status_observers.len())
            .field("delete_observers", &self.inner.delete_observers.len())
            .field("receiver_count", &self.inner.sender.receiver_count())
            .finish()
    }
}

pub struct StatusEventBusBuilder {
    capacity: usize,
    status_observers: Vec<Arc<dyn PlanStatusObserver>>,
    delete_observers: Vec<Arc<dyn PlanExecutionDeleteObserver>>,
}

impl StatusEventBusBuilder {
    pub fn with_status_observer(mut self, observer: Arc<dyn PlanStatusObserver>) -> Self {
        self.status_observers.push(observer);
        self
    }

    pub fn with_delete_observer(mut self, observer: Arc<dyn PlanExecutionDeleteObserver>) -> Self {
        self.delete_observers.push(observer);
        self
    }

    pub fn build(self) -> StatusEventBus {
        let (sender, _) = broadcast::channel(self.capacity.max(1));
        StatusEventBus {
            inner: Arc::new(Inner {
                status_observers: self.status_observers,
                delete_observers: self.delete_observers,
                sender,
            }),
        }
    }
}
