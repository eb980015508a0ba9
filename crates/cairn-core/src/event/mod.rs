//! Status-change event bus.
//!
//! Observers are registered once at startup and invoked after every committed
//! plan status change (and before plan executions are physically deleted).

pub mod bus;

pub use bus::{
    ObserverFuture, PlanExecutionDeleteObserver, PlanStatusObserver, StatusEventBus,
    StatusEventBusBuilder,
};
