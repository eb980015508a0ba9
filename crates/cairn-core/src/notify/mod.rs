//! Correlation-id based wait/notify.
//!
//! A waiter registers a correlation id and gets a handle; a producer delivers
//! a payload for that id. Registration and delivery may happen in either
//! order, across tasks and across process restarts. The first delivery wins.

pub mod engine;

pub use engine::{Delivery, NotifyEngine, NotifyError, WaitHandle, plan_callback_id};
