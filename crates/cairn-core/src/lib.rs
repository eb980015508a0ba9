//! Engine logic and repository trait definitions for cairn.
//!
//! This crate defines the ports (repository traits) that the infrastructure
//! layer implements, plus everything that runs on top of them. It depends
//! only on `cairn-types`, never on `cairn-infra` or any database crate.

pub mod event;
pub mod execution;
pub mod notify;
pub mod repository;
pub mod retry;
pub mod service;
