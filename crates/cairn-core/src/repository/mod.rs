//! Repository trait definitions (ports).
//!
//! These traits define the storage interface that the infrastructure layer
//! (cairn-infra) implements. The core crate never depends on any specific
//! storage technology. Every status write goes through a conditional update
//! described by a [`Transition`](crate::execution::transition::Transition).

pub mod backend;
pub mod graph;
pub mod lock;
pub mod metadata;
pub mod node_execution;
pub mod plan_execution;
pub mod wait;

use std::pin::Pin;

use cairn_types::error::RepositoryError;
use futures_util::Stream;

pub use backend::Backend;

/// Lazy, finite result of a filtered scan. Re-issue the call to restart it.
pub type RepositoryStream<'a, T> =
    Pin<Box<dyn Stream<Item = Result<T, RepositoryError>> + Send + 'a>>;
