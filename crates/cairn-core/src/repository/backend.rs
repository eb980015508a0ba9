//! Bundle of every port the engine needs from a storage technology.

use super::graph::PlanGraphRepository;
use super::lock::LockProvider;
use super::metadata::PlanMetadataRepository;
use super::node_execution::NodeExecutionRepository;
use super::plan_execution::PlanExecutionRepository;
use super::wait::WaitRepository;

/// A complete storage backend.
///
/// Services are generic over `B: Backend` instead of one parameter per
/// repository. A backend may implement several ports with one type (the
/// in-memory backend) or compose separate repositories (SQLite).
pub trait Backend: Send + Sync + 'static {
    type Plans: PlanExecutionRepository;
    type Nodes: NodeExecutionRepository;
    type Metadata: PlanMetadataRepository;
    type Graphs: PlanGraphRepository;
    type Waits: WaitRepository;
    type Locks: LockProvider;

    fn plans(&self) -> &Self::Plans;
    fn nodes(&self) -> &Self::Nodes;
    fn metadata(&self) -> &Self::Metadata;
    fn graphs(&self) -> &Self::Graphs;
    fn waits(&self) -> &Self::Waits;
    fn locks(&self) -> &Self::Locks;
}
