//! SQLite `Backend`: one repository per table over a shared pool.

use cairn_core::repository::Backend;

use super::graph::SqlitePlanGraphRepository;
use super::lease::SqliteLockProvider;
use super::metadata::SqlitePlanMetadataRepository;
use super::node_execution::SqliteNodeExecutionRepository;
use super::plan_execution::SqlitePlanExecutionRepository;
use super::pool::DatabasePool;
use super::wait::SqliteWaitRepository;

pub struct SqliteBackend {
    plans: SqlitePlanExecutionRepository,
    nodes: SqliteNodeExecutionRepository,
    metadata: SqlitePlanMetadataRepository,
    graphs: SqlitePlanGraphRepository,
    waits: SqliteWaitRepository,
    locks: SqliteLockProvider,
}

impl SqliteBackend {
    pub fn new(pool: DatabasePool) -> Self {
        Self {
            plans: SqlitePlanExecutionRepository::new(pool.clone()),
            nodes: SqliteNodeExecutionRepository::new(pool.clone()),
            metadata: SqlitePlanMetadataRepository::new(pool.clone()),
            graphs: SqlitePlanGraphRepository::new(pool.clone()),
            waits: SqliteWaitRepository::new(pool.clone()),
            locks: SqliteLockProvider::new(pool),
        }
    }

    /// Open (and migrate) the database at `database_url`.
    pub async fn connect(database_url: &str) -> Result<Self, sqlx::Error> {
        Ok(Self::new(DatabasePool::new(database_url).await?))
    }
}

impl Backend for SqliteBackend {
    type Plans = SqlitePlanExecutionRepository;
    type Nodes = SqliteNodeExecutionRepository;
    type Metadata = SqlitePlanMetadataRepository;
    type Graphs = SqlitePlanGraphRepository;
    type Waits = SqliteWaitRepository;
    type Locks = SqliteLockProvider;

    fn plans(&self) -> &Self::Plans {
        &self.plans
    }

    fn nodes(&self) -> &Self::Nodes {
        &self.nodes
    }

    fn metadata(&self) -> &Self::Metadata {
        &self.metadata
    }

    fn graphs(&self) -> &Self::Graphs {
        &self.graphs
    }

    fn waits(&self) -> &Self::Waits {
        &self.waits
    }

    fn locks(&self) -> &Self::Locks {
        &self.locks
    }
}
