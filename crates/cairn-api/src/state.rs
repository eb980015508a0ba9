//! Application state wiring the engine together.
//!
//! AppState pins the generic engine services to the SQLite backend and
//! hands them to the CLI command handlers.

use std::sync::Arc;

use cairn_core::event::StatusEventBus;
use cairn_core::execution::Orchestrator;
use cairn_core::execution::step::StepRegistry;
use cairn_core::retry::RetryPolicy;
use cairn_core::service::reconcile::Reconciler;
use cairn_core::service::retention::{MetadataCleanupObserver, RetentionService};
use cairn_infra::SqliteBackend;
use cairn_infra::config::{load_engine_config, resolve_data_dir, resolve_database_url};
use cairn_types::config::EngineConfig;

pub type Engine = Orchestrator<SqliteBackend>;

/// Shared state for every command.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
    pub retention: Arc<RetentionService<SqliteBackend>>,
    pub reconciler: Arc<Reconciler<SqliteBackend>>,
    pub config: EngineConfig,
}

impl AppState {
    /// Load config, connect to the database and wire the engine.
    pub async fn init() -> anyhow::Result<Self> {
        let data_dir = resolve_data_dir();
        tokio::fs::create_dir_all(&data_dir).await?;

        let config = load_engine_config(&data_dir).await;
        let database_url = resolve_database_url(&config, &data_dir);
        let backend = Arc::new(SqliteBackend::connect(&database_url).await?);
        tracing::debug!(database_url = %database_url, "database ready");

        let retry = RetryPolicy::from_config(&config.retry);
        let builder =
            Orchestrator::builder(backend.clone(), config.clone()).steps(StepRegistry::with_builtins());
        let bus = StatusEventBus::builder(config.events.channel_capacity)
            .with_delete_observer(Arc::new(MetadataCleanupObserver::new(
                backend.clone(),
                retry,
            )))
            .with_delete_observer(Arc::new(builder.cache_evictor()))
            .build();

        let engine = builder.bus(bus.clone()).build();
        let retention = RetentionService::new(
            backend.clone(),
            bus,
            retry,
            config.retention.purge_batch_size,
        );
        let reconciler = Reconciler::new(backend, engine.plans().clone());

        Ok(Self {
            engine,
            retention: Arc::new(retention),
            reconciler: Arc::new(reconciler),
            config,
        })
    }
}
