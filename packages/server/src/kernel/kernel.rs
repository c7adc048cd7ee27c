// Kernel - core infrastructure with all dependencies
//
// The Kernel holds every injected capability (store, bus, queue, reasoner,
// embedder, tools) behind traits for testability. No process-wide
// singletons; construction wires everything explicitly.

use std::sync::Arc;

use sqlx::PgPool;

use crate::config::OrchestratorConfig;

use super::bus::{EventBus, MemoryEventBus, PostgresEventBus};
use super::store::{MemorySubstrateStore, PostgresSubstrateStore, SubstrateStore};
use super::traits::{Embedder, NoTools, Reasoner, ToolProvider};
use super::work::{MemoryWorkQueue, PostgresWorkQueue, WorkQueue};

pub struct Kernel {
    pub store: Arc<dyn SubstrateStore>,
    pub bus: Arc<dyn EventBus>,
    pub queue: Arc<dyn WorkQueue>,
    pub reasoner: Arc<dyn Reasoner>,
    pub embedder: Arc<dyn Embedder>,
    pub tools: Arc<dyn ToolProvider>,
    pub config: Arc<OrchestratorConfig>,
}

impl Kernel {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn SubstrateStore>,
        bus: Arc<dyn EventBus>,
        queue: Arc<dyn WorkQueue>,
        reasoner: Arc<dyn Reasoner>,
        embedder: Arc<dyn Embedder>,
        tools: Arc<dyn ToolProvider>,
        config: Arc<OrchestratorConfig>,
    ) -> Self {
        Self { store, bus, queue, reasoner, embedder, tools, config }
    }

    /// Durable kernel over a Postgres pool.
    pub fn postgres(
        pool: PgPool,
        reasoner: Arc<dyn Reasoner>,
        embedder: Arc<dyn Embedder>,
        tools: Arc<dyn ToolProvider>,
        config: OrchestratorConfig,
    ) -> Self {
        let config = Arc::new(config);
        Self {
            store: Arc::new(PostgresSubstrateStore::new(pool.clone())),
            bus: Arc::new(PostgresEventBus::new(pool.clone())),
            queue: Arc::new(PostgresWorkQueue::new(pool, &config)),
            reasoner,
            embedder,
            tools,
            config,
        }
    }

    /// In-memory kernel for tests and single-process experiments.
    pub fn in_memory(
        reasoner: Arc<dyn Reasoner>,
        embedder: Arc<dyn Embedder>,
        config: OrchestratorConfig,
    ) -> Self {
        let config = Arc::new(config);
        Self {
            store: Arc::new(MemorySubstrateStore::new()),
            bus: Arc::new(MemoryEventBus::new()),
            queue: Arc::new(MemoryWorkQueue::new(&config)),
            reasoner,
            embedder,
            tools: Arc::new(NoTools),
            config,
        }
    }
}
