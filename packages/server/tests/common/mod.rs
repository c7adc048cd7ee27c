//! Shared test harness: an in-memory kernel with concrete store/bus/queue
//! handles kept around for inspection, plus a scripted reasoner.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use server_core::domains::baskets::{Basket, Workspace};
use server_core::kernel::bus::MemoryEventBus;
use server_core::kernel::store::{MemorySubstrateStore, SubstrateStore};
use server_core::kernel::work::MemoryWorkQueue;
use server_core::kernel::{Kernel, NoTools};
use server_core::testing::{MockEmbedder, MockReasoner};
use server_core::{Orchestrator, OrchestratorConfig};

pub struct Harness {
    pub store: MemorySubstrateStore,
    pub bus: MemoryEventBus,
    pub queue: MemoryWorkQueue,
    pub reasoner: Arc<MockReasoner>,
    pub orchestrator: Orchestrator,
}

/// Config tuned for fast tests: quick polling, tiny sweep intervals, no
/// debounce hold-back.
pub fn test_config() -> OrchestratorConfig {
    let mut config = OrchestratorConfig {
        worker_poll_interval: Duration::from_millis(20),
        reap_interval: Duration::from_millis(50),
        bus_sweep_interval: Duration::from_millis(200),
        bus_sweep_threshold: Duration::ZERO,
        backoff_base: Duration::from_millis(100),
        ..OrchestratorConfig::default()
    };
    for window in config.debounce_window.values_mut() {
        *window = Duration::ZERO;
    }
    config
}

pub fn harness_with(config: OrchestratorConfig) -> Harness {
    let config = Arc::new(config);
    let store = MemorySubstrateStore::new();
    let bus = MemoryEventBus::new();
    let queue = MemoryWorkQueue::new(&config);
    let reasoner = Arc::new(MockReasoner::new());

    let kernel = Arc::new(Kernel::new(
        Arc::new(store.clone()),
        Arc::new(bus.clone()),
        Arc::new(queue.clone()),
        reasoner.clone(),
        Arc::new(MockEmbedder::new()),
        Arc::new(NoTools),
        config,
    ));

    Harness { store, bus, queue, reasoner, orchestrator: Orchestrator::new(kernel) }
}

pub fn harness() -> Harness {
    harness_with(test_config())
}

impl Harness {
    pub async fn seed_basket(&self) -> (Workspace, Basket) {
        let workspace = self.store.create_workspace("owner@example.com").await.unwrap();
        let basket = self.store.create_basket(workspace.id).await.unwrap();
        (workspace, basket)
    }
}

/// Poll until `cond` returns true or the timeout elapses.
pub async fn wait_until<F: FnMut() -> bool>(timeout: Duration, mut cond: F) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if cond() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// A P1 extraction response with one confident goal block and one tag.
pub fn goal_extraction_json() -> &'static str {
    r#"{
        "blocks": [
            {
                "title": "Reduce MTTR",
                "semantic_type": "goal",
                "content": "Reduce mean time to recovery below 10 minutes.",
                "confidence": 0.9
            }
        ],
        "context_items": [
            {"item_type": "tag", "label": "reliability"}
        ]
    }"#
}
