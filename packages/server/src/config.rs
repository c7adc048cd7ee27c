//! Configuration.
//!
//! `Config` is what the binary loads from the environment. All orchestrator
//! tunables live in `OrchestratorConfig`, a plain value struct passed in at
//! construction; nothing in the core reads the environment or global state.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use dotenvy::dotenv;
use std::env;

use crate::domains::governance::policy::PolicyTable;
use crate::kernel::work::WorkType;

/// Process configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        Ok(Self {
            database_url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
        })
    }
}

/// All orchestrator tunables in one place.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Worker tasks per work type.
    pub worker_count: HashMap<WorkType, usize>,
    /// Claim lease per work type; `default_lease` covers the rest.
    pub lease_duration: HashMap<WorkType, Duration>,
    pub default_lease: Duration,
    /// Total attempts before a retryable failure becomes terminal.
    pub retry_cap: i32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// Coalescing window per work type for debounced stages.
    pub debounce_window: HashMap<WorkType, Duration>,
    /// Max concurrently held items per workspace.
    pub workspace_concurrency_cap: usize,
    /// Cosine similarity at or above which a CreateBlock is a near-duplicate.
    pub dedup_similarity_threshold: f32,
    /// Blocks whose `last_validated_at` is older than this are stale.
    pub staleness_threshold: Duration,
    /// Whether P2 relationship inference runs as part of the cascade.
    pub enable_graph_stage: bool,
    /// Whether `reflection.computed` schedules document recomposition.
    pub enable_compose_on_reflection: bool,
    /// How often the bus sweeper re-notifies undelivered events, and how old
    /// an undelivered event must be before it is swept.
    pub bus_sweep_interval: Duration,
    pub bus_sweep_threshold: Duration,
    /// How often expired leases are reaped.
    pub reap_interval: Duration,
    /// Idle delay between claim attempts when the queue is empty.
    pub worker_poll_interval: Duration,
    /// A cascade with no descendant progress for this long is orphaned.
    pub orphan_cascade_timeout: Duration,
    /// Default governance policy, merged with per-basket overrides.
    pub policy: PolicyTable,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        let mut worker_count = HashMap::new();
        worker_count.insert(WorkType::P1Substrate, 2);
        worker_count.insert(WorkType::P2Graph, 1);
        worker_count.insert(WorkType::P3Reflection, 1);
        worker_count.insert(WorkType::P4Compose, 1);

        let mut lease_duration = HashMap::new();
        lease_duration.insert(WorkType::P1Substrate, Duration::from_secs(300));
        lease_duration.insert(WorkType::P4Compose, Duration::from_secs(600));

        let mut debounce_window = HashMap::new();
        debounce_window.insert(WorkType::P3Reflection, Duration::from_secs(30));
        debounce_window.insert(WorkType::P4Compose, Duration::from_secs(30));

        Self {
            worker_count,
            lease_duration,
            default_lease: Duration::from_secs(300),
            retry_cap: 5,
            backoff_base: Duration::from_secs(2),
            backoff_max: Duration::from_secs(300),
            debounce_window,
            workspace_concurrency_cap: 4,
            dedup_similarity_threshold: 0.88,
            staleness_threshold: Duration::from_secs(14 * 24 * 3600),
            enable_graph_stage: false,
            enable_compose_on_reflection: false,
            bus_sweep_interval: Duration::from_secs(30),
            bus_sweep_threshold: Duration::from_secs(60),
            reap_interval: Duration::from_secs(10),
            worker_poll_interval: Duration::from_millis(500),
            orphan_cascade_timeout: Duration::from_secs(600),
            policy: PolicyTable::default(),
        }
    }
}

impl OrchestratorConfig {
    pub fn lease_for(&self, work_type: WorkType) -> Duration {
        self.lease_duration
            .get(&work_type)
            .copied()
            .unwrap_or(self.default_lease)
    }

    pub fn workers_for(&self, work_type: WorkType) -> usize {
        self.worker_count.get(&work_type).copied().unwrap_or(1)
    }

    pub fn debounce_for(&self, work_type: WorkType) -> Option<Duration> {
        self.debounce_window.get(&work_type).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_work_type_falls_back_to_default_lease() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.lease_for(WorkType::ManualEdit), config.default_lease);
    }

    #[test]
    fn p3_is_debounced_by_default() {
        let config = OrchestratorConfig::default();
        assert!(config.debounce_for(WorkType::P3Reflection).is_some());
        assert!(config.debounce_for(WorkType::P1Substrate).is_none());
    }
}
