//! Pipeline workers.
//!
//! A worker repeatedly claims queue items for its work type, runs the
//! matching stage agent with a heartbeat, routes the outcome (proposal →
//! governance, artifact → event), and settles the item. Workers hold no
//! state of their own; a crashed worker's items come back via lease
//! expiry.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::common::{OrchestratorError, OrchestratorResult};
use crate::config::OrchestratorConfig;
use crate::domains::governance::proposal::ProposalState;
use crate::domains::governance::GovernanceEngine;
use crate::kernel::bus::{
    CascadeCompletedPayload, DocumentComposedPayload, EventBus, NewEvent,
    ReflectionComputedPayload, Topic,
};
use crate::kernel::store::SubstrateStore;
use crate::kernel::work::{
    CascadeCoordinator, SubstrateImpact, WorkErrorRecord, WorkItem, WorkQueue, WorkResult,
    WorkType,
};

use super::agents::{AgentDeps, AgentOutcome, AgentRegistry, ArtifactOutcome, StageAgent};

/// Work types that pipeline workers pull from the queue.
const AGENT_WORK_TYPES: [WorkType; 4] =
    [WorkType::P1Substrate, WorkType::P2Graph, WorkType::P3Reflection, WorkType::P4Compose];

pub struct WorkerPool {
    queue: Arc<dyn WorkQueue>,
    bus: Arc<dyn EventBus>,
    store: Arc<dyn SubstrateStore>,
    governance: Arc<GovernanceEngine>,
    registry: Arc<AgentRegistry>,
    agent_deps: AgentDeps,
    config: Arc<OrchestratorConfig>,
}

impl WorkerPool {
    pub fn new(
        queue: Arc<dyn WorkQueue>,
        bus: Arc<dyn EventBus>,
        store: Arc<dyn SubstrateStore>,
        governance: Arc<GovernanceEngine>,
        registry: Arc<AgentRegistry>,
        agent_deps: AgentDeps,
        config: Arc<OrchestratorConfig>,
    ) -> Self {
        Self { queue, bus, store, governance, registry, agent_deps, config }
    }

    /// Spawn the configured worker tasks. Each returns when `shutdown`
    /// fires.
    pub fn spawn(self: Arc<Self>, shutdown: CancellationToken) -> Vec<tokio::task::JoinHandle<()>> {
        let mut handles = Vec::new();
        for work_type in AGENT_WORK_TYPES {
            if work_type == WorkType::P2Graph && !self.config.enable_graph_stage {
                continue;
            }
            for slot in 0..self.config.workers_for(work_type) {
                let pool = Arc::clone(&self);
                let shutdown = shutdown.clone();
                let worker_id = format!("{}-{slot}-{}", work_type, uuid::Uuid::new_v4());
                handles.push(tokio::spawn(async move {
                    pool.run_worker(work_type, worker_id, shutdown).await;
                }));
            }
        }
        handles
    }

    async fn run_worker(&self, work_type: WorkType, worker_id: String, shutdown: CancellationToken) {
        info!(worker_id = %worker_id, work_type = %work_type, "worker started");
        let lease = self.config.lease_for(work_type);

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            let claimed = match self.queue.claim(&[work_type], &worker_id, lease).await {
                Ok(claimed) => claimed,
                Err(err) => {
                    warn!(worker_id = %worker_id, error = %err, "claim failed");
                    None
                }
            };

            match claimed {
                Some(item) => {
                    self.process_item(item, lease, &shutdown).await;
                }
                None => {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.config.worker_poll_interval) => {}
                    }
                }
            }
        }
        info!(worker_id = %worker_id, "worker stopped");
    }

    async fn process_item(&self, item: WorkItem, lease: Duration, shutdown: &CancellationToken) {
        let work_id = item.id;
        debug!(work_id = %work_id, work_type = %item.work_type, attempts = item.attempts,
               "work claimed");

        if let Err(err) = self.queue.mark_processing(work_id).await {
            warn!(work_id = %work_id, error = %err, "could not move item to processing");
            return;
        }

        // Heartbeat for as long as the stage runs.
        let heartbeat_cancel = shutdown.child_token();
        let heartbeat = {
            let queue = Arc::clone(&self.queue);
            let cancel = heartbeat_cancel.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(lease / 3);
                interval.tick().await;
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = interval.tick() => {
                            if let Err(err) = queue.heartbeat(work_id, lease).await {
                                warn!(work_id = %work_id, error = %err, "heartbeat failed");
                            }
                        }
                    }
                }
            })
        };

        let outcome = self.execute(&item).await;
        heartbeat_cancel.cancel();
        let _ = heartbeat.await;

        match outcome {
            Ok(result) => {
                if let Err(err) = self.settle_success(&item, result).await {
                    error!(work_id = %work_id, error = %err, "failed to settle work item");
                }
            }
            Err(err) => {
                let record = WorkErrorRecord::from_error(&err);
                let retryable = err.is_retryable();
                warn!(work_id = %work_id, error = %err, retryable, "work failed");
                if let Err(fail_err) = self.queue.fail(work_id, record, retryable).await {
                    error!(work_id = %work_id, error = %fail_err, "failed to record failure");
                }
            }
        }
    }

    async fn execute(&self, item: &WorkItem) -> OrchestratorResult<WorkResult> {
        let agent = self.registry.agent_for(item.work_type).ok_or_else(|| {
            OrchestratorError::Fatal(format!("no agent handles {}", item.work_type))
        })?;

        let basket_id = item.basket_id.ok_or_else(|| {
            OrchestratorError::Fatal(format!("{} work without basket", item.work_type))
        })?;
        let ctx = self.store.fetch_basket_context(basket_id).await?;

        let outcome = agent.run(item, &ctx, &self.agent_deps).await?;

        match outcome {
            AgentOutcome::Proposal(draft) => {
                let submitted = self.governance.submit(draft, None, Some(item.id)).await?;
                let mut result = WorkResult {
                    proposal_id: Some(submitted.proposal_id),
                    delta_id: submitted.delta_id,
                    substrate_impact: SubstrateImpact {
                        proposals_created: 1,
                        ..Default::default()
                    },
                    ..Default::default()
                };

                match submitted.state {
                    ProposalState::Committed => {
                        if let Some(delta_id) = submitted.delta_id {
                            if let Some(delta) = self.store.fetch_delta(delta_id).await? {
                                result.substrate_impact.blocks_created = delta.blocks_created();
                                result.substrate_impact.context_items_created =
                                    delta.context_items_changed();
                                result.substrate_impact.relationships_mapped =
                                    delta.relationships_changed();
                            }
                        }
                        result.summary = Some("proposal committed".to_string());
                        Ok(result)
                    }
                    ProposalState::Validated => {
                        result.summary = Some("proposal pending review".to_string());
                        Ok(result)
                    }
                    ProposalState::Rejected => {
                        result.summary = Some("proposal rejected by governance".to_string());
                        Ok(result)
                    }
                    ProposalState::Failed => Err(OrchestratorError::Conflict(format!(
                        "proposal {} failed at commit",
                        submitted.proposal_id
                    ))),
                    other => Err(OrchestratorError::Fatal(format!(
                        "submit returned unexpected state {other}"
                    ))),
                }
            }

            AgentOutcome::Artifact(artifact) => {
                let mut result = WorkResult {
                    substrate_impact: SubstrateImpact {
                        artifacts_generated: 1,
                        ..Default::default()
                    },
                    ..Default::default()
                };
                match artifact {
                    ArtifactOutcome::Reflection { reflection_id, kind } => {
                        result.reflection_id = Some(reflection_id);
                        result.summary = Some(format!("{} reflection computed", kind.as_str()));
                        let payload = ReflectionComputedPayload {
                            reflection_id,
                            basket_id,
                            workspace_id: item.workspace_id,
                            kind: kind.as_str().to_string(),
                            work_id: Some(item.id),
                        };
                        self.emit(Topic::ReflectionComputed, &payload, item).await?;
                    }
                    ArtifactOutcome::Document { document_id, references } => {
                        result.document_id = Some(document_id);
                        result.summary = Some("document composed".to_string());
                        let payload = DocumentComposedPayload {
                            document_id,
                            basket_id,
                            workspace_id: item.workspace_id,
                            references,
                        };
                        self.emit(Topic::DocumentComposed, &payload, item).await?;
                    }
                }
                Ok(result)
            }

            AgentOutcome::Nothing { reason } => {
                Ok(WorkResult { summary: Some(reason), ..Default::default() })
            }
        }
    }

    async fn settle_success(&self, item: &WorkItem, result: WorkResult) -> OrchestratorResult<()> {
        // Explicit next stages enqueue before completion so the cascade is
        // visible the moment the parent is terminal.
        if item.cascade().next_stage.is_some() {
            self.queue.mark_cascading(item.id).await?;
            let coordinator = CascadeCoordinator::new(Arc::clone(&self.queue));
            if let Some(child) = coordinator.enqueue_next(item).await? {
                debug!(work_id = %item.id, child = %child.id, "cascade stage enqueued");
            }
        }

        self.queue.complete(item.id, result).await?;
        self.signal_cascade_if_done(item.id).await;
        Ok(())
    }

    /// Emit `work.cascade_completed` when every item in this cascade tree
    /// is terminal. At-least-once: a stage enqueued later re-signals when
    /// it finishes.
    async fn signal_cascade_if_done(&self, work_id: crate::common::WorkId) {
        let result: OrchestratorResult<()> = async {
            let Some(mut root) = self.queue.get(work_id).await? else { return Ok(()) };
            while let Some(parent_id) = root.parent_work_id {
                match self.queue.get(parent_id).await? {
                    Some(parent) => root = parent,
                    None => break,
                }
            }

            let coordinator = CascadeCoordinator::new(Arc::clone(&self.queue));
            let descendants = coordinator.descendants(root.id).await?;
            if descendants.is_empty() {
                return Ok(());
            }
            let all_terminal =
                root.state.is_terminal() && descendants.iter().all(|d| d.state.is_terminal());
            if !all_terminal {
                return Ok(());
            }

            let flow = CascadeCoordinator::flow(&root, &descendants);
            let payload = CascadeCompletedPayload {
                root_work_id: root.id,
                basket_id: root.basket_id,
                workspace_id: root.workspace_id,
                completed_stages: flow.completed_stages,
            };
            self.emit(Topic::WorkCascadeCompleted, &payload, &root).await
        }
        .await;

        if let Err(err) = result {
            warn!(work_id = %work_id, error = %err, "cascade completion signal failed");
        }
    }

    async fn emit<P: serde::Serialize>(
        &self,
        topic: Topic,
        payload: &P,
        item: &WorkItem,
    ) -> OrchestratorResult<()> {
        let event = NewEvent::new(topic, payload)?
            .scoped(item.workspace_id, item.basket_id)
            .from_origin(format!("work:{}", item.work_type));
        self.bus.emit(event).await?;
        Ok(())
    }
}
