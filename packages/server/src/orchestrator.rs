//! Orchestrator facade.
//!
//! The external actor surface: capture, proposal submission and decisions,
//! block lifecycle actions, work status, and event subscription. Also owns
//! the background service tasks (dispatcher, workers, lease reaper, bus
//! sweeper).

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use typed_builder::TypedBuilder;

use crate::common::{
    BasketId, BlockId, DeltaId, DocumentId, DumpId, OrchestratorError, OrchestratorResult,
    ProposalId, WorkId, WorkspaceId,
};
use crate::domains::baskets::BasketContext;
use crate::domains::dumps::NewDump;
use crate::domains::governance::delta::{Delta, DeltaChange};
use crate::domains::governance::proposal::{
    Decision, DecisionActor, ProposalDraft, ProposalState, SubmitOutcome,
};
use crate::domains::governance::GovernanceEngine;
use crate::domains::pipeline::{AgentDeps, AgentRegistry, PipelineDispatcher, WorkerPool};
use crate::domains::substrate::{Block, BlockState};
use crate::kernel::bus::{
    ComposeRequestPayload, DumpCreatedPayload, EventBus, EventStream, NewEvent, Topic,
};
use crate::kernel::store::SubstrateStore;
use crate::kernel::work::{
    build_status, CascadeCoordinator, QueueHealth, WorkQueue, WorkStatusView,
};
use crate::kernel::Kernel;

// ============================================================================
// Request/response shapes
// ============================================================================

#[derive(Debug, Clone, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct CaptureRequest {
    pub workspace_id: WorkspaceId,
    pub basket_id: BasketId,
    pub body: String,
    #[builder(default = serde_json::Value::Null)]
    pub source_meta: serde_json::Value,
    pub request_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureReceipt {
    pub dump_id: DumpId,
    pub delta_id: DeltaId,
}

// ============================================================================
// Facade
// ============================================================================

pub struct Orchestrator {
    kernel: Arc<Kernel>,
    governance: Arc<GovernanceEngine>,
    registry: Arc<AgentRegistry>,
}

impl Orchestrator {
    pub fn new(kernel: Arc<Kernel>) -> Self {
        let governance = Arc::new(GovernanceEngine::new(
            Arc::clone(&kernel.store),
            Arc::clone(&kernel.bus),
            Arc::clone(&kernel.queue),
            Arc::clone(&kernel.embedder),
            Arc::clone(&kernel.config),
        ));
        Self { kernel, governance, registry: Arc::new(AgentRegistry::new()) }
    }

    pub fn kernel(&self) -> &Arc<Kernel> {
        &self.kernel
    }

    pub fn governance(&self) -> &Arc<GovernanceEngine> {
        &self.governance
    }

    /// P0 capture: write the immutable dump, record the capture delta, and
    /// emit `dump.created`. Never interprets content. Idempotent on
    /// `request_id`.
    pub async fn capture_dump(&self, req: CaptureRequest) -> OrchestratorResult<CaptureReceipt> {
        let store = &self.kernel.store;

        if !store.claim_request(&req.request_id).await? {
            let binding = store.lookup_request(&req.request_id).await?.ok_or_else(|| {
                OrchestratorError::Transient(format!(
                    "request {} is still in flight",
                    req.request_id
                ))
            })?;
            let delta_id = binding.delta_id.ok_or_else(|| {
                OrchestratorError::Transient(format!(
                    "request {} is still in flight",
                    req.request_id
                ))
            })?;
            let delta = store.fetch_delta(delta_id).await?.ok_or_else(|| {
                OrchestratorError::Fatal(format!("delta {delta_id} missing for replay"))
            })?;
            let dump_id = delta.dump_id().ok_or_else(|| {
                OrchestratorError::Fatal(format!("delta {delta_id} carries no dump"))
            })?;
            info!(request_id = %req.request_id, dump_id = %dump_id, "capture replayed");
            return Ok(CaptureReceipt { dump_id, delta_id });
        }

        let basket = store
            .fetch_basket(req.basket_id)
            .await?
            .ok_or_else(|| {
                OrchestratorError::Validation(format!("basket {} does not exist", req.basket_id))
            })?;
        if basket.workspace_id != req.workspace_id {
            return Err(OrchestratorError::Validation(format!(
                "basket {} does not belong to workspace {}",
                req.basket_id, req.workspace_id
            )));
        }
        if !basket.accepts_writes() {
            return Err(OrchestratorError::Validation(format!(
                "basket {} is archived",
                req.basket_id
            )));
        }

        let dump = store
            .insert_dump(
                NewDump::builder()
                    .basket_id(req.basket_id)
                    .workspace_id(req.workspace_id)
                    .body_text(req.body)
                    .source_meta(req.source_meta)
                    .ingest_trace_id(req.request_id.clone())
                    .build(),
            )
            .await?;

        let delta = Delta::new(
            req.basket_id,
            None,
            "dump captured",
            vec![DeltaChange::DumpCreated { dump_id: dump.id }],
        );
        store.insert_delta(&delta).await?;
        store.bind_request(&req.request_id, None, Some(delta.delta_id)).await?;

        // Durable insert failure here must surface to the caller; delivery
        // failures past the insert are the sweeper's job.
        let payload = DumpCreatedPayload {
            dump_id: dump.id,
            basket_id: req.basket_id,
            workspace_id: req.workspace_id,
        };
        self.kernel
            .bus
            .emit(
                NewEvent::new(Topic::DumpCreated, &payload)?
                    .scoped(req.workspace_id, Some(req.basket_id))
                    .from_origin("capture"),
            )
            .await?;

        info!(dump_id = %dump.id, basket_id = %req.basket_id, "dump captured");
        Ok(CaptureReceipt { dump_id: dump.id, delta_id: delta.delta_id })
    }

    /// Submit a proposal draft through governance (human or service path).
    pub async fn submit_proposal(
        &self,
        draft: ProposalDraft,
        request_id: &str,
    ) -> OrchestratorResult<SubmitOutcome> {
        self.governance.submit(draft, Some(request_id), None).await
    }

    /// Decide a proposal that is pending review.
    pub async fn decide_proposal(
        &self,
        proposal_id: ProposalId,
        decision: Decision,
        actor: DecisionActor,
    ) -> OrchestratorResult<ProposalState> {
        self.governance.decide(proposal_id, decision, actor).await
    }

    /// Direct block lifecycle action (accept, lock, etc.).
    pub async fn transition_block(
        &self,
        block_id: BlockId,
        to: BlockState,
        actor: DecisionActor,
    ) -> OrchestratorResult<Block> {
        self.kernel.store.transition_block(block_id, to, actor).await
    }

    /// Status view for one work item and its cascade.
    pub async fn get_work_status(
        &self,
        work_id: WorkId,
    ) -> OrchestratorResult<Option<WorkStatusView>> {
        let Some(item) = self.kernel.queue.get(work_id).await? else {
            return Ok(None);
        };
        let coordinator = CascadeCoordinator::new(Arc::clone(&self.kernel.queue));
        let descendants = coordinator.descendants(work_id).await?;
        Ok(Some(build_status(&item, &descendants)))
    }

    /// Live event subscription; replay gaps with the bus cursor API.
    pub async fn subscribe(&self, topics: &[Topic]) -> OrchestratorResult<EventStream> {
        self.kernel.bus.subscribe(topics).await
    }

    pub async fn queue_health(&self) -> OrchestratorResult<QueueHealth> {
        self.kernel.queue.health().await
    }

    pub async fn basket_context(&self, basket_id: BasketId) -> OrchestratorResult<BasketContext> {
        self.kernel.store.fetch_basket_context(basket_id).await
    }

    /// Blocks whose last validation predates the configured staleness
    /// threshold.
    pub async fn stale_blocks(&self, basket_id: BasketId) -> OrchestratorResult<Vec<Block>> {
        let ctx = self.kernel.store.fetch_basket_context(basket_id).await?;
        let cutoff = chrono::Utc::now()
            - chrono::Duration::from_std(self.kernel.config.staleness_threshold)
                .unwrap_or_else(|_| chrono::Duration::days(14));
        Ok(ctx.stale_blocks(cutoff).into_iter().cloned().collect())
    }

    /// Cascade roots in a workspace with no progress inside the configured
    /// orphan timeout.
    pub async fn orphaned_cascades(
        &self,
        workspace_id: WorkspaceId,
    ) -> OrchestratorResult<Vec<WorkStatusView>> {
        let coordinator = CascadeCoordinator::new(Arc::clone(&self.kernel.queue));
        let orphans = coordinator
            .find_orphans(workspace_id, self.kernel.config.orphan_cascade_timeout)
            .await?;
        let mut views = Vec::with_capacity(orphans.len());
        for orphan in orphans {
            let descendants = coordinator.descendants(orphan.id).await?;
            views.push(build_status(&orphan, &descendants));
        }
        Ok(views)
    }

    /// Request composition of a document for a basket.
    pub async fn request_compose(
        &self,
        workspace_id: WorkspaceId,
        basket_id: BasketId,
        document_id: Option<DocumentId>,
        intent: Option<String>,
    ) -> OrchestratorResult<()> {
        let payload = ComposeRequestPayload { basket_id, workspace_id, document_id, intent };
        self.kernel
            .bus
            .emit(
                NewEvent::new(Topic::BasketComposeRequest, &payload)?
                    .scoped(workspace_id, Some(basket_id))
                    .from_origin("compose_request"),
            )
            .await?;
        Ok(())
    }

    /// Start the background services: dispatcher, worker pool, lease
    /// reaper, and bus sweeper.
    pub fn start(&self) -> OrchestratorHandle {
        let shutdown = CancellationToken::new();
        let mut handles = Vec::new();

        let dispatcher = PipelineDispatcher::new(
            Arc::clone(&self.kernel.bus),
            Arc::clone(&self.kernel.queue),
            Arc::clone(&self.kernel.store),
            Arc::clone(&self.kernel.config),
        );
        let dispatcher_shutdown = shutdown.clone();
        handles.push(tokio::spawn(async move {
            dispatcher.run(dispatcher_shutdown).await;
        }));

        let agent_deps = AgentDeps {
            store: Arc::clone(&self.kernel.store),
            reasoner: Arc::clone(&self.kernel.reasoner),
            embedder: Arc::clone(&self.kernel.embedder),
            tools: Arc::clone(&self.kernel.tools),
        };
        let pool = Arc::new(WorkerPool::new(
            Arc::clone(&self.kernel.queue),
            Arc::clone(&self.kernel.bus),
            Arc::clone(&self.kernel.store),
            Arc::clone(&self.governance),
            Arc::clone(&self.registry),
            agent_deps,
            Arc::clone(&self.kernel.config),
        ));
        handles.extend(pool.spawn(shutdown.clone()));

        // Lease reaper: lost workers' items come back via lease expiry.
        {
            let queue = Arc::clone(&self.kernel.queue);
            let interval = self.kernel.config.reap_interval;
            let shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(interval) => {
                            match queue.reap_expired().await {
                                Ok(reaped) if !reaped.is_empty() => {
                                    info!(count = reaped.len(), "reaped expired leases");
                                }
                                Ok(_) => {}
                                Err(err) => warn!(error = %err, "lease reap failed"),
                            }
                        }
                    }
                }
            }));
        }

        // Bus sweeper: re-notify persisted events that were never handled.
        {
            let bus = Arc::clone(&self.kernel.bus);
            let interval = self.kernel.config.bus_sweep_interval;
            let threshold = self.kernel.config.bus_sweep_threshold;
            let shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(interval) => {
                            match bus.sweep_undelivered(threshold).await {
                                Ok(swept) if !swept.is_empty() => {
                                    info!(count = swept.len(), "re-notified undelivered events");
                                }
                                Ok(_) => {}
                                Err(err) => warn!(error = %err, "bus sweep failed"),
                            }
                        }
                    }
                }
            }));
        }

        OrchestratorHandle { shutdown, handles }
    }
}

/// Running background services. Dropping the handle leaves tasks running;
/// call [`OrchestratorHandle::shutdown`] for a clean stop.
pub struct OrchestratorHandle {
    shutdown: CancellationToken,
    handles: Vec<tokio::task::JoinHandle<()>>,
}

impl OrchestratorHandle {
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}
