//! Pipeline dispatcher.
//!
//! Subscribes to bus topics and turns events into queue work. Routing is
//! an exhaustive match over the closed topic set; every enqueue carries a
//! dedupe key, so replayed or duplicated events coalesce onto at most one
//! live work item.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::common::OrchestratorResult;
use crate::config::OrchestratorConfig;
use crate::kernel::bus::{
    ComposeRequestPayload, DumpCreatedPayload, EventBus, EventRecord, ProposalLifecyclePayload,
    ReflectionComputedPayload, SubstrateCommittedPayload, Topic,
};
use crate::kernel::store::SubstrateStore;
use crate::kernel::work::{
    CascadeMetadata, NewWorkItem, WorkPayload, WorkQueue, WorkResult, WorkType,
};

/// Topics the dispatcher routes.
const ROUTED_TOPICS: [Topic; 5] = [
    Topic::DumpCreated,
    Topic::SubstrateCommitted,
    Topic::ReflectionComputed,
    Topic::BasketComposeRequest,
    Topic::ProposalReviewRequested,
];

pub struct PipelineDispatcher {
    bus: Arc<dyn EventBus>,
    queue: Arc<dyn WorkQueue>,
    store: Arc<dyn SubstrateStore>,
    config: Arc<OrchestratorConfig>,
}

impl PipelineDispatcher {
    pub fn new(
        bus: Arc<dyn EventBus>,
        queue: Arc<dyn WorkQueue>,
        store: Arc<dyn SubstrateStore>,
        config: Arc<OrchestratorConfig>,
    ) -> Self {
        Self { bus, queue, store, config }
    }

    /// Run until shutdown: catch up on undelivered events, then route live
    /// notifications.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut stream = match self.bus.subscribe(&ROUTED_TOPICS).await {
            Ok(stream) => stream,
            Err(err) => {
                warn!(error = %err, "dispatcher could not subscribe, exiting");
                return;
            }
        };

        // Catch-up: events persisted before this dispatcher came up.
        match self.bus.replay_after(0, &ROUTED_TOPICS).await {
            Ok(backlog) => {
                for event in backlog.into_iter().filter(|e| e.delivered_at.is_none()) {
                    self.dispatch(&event).await;
                }
            }
            Err(err) => warn!(error = %err, "dispatcher replay failed"),
        }

        info!("pipeline dispatcher running");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                event = stream.recv() => {
                    match event {
                        Some(event) => self.dispatch(&event).await,
                        None => {
                            warn!("dispatcher event stream closed");
                            break;
                        }
                    }
                }
            }
        }
        info!("pipeline dispatcher stopped");
    }

    async fn dispatch(&self, event: &EventRecord) {
        match self.handle_event(event).await {
            Ok(()) => {
                if let Err(err) = self.bus.mark_delivered(event.id).await {
                    warn!(event_id = event.id, error = %err, "mark_delivered failed");
                }
            }
            Err(err) => {
                // Left undelivered; the sweeper will re-notify.
                warn!(event_id = event.id, topic = %event.topic, error = %err,
                      "event routing failed");
            }
        }
    }

    /// Route one event to queue work. Idempotent per event: enqueues are
    /// dedupe-keyed and the queue refreshes rather than duplicates.
    pub async fn handle_event(&self, event: &EventRecord) -> OrchestratorResult<()> {
        let Some(topic) = event.topic() else {
            debug!(event_id = event.id, topic = %event.topic, "ignoring unknown topic");
            return Ok(());
        };

        match topic {
            Topic::DumpCreated => {
                let payload: DumpCreatedPayload = event.payload_as()?;
                let item = NewWorkItem::builder()
                    .work_type(WorkType::P1Substrate)
                    .payload(WorkPayload::Substrate { dump_id: payload.dump_id })
                    .workspace_id(payload.workspace_id)
                    .basket_id(payload.basket_id)
                    .priority(8)
                    .max_attempts(self.config.retry_cap)
                    .dedupe_key(format!("p1:{}", payload.dump_id))
                    .cascade(CascadeMetadata {
                        next_stage: None,
                        origin_dump_id: Some(payload.dump_id),
                        depth: 0,
                    })
                    .build();
                let work = self.queue.enqueue(item).await?;
                debug!(event_id = event.id, work_id = %work.id, "P1 enqueued for dump");
            }

            Topic::SubstrateCommitted => {
                let payload: SubstrateCommittedPayload = event.payload_as()?;
                if payload.blocks_changed == 0 && payload.context_items_changed == 0 {
                    return Ok(());
                }

                if self.config.enable_graph_stage {
                    let mut item = NewWorkItem::builder()
                        .work_type(WorkType::P2Graph)
                        .payload(WorkPayload::Graph)
                        .workspace_id(payload.workspace_id)
                        .basket_id(payload.basket_id)
                        .priority(6)
                        .max_attempts(self.config.retry_cap)
                        .dedupe_key(format!("p2:{}", payload.basket_id))
                        .build();
                    item.parent_work_id = payload.work_id;
                    self.queue.enqueue(item).await?;
                }

                // Debounced: one live reflection item per basket, held back
                // for the coalescing window.
                let mut item = NewWorkItem::builder()
                    .work_type(WorkType::P3Reflection)
                    .payload(WorkPayload::Reflection)
                    .workspace_id(payload.workspace_id)
                    .basket_id(payload.basket_id)
                    .priority(5)
                    .max_attempts(self.config.retry_cap)
                    .dedupe_key(format!("p3:{}", payload.basket_id))
                    .cascade(CascadeMetadata { next_stage: None, origin_dump_id: None, depth: 1 })
                    .build();
                item.parent_work_id = payload.work_id;
                item.not_before = self
                    .config
                    .debounce_for(WorkType::P3Reflection)
                    .map(|window| {
                        chrono::Utc::now()
                            + chrono::Duration::from_std(window)
                                .unwrap_or_else(|_| chrono::Duration::zero())
                    });
                let work = self.queue.enqueue(item).await?;
                debug!(event_id = event.id, work_id = %work.id, "P3 enqueued (debounced)");
            }

            Topic::ReflectionComputed => {
                if !self.config.enable_compose_on_reflection {
                    return Ok(());
                }
                let payload: ReflectionComputedPayload = event.payload_as()?;
                let documents = self.store.documents_for_basket(payload.basket_id).await?;
                for document in documents {
                    let mut item = NewWorkItem::builder()
                        .work_type(WorkType::P4Compose)
                        .payload(WorkPayload::Compose {
                            document_id: Some(document.id),
                            intent: None,
                        })
                        .workspace_id(payload.workspace_id)
                        .basket_id(payload.basket_id)
                        .priority(4)
                        .max_attempts(self.config.retry_cap)
                        .dedupe_key(format!("p4:{}:{}", payload.basket_id, document.id))
                        .build();
                    item.parent_work_id = payload.work_id;
                    item.not_before = self
                        .config
                        .debounce_for(WorkType::P4Compose)
                        .map(|window| {
                            chrono::Utc::now()
                                + chrono::Duration::from_std(window)
                                    .unwrap_or_else(|_| chrono::Duration::zero())
                        });
                    self.queue.enqueue(item).await?;
                }
            }

            Topic::BasketComposeRequest => {
                let payload: ComposeRequestPayload = event.payload_as()?;
                let dedupe = payload
                    .document_id
                    .map(|doc| format!("p4:{}:{doc}", payload.basket_id));
                let mut item = NewWorkItem::builder()
                    .work_type(WorkType::P4Compose)
                    .payload(WorkPayload::Compose {
                        document_id: payload.document_id,
                        intent: payload.intent.clone(),
                    })
                    .workspace_id(payload.workspace_id)
                    .basket_id(payload.basket_id)
                    .priority(6)
                    .max_attempts(self.config.retry_cap)
                    .build();
                item.dedupe_key = dedupe;
                let work = self.queue.enqueue(item).await?;
                debug!(event_id = event.id, work_id = %work.id, "P4 enqueued on request");
            }

            Topic::ProposalReviewRequested => {
                let payload: ProposalLifecyclePayload = event.payload_as()?;
                // A reviewer may already have decided by the time this
                // event is routed (or re-notified); decided proposals get
                // no review item.
                let still_open = self
                    .store
                    .fetch_proposal(payload.proposal_id)
                    .await?
                    .map(|p| !p.state.is_terminal())
                    .unwrap_or(false);
                if !still_open {
                    return Ok(());
                }
                let item = NewWorkItem::builder()
                    .work_type(WorkType::ProposalReview)
                    .payload(WorkPayload::ProposalReview { proposal_id: payload.proposal_id })
                    .workspace_id(payload.workspace_id)
                    .basket_id(payload.basket_id)
                    .priority(7)
                    .max_attempts(1)
                    .dedupe_key(format!("review:{}", payload.proposal_id))
                    .build();
                let work = self.queue.enqueue(item).await?;

                // The decision may land between the check above and the
                // enqueue; the engine settles only items it can see, so
                // re-check and settle here if the proposal closed meanwhile.
                let closed_meanwhile = self
                    .store
                    .fetch_proposal(payload.proposal_id)
                    .await?
                    .map(|p| p.state.is_terminal())
                    .unwrap_or(true);
                if closed_meanwhile {
                    let result = WorkResult {
                        summary: Some("proposal decided before review was routed".to_string()),
                        proposal_id: Some(payload.proposal_id),
                        ..Default::default()
                    };
                    if let Err(err) = self.queue.resolve_manual(work.id, result).await {
                        debug!(work_id = %work.id, error = %err,
                               "review item settled concurrently");
                    }
                }
            }

            // Observed by external subscribers, not routed to work.
            Topic::SubstrateCommitFailed
            | Topic::ProposalDrafted
            | Topic::ProposalValidated
            | Topic::ProposalApproved
            | Topic::ProposalRejected
            | Topic::DocumentComposed
            | Topic::WorkCascadeCompleted => {}
        }

        Ok(())
    }
}
