//! Governance engine.
//!
//! Drives the proposal state machine end to end: submission, mandatory
//! validation, policy decision, approval, and atomic commit. Every
//! substrate mutation in the system funnels through here.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{info, warn};

use crate::common::{DeltaId, OrchestratorError, OrchestratorResult, ProposalId, WorkId};
use crate::config::OrchestratorConfig;
use crate::domains::baskets::BasketContext;
use crate::domains::substrate::Block;
use crate::kernel::bus::{
    CommitFailedPayload, EventBus, NewEvent, ProposalLifecyclePayload, SubstrateCommittedPayload,
    Topic,
};
use crate::kernel::store::SubstrateStore;
use crate::kernel::traits::Embedder;
use crate::kernel::work::{WorkQueue, WorkResult};

use super::delta::{Delta, DeltaChange};
use super::ops::Operation;
use super::policy::PolicyDecision;
use super::proposal::{
    Decision, DecisionActor, Proposal, ProposalDraft, ProposalState, SubmitOutcome,
};
use super::validator::{self, ValidationReport};

pub struct GovernanceEngine {
    store: Arc<dyn SubstrateStore>,
    bus: Arc<dyn EventBus>,
    queue: Arc<dyn WorkQueue>,
    embedder: Arc<dyn Embedder>,
    config: Arc<OrchestratorConfig>,
}

impl GovernanceEngine {
    pub fn new(
        store: Arc<dyn SubstrateStore>,
        bus: Arc<dyn EventBus>,
        queue: Arc<dyn WorkQueue>,
        embedder: Arc<dyn Embedder>,
        config: Arc<OrchestratorConfig>,
    ) -> Self {
        Self { store, bus, queue, embedder, config }
    }

    /// Submit a proposal draft through governance.
    ///
    /// With a `request_id`, resubmissions return the original outcome
    /// without producing a second proposal or delta. `work_id` threads
    /// cascade lineage into the committed event.
    pub async fn submit(
        &self,
        draft: ProposalDraft,
        request_id: Option<&str>,
        work_id: Option<WorkId>,
    ) -> OrchestratorResult<SubmitOutcome> {
        if let Some(request_id) = request_id {
            if !self.store.claim_request(request_id).await? {
                return self.replay_outcome(request_id).await;
            }
        }

        let proposal = Proposal::from_draft(draft);
        self.store.insert_proposal(&proposal).await?;
        if let Some(request_id) = request_id {
            self.store.bind_request(request_id, Some(proposal.id), None).await?;
        }

        self.emit_lifecycle(Topic::ProposalDrafted, &proposal, None).await;
        info!(proposal_id = %proposal.id, basket_id = %proposal.basket_id,
              origin = %proposal.origin, ops = proposal.ops.len(), "proposal drafted");

        let ctx = self.store.fetch_basket_context(proposal.basket_id).await?;
        let report = self.validate(&proposal, &ctx).await?;

        let proposal = self
            .store
            .transition_proposal(
                proposal.id,
                ProposalState::Draft,
                ProposalState::Validated,
                Some(&report),
                None,
            )
            .await?;
        self.emit_lifecycle(Topic::ProposalValidated, &proposal, None).await;

        match report.policy_decision {
            PolicyDecision::Reject => {
                let reason = report.error_summary();
                let proposal = self
                    .store
                    .transition_proposal(
                        proposal.id,
                        ProposalState::Validated,
                        ProposalState::Rejected,
                        None,
                        Some(&reason),
                    )
                    .await?;
                self.emit_lifecycle(Topic::ProposalRejected, &proposal, Some(reason.clone()))
                    .await;
                info!(proposal_id = %proposal.id, %reason, "proposal rejected by policy");
                Ok(SubmitOutcome {
                    proposal_id: proposal.id,
                    state: ProposalState::Rejected,
                    delta_id: None,
                })
            }

            PolicyDecision::RequireReview => {
                self.emit_lifecycle(
                    Topic::ProposalReviewRequested,
                    &proposal,
                    report.policy_reason.clone(),
                )
                .await;
                info!(proposal_id = %proposal.id, reason = ?report.policy_reason,
                      "proposal pending review");
                Ok(SubmitOutcome {
                    proposal_id: proposal.id,
                    state: ProposalState::Validated,
                    delta_id: None,
                })
            }

            PolicyDecision::AutoApprove => {
                let actor = DecisionActor { kind: proposal.origin.actor_kind(), user_id: None };
                match self.approve_and_commit(&proposal, actor, request_id, work_id).await {
                    Ok(delta) => Ok(SubmitOutcome {
                        proposal_id: proposal.id,
                        state: ProposalState::Committed,
                        delta_id: Some(delta.delta_id),
                    }),
                    Err(err) if !err.is_retryable() => Ok(SubmitOutcome {
                        proposal_id: proposal.id,
                        state: ProposalState::Failed,
                        delta_id: None,
                    }),
                    Err(err) => Err(err),
                }
            }
        }
    }

    /// Apply a human or service decision to a validated proposal.
    pub async fn decide(
        &self,
        proposal_id: ProposalId,
        decision: Decision,
        actor: DecisionActor,
    ) -> OrchestratorResult<ProposalState> {
        let proposal = self
            .store
            .fetch_proposal(proposal_id)
            .await?
            .ok_or_else(|| OrchestratorError::Fatal(format!("unknown proposal {proposal_id}")))?;

        if proposal.state != ProposalState::Validated {
            return Err(OrchestratorError::Conflict(format!(
                "proposal {proposal_id} is {}, decisions apply to VALIDATED proposals",
                proposal.state
            )));
        }

        match decision {
            Decision::Reject => {
                let proposal = self
                    .store
                    .transition_proposal(
                        proposal_id,
                        ProposalState::Validated,
                        ProposalState::Rejected,
                        None,
                        Some("rejected by reviewer"),
                    )
                    .await?;
                self.emit_lifecycle(
                    Topic::ProposalRejected,
                    &proposal,
                    Some("rejected by reviewer".to_string()),
                )
                .await;
                self.settle_review_item(proposal_id, ProposalState::Rejected, None).await;
                Ok(ProposalState::Rejected)
            }
            Decision::Approve => {
                match self.approve_and_commit(&proposal, actor, None, None).await {
                    Ok(delta) => {
                        self.settle_review_item(
                            proposal_id,
                            ProposalState::Committed,
                            Some(delta.delta_id),
                        )
                        .await;
                        Ok(ProposalState::Committed)
                    }
                    Err(err) if !err.is_retryable() => {
                        self.settle_review_item(proposal_id, ProposalState::Failed, None).await;
                        Ok(ProposalState::Failed)
                    }
                    Err(err) => Err(err),
                }
            }
        }
    }

    /// Settle the `PROPOSAL_REVIEW` work item the dispatcher enqueued for
    /// this proposal, if one is live. The item tracks the human decision,
    /// so it resolves here rather than through a claiming worker.
    async fn settle_review_item(
        &self,
        proposal_id: ProposalId,
        state: ProposalState,
        delta_id: Option<DeltaId>,
    ) {
        let key = format!("review:{proposal_id}");
        let item = match self.queue.find_by_dedupe_key(&key).await {
            Ok(Some(item)) => item,
            Ok(None) => return,
            Err(err) => {
                warn!(proposal_id = %proposal_id, error = %err,
                      "review work item lookup failed");
                return;
            }
        };

        let result = WorkResult {
            summary: Some(format!("proposal {state}")),
            proposal_id: Some(proposal_id),
            delta_id,
            ..Default::default()
        };
        if let Err(err) = self.queue.resolve_manual(item.id, result).await {
            warn!(work_id = %item.id, proposal_id = %proposal_id, error = %err,
                  "failed to settle review work item");
        }
    }

    /// Run the validator over a proposal against a context snapshot,
    /// embedding candidate blocks for semantic dedup first.
    pub async fn validate(
        &self,
        proposal: &Proposal,
        ctx: &BasketContext,
    ) -> OrchestratorResult<ValidationReport> {
        let mut op_embeddings = HashMap::new();
        for (op_index, op) in proposal.ops.iter().enumerate() {
            if let Operation::CreateBlock { title, content, .. } = op {
                let text = Block::embedding_text(title, content);
                match self.embedder.embed(&text).await {
                    Ok(embedding) => {
                        op_embeddings.insert(op_index, embedding);
                    }
                    Err(err) => {
                        // Dedup degrades gracefully; validation itself
                        // never depends on the embedder being up.
                        warn!(proposal_id = %proposal.id, op_index, error = %err,
                              "embedding failed, skipping semantic dedup for op");
                    }
                }
            }
        }

        let overrides = self.store.fetch_policy_overrides(proposal.basket_id).await?;
        let policy = self.config.policy.merged(&overrides);

        Ok(validator::validate(
            proposal,
            ctx,
            &op_embeddings,
            &policy,
            self.config.dedup_similarity_threshold,
        ))
    }

    async fn approve_and_commit(
        &self,
        proposal: &Proposal,
        actor: DecisionActor,
        request_id: Option<&str>,
        work_id: Option<WorkId>,
    ) -> OrchestratorResult<Delta> {
        let proposal = self
            .store
            .transition_proposal(
                proposal.id,
                ProposalState::Validated,
                ProposalState::Approved,
                None,
                None,
            )
            .await?;
        self.emit_lifecycle(Topic::ProposalApproved, &proposal, None).await;

        match self.store.apply_proposal_ops(&proposal, actor).await {
            Ok(delta) => {
                if let Some(request_id) = request_id {
                    self.store.bind_request(request_id, None, Some(delta.delta_id)).await?;
                }

                let payload = SubstrateCommittedPayload {
                    proposal_id: proposal.id,
                    delta_id: delta.delta_id,
                    basket_id: proposal.basket_id,
                    workspace_id: proposal.workspace_id,
                    work_id,
                    blocks_changed: delta.blocks_changed(),
                    context_items_changed: delta.context_items_changed(),
                    relationships_changed: delta.relationships_changed(),
                };
                self.emit(Topic::SubstrateCommitted, &payload, &proposal).await;
                info!(proposal_id = %proposal.id, delta_id = %delta.delta_id,
                      changes = delta.changes.len(), "substrate committed");

                self.backfill_embeddings(&delta).await;
                Ok(delta)
            }
            Err(err) => {
                let reason = err.to_string();
                if let Err(transition_err) = self
                    .store
                    .transition_proposal(
                        proposal.id,
                        ProposalState::Approved,
                        ProposalState::Failed,
                        None,
                        Some(&reason),
                    )
                    .await
                {
                    warn!(proposal_id = %proposal.id, error = %transition_err,
                          "failed to record commit failure");
                }

                let payload = CommitFailedPayload {
                    proposal_id: proposal.id,
                    basket_id: proposal.basket_id,
                    workspace_id: proposal.workspace_id,
                    error_code: err.code().to_string(),
                    reason: reason.clone(),
                };
                self.emit(Topic::SubstrateCommitFailed, &payload, &proposal).await;
                warn!(proposal_id = %proposal.id, %reason, "commit failed");
                Err(err)
            }
        }
    }

    /// Embedding generation happens outside the commit transaction and is
    /// idempotent: the store drops backfills whose content hash is stale.
    async fn backfill_embeddings(&self, delta: &Delta) {
        for change in &delta.changes {
            let DeltaChange::BlockCreated { block_id, .. } = change else { continue };
            let block = match self.store.fetch_block(*block_id).await {
                Ok(Some(block)) => block,
                Ok(None) => continue,
                Err(err) => {
                    warn!(block_id = %block_id, error = %err, "embedding backfill fetch failed");
                    continue;
                }
            };
            if block.embedding.is_some() {
                continue;
            }
            let Some(hash) = block.content_hash.clone() else { continue };
            let text = Block::embedding_text(&block.title, &block.content);
            match self.embedder.embed(&text).await {
                Ok(embedding) => {
                    if let Err(err) =
                        self.store.update_block_embedding(*block_id, embedding, &hash).await
                    {
                        warn!(block_id = %block_id, error = %err, "embedding backfill failed");
                    }
                }
                Err(err) => {
                    warn!(block_id = %block_id, error = %err, "embedding generation failed");
                }
            }
        }
    }

    async fn replay_outcome(&self, request_id: &str) -> OrchestratorResult<SubmitOutcome> {
        let binding = self.store.lookup_request(request_id).await?.ok_or_else(|| {
            OrchestratorError::Transient(format!("request {request_id} is still in flight"))
        })?;

        if let Some(delta_id) = binding.delta_id {
            let delta = self.store.fetch_delta(delta_id).await?;
            let proposal_id = binding
                .proposal_id
                .or_else(|| delta.as_ref().and_then(|d| d.proposal_id))
                .ok_or_else(|| {
                    OrchestratorError::Fatal(format!(
                        "request {request_id} has a delta but no proposal"
                    ))
                })?;
            return Ok(SubmitOutcome {
                proposal_id,
                state: ProposalState::Committed,
                delta_id: Some(delta_id),
            });
        }

        let proposal_id = binding.proposal_id.ok_or_else(|| {
            OrchestratorError::Transient(format!("request {request_id} is still in flight"))
        })?;
        let proposal = self
            .store
            .fetch_proposal(proposal_id)
            .await?
            .ok_or_else(|| OrchestratorError::Fatal(format!("unknown proposal {proposal_id}")))?;
        Ok(SubmitOutcome { proposal_id, state: proposal.state, delta_id: None })
    }

    async fn emit_lifecycle(&self, topic: Topic, proposal: &Proposal, reason: Option<String>) {
        let payload = ProposalLifecyclePayload {
            proposal_id: proposal.id,
            basket_id: proposal.basket_id,
            workspace_id: proposal.workspace_id,
            origin: proposal.origin.as_string(),
            reason,
        };
        self.emit(topic, &payload, proposal).await;
    }

    async fn emit<P: serde::Serialize>(&self, topic: Topic, payload: &P, proposal: &Proposal) {
        let event = match NewEvent::new(topic, payload) {
            Ok(event) => event
                .scoped(proposal.workspace_id, Some(proposal.basket_id))
                .from_origin(proposal.origin.as_string()),
            Err(err) => {
                warn!(topic = %topic, error = %err, "failed to encode event payload");
                return;
            }
        };
        if let Err(err) = self.bus.emit(event).await {
            warn!(topic = %topic, error = %err, "event emit failed");
        }
    }
}
