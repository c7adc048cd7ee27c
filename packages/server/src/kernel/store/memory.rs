//! In-memory substrate store.
//!
//! Backs tests and mirrors the Postgres store's guarantees: guarded FSM
//! transitions, optimistic block versions, request-id idempotency, and
//! all-or-nothing op application. One mutex guards the whole table set and
//! is never held across an await, so every commit is atomic as observed by
//! any other task; per-basket serialization follows a fortiori.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use crate::common::{
    content_hash, BasketId, BlockId, ContextItemId, DeltaId, DocumentId, DumpId,
    OrchestratorError, OrchestratorResult, ProposalId, WorkspaceId,
};
use crate::domains::baskets::{Basket, BasketContext, BasketStatus, Workspace};
use crate::domains::documents::{Document, NewSubstrateReference, SubstrateReference};
use crate::domains::dumps::{NewDump, RawDump};
use crate::domains::governance::delta::{Delta, DeltaChange};
use crate::domains::governance::ops::Operation;
use crate::domains::governance::policy::PolicyOverrides;
use crate::domains::governance::proposal::{DecisionActor, Proposal, ProposalState};
use crate::domains::governance::validator::ValidationReport;
use crate::domains::reflections::{ReflectionArtifact, ReflectionKind};
use crate::domains::substrate::{
    Block, BlockDiff, BlockState, ContextItem, ContextItemState, Relationship, Revision,
};

use super::{RequestBinding, SubstrateStore};

#[derive(Default)]
struct State {
    workspaces: Vec<Workspace>,
    baskets: Vec<Basket>,
    policies: HashMap<BasketId, PolicyOverrides>,
    dumps: Vec<RawDump>,
    blocks: Vec<Block>,
    items: Vec<ContextItem>,
    relationships: Vec<Relationship>,
    revisions: Vec<Revision>,
    proposals: Vec<Proposal>,
    deltas: Vec<Delta>,
    idempotency: HashMap<String, RequestBinding>,
    reflections: Vec<ReflectionArtifact>,
    documents: Vec<Document>,
    references: Vec<SubstrateReference>,
}

#[derive(Clone, Default)]
pub struct MemorySubstrateStore {
    state: Arc<Mutex<State>>,
}

impl MemorySubstrateStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().expect("substrate store poisoned")
    }

    /// All revisions in insert order. Test helper.
    pub fn all_revisions(&self) -> Vec<Revision> {
        self.lock().revisions.clone()
    }

    /// All deltas in insert order. Test helper.
    pub fn all_deltas(&self) -> Vec<Delta> {
        self.lock().deltas.clone()
    }
}

/// Apply one op against the scratch tables. Returns the delta changes, or
/// the error that aborts the whole proposal.
#[allow(clippy::too_many_arguments)]
fn apply_op(
    op: &Operation,
    proposal: &Proposal,
    actor: DecisionActor,
    blocks: &mut Vec<Block>,
    items: &mut Vec<ContextItem>,
    relationships: &mut Vec<Relationship>,
    revisions: &mut Vec<Revision>,
) -> OrchestratorResult<Vec<DeltaChange>> {
    let now = Utc::now();
    match op {
        Operation::CreateBlock { title, semantic_type, content, confidence, metadata } => {
            let block = Block {
                id: BlockId::new(),
                basket_id: proposal.basket_id,
                workspace_id: proposal.workspace_id,
                semantic_type: *semantic_type,
                title: title.clone(),
                content: content.clone(),
                status: BlockState::Proposed,
                version: 1,
                confidence: *confidence,
                provenance: proposal.provenance.clone(),
                content_hash: Some(content_hash(&Block::embedding_text(title, content))),
                embedding: None,
                last_validated_at: now,
                metadata: metadata.clone(),
                created_at: now,
                updated_at: now,
            };
            let change = DeltaChange::BlockCreated { block_id: block.id, version: 1 };
            blocks.push(block);
            Ok(vec![change])
        }

        Operation::UpdateBlock { block_id, from_version, patch } => {
            let block = find_block(blocks, *block_id, proposal.basket_id)?;
            if block.version != *from_version {
                return Err(OrchestratorError::Conflict(format!(
                    "block {block_id} is at version {}, op expected {from_version}",
                    block.version
                )));
            }
            if !block.status.content_editable_by(actor.kind) {
                return Err(OrchestratorError::Conflict(format!(
                    "block {block_id} is {} and not editable",
                    block.status
                )));
            }

            let mut diff = BlockDiff::new(block.version, block.version + 1);
            if let Some(title) = &patch.title {
                diff.push_field("title", &block.title, title);
                block.title = title.clone();
            }
            if let Some(content) = &patch.content {
                diff.push_field("content", &block.content, content);
                block.content = content.clone();
            }
            if let Some(confidence) = patch.confidence {
                diff.push_field(
                    "confidence",
                    &block.confidence.to_string(),
                    &confidence.to_string(),
                );
                block.confidence = confidence;
            }
            if let Some(metadata) = &patch.metadata {
                block.metadata = metadata.clone();
            }

            let from = block.version;
            block.version += 1;
            block.updated_at = now;
            block.last_validated_at = now;
            block.content_hash =
                Some(content_hash(&Block::embedding_text(&block.title, &block.content)));
            block.embedding = None;

            revisions.push(Revision {
                id: Uuid::new_v4(),
                block_id: block.id,
                workspace_id: block.workspace_id,
                actor_id: actor.user_id,
                summary: format!("update v{from} -> v{}", block.version),
                diff_json: serde_json::to_value(&diff)?,
                created_at: now,
            });

            Ok(vec![DeltaChange::BlockUpdated {
                block_id: *block_id,
                from_version: from,
                to_version: from + 1,
            }])
        }

        Operation::ReviseBlock { block_id, from_version, content, summary } => {
            let block = find_block(blocks, *block_id, proposal.basket_id)?;
            if block.version != *from_version {
                return Err(OrchestratorError::Conflict(format!(
                    "block {block_id} is at version {}, op expected {from_version}",
                    block.version
                )));
            }
            if !block.status.content_editable_by(actor.kind) {
                return Err(OrchestratorError::Conflict(format!(
                    "block {block_id} is {} and not editable",
                    block.status
                )));
            }

            let mut diff = BlockDiff::new(block.version, block.version + 1);
            diff.push_field("content", &block.content, content);

            let from = block.version;
            block.content = content.clone();
            block.version += 1;
            block.updated_at = now;
            block.last_validated_at = now;
            block.content_hash =
                Some(content_hash(&Block::embedding_text(&block.title, &block.content)));
            block.embedding = None;

            revisions.push(Revision {
                id: Uuid::new_v4(),
                block_id: block.id,
                workspace_id: block.workspace_id,
                actor_id: actor.user_id,
                summary: summary.clone(),
                diff_json: serde_json::to_value(&diff)?,
                created_at: now,
            });

            Ok(vec![DeltaChange::BlockUpdated {
                block_id: *block_id,
                from_version: from,
                to_version: from + 1,
            }])
        }

        Operation::CreateContextItem { item_type, label, metadata } => {
            let normalized = ContextItem::normalized_label(label);
            let exists = items.iter().any(|i| {
                i.basket_id == proposal.basket_id
                    && i.item_type == *item_type
                    && ContextItem::normalized_label(&i.label) == normalized
            });
            if exists {
                return Ok(vec![]);
            }
            let item = ContextItem {
                id: ContextItemId::new(),
                basket_id: proposal.basket_id,
                workspace_id: proposal.workspace_id,
                item_type: *item_type,
                label: label.clone(),
                state: ContextItemState::Active,
                metadata: metadata.clone(),
                created_at: now,
            };
            let change = DeltaChange::ContextItemCreated { item_id: item.id };
            items.push(item);
            Ok(vec![change])
        }

        Operation::MergeBlocks { primary_id, merged_ids, merged_title } => {
            let mut changes = Vec::new();

            for merged_id in merged_ids {
                let block = find_block(blocks, *merged_id, proposal.basket_id)?;
                if !block.status.can_transition(BlockState::Superseded, actor.kind) {
                    return Err(OrchestratorError::Conflict(format!(
                        "block {merged_id} is {} and cannot be superseded",
                        block.status
                    )));
                }
                block.status = BlockState::Superseded;
                block.updated_at = now;
                changes.push(DeltaChange::BlockSuperseded { block_id: *merged_id });
            }

            let primary = find_block(blocks, *primary_id, proposal.basket_id)?;
            if let Some(title) = merged_title {
                primary.title = title.clone();
                primary.version += 1;
                primary.updated_at = now;
            }
            let merged_from: Vec<String> = merged_ids.iter().map(|id| id.to_string()).collect();
            if let serde_json::Value::Object(map) = &mut primary.metadata {
                map.insert("merged_from".to_string(), serde_json::json!(merged_from));
            } else {
                primary.metadata = serde_json::json!({ "merged_from": merged_from });
            }

            changes.push(DeltaChange::BlocksMerged {
                primary_id: *primary_id,
                merged_ids: merged_ids.clone(),
            });
            Ok(changes)
        }

        Operation::CreateRelationship { from, to, relationship_type, strength } => {
            let duplicate = relationships.iter().any(|r| {
                r.basket_id == proposal.basket_id
                    && r.from_type == from.substrate_type
                    && r.from_id == from.id
                    && r.to_type == to.substrate_type
                    && r.to_id == to.id
                    && r.relationship_type == *relationship_type
            });
            if duplicate {
                return Err(OrchestratorError::Conflict(format!(
                    "relationship {relationship_type} already exists between {} and {}",
                    from.id, to.id
                )));
            }
            let relationship = Relationship {
                id: Uuid::new_v4(),
                basket_id: proposal.basket_id,
                workspace_id: proposal.workspace_id,
                from_type: from.substrate_type,
                from_id: from.id,
                to_type: to.substrate_type,
                to_id: to.id,
                relationship_type: relationship_type.clone(),
                strength: *strength,
                created_at: now,
            };
            let change = DeltaChange::RelationshipCreated {
                from_id: from.id,
                to_id: to.id,
                relationship_type: relationship_type.clone(),
            };
            relationships.push(relationship);
            Ok(vec![change])
        }
    }
}

fn find_block<'a>(
    blocks: &'a mut [Block],
    block_id: BlockId,
    basket_id: BasketId,
) -> OrchestratorResult<&'a mut Block> {
    blocks
        .iter_mut()
        .find(|b| b.id == block_id && b.basket_id == basket_id)
        .ok_or_else(|| {
            OrchestratorError::Conflict(format!("block {block_id} does not exist in basket"))
        })
}

#[async_trait]
impl SubstrateStore for MemorySubstrateStore {
    async fn create_workspace(&self, owner_ref: &str) -> OrchestratorResult<Workspace> {
        let workspace = Workspace {
            id: WorkspaceId::new(),
            owner_ref: owner_ref.to_string(),
            created_at: Utc::now(),
        };
        self.lock().workspaces.push(workspace.clone());
        Ok(workspace)
    }

    async fn create_basket(&self, workspace_id: WorkspaceId) -> OrchestratorResult<Basket> {
        let basket = Basket {
            id: BasketId::new(),
            workspace_id,
            status: BasketStatus::Active,
            created_at: Utc::now(),
        };
        self.lock().baskets.push(basket.clone());
        Ok(basket)
    }

    async fn fetch_basket(&self, basket_id: BasketId) -> OrchestratorResult<Option<Basket>> {
        Ok(self.lock().baskets.iter().find(|b| b.id == basket_id).cloned())
    }

    async fn set_basket_status(
        &self,
        basket_id: BasketId,
        status: BasketStatus,
    ) -> OrchestratorResult<()> {
        let mut state = self.lock();
        if let Some(basket) = state.baskets.iter_mut().find(|b| b.id == basket_id) {
            basket.status = status;
        }
        Ok(())
    }

    async fn fetch_policy_overrides(
        &self,
        basket_id: BasketId,
    ) -> OrchestratorResult<PolicyOverrides> {
        Ok(self.lock().policies.get(&basket_id).cloned().unwrap_or_default())
    }

    async fn set_policy_overrides(
        &self,
        basket_id: BasketId,
        overrides: &PolicyOverrides,
    ) -> OrchestratorResult<()> {
        self.lock().policies.insert(basket_id, overrides.clone());
        Ok(())
    }

    async fn insert_dump(&self, dump: NewDump) -> OrchestratorResult<RawDump> {
        let row = RawDump {
            id: dump.id,
            basket_id: dump.basket_id,
            workspace_id: dump.workspace_id,
            body_text: dump.body_text,
            source_meta: dump.source_meta,
            ingest_trace_id: dump.ingest_trace_id,
            created_at: Utc::now(),
        };
        self.lock().dumps.push(row.clone());
        Ok(row)
    }

    async fn fetch_dump(&self, dump_id: DumpId) -> OrchestratorResult<Option<RawDump>> {
        Ok(self.lock().dumps.iter().find(|d| d.id == dump_id).cloned())
    }

    async fn insert_delta(&self, delta: &Delta) -> OrchestratorResult<()> {
        self.lock().deltas.push(delta.clone());
        Ok(())
    }

    async fn fetch_delta(&self, delta_id: DeltaId) -> OrchestratorResult<Option<Delta>> {
        Ok(self.lock().deltas.iter().find(|d| d.delta_id == delta_id).cloned())
    }

    async fn claim_request(&self, request_id: &str) -> OrchestratorResult<bool> {
        let mut state = self.lock();
        if state.idempotency.contains_key(request_id) {
            return Ok(false);
        }
        state.idempotency.insert(request_id.to_string(), RequestBinding::default());
        Ok(true)
    }

    async fn bind_request(
        &self,
        request_id: &str,
        proposal_id: Option<ProposalId>,
        delta_id: Option<DeltaId>,
    ) -> OrchestratorResult<()> {
        let mut state = self.lock();
        let binding = state.idempotency.entry(request_id.to_string()).or_default();
        if proposal_id.is_some() {
            binding.proposal_id = proposal_id;
        }
        if delta_id.is_some() {
            binding.delta_id = delta_id;
        }
        Ok(())
    }

    async fn lookup_request(
        &self,
        request_id: &str,
    ) -> OrchestratorResult<Option<RequestBinding>> {
        Ok(self.lock().idempotency.get(request_id).cloned())
    }

    async fn insert_proposal(&self, proposal: &Proposal) -> OrchestratorResult<()> {
        self.lock().proposals.push(proposal.clone());
        Ok(())
    }

    async fn fetch_proposal(
        &self,
        proposal_id: ProposalId,
    ) -> OrchestratorResult<Option<Proposal>> {
        Ok(self.lock().proposals.iter().find(|p| p.id == proposal_id).cloned())
    }

    async fn transition_proposal(
        &self,
        proposal_id: ProposalId,
        from: ProposalState,
        to: ProposalState,
        report: Option<&ValidationReport>,
        reason: Option<&str>,
    ) -> OrchestratorResult<Proposal> {
        let mut state = self.lock();
        let proposal = state
            .proposals
            .iter_mut()
            .find(|p| p.id == proposal_id)
            .ok_or_else(|| OrchestratorError::Fatal(format!("unknown proposal {proposal_id}")))?;

        if proposal.state != from {
            return Err(OrchestratorError::Conflict(format!(
                "proposal {proposal_id} is {}, expected {from}",
                proposal.state
            )));
        }
        if !from.can_transition(to) {
            return Err(OrchestratorError::Conflict(format!(
                "illegal proposal transition {from} -> {to}"
            )));
        }

        proposal.state = to;
        if let Some(report) = report {
            proposal.validation_report = Some(report.clone());
        }
        if let Some(reason) = reason {
            proposal.review_reason = Some(reason.to_string());
        }
        if to.is_terminal() {
            proposal.decided_at = Some(Utc::now());
        }
        Ok(proposal.clone())
    }

    async fn apply_proposal_ops(
        &self,
        proposal: &Proposal,
        actor: DecisionActor,
    ) -> OrchestratorResult<Delta> {
        let mut state = self.lock();

        let stored_state = state
            .proposals
            .iter()
            .find(|p| p.id == proposal.id)
            .map(|p| p.state)
            .ok_or_else(|| OrchestratorError::Fatal(format!("unknown proposal {}", proposal.id)))?;
        if stored_state != ProposalState::Approved {
            return Err(OrchestratorError::Conflict(format!(
                "proposal {} is {stored_state}, only APPROVED proposals commit",
                proposal.id
            )));
        }

        // Scratch tables: either every op lands or none do.
        let mut blocks = state.blocks.clone();
        let mut items = state.items.clone();
        let mut relationships = state.relationships.clone();
        let mut revisions = state.revisions.clone();

        let mut changes = Vec::new();
        for op in &proposal.ops {
            let op_changes = apply_op(
                op,
                proposal,
                actor,
                &mut blocks,
                &mut items,
                &mut relationships,
                &mut revisions,
            )?;
            changes.extend(op_changes);
        }

        let delta = Delta::new(
            proposal.basket_id,
            Some(proposal.id),
            format!("{} ops committed", proposal.ops.len()),
            changes,
        );

        state.blocks = blocks;
        state.items = items;
        state.relationships = relationships;
        state.revisions = revisions;
        state.deltas.push(delta.clone());

        if let Some(stored) = state.proposals.iter_mut().find(|p| p.id == proposal.id) {
            stored.state = ProposalState::Committed;
            stored.decided_at = Some(Utc::now());
        }

        Ok(delta)
    }

    async fn fetch_block(&self, block_id: BlockId) -> OrchestratorResult<Option<Block>> {
        Ok(self.lock().blocks.iter().find(|b| b.id == block_id).cloned())
    }

    async fn transition_block(
        &self,
        block_id: BlockId,
        to: BlockState,
        actor: DecisionActor,
    ) -> OrchestratorResult<Block> {
        let mut state = self.lock();
        let block = state
            .blocks
            .iter_mut()
            .find(|b| b.id == block_id)
            .ok_or_else(|| OrchestratorError::Fatal(format!("unknown block {block_id}")))?;

        if !block.status.can_transition(to, actor.kind) {
            return Err(OrchestratorError::PolicyRejection(format!(
                "transition {} -> {to} not permitted for {:?} actor",
                block.status, actor.kind
            )));
        }
        block.status = to;
        block.updated_at = Utc::now();
        Ok(block.clone())
    }

    async fn update_block_embedding(
        &self,
        block_id: BlockId,
        embedding: Vec<f32>,
        content_hash: &str,
    ) -> OrchestratorResult<()> {
        let mut state = self.lock();
        if let Some(block) = state.blocks.iter_mut().find(|b| b.id == block_id) {
            // Stale backfills (content changed since embedding was computed)
            // are dropped.
            if block.content_hash.as_deref() == Some(content_hash) {
                block.embedding = Some(pgvector::Vector::from(embedding));
            }
        }
        Ok(())
    }

    async fn fetch_revisions(&self, block_id: BlockId) -> OrchestratorResult<Vec<Revision>> {
        Ok(self
            .lock()
            .revisions
            .iter()
            .filter(|r| r.block_id == block_id)
            .cloned()
            .collect())
    }

    async fn fetch_basket_context(
        &self,
        basket_id: BasketId,
    ) -> OrchestratorResult<BasketContext> {
        let state = self.lock();
        let basket = state
            .baskets
            .iter()
            .find(|b| b.id == basket_id)
            .cloned()
            .ok_or_else(|| OrchestratorError::Fatal(format!("unknown basket {basket_id}")))?;

        Ok(BasketContext {
            blocks: state
                .blocks
                .iter()
                .filter(|b| b.basket_id == basket_id && b.status.is_active())
                .cloned()
                .collect(),
            context_items: state
                .items
                .iter()
                .filter(|i| {
                    i.basket_id == basket_id && i.state == ContextItemState::Active
                })
                .cloned()
                .collect(),
            relationships: state
                .relationships
                .iter()
                .filter(|r| r.basket_id == basket_id)
                .cloned()
                .collect(),
            dump_ids: state
                .dumps
                .iter()
                .filter(|d| d.basket_id == basket_id)
                .map(|d| d.id)
                .collect(),
            snapshot_at: Utc::now(),
            basket,
        })
    }

    async fn insert_reflection(&self, artifact: &ReflectionArtifact) -> OrchestratorResult<()> {
        self.lock().reflections.push(artifact.clone());
        Ok(())
    }

    async fn latest_reflection(
        &self,
        basket_id: BasketId,
        kind: ReflectionKind,
    ) -> OrchestratorResult<Option<ReflectionArtifact>> {
        Ok(self
            .lock()
            .reflections
            .iter()
            .filter(|r| r.basket_id == basket_id && r.kind == kind)
            .max_by_key(|r| r.computation_timestamp)
            .cloned())
    }

    async fn upsert_document(
        &self,
        document: &Document,
        references: &[NewSubstrateReference],
    ) -> OrchestratorResult<Document> {
        let mut state = self.lock();
        let stored = match state.documents.iter_mut().find(|d| d.id == document.id) {
            Some(existing) => {
                existing.title = document.title.clone();
                existing.body = document.body.clone();
                existing.composition_mode = document.composition_mode;
                existing.updated_at = Utc::now();
                existing.clone()
            }
            None => {
                state.documents.push(document.clone());
                document.clone()
            }
        };

        state.references.retain(|r| r.document_id != document.id);
        for reference in references {
            state.references.push(SubstrateReference {
                id: Uuid::new_v4(),
                document_id: document.id,
                substrate_type: reference.substrate_type,
                substrate_id: reference.substrate_id,
                role: reference.role.clone(),
                weight: reference.weight,
                created_at: Utc::now(),
            });
        }

        Ok(stored)
    }

    async fn fetch_document(
        &self,
        document_id: DocumentId,
    ) -> OrchestratorResult<Option<Document>> {
        Ok(self.lock().documents.iter().find(|d| d.id == document_id).cloned())
    }

    async fn document_references(
        &self,
        document_id: DocumentId,
    ) -> OrchestratorResult<Vec<SubstrateReference>> {
        Ok(self
            .lock()
            .references
            .iter()
            .filter(|r| r.document_id == document_id)
            .cloned()
            .collect())
    }

    async fn documents_for_basket(
        &self,
        basket_id: BasketId,
    ) -> OrchestratorResult<Vec<Document>> {
        Ok(self
            .lock()
            .documents
            .iter()
            .filter(|d| d.basket_id == basket_id)
            .cloned()
            .collect())
    }
}
