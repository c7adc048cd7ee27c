//! Substrate store seam.
//!
//! The orchestrator core talks to durable state through this trait only.
//! `PostgresSubstrateStore` is the production implementation;
//! `MemorySubstrateStore` backs tests and mirrors every guarantee the
//! Postgres store makes (per-basket commit serialization, optimistic
//! versions, idempotency keys).

pub mod memory;
pub mod postgres;

use async_trait::async_trait;

use crate::common::{
    BasketId, BlockId, DeltaId, DocumentId, DumpId, OrchestratorResult, ProposalId, WorkspaceId,
};
use crate::domains::baskets::{Basket, BasketContext, BasketStatus, Workspace};
use crate::domains::documents::{Document, NewSubstrateReference, SubstrateReference};
use crate::domains::dumps::{NewDump, RawDump};
use crate::domains::governance::delta::Delta;
use crate::domains::governance::policy::PolicyOverrides;
use crate::domains::governance::proposal::{DecisionActor, Proposal, ProposalState};
use crate::domains::governance::validator::ValidationReport;
use crate::domains::reflections::{ReflectionArtifact, ReflectionKind};
use crate::domains::substrate::{Block, BlockState, Revision};

pub use memory::MemorySubstrateStore;
pub use postgres::PostgresSubstrateStore;

/// What a previously seen request id produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestBinding {
    pub proposal_id: Option<ProposalId>,
    pub delta_id: Option<DeltaId>,
}

#[async_trait]
pub trait SubstrateStore: Send + Sync {
    // ------------------------------------------------------------------
    // Workspaces and baskets
    // ------------------------------------------------------------------

    async fn create_workspace(&self, owner_ref: &str) -> OrchestratorResult<Workspace>;

    async fn create_basket(&self, workspace_id: WorkspaceId) -> OrchestratorResult<Basket>;

    async fn fetch_basket(&self, basket_id: BasketId) -> OrchestratorResult<Option<Basket>>;

    async fn set_basket_status(
        &self,
        basket_id: BasketId,
        status: BasketStatus,
    ) -> OrchestratorResult<()>;

    async fn fetch_policy_overrides(
        &self,
        basket_id: BasketId,
    ) -> OrchestratorResult<PolicyOverrides>;

    async fn set_policy_overrides(
        &self,
        basket_id: BasketId,
        overrides: &PolicyOverrides,
    ) -> OrchestratorResult<()>;

    // ------------------------------------------------------------------
    // Dumps
    // ------------------------------------------------------------------

    async fn insert_dump(&self, dump: NewDump) -> OrchestratorResult<RawDump>;

    async fn fetch_dump(&self, dump_id: DumpId) -> OrchestratorResult<Option<RawDump>>;

    // ------------------------------------------------------------------
    // Idempotency and deltas
    // ------------------------------------------------------------------

    async fn insert_delta(&self, delta: &Delta) -> OrchestratorResult<()>;

    async fn fetch_delta(&self, delta_id: DeltaId) -> OrchestratorResult<Option<Delta>>;

    /// Claim a request id before planning any work. Returns `true` if this
    /// caller won the claim; `false` means the request was seen before and
    /// [`SubstrateStore::lookup_request`] returns what it produced.
    async fn claim_request(&self, request_id: &str) -> OrchestratorResult<bool>;

    /// Bind the proposal and/or delta a claimed request produced. Non-null
    /// values only ever overwrite nulls.
    async fn bind_request(
        &self,
        request_id: &str,
        proposal_id: Option<ProposalId>,
        delta_id: Option<DeltaId>,
    ) -> OrchestratorResult<()>;

    async fn lookup_request(
        &self,
        request_id: &str,
    ) -> OrchestratorResult<Option<RequestBinding>>;

    // ------------------------------------------------------------------
    // Proposals
    // ------------------------------------------------------------------

    async fn insert_proposal(&self, proposal: &Proposal) -> OrchestratorResult<()>;

    async fn fetch_proposal(
        &self,
        proposal_id: ProposalId,
    ) -> OrchestratorResult<Option<Proposal>>;

    /// Guarded FSM transition. Fails with `Conflict` when the stored state
    /// is not `from` or the transition is illegal. Ops of terminal
    /// proposals are immutable; only state, report, and decision metadata
    /// ever change.
    async fn transition_proposal(
        &self,
        proposal_id: ProposalId,
        from: ProposalState,
        to: ProposalState,
        report: Option<&ValidationReport>,
        reason: Option<&str>,
    ) -> OrchestratorResult<Proposal>;

    /// Apply all ops of an approved proposal atomically: blocks, items,
    /// relationships, revisions, the delta row, and the
    /// `APPROVED → COMMITTED` flip happen in one transaction under the
    /// per-basket commit lock. On any op failure nothing is applied and
    /// the error is returned (`Conflict` for version/uniqueness clashes).
    async fn apply_proposal_ops(
        &self,
        proposal: &Proposal,
        actor: DecisionActor,
    ) -> OrchestratorResult<Delta>;

    // ------------------------------------------------------------------
    // Blocks
    // ------------------------------------------------------------------

    async fn fetch_block(&self, block_id: BlockId) -> OrchestratorResult<Option<Block>>;

    /// Direct lifecycle transition (accept/lock/etc.) by a user action,
    /// outside the proposal path. Enforces `BlockState::can_transition`.
    async fn transition_block(
        &self,
        block_id: BlockId,
        to: BlockState,
        actor: DecisionActor,
    ) -> OrchestratorResult<Block>;

    /// Idempotent post-commit embedding backfill.
    async fn update_block_embedding(
        &self,
        block_id: BlockId,
        embedding: Vec<f32>,
        content_hash: &str,
    ) -> OrchestratorResult<()>;

    async fn fetch_revisions(&self, block_id: BlockId) -> OrchestratorResult<Vec<Revision>>;

    // ------------------------------------------------------------------
    // Context
    // ------------------------------------------------------------------

    /// Read-only snapshot of a basket's live substrate, consistent with
    /// the latest committed proposal.
    async fn fetch_basket_context(
        &self,
        basket_id: BasketId,
    ) -> OrchestratorResult<BasketContext>;

    // ------------------------------------------------------------------
    // Artifacts
    // ------------------------------------------------------------------

    async fn insert_reflection(&self, artifact: &ReflectionArtifact) -> OrchestratorResult<()>;

    async fn latest_reflection(
        &self,
        basket_id: BasketId,
        kind: ReflectionKind,
    ) -> OrchestratorResult<Option<ReflectionArtifact>>;

    /// Dedicated artifact commit path for composition: upsert the document
    /// and replace its substrate references in one transaction.
    async fn upsert_document(
        &self,
        document: &Document,
        references: &[NewSubstrateReference],
    ) -> OrchestratorResult<Document>;

    async fn fetch_document(
        &self,
        document_id: DocumentId,
    ) -> OrchestratorResult<Option<Document>>;

    async fn document_references(
        &self,
        document_id: DocumentId,
    ) -> OrchestratorResult<Vec<SubstrateReference>>;

    async fn documents_for_basket(
        &self,
        basket_id: BasketId,
    ) -> OrchestratorResult<Vec<Document>>;
}
