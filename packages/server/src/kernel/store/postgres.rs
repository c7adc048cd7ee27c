//! Postgres substrate store.
//!
//! Commits run inside a single serializable transaction holding a
//! per-basket advisory lock, so two proposals for the same basket can never
//! interleave op application. Optimistic block versions are enforced by
//! guarded updates (`WHERE version = $from`).

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{PgPool, Postgres, Transaction};
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
use crate::domains::governance::proposal::{
    DecisionActor, Proposal, ProposalOrigin, ProposalState,
};
use crate::domains::governance::validator::ValidationReport;
use crate::domains::reflections::{ReflectionArtifact, ReflectionKind};
use crate::domains::substrate::{Block, BlockDiff, BlockState, ContextItem, Revision};

use super::{RequestBinding, SubstrateStore};

const BLOCK_COLUMNS: &str = r#"id, basket_id, workspace_id, semantic_type, title, content, status,
           version, confidence, provenance, content_hash, embedding, last_validated_at,
           metadata, created_at, updated_at"#;

const PROPOSAL_COLUMNS: &str = r#"id, basket_id, workspace_id, origin, ops, provenance, confidence,
           state, validation_report, review_reason, created_at, decided_at"#;

#[derive(Clone)]
pub struct PostgresSubstrateStore {
    pool: PgPool,
}

impl PostgresSubstrateStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

// ============================================================================
// Proposal row mapping
// ============================================================================

#[derive(sqlx::FromRow)]
struct ProposalRow {
    id: ProposalId,
    basket_id: BasketId,
    workspace_id: WorkspaceId,
    origin: String,
    ops: serde_json::Value,
    provenance: Vec<DumpId>,
    confidence: f32,
    state: ProposalState,
    validation_report: Option<serde_json::Value>,
    review_reason: Option<String>,
    created_at: chrono::DateTime<Utc>,
    decided_at: Option<chrono::DateTime<Utc>>,
}

impl TryFrom<ProposalRow> for Proposal {
    type Error = OrchestratorError;

    fn try_from(row: ProposalRow) -> Result<Self, Self::Error> {
        let origin = ProposalOrigin::parse(&row.origin).ok_or_else(|| {
            OrchestratorError::Fatal(format!("corrupt proposal origin: {}", row.origin))
        })?;
        let validation_report = row
            .validation_report
            .map(|v| serde_json::from_value::<ValidationReport>(v))
            .transpose()?;
        Ok(Proposal {
            id: row.id,
            basket_id: row.basket_id,
            workspace_id: row.workspace_id,
            origin,
            ops: serde_json::from_value(row.ops)?,
            provenance: row.provenance,
            confidence: row.confidence,
            state: row.state,
            validation_report,
            review_reason: row.review_reason,
            created_at: row.created_at,
            decided_at: row.decided_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct DeltaRow {
    delta_id: DeltaId,
    basket_id: BasketId,
    proposal_id: Option<ProposalId>,
    summary: String,
    changes: serde_json::Value,
    created_at: chrono::DateTime<Utc>,
    applied_at: chrono::DateTime<Utc>,
}

impl TryFrom<DeltaRow> for Delta {
    type Error = OrchestratorError;

    fn try_from(row: DeltaRow) -> Result<Self, Self::Error> {
        Ok(Delta {
            delta_id: row.delta_id,
            basket_id: row.basket_id,
            proposal_id: row.proposal_id,
            summary: row.summary,
            changes: serde_json::from_value(row.changes)?,
            created_at: row.created_at,
            applied_at: row.applied_at,
        })
    }
}

// ============================================================================
// Op application inside the commit transaction
// ============================================================================

async fn fetch_block_for_update(
    tx: &mut Transaction<'_, Postgres>,
    block_id: BlockId,
    basket_id: BasketId,
) -> OrchestratorResult<Block> {
    let sql = format!(
        "SELECT {BLOCK_COLUMNS} FROM blocks WHERE id = $1 AND basket_id = $2 FOR UPDATE"
    );
    sqlx::query_as::<_, Block>(&sql)
        .bind(block_id)
        .bind(basket_id)
        .fetch_optional(&mut **tx)
        .await?
        .ok_or_else(|| {
            OrchestratorError::Conflict(format!("block {block_id} does not exist in basket"))
        })
}

async fn insert_revision(
    tx: &mut Transaction<'_, Postgres>,
    block: &Block,
    actor: DecisionActor,
    summary: &str,
    diff: &BlockDiff,
) -> OrchestratorResult<()> {
    sqlx::query(
        r#"
        INSERT INTO block_revisions (id, block_id, workspace_id, actor_id, summary, diff_json)
        VALUES ($1, $2, $3, $4, $5, $6)
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(block.id)
    .bind(block.workspace_id)
    .bind(actor.user_id)
    .bind(summary)
    .bind(serde_json::to_value(diff)?)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Guarded version bump shared by update and revise ops. Returns the new
/// version; a zero-row update means a concurrent commit won the version.
async fn write_block_content(
    tx: &mut Transaction<'_, Postgres>,
    block: &Block,
    from_version: i32,
    title: &str,
    content: &str,
    confidence: Option<f32>,
    metadata: Option<&serde_json::Value>,
) -> OrchestratorResult<i32> {
    let new_hash = content_hash(&Block::embedding_text(title, content));
    let updated = sqlx::query(
        r#"
        UPDATE blocks
        SET title = $3,
            content = $4,
            confidence = COALESCE($5, confidence),
            metadata = COALESCE($6, metadata),
            version = version + 1,
            content_hash = $7,
            embedding = NULL,
            last_validated_at = NOW(),
            updated_at = NOW()
        WHERE id = $1 AND version = $2
        "#,
    )
    .bind(block.id)
    .bind(from_version)
    .bind(title)
    .bind(content)
    .bind(confidence)
    .bind(metadata)
    .bind(&new_hash)
    .execute(&mut **tx)
    .await?
    .rows_affected();

    if updated == 0 {
        return Err(OrchestratorError::Conflict(format!(
            "block {} version moved past {from_version}",
            block.id
        )));
    }
    Ok(from_version + 1)
}

async fn apply_op(
    tx: &mut Transaction<'_, Postgres>,
    op: &Operation,
    proposal: &Proposal,
    actor: DecisionActor,
) -> OrchestratorResult<Vec<DeltaChange>> {
    match op {
        Operation::CreateBlock { title, semantic_type, content, confidence, metadata } => {
            let block_id = BlockId::new();
            let hash = content_hash(&Block::embedding_text(title, content));
            sqlx::query(
                r#"
                INSERT INTO blocks (id, basket_id, workspace_id, semantic_type, title, content,
                                    status, version, confidence, provenance, content_hash, metadata)
                VALUES ($1, $2, $3, $4, $5, $6, 'proposed', 1, $7, $8, $9, $10)
                "#,
            )
            .bind(block_id)
            .bind(proposal.basket_id)
            .bind(proposal.workspace_id)
            .bind(semantic_type)
            .bind(title)
            .bind(content)
            .bind(confidence)
            .bind(&proposal.provenance)
            .bind(&hash)
            .bind(metadata)
            .execute(&mut **tx)
            .await?;
            Ok(vec![DeltaChange::BlockCreated { block_id, version: 1 }])
        }

        Operation::UpdateBlock { block_id, from_version, patch } => {
            let block = fetch_block_for_update(tx, *block_id, proposal.basket_id).await?;
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

            let title = patch.title.clone().unwrap_or_else(|| block.title.clone());
            let content = patch.content.clone().unwrap_or_else(|| block.content.clone());

            let mut diff = BlockDiff::new(block.version, block.version + 1);
            if patch.title.is_some() && title != block.title {
                diff.push_field("title", &block.title, &title);
            }
            if patch.content.is_some() && content != block.content {
                diff.push_field("content", &block.content, &content);
            }
            if let Some(confidence) = patch.confidence {
                diff.push_field(
                    "confidence",
                    &block.confidence.to_string(),
                    &confidence.to_string(),
                );
            }

            let to_version = write_block_content(
                tx,
                &block,
                *from_version,
                &title,
                &content,
                patch.confidence,
                patch.metadata.as_ref(),
            )
            .await?;

            let summary = format!("update v{from_version} -> v{to_version}");
            insert_revision(tx, &block, actor, &summary, &diff).await?;

            Ok(vec![DeltaChange::BlockUpdated {
                block_id: *block_id,
                from_version: *from_version,
                to_version,
            }])
        }

        Operation::ReviseBlock { block_id, from_version, content, summary } => {
            let block = fetch_block_for_update(tx, *block_id, proposal.basket_id).await?;
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

            let title = block.title.clone();
            let to_version =
                write_block_content(tx, &block, *from_version, &title, content, None, None)
                    .await?;
            insert_revision(tx, &block, actor, summary, &diff).await?;

            Ok(vec![DeltaChange::BlockUpdated {
                block_id: *block_id,
                from_version: *from_version,
                to_version,
            }])
        }

        Operation::CreateContextItem { item_type, label, metadata } => {
            let item_id = ContextItemId::new();
            let inserted = sqlx::query(
                r#"
                INSERT INTO context_items (id, basket_id, workspace_id, item_type, label,
                                           label_norm, state, metadata)
                VALUES ($1, $2, $3, $4, $5, $6, 'active', $7)
                ON CONFLICT (basket_id, item_type, label_norm) DO NOTHING
                "#,
            )
            .bind(item_id)
            .bind(proposal.basket_id)
            .bind(proposal.workspace_id)
            .bind(item_type)
            .bind(label)
            .bind(ContextItem::normalized_label(label))
            .bind(metadata)
            .execute(&mut **tx)
            .await?
            .rows_affected();

            if inserted == 0 {
                return Ok(vec![]);
            }
            Ok(vec![DeltaChange::ContextItemCreated { item_id }])
        }

        Operation::MergeBlocks { primary_id, merged_ids, merged_title } => {
            let mut changes = Vec::new();

            for merged_id in merged_ids {
                let block = fetch_block_for_update(tx, *merged_id, proposal.basket_id).await?;
                if !block.status.can_transition(BlockState::Superseded, actor.kind) {
                    return Err(OrchestratorError::Conflict(format!(
                        "block {merged_id} is {} and cannot be superseded",
                        block.status
                    )));
                }
                sqlx::query(
                    "UPDATE blocks SET status = 'superseded', updated_at = NOW() WHERE id = $1",
                )
                .bind(merged_id)
                .execute(&mut **tx)
                .await?;
                changes.push(DeltaChange::BlockSuperseded { block_id: *merged_id });
            }

            let primary = fetch_block_for_update(tx, *primary_id, proposal.basket_id).await?;
            let merged_from: Vec<String> = merged_ids.iter().map(|id| id.to_string()).collect();
            sqlx::query(
                r#"
                UPDATE blocks
                SET title = COALESCE($2, title),
                    version = CASE WHEN $2 IS NULL THEN version ELSE version + 1 END,
                    metadata = jsonb_set(
                        CASE WHEN jsonb_typeof(metadata) = 'object' THEN metadata
                             ELSE '{}'::jsonb END,
                        '{merged_from}', $3),
                    updated_at = NOW()
                WHERE id = $1
                "#,
            )
            .bind(primary.id)
            .bind(merged_title.as_deref())
            .bind(serde_json::json!(merged_from))
            .execute(&mut **tx)
            .await?;

            changes.push(DeltaChange::BlocksMerged {
                primary_id: *primary_id,
                merged_ids: merged_ids.clone(),
            });
            Ok(changes)
        }

        Operation::CreateRelationship { from, to, relationship_type, strength } => {
            let inserted = sqlx::query(
                r#"
                INSERT INTO relationships (id, basket_id, workspace_id, from_type, from_id,
                                           to_type, to_id, relationship_type, strength)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                ON CONFLICT (basket_id, from_type, from_id, to_type, to_id, relationship_type)
                    DO NOTHING
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(proposal.basket_id)
            .bind(proposal.workspace_id)
            .bind(from.substrate_type)
            .bind(from.id)
            .bind(to.substrate_type)
            .bind(to.id)
            .bind(relationship_type)
            .bind(strength)
            .execute(&mut **tx)
            .await?
            .rows_affected();

            if inserted == 0 {
                return Err(OrchestratorError::Conflict(format!(
                    "relationship {relationship_type} already exists between {} and {}",
                    from.id, to.id
                )));
            }
            Ok(vec![DeltaChange::RelationshipCreated {
                from_id: from.id,
                to_id: to.id,
                relationship_type: relationship_type.clone(),
            }])
        }
    }
}

// ============================================================================
// Store implementation
// ============================================================================

#[async_trait]
impl SubstrateStore for PostgresSubstrateStore {
    async fn create_workspace(&self, owner_ref: &str) -> OrchestratorResult<Workspace> {
        let workspace = sqlx::query_as::<_, Workspace>(
            r#"
            INSERT INTO workspaces (id, owner_ref)
            VALUES ($1, $2)
            RETURNING id, owner_ref, created_at
            "#,
        )
        .bind(WorkspaceId::new())
        .bind(owner_ref)
        .fetch_one(&self.pool)
        .await?;
        Ok(workspace)
    }

    async fn create_basket(&self, workspace_id: WorkspaceId) -> OrchestratorResult<Basket> {
        let basket = sqlx::query_as::<_, Basket>(
            r#"
            INSERT INTO baskets (id, workspace_id, status)
            VALUES ($1, $2, 'ACTIVE')
            RETURNING id, workspace_id, status, created_at
            "#,
        )
        .bind(BasketId::new())
        .bind(workspace_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(basket)
    }

    async fn fetch_basket(&self, basket_id: BasketId) -> OrchestratorResult<Option<Basket>> {
        let basket = sqlx::query_as::<_, Basket>(
            "SELECT id, workspace_id, status, created_at FROM baskets WHERE id = $1",
        )
        .bind(basket_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(basket)
    }

    async fn set_basket_status(
        &self,
        basket_id: BasketId,
        status: BasketStatus,
    ) -> OrchestratorResult<()> {
        sqlx::query("UPDATE baskets SET status = $2 WHERE id = $1")
            .bind(basket_id)
            .bind(status)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn fetch_policy_overrides(
        &self,
        basket_id: BasketId,
    ) -> OrchestratorResult<PolicyOverrides> {
        let overrides: Option<(serde_json::Value,)> =
            sqlx::query_as("SELECT overrides FROM basket_policies WHERE basket_id = $1")
                .bind(basket_id)
                .fetch_optional(&self.pool)
                .await?;
        match overrides {
            Some((value,)) => Ok(serde_json::from_value(value)?),
            None => Ok(PolicyOverrides::default()),
        }
    }

    async fn set_policy_overrides(
        &self,
        basket_id: BasketId,
        overrides: &PolicyOverrides,
    ) -> OrchestratorResult<()> {
        sqlx::query(
            r#"
            INSERT INTO basket_policies (basket_id, overrides)
            VALUES ($1, $2)
            ON CONFLICT (basket_id) DO UPDATE SET overrides = EXCLUDED.overrides
            "#,
        )
        .bind(basket_id)
        .bind(serde_json::to_value(overrides)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn insert_dump(&self, dump: NewDump) -> OrchestratorResult<RawDump> {
        let row = sqlx::query_as::<_, RawDump>(
            r#"
            INSERT INTO raw_dumps (id, basket_id, workspace_id, body_text, source_meta,
                                   ingest_trace_id)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING id, basket_id, workspace_id, body_text, source_meta, ingest_trace_id,
                      created_at
            "#,
        )
        .bind(dump.id)
        .bind(dump.basket_id)
        .bind(dump.workspace_id)
        .bind(&dump.body_text)
        .bind(&dump.source_meta)
        .bind(&dump.ingest_trace_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row)
    }

    async fn fetch_dump(&self, dump_id: DumpId) -> OrchestratorResult<Option<RawDump>> {
        let dump = sqlx::query_as::<_, RawDump>(
            r#"SELECT id, basket_id, workspace_id, body_text, source_meta, ingest_trace_id,
                      created_at
               FROM raw_dumps WHERE id = $1"#,
        )
        .bind(dump_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(dump)
    }

    async fn insert_delta(&self, delta: &Delta) -> OrchestratorResult<()> {
        sqlx::query(
            r#"
            INSERT INTO basket_deltas (delta_id, basket_id, proposal_id, summary, changes,
                                       created_at, applied_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(delta.delta_id)
        .bind(delta.basket_id)
        .bind(delta.proposal_id)
        .bind(&delta.summary)
        .bind(serde_json::to_value(&delta.changes)?)
        .bind(delta.created_at)
        .bind(delta.applied_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn fetch_delta(&self, delta_id: DeltaId) -> OrchestratorResult<Option<Delta>> {
        let row = sqlx::query_as::<_, DeltaRow>(
            r#"SELECT delta_id, basket_id, proposal_id, summary, changes, created_at, applied_at
               FROM basket_deltas WHERE delta_id = $1"#,
        )
        .bind(delta_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Delta::try_from).transpose()
    }

    async fn claim_request(&self, request_id: &str) -> OrchestratorResult<bool> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO idempotency_keys (request_id)
            VALUES ($1)
            ON CONFLICT (request_id) DO NOTHING
            "#,
        )
        .bind(request_id)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(inserted == 1)
    }

    async fn bind_request(
        &self,
        request_id: &str,
        proposal_id: Option<ProposalId>,
        delta_id: Option<DeltaId>,
    ) -> OrchestratorResult<()> {
        sqlx::query(
            r#"
            UPDATE idempotency_keys
            SET proposal_id = COALESCE($2, proposal_id),
                delta_id = COALESCE($3, delta_id)
            WHERE request_id = $1
            "#,
        )
        .bind(request_id)
        .bind(proposal_id)
        .bind(delta_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn lookup_request(
        &self,
        request_id: &str,
    ) -> OrchestratorResult<Option<RequestBinding>> {
        let row: Option<(Option<ProposalId>, Option<DeltaId>)> = sqlx::query_as(
            "SELECT proposal_id, delta_id FROM idempotency_keys WHERE request_id = $1",
        )
        .bind(request_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(proposal_id, delta_id)| RequestBinding { proposal_id, delta_id }))
    }

    async fn insert_proposal(&self, proposal: &Proposal) -> OrchestratorResult<()> {
        sqlx::query(
            r#"
            INSERT INTO proposals (id, basket_id, workspace_id, origin, ops, provenance,
                                   confidence, state, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(proposal.id)
        .bind(proposal.basket_id)
        .bind(proposal.workspace_id)
        .bind(proposal.origin.as_string())
        .bind(serde_json::to_value(&proposal.ops)?)
        .bind(&proposal.provenance)
        .bind(proposal.confidence)
        .bind(proposal.state)
        .bind(proposal.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn fetch_proposal(
        &self,
        proposal_id: ProposalId,
    ) -> OrchestratorResult<Option<Proposal>> {
        let sql = format!("SELECT {PROPOSAL_COLUMNS} FROM proposals WHERE id = $1");
        let row = sqlx::query_as::<_, ProposalRow>(&sql)
            .bind(proposal_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Proposal::try_from).transpose()
    }

    async fn transition_proposal(
        &self,
        proposal_id: ProposalId,
        from: ProposalState,
        to: ProposalState,
        report: Option<&ValidationReport>,
        reason: Option<&str>,
    ) -> OrchestratorResult<Proposal> {
        if !from.can_transition(to) {
            return Err(OrchestratorError::Conflict(format!(
                "illegal proposal transition {from} -> {to}"
            )));
        }

        let report_json = report.map(serde_json::to_value).transpose()?;
        let sql = format!(
            r#"
            UPDATE proposals
            SET state = $3,
                validation_report = COALESCE($4, validation_report),
                review_reason = COALESCE($5, review_reason),
                decided_at = CASE WHEN $6 THEN NOW() ELSE decided_at END
            WHERE id = $1 AND state = $2
            RETURNING {PROPOSAL_COLUMNS}
            "#
        );

        let row = sqlx::query_as::<_, ProposalRow>(&sql)
            .bind(proposal_id)
            .bind(from)
            .bind(to)
            .bind(report_json)
            .bind(reason)
            .bind(to.is_terminal())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| {
                OrchestratorError::Conflict(format!(
                    "proposal {proposal_id} is not in state {from}"
                ))
            })?;

        Proposal::try_from(row)
    }

    async fn apply_proposal_ops(
        &self,
        proposal: &Proposal,
        actor: DecisionActor,
    ) -> OrchestratorResult<Delta> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
            .execute(&mut *tx)
            .await?;

        // Commits to one basket are serialized; other baskets proceed.
        sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1::text, 0))")
            .bind(proposal.basket_id.to_string())
            .execute(&mut *tx)
            .await?;

        let stored_state: Option<(ProposalState,)> =
            sqlx::query_as("SELECT state FROM proposals WHERE id = $1 FOR UPDATE")
                .bind(proposal.id)
                .fetch_optional(&mut *tx)
                .await?;
        match stored_state {
            Some((ProposalState::Approved,)) => {}
            Some((state,)) => {
                return Err(OrchestratorError::Conflict(format!(
                    "proposal {} is {state}, only APPROVED proposals commit",
                    proposal.id
                )));
            }
            None => {
                return Err(OrchestratorError::Fatal(format!(
                    "unknown proposal {}",
                    proposal.id
                )));
            }
        }

        let mut changes = Vec::new();
        for op in &proposal.ops {
            let op_changes = apply_op(&mut tx, op, proposal, actor).await?;
            changes.extend(op_changes);
        }

        let delta = Delta::new(
            proposal.basket_id,
            Some(proposal.id),
            format!("{} ops committed", proposal.ops.len()),
            changes,
        );

        sqlx::query(
            r#"
            INSERT INTO basket_deltas (delta_id, basket_id, proposal_id, summary, changes,
                                       created_at, applied_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(delta.delta_id)
        .bind(delta.basket_id)
        .bind(delta.proposal_id)
        .bind(&delta.summary)
        .bind(serde_json::to_value(&delta.changes)?)
        .bind(delta.created_at)
        .bind(delta.applied_at)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "UPDATE proposals SET state = 'COMMITTED', decided_at = NOW() WHERE id = $1",
        )
        .bind(proposal.id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(delta)
    }

    async fn fetch_block(&self, block_id: BlockId) -> OrchestratorResult<Option<Block>> {
        let sql = format!("SELECT {BLOCK_COLUMNS} FROM blocks WHERE id = $1");
        let block = sqlx::query_as::<_, Block>(&sql)
            .bind(block_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(block)
    }

    async fn transition_block(
        &self,
        block_id: BlockId,
        to: BlockState,
        actor: DecisionActor,
    ) -> OrchestratorResult<Block> {
        let mut tx = self.pool.begin().await?;
        let sql = format!("SELECT {BLOCK_COLUMNS} FROM blocks WHERE id = $1 FOR UPDATE");
        let block = sqlx::query_as::<_, Block>(&sql)
            .bind(block_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| OrchestratorError::Fatal(format!("unknown block {block_id}")))?;

        if !block.status.can_transition(to, actor.kind) {
            return Err(OrchestratorError::PolicyRejection(format!(
                "transition {} -> {to} not permitted for {:?} actor",
                block.status, actor.kind
            )));
        }

        let sql = format!(
            "UPDATE blocks SET status = $2, updated_at = NOW() WHERE id = $1
             RETURNING {BLOCK_COLUMNS}"
        );
        let updated = sqlx::query_as::<_, Block>(&sql)
            .bind(block_id)
            .bind(to)
            .fetch_one(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(updated)
    }

    async fn update_block_embedding(
        &self,
        block_id: BlockId,
        embedding: Vec<f32>,
        content_hash: &str,
    ) -> OrchestratorResult<()> {
        // Guarded by the stored hash so stale backfills are dropped.
        sqlx::query(
            "UPDATE blocks SET embedding = $2 WHERE id = $1 AND content_hash = $3",
        )
        .bind(block_id)
        .bind(pgvector::Vector::from(embedding))
        .bind(content_hash)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn fetch_revisions(&self, block_id: BlockId) -> OrchestratorResult<Vec<Revision>> {
        let revisions = sqlx::query_as::<_, Revision>(
            r#"SELECT id, block_id, workspace_id, actor_id, summary, diff_json, created_at
               FROM block_revisions WHERE block_id = $1 ORDER BY created_at ASC"#,
        )
        .bind(block_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(revisions)
    }

    async fn fetch_basket_context(
        &self,
        basket_id: BasketId,
    ) -> OrchestratorResult<BasketContext> {
        let basket = self
            .fetch_basket(basket_id)
            .await?
            .ok_or_else(|| OrchestratorError::Fatal(format!("unknown basket {basket_id}")))?;

        let sql = format!(
            r#"SELECT {BLOCK_COLUMNS} FROM blocks
               WHERE basket_id = $1 AND status NOT IN ('rejected', 'superseded')
               ORDER BY created_at ASC"#
        );
        let blocks = sqlx::query_as::<_, Block>(&sql)
            .bind(basket_id)
            .fetch_all(&self.pool)
            .await?;

        let context_items = sqlx::query_as::<_, ContextItem>(
            r#"SELECT id, basket_id, workspace_id, item_type, label, state, metadata, created_at
               FROM context_items
               WHERE basket_id = $1 AND state = 'active'
               ORDER BY created_at ASC"#,
        )
        .bind(basket_id)
        .fetch_all(&self.pool)
        .await?;

        let relationships = sqlx::query_as::<_, crate::domains::substrate::Relationship>(
            r#"SELECT id, basket_id, workspace_id, from_type, from_id, to_type, to_id,
                      relationship_type, strength, created_at
               FROM relationships WHERE basket_id = $1"#,
        )
        .bind(basket_id)
        .fetch_all(&self.pool)
        .await?;

        let dump_ids: Vec<DumpId> =
            sqlx::query_scalar("SELECT id FROM raw_dumps WHERE basket_id = $1 ORDER BY created_at")
                .bind(basket_id)
                .fetch_all(&self.pool)
                .await?;

        Ok(BasketContext {
            basket,
            blocks,
            context_items,
            relationships,
            dump_ids,
            snapshot_at: Utc::now(),
        })
    }

    async fn insert_reflection(&self, artifact: &ReflectionArtifact) -> OrchestratorResult<()> {
        sqlx::query(
            r#"
            INSERT INTO reflections (id, basket_id, workspace_id, kind, body, substrate_window,
                                     meta_derived_from, computation_timestamp)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(artifact.id)
        .bind(artifact.basket_id)
        .bind(artifact.workspace_id)
        .bind(artifact.kind)
        .bind(&artifact.body)
        .bind(&artifact.substrate_window)
        .bind(&artifact.meta_derived_from)
        .bind(artifact.computation_timestamp)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn latest_reflection(
        &self,
        basket_id: BasketId,
        kind: ReflectionKind,
    ) -> OrchestratorResult<Option<ReflectionArtifact>> {
        let artifact = sqlx::query_as::<_, ReflectionArtifact>(
            r#"SELECT id, basket_id, workspace_id, kind, body, substrate_window,
                      meta_derived_from, computation_timestamp
               FROM reflections
               WHERE basket_id = $1 AND kind = $2
               ORDER BY computation_timestamp DESC
               LIMIT 1"#,
        )
        .bind(basket_id)
        .bind(kind)
        .fetch_optional(&self.pool)
        .await?;
        Ok(artifact)
    }

    async fn upsert_document(
        &self,
        document: &Document,
        references: &[NewSubstrateReference],
    ) -> OrchestratorResult<Document> {
        let mut tx = self.pool.begin().await?;

        let stored = sqlx::query_as::<_, Document>(
            r#"
            INSERT INTO documents (id, basket_id, workspace_id, title, body, composition_mode)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (id) DO UPDATE SET
                title = EXCLUDED.title,
                body = EXCLUDED.body,
                composition_mode = EXCLUDED.composition_mode,
                updated_at = NOW()
            RETURNING id, basket_id, workspace_id, title, body, composition_mode, created_at,
                      updated_at
            "#,
        )
        .bind(document.id)
        .bind(document.basket_id)
        .bind(document.workspace_id)
        .bind(&document.title)
        .bind(&document.body)
        .bind(document.composition_mode)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM substrate_references WHERE document_id = $1")
            .bind(document.id)
            .execute(&mut *tx)
            .await?;

        for reference in references {
            sqlx::query(
                r#"
                INSERT INTO substrate_references (id, document_id, substrate_type, substrate_id,
                                                  role, weight)
                VALUES ($1, $2, $3, $4, $5, $6)
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(document.id)
            .bind(reference.substrate_type)
            .bind(reference.substrate_id)
            .bind(&reference.role)
            .bind(reference.weight)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(stored)
    }

    async fn fetch_document(
        &self,
        document_id: DocumentId,
    ) -> OrchestratorResult<Option<Document>> {
        let document = sqlx::query_as::<_, Document>(
            r#"SELECT id, basket_id, workspace_id, title, body, composition_mode, created_at,
                      updated_at
               FROM documents WHERE id = $1"#,
        )
        .bind(document_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(document)
    }

    async fn document_references(
        &self,
        document_id: DocumentId,
    ) -> OrchestratorResult<Vec<SubstrateReference>> {
        let references = sqlx::query_as::<_, SubstrateReference>(
            r#"SELECT id, document_id, substrate_type, substrate_id, role, weight, created_at
               FROM substrate_references WHERE document_id = $1"#,
        )
        .bind(document_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(references)
    }

    async fn documents_for_basket(
        &self,
        basket_id: BasketId,
    ) -> OrchestratorResult<Vec<Document>> {
        let documents = sqlx::query_as::<_, Document>(
            r#"SELECT id, basket_id, workspace_id, title, body, composition_mode, created_at,
                      updated_at
               FROM documents WHERE basket_id = $1 ORDER BY created_at ASC"#,
        )
        .bind(basket_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(documents)
    }
}
