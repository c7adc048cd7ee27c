//! Mandatory proposal validation.
//!
//! Validation runs for every proposal regardless of origin. It is pure: a
//! function of the proposal, a basket context snapshot, precomputed op
//! embeddings, and the effective policy. Same inputs, same report.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::common::BlockId;
use crate::domains::baskets::{cosine_similarity, BasketContext};
use crate::domains::substrate::{BlockState, SubstrateRef, SubstrateType};

use super::ops::Operation;
use super::policy::{self, PolicyDecision, PolicyInput, PolicyTable};
use super::proposal::Proposal;

/// Confidence multiplier applied when near-duplicates are found.
const DEDUP_CONFIDENCE_PENALTY: f32 = 0.75;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpReport {
    pub op_index: usize,
    pub ok: bool,
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(default)]
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DedupHint {
    pub op_index: usize,
    pub existing_block_id: BlockId,
    pub similarity: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationReport {
    pub ok: bool,
    pub op_reports: Vec<OpReport>,
    pub policy_decision: PolicyDecision,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy_reason: Option<String>,
    #[serde(default)]
    pub dedup_hints: Vec<DedupHint>,
    /// Confidence after dedup demotion.
    pub confidence: f32,
}

impl ValidationReport {
    /// Flattened errors for human-readable rejection reasons.
    pub fn error_summary(&self) -> String {
        let mut parts: Vec<String> = Vec::new();
        for report in &self.op_reports {
            for error in &report.errors {
                parts.push(format!("op {}: {}", report.op_index, error));
            }
        }
        if let Some(reason) = &self.policy_reason {
            parts.push(reason.clone());
        }
        parts.join("; ")
    }
}

/// Validate a proposal against a basket context snapshot.
///
/// `op_embeddings` maps op index to the embedding of the candidate block
/// content, for `CreateBlock` ops; missing entries skip semantic dedup for
/// that op.
pub fn validate(
    proposal: &Proposal,
    ctx: &BasketContext,
    op_embeddings: &HashMap<usize, Vec<f32>>,
    policy: &PolicyTable,
    dedup_threshold: f32,
) -> ValidationReport {
    let mut op_reports = Vec::with_capacity(proposal.ops.len());
    let mut dedup_hints = Vec::new();
    let mut touched_states = Vec::new();

    let scope_ok = proposal.basket_id == ctx.basket_id()
        && proposal.workspace_id == ctx.workspace_id();
    let scope_error = if scope_ok {
        None
    } else {
        Some("proposal scope does not match basket".to_string())
    };

    if proposal.ops.is_empty() {
        return ValidationReport {
            ok: false,
            op_reports: vec![],
            policy_decision: PolicyDecision::Reject,
            policy_reason: Some("proposal contains no operations".to_string()),
            dedup_hints: vec![],
            confidence: proposal.confidence,
        };
    }

    for (op_index, op) in proposal.ops.iter().enumerate() {
        let mut report = OpReport { op_index, ok: true, warnings: vec![], errors: vec![] };

        if let Some(error) = &scope_error {
            report.errors.push(error.clone());
        }
        if !ctx.basket.accepts_writes() {
            report.errors.push("basket is archived".to_string());
        }

        check_schema(op, &mut report);
        check_references(op, ctx, &mut report, &mut touched_states);

        if let Operation::CreateBlock { .. } = op {
            if let Some(embedding) = op_embeddings.get(&op_index) {
                for block in &ctx.blocks {
                    let Some(existing) = &block.embedding else { continue };
                    if !block.status.is_active() {
                        continue;
                    }
                    let similarity = cosine_similarity(embedding, &existing.to_vec());
                    if similarity >= dedup_threshold {
                        report.warnings.push(format!(
                            "near-duplicate of block {} (similarity {similarity:.2})",
                            block.id
                        ));
                        dedup_hints.push(DedupHint {
                            op_index,
                            existing_block_id: block.id,
                            similarity,
                        });
                    }
                }
            }
        }

        report.ok = report.errors.is_empty();
        op_reports.push(report);
    }

    let all_ok = op_reports.iter().all(|r| r.ok);
    let confidence = if dedup_hints.is_empty() {
        proposal.confidence
    } else {
        proposal.confidence * DEDUP_CONFIDENCE_PENALTY
    };

    let (policy_decision, policy_reason) = if all_ok {
        policy::decide(
            policy,
            &PolicyInput {
                ops: &proposal.ops,
                origin: proposal.origin,
                confidence,
                touched_states: &touched_states,
                has_dedup_conflict: !dedup_hints.is_empty(),
            },
        )
    } else {
        (PolicyDecision::Reject, Some("validation errors".to_string()))
    };

    ValidationReport {
        ok: all_ok,
        op_reports,
        policy_decision,
        policy_reason,
        dedup_hints,
        confidence,
    }
}

fn check_schema(op: &Operation, report: &mut OpReport) {
    match op {
        Operation::CreateBlock { title, content, confidence, .. } => {
            if title.trim().is_empty() {
                report.errors.push("block title is empty".to_string());
            }
            if content.trim().is_empty() {
                report.errors.push("block content is empty".to_string());
            }
            if !(0.0..=1.0).contains(confidence) {
                report.errors.push(format!("confidence {confidence} outside [0, 1]"));
            }
        }
        Operation::UpdateBlock { patch, from_version, .. } => {
            if patch.is_empty() {
                report.errors.push("update patch is empty".to_string());
            }
            if *from_version < 1 {
                report.errors.push(format!("from_version {from_version} is invalid"));
            }
        }
        Operation::ReviseBlock { content, summary, from_version, .. } => {
            if content.trim().is_empty() {
                report.errors.push("revised content is empty".to_string());
            }
            if summary.trim().is_empty() {
                report.errors.push("revision summary is empty".to_string());
            }
            if *from_version < 1 {
                report.errors.push(format!("from_version {from_version} is invalid"));
            }
        }
        Operation::CreateContextItem { label, .. } => {
            if label.trim().is_empty() {
                report.errors.push("context item label is empty".to_string());
            }
        }
        Operation::MergeBlocks { merged_ids, .. } => {
            if merged_ids.is_empty() {
                report.errors.push("merge lists no blocks to merge".to_string());
            }
        }
        Operation::CreateRelationship { relationship_type, strength, from, to } => {
            if relationship_type.trim().is_empty() {
                report.errors.push("relationship type is empty".to_string());
            }
            if !(0.0..=1.0).contains(strength) {
                report.errors.push(format!("strength {strength} outside [0, 1]"));
            }
            if from == to {
                report.errors.push("relationship endpoints are identical".to_string());
            }
        }
    }
}

fn check_references(
    op: &Operation,
    ctx: &BasketContext,
    report: &mut OpReport,
    touched_states: &mut Vec<BlockState>,
) {
    let mut require_block = |id: BlockId, report: &mut OpReport| -> Option<BlockState> {
        match ctx.block(id) {
            Some(block) => {
                touched_states.push(block.status);
                Some(block.status)
            }
            None => {
                report.errors.push(format!("block {id} does not exist in basket"));
                None
            }
        }
    };

    match op {
        Operation::UpdateBlock { block_id, from_version, .. }
        | Operation::ReviseBlock { block_id, from_version, .. } => {
            if let Some(status) = require_block(*block_id, report) {
                if !status.is_active() {
                    report
                        .errors
                        .push(format!("block {block_id} is {status} and cannot change"));
                }
                if let Some(block) = ctx.block(*block_id) {
                    if block.version != *from_version {
                        report.warnings.push(format!(
                            "from_version {} is stale, block is at {}",
                            from_version, block.version
                        ));
                    }
                }
            }
        }
        Operation::MergeBlocks { primary_id, merged_ids, .. } => {
            require_block(*primary_id, report);
            for merged in merged_ids {
                if let Some(status) = require_block(*merged, report) {
                    // Supersession is only reachable from these states.
                    if !matches!(status, BlockState::Accepted | BlockState::Locked) {
                        report.errors.push(format!(
                            "block {merged} is {status} and cannot be superseded"
                        ));
                    }
                }
                if merged == primary_id {
                    report.errors.push("merge target cannot merge into itself".to_string());
                }
            }
        }
        Operation::CreateRelationship { from, to, .. } => {
            check_endpoint(from, ctx, report);
            check_endpoint(to, ctx, report);
        }
        Operation::CreateBlock { .. } | Operation::CreateContextItem { .. } => {}
    }
}

fn check_endpoint(endpoint: &SubstrateRef, ctx: &BasketContext, report: &mut OpReport) {
    let exists = match endpoint.substrate_type {
        SubstrateType::Block => ctx.blocks.iter().any(|b| b.id.into_uuid() == endpoint.id),
        SubstrateType::ContextItem => {
            ctx.context_items.iter().any(|i| i.id.into_uuid() == endpoint.id)
        }
        SubstrateType::Dump => ctx.dump_ids.iter().any(|d| d.into_uuid() == endpoint.id),
    };
    if !exists {
        report.errors.push(format!(
            "{:?} {} does not exist in basket",
            endpoint.substrate_type, endpoint.id
        ));
    }
}
