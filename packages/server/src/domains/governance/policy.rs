//! Governance policy.
//!
//! Policy decides what happens to a validated proposal: auto-approval,
//! manual review, or rejection. The defaults live in configuration, not
//! code; baskets may override individual rules through the policy table.

use serde::{Deserialize, Serialize};

use crate::domains::substrate::BlockState;

use super::ops::{affected_block_count, Operation};
use super::proposal::ProposalOrigin;

/// Outcome of the policy check, persisted in the validation report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PolicyDecision {
    AutoApprove,
    RequireReview,
    Reject,
}

/// Default policy rules, merged with per-basket overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyTable {
    /// Create-only proposals above the confidence threshold auto-approve.
    pub auto_approve_creates: bool,
    pub auto_approve_confidence: f32,
    /// Merges always carry destructive supersession; reviewed by default.
    pub merge_requires_review: bool,
    /// Updates against `LOCKED`/`CONSTANT` blocks are rejected outright.
    pub reject_immutable_updates: bool,
    /// Non-merge updates from human origin may auto-approve.
    pub human_updates_auto_approve: bool,
    /// Budgets above which proposals always require review.
    pub max_ops_for_auto: usize,
    pub max_blocks_for_auto: usize,
}

impl Default for PolicyTable {
    fn default() -> Self {
        Self {
            auto_approve_creates: true,
            auto_approve_confidence: 0.85,
            merge_requires_review: true,
            reject_immutable_updates: true,
            human_updates_auto_approve: false,
            max_ops_for_auto: 20,
            max_blocks_for_auto: 10,
        }
    }
}

/// Per-basket overrides stored in the policy table. Absent fields fall
/// back to the defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyOverrides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_approve_creates: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_approve_confidence: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merge_requires_review: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub human_updates_auto_approve: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_ops_for_auto: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_blocks_for_auto: Option<usize>,
}

impl PolicyTable {
    /// Merge basket overrides over the defaults.
    pub fn merged(&self, overrides: &PolicyOverrides) -> PolicyTable {
        PolicyTable {
            auto_approve_creates: overrides
                .auto_approve_creates
                .unwrap_or(self.auto_approve_creates),
            auto_approve_confidence: overrides
                .auto_approve_confidence
                .unwrap_or(self.auto_approve_confidence),
            merge_requires_review: overrides
                .merge_requires_review
                .unwrap_or(self.merge_requires_review),
            reject_immutable_updates: self.reject_immutable_updates,
            human_updates_auto_approve: overrides
                .human_updates_auto_approve
                .unwrap_or(self.human_updates_auto_approve),
            max_ops_for_auto: overrides.max_ops_for_auto.unwrap_or(self.max_ops_for_auto),
            max_blocks_for_auto: overrides
                .max_blocks_for_auto
                .unwrap_or(self.max_blocks_for_auto),
        }
    }
}

/// Facts the policy check needs, precomputed by the validator.
#[derive(Debug, Clone)]
pub struct PolicyInput<'a> {
    pub ops: &'a [Operation],
    pub origin: ProposalOrigin,
    pub confidence: f32,
    /// States of every existing block the ops touch.
    pub touched_states: &'a [BlockState],
    pub has_dedup_conflict: bool,
}

/// Apply the policy table to a validated proposal.
pub fn decide(policy: &PolicyTable, input: &PolicyInput<'_>) -> (PolicyDecision, Option<String>) {
    if policy.reject_immutable_updates
        && input
            .touched_states
            .iter()
            .any(|s| matches!(s, BlockState::Locked | BlockState::Constant))
    {
        return (
            PolicyDecision::Reject,
            Some("operation touches a locked or constant block".to_string()),
        );
    }

    if policy.merge_requires_review
        && input.ops.iter().any(|op| matches!(op, Operation::MergeBlocks { .. }))
    {
        return (
            PolicyDecision::RequireReview,
            Some("merges always require manual review".to_string()),
        );
    }

    if input.ops.len() > policy.max_ops_for_auto {
        return (
            PolicyDecision::RequireReview,
            Some(format!(
                "proposal has {} ops, budget for auto-approval is {}",
                input.ops.len(),
                policy.max_ops_for_auto
            )),
        );
    }

    let affected = affected_block_count(input.ops);
    if affected > policy.max_blocks_for_auto {
        return (
            PolicyDecision::RequireReview,
            Some(format!(
                "proposal affects {} blocks, budget for auto-approval is {}",
                affected, policy.max_blocks_for_auto
            )),
        );
    }

    if input.has_dedup_conflict {
        return (
            PolicyDecision::RequireReview,
            Some("near-duplicate blocks detected".to_string()),
        );
    }

    let creates_only = input.ops.iter().all(|op| {
        matches!(
            op,
            Operation::CreateBlock { .. }
                | Operation::CreateContextItem { .. }
                | Operation::CreateRelationship { .. }
        )
    });

    if creates_only {
        if policy.auto_approve_creates && input.confidence >= policy.auto_approve_confidence {
            return (PolicyDecision::AutoApprove, None);
        }
        return (
            PolicyDecision::RequireReview,
            Some(format!(
                "confidence {:.2} below auto-approval threshold {:.2}",
                input.confidence, policy.auto_approve_confidence
            )),
        );
    }

    if input.origin == ProposalOrigin::Human && policy.human_updates_auto_approve {
        return (PolicyDecision::AutoApprove, None);
    }

    (
        PolicyDecision::RequireReview,
        Some("updates to existing substrate require review".to_string()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domains::substrate::{BlockPatch, SemanticType};
    use crate::common::BlockId;
    use crate::domains::pipeline::agents::AgentKind;

    fn create_op(confidence: f32) -> Operation {
        Operation::CreateBlock {
            title: "Reduce MTTR".into(),
            semantic_type: SemanticType::Goal,
            content: "Reduce MTTR below 10 minutes.".into(),
            confidence,
            metadata: serde_json::Value::Null,
        }
    }

    fn update_op() -> Operation {
        Operation::UpdateBlock {
            block_id: BlockId::new(),
            from_version: 1,
            patch: BlockPatch { content: Some("new".into()), ..Default::default() },
        }
    }

    fn agent_origin() -> ProposalOrigin {
        ProposalOrigin::Agent(AgentKind::P1Substrate)
    }

    #[test]
    fn confident_creates_auto_approve() {
        let ops = vec![create_op(0.9)];
        let input = PolicyInput {
            ops: &ops,
            origin: agent_origin(),
            confidence: 0.9,
            touched_states: &[],
            has_dedup_conflict: false,
        };
        let (decision, _) = decide(&PolicyTable::default(), &input);
        assert_eq!(decision, PolicyDecision::AutoApprove);
    }

    #[test]
    fn low_confidence_creates_require_review() {
        let ops = vec![create_op(0.5)];
        let input = PolicyInput {
            ops: &ops,
            origin: agent_origin(),
            confidence: 0.5,
            touched_states: &[],
            has_dedup_conflict: false,
        };
        let (decision, reason) = decide(&PolicyTable::default(), &input);
        assert_eq!(decision, PolicyDecision::RequireReview);
        assert!(reason.unwrap().contains("threshold"));
    }

    #[test]
    fn dedup_conflict_demotes_to_review() {
        let ops = vec![create_op(0.95)];
        let input = PolicyInput {
            ops: &ops,
            origin: agent_origin(),
            confidence: 0.95,
            touched_states: &[],
            has_dedup_conflict: true,
        };
        let (decision, _) = decide(&PolicyTable::default(), &input);
        assert_eq!(decision, PolicyDecision::RequireReview);
    }

    #[test]
    fn merges_always_require_review() {
        let ops = vec![Operation::MergeBlocks {
            primary_id: BlockId::new(),
            merged_ids: vec![BlockId::new()],
            merged_title: None,
        }];
        let input = PolicyInput {
            ops: &ops,
            origin: ProposalOrigin::Human,
            confidence: 1.0,
            touched_states: &[BlockState::Accepted, BlockState::Accepted],
            has_dedup_conflict: false,
        };
        let (decision, _) = decide(&PolicyTable::default(), &input);
        assert_eq!(decision, PolicyDecision::RequireReview);
    }

    #[test]
    fn locked_block_update_is_rejected() {
        let ops = vec![update_op()];
        let input = PolicyInput {
            ops: &ops,
            origin: agent_origin(),
            confidence: 0.99,
            touched_states: &[BlockState::Locked],
            has_dedup_conflict: false,
        };
        let (decision, reason) = decide(&PolicyTable::default(), &input);
        assert_eq!(decision, PolicyDecision::Reject);
        assert!(reason.unwrap().contains("locked"));
    }

    #[test]
    fn op_budget_forces_review() {
        let ops: Vec<Operation> = (0..25).map(|_| create_op(0.99)).collect();
        let input = PolicyInput {
            ops: &ops,
            origin: agent_origin(),
            confidence: 0.99,
            touched_states: &[],
            has_dedup_conflict: false,
        };
        let (decision, _) = decide(&PolicyTable::default(), &input);
        assert_eq!(decision, PolicyDecision::RequireReview);
    }

    #[test]
    fn overrides_merge_over_defaults() {
        let overrides = PolicyOverrides {
            auto_approve_confidence: Some(0.5),
            ..Default::default()
        };
        let merged = PolicyTable::default().merged(&overrides);
        assert_eq!(merged.auto_approve_confidence, 0.5);
        assert!(merged.merge_requires_review);
    }
}
