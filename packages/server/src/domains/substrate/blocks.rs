//! Block model and lifecycle state machine.
//!
//! Blocks are the core substrate unit. They are only ever created through
//! committed proposals (in `Proposed` status) and promoted by human action.
//! `Constant`, `Rejected`, and `Superseded` are terminal.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::common::{BasketId, BlockId, DumpId, WorkspaceId};

// ============================================================================
// Enums
// ============================================================================

/// Semantic classification of a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "semantic_type", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SemanticType {
    Goal,
    Constraint,
    Finding,
    Insight,
    Entity,
    Metric,
    Question,
    Reference,
}

impl SemanticType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SemanticType::Goal => "goal",
            SemanticType::Constraint => "constraint",
            SemanticType::Finding => "finding",
            SemanticType::Insight => "insight",
            SemanticType::Entity => "entity",
            SemanticType::Metric => "metric",
            SemanticType::Question => "question",
            SemanticType::Reference => "reference",
        }
    }
}

impl std::fmt::Display for SemanticType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who is performing an action on a block. Agents can only ever produce
/// `Proposed` blocks or propose supersession; promotion is human-only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorKind {
    Human,
    Agent,
}

/// Block lifecycle states.
///
/// ```text
/// PROPOSED → ACCEPTED → LOCKED → CONSTANT
///     ↓         ↓          ↓
///  REJECTED  SUPERSEDED  SUPERSEDED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "block_state", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum BlockState {
    #[default]
    Proposed,
    Accepted,
    Locked,
    Constant,
    Rejected,
    Superseded,
}

impl BlockState {
    /// Terminal states never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, BlockState::Constant | BlockState::Rejected | BlockState::Superseded)
    }

    /// States counted as live substrate for context and dedup.
    pub fn is_active(&self) -> bool {
        !matches!(self, BlockState::Rejected | BlockState::Superseded)
    }

    /// Whether `actor` may move a block from `self` to `to`.
    pub fn can_transition(self, to: BlockState, actor: ActorKind) -> bool {
        use BlockState::*;

        let edge_exists = matches!(
            (self, to),
            (Proposed, Accepted)
                | (Proposed, Rejected)
                | (Accepted, Locked)
                | (Accepted, Superseded)
                | (Locked, Constant)
                | (Locked, Superseded)
        );
        if !edge_exists {
            return false;
        }

        match to {
            // Promotion and rejection are human decisions.
            Accepted | Locked | Constant | Rejected => actor == ActorKind::Human,
            // Supersession may be proposed by agents (merges) or humans.
            Superseded => true,
            Proposed => false,
        }
    }

    /// Whether `actor` may edit block content in this state.
    pub fn content_editable_by(self, actor: ActorKind) -> bool {
        match self {
            BlockState::Proposed => true,
            BlockState::Accepted => actor == ActorKind::Human,
            _ => false,
        }
    }
}

impl std::fmt::Display for BlockState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BlockState::Proposed => "proposed",
            BlockState::Accepted => "accepted",
            BlockState::Locked => "locked",
            BlockState::Constant => "constant",
            BlockState::Rejected => "rejected",
            BlockState::Superseded => "superseded",
        };
        f.write_str(s)
    }
}

// ============================================================================
// Model
// ============================================================================

#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct Block {
    pub id: BlockId,
    pub basket_id: BasketId,
    pub workspace_id: WorkspaceId,
    pub semantic_type: SemanticType,
    pub title: String,
    pub content: String,
    pub status: BlockState,
    /// Strictly increasing across committed updates.
    pub version: i32,
    pub confidence: f32,
    /// Dumps this block was derived from. Survives dump access restrictions.
    pub provenance: Vec<DumpId>,
    pub content_hash: Option<String>,
    #[serde(skip)]
    pub embedding: Option<pgvector::Vector>,
    pub last_validated_at: DateTime<Utc>,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Block {
    /// Whether the block's last validation predates the staleness cutoff.
    pub fn is_stale(&self, cutoff: DateTime<Utc>) -> bool {
        self.last_validated_at < cutoff
    }

    /// Text used for embedding and dedup hashing.
    pub fn embedding_text(title: &str, content: &str) -> String {
        format!("{title}\n{content}")
    }
}

/// Patch applied by an `UpdateBlock` op. Absent fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BlockPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl BlockPatch {
    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.content.is_none()
            && self.confidence.is_none()
            && self.metadata.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ActorKind::*;
    use BlockState::*;

    #[test]
    fn promotion_chain_is_human_only() {
        assert!(Proposed.can_transition(Accepted, Human));
        assert!(Accepted.can_transition(Locked, Human));
        assert!(Locked.can_transition(Constant, Human));

        assert!(!Proposed.can_transition(Accepted, Agent));
        assert!(!Accepted.can_transition(Locked, Agent));
        assert!(!Locked.can_transition(Constant, Agent));
    }

    #[test]
    fn agents_may_propose_supersession() {
        assert!(Accepted.can_transition(Superseded, Agent));
        assert!(Locked.can_transition(Superseded, Agent));
    }

    #[test]
    fn terminal_states_never_transition() {
        for from in [Constant, Rejected, Superseded] {
            for to in [Proposed, Accepted, Locked, Constant, Rejected, Superseded] {
                assert!(!from.can_transition(to, Human), "{from:?} -> {to:?}");
                assert!(!from.can_transition(to, Agent), "{from:?} -> {to:?}");
            }
        }
    }

    #[test]
    fn no_skipping_promotion_levels() {
        assert!(!Proposed.can_transition(Locked, Human));
        assert!(!Proposed.can_transition(Constant, Human));
        assert!(!Accepted.can_transition(Constant, Human));
    }

    #[test]
    fn content_edit_rules() {
        assert!(Proposed.content_editable_by(Agent));
        assert!(Proposed.content_editable_by(Human));
        assert!(Accepted.content_editable_by(Human));
        assert!(!Accepted.content_editable_by(Agent));
        assert!(!Locked.content_editable_by(Human));
        assert!(!Constant.content_editable_by(Human));
        assert!(!Rejected.content_editable_by(Human));
    }

    #[test]
    fn empty_patch_detected() {
        assert!(BlockPatch::default().is_empty());
        let patch = BlockPatch { content: Some("new".into()), ..Default::default() };
        assert!(!patch.is_empty());
    }
}
