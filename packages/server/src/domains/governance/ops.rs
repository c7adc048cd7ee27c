//! Typed proposal operations.
//!
//! Operations are the only way substrate changes. They persist as tagged
//! JSON on the proposal row and decode back through this enum at every
//! boundary.

use serde::{Deserialize, Serialize};

use crate::common::BlockId;
use crate::domains::substrate::{BlockPatch, ContextItemType, SemanticType, SubstrateRef};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Operation {
    CreateBlock {
        title: String,
        semantic_type: SemanticType,
        content: String,
        confidence: f32,
        #[serde(default)]
        metadata: serde_json::Value,
    },
    UpdateBlock {
        block_id: BlockId,
        /// Version the op was planned against. Commit aborts on mismatch.
        from_version: i32,
        patch: BlockPatch,
    },
    /// Content rewrite with an explicit human-readable summary; otherwise
    /// an update with the same optimistic-version rules.
    ReviseBlock {
        block_id: BlockId,
        from_version: i32,
        content: String,
        summary: String,
    },
    CreateContextItem {
        item_type: ContextItemType,
        label: String,
        #[serde(default)]
        metadata: serde_json::Value,
    },
    MergeBlocks {
        primary_id: BlockId,
        merged_ids: Vec<BlockId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        merged_title: Option<String>,
    },
    CreateRelationship {
        from: SubstrateRef,
        to: SubstrateRef,
        relationship_type: String,
        strength: f32,
    },
}

impl Operation {
    /// Stable name used in reports and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Operation::CreateBlock { .. } => "create_block",
            Operation::UpdateBlock { .. } => "update_block",
            Operation::ReviseBlock { .. } => "revise_block",
            Operation::CreateContextItem { .. } => "create_context_item",
            Operation::MergeBlocks { .. } => "merge_blocks",
            Operation::CreateRelationship { .. } => "create_relationship",
        }
    }

    /// Whether this op writes to an existing block.
    pub fn touches_block(&self) -> Option<BlockId> {
        match self {
            Operation::UpdateBlock { block_id, .. } | Operation::ReviseBlock { block_id, .. } => {
                Some(*block_id)
            }
            Operation::MergeBlocks { primary_id, .. } => Some(*primary_id),
            _ => None,
        }
    }

    /// Every block id referenced by this op.
    pub fn referenced_blocks(&self) -> Vec<BlockId> {
        match self {
            Operation::UpdateBlock { block_id, .. } | Operation::ReviseBlock { block_id, .. } => {
                vec![*block_id]
            }
            Operation::MergeBlocks { primary_id, merged_ids, .. } => {
                let mut ids = vec![*primary_id];
                ids.extend(merged_ids.iter().copied());
                ids
            }
            _ => Vec::new(),
        }
    }

    pub fn is_create_block(&self) -> bool {
        matches!(self, Operation::CreateBlock { .. })
    }
}

/// Count distinct blocks affected by a set of ops; creates count as one
/// block each.
pub fn affected_block_count(ops: &[Operation]) -> usize {
    let mut existing: Vec<BlockId> = Vec::new();
    let mut created = 0usize;
    for op in ops {
        if op.is_create_block() {
            created += 1;
        }
        for id in op.referenced_blocks() {
            if !existing.contains(&id) {
                existing.push(id);
            }
        }
    }
    created + existing.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_op() -> Operation {
        Operation::CreateBlock {
            title: "Reduce MTTR".into(),
            semantic_type: SemanticType::Goal,
            content: "Reduce MTTR below 10 minutes.".into(),
            confidence: 0.9,
            metadata: serde_json::Value::Null,
        }
    }

    #[test]
    fn ops_round_trip_through_tagged_json() {
        let op = create_op();
        let json = serde_json::to_value(&op).unwrap();
        assert_eq!(json["type"], "create_block");
        let back: Operation = serde_json::from_value(json).unwrap();
        assert_eq!(back.kind(), "create_block");
    }

    #[test]
    fn merge_references_primary_and_merged() {
        let primary = BlockId::new();
        let merged = vec![BlockId::new(), BlockId::new()];
        let op = Operation::MergeBlocks {
            primary_id: primary,
            merged_ids: merged.clone(),
            merged_title: None,
        };
        let refs = op.referenced_blocks();
        assert_eq!(refs.len(), 3);
        assert!(refs.contains(&primary));
        assert!(refs.contains(&merged[0]));
    }

    #[test]
    fn affected_count_dedupes_repeated_blocks() {
        let block_id = BlockId::new();
        let ops = vec![
            create_op(),
            Operation::UpdateBlock {
                block_id,
                from_version: 1,
                patch: BlockPatch { content: Some("a".into()), ..Default::default() },
            },
            Operation::ReviseBlock {
                block_id,
                from_version: 2,
                content: "b".into(),
                summary: "rewrite".into(),
            },
        ];
        assert_eq!(affected_block_count(&ops), 2);
    }
}
