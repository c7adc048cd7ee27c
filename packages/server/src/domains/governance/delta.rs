//! Deltas: the applied outcome of a committed proposal.
//!
//! A delta links the idempotency key of a request to the physical mutation
//! set, so replays can return the original outcome without re-executing.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::common::{BasketId, BlockId, ContextItemId, DeltaId, DumpId, ProposalId};

/// One applied change inside a delta.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "change", rename_all = "snake_case")]
pub enum DeltaChange {
    DumpCreated { dump_id: DumpId },
    BlockCreated { block_id: BlockId, version: i32 },
    BlockUpdated { block_id: BlockId, from_version: i32, to_version: i32 },
    BlockSuperseded { block_id: BlockId },
    BlocksMerged { primary_id: BlockId, merged_ids: Vec<BlockId> },
    ContextItemCreated { item_id: ContextItemId },
    RelationshipCreated { from_id: uuid::Uuid, to_id: uuid::Uuid, relationship_type: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Delta {
    pub delta_id: DeltaId,
    pub basket_id: BasketId,
    /// Proposal that produced this delta; absent for capture deltas.
    pub proposal_id: Option<ProposalId>,
    pub summary: String,
    pub changes: Vec<DeltaChange>,
    pub created_at: DateTime<Utc>,
    pub applied_at: DateTime<Utc>,
}

impl Delta {
    pub fn new(
        basket_id: BasketId,
        proposal_id: Option<ProposalId>,
        summary: impl Into<String>,
        changes: Vec<DeltaChange>,
    ) -> Self {
        let now = Utc::now();
        Self {
            delta_id: DeltaId::new(),
            basket_id,
            proposal_id,
            summary: summary.into(),
            changes,
            created_at: now,
            applied_at: now,
        }
    }

    pub fn blocks_created(&self) -> u32 {
        self.changes
            .iter()
            .filter(|c| matches!(c, DeltaChange::BlockCreated { .. }))
            .count() as u32
    }

    pub fn blocks_changed(&self) -> u32 {
        self.changes
            .iter()
            .filter(|c| {
                matches!(
                    c,
                    DeltaChange::BlockCreated { .. }
                        | DeltaChange::BlockUpdated { .. }
                        | DeltaChange::BlockSuperseded { .. }
                        | DeltaChange::BlocksMerged { .. }
                )
            })
            .count() as u32
    }

    pub fn context_items_changed(&self) -> u32 {
        self.changes
            .iter()
            .filter(|c| matches!(c, DeltaChange::ContextItemCreated { .. }))
            .count() as u32
    }

    pub fn relationships_changed(&self) -> u32 {
        self.changes
            .iter()
            .filter(|c| matches!(c, DeltaChange::RelationshipCreated { .. }))
            .count() as u32
    }

    /// Dump created by a capture delta, if any.
    pub fn dump_id(&self) -> Option<DumpId> {
        self.changes.iter().find_map(|c| match c {
            DeltaChange::DumpCreated { dump_id } => Some(*dump_id),
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_classify_changes() {
        let delta = Delta::new(
            BasketId::new(),
            Some(ProposalId::new()),
            "test",
            vec![
                DeltaChange::BlockCreated { block_id: BlockId::new(), version: 1 },
                DeltaChange::BlockUpdated {
                    block_id: BlockId::new(),
                    from_version: 1,
                    to_version: 2,
                },
                DeltaChange::ContextItemCreated { item_id: ContextItemId::new() },
            ],
        );
        assert_eq!(delta.blocks_created(), 1);
        assert_eq!(delta.blocks_changed(), 2);
        assert_eq!(delta.context_items_changed(), 1);
        assert_eq!(delta.relationships_changed(), 0);
    }

    #[test]
    fn capture_delta_exposes_dump_id() {
        let dump_id = DumpId::new();
        let delta = Delta::new(
            BasketId::new(),
            None,
            "capture",
            vec![DeltaChange::DumpCreated { dump_id }],
        );
        assert_eq!(delta.dump_id(), Some(dump_id));
    }
}
