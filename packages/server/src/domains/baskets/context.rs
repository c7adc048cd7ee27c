//! Read-only basket context projection.
//!
//! A `BasketContext` is a consistent snapshot of a basket's live substrate
//! as of the latest committed proposal. Validation uses it for referential
//! and dedup checks; stage agents use it to produce context-aware output.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::common::{BasketId, DumpId, WorkspaceId};
use crate::domains::substrate::{Block, ContextItem, Relationship, SemanticType};

use super::models::Basket;

#[derive(Debug, Clone)]
pub struct BasketContext {
    pub basket: Basket,
    /// Blocks in non-terminal states, embeddings included when present.
    pub blocks: Vec<Block>,
    pub context_items: Vec<ContextItem>,
    pub relationships: Vec<Relationship>,
    pub dump_ids: Vec<DumpId>,
    pub snapshot_at: DateTime<Utc>,
}

impl BasketContext {
    pub fn basket_id(&self) -> BasketId {
        self.basket.id
    }

    pub fn workspace_id(&self) -> WorkspaceId {
        self.basket.workspace_id
    }

    pub fn block(&self, id: crate::common::BlockId) -> Option<&Block> {
        self.blocks.iter().find(|b| b.id == id)
    }

    pub fn context_item(&self, id: crate::common::ContextItemId) -> Option<&ContextItem> {
        self.context_items.iter().find(|i| i.id == id)
    }

    /// Blocks of a given semantic type, highest confidence first.
    pub fn blocks_of_type(&self, semantic_type: SemanticType) -> Vec<&Block> {
        let mut blocks: Vec<&Block> = self
            .blocks
            .iter()
            .filter(|b| b.semantic_type == semantic_type)
            .collect();
        blocks.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
        blocks
    }

    /// Aggregated goals and constraints, the anchor substrate most agents
    /// condition on.
    pub fn anchors(&self) -> Vec<&Block> {
        self.blocks
            .iter()
            .filter(|b| {
                matches!(b.semantic_type, SemanticType::Goal | SemanticType::Constraint)
            })
            .collect()
    }

    /// Blocks whose last validation predates `cutoff`.
    pub fn stale_blocks(&self, cutoff: DateTime<Utc>) -> Vec<&Block> {
        self.blocks.iter().filter(|b| b.is_stale(cutoff)).collect()
    }

    /// Summary counters for status views.
    pub fn usage(&self) -> ContextUsage {
        ContextUsage {
            blocks: self.blocks.len(),
            context_items: self.context_items.len(),
            relationships: self.relationships.len(),
            dumps: self.dump_ids.len(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextUsage {
    pub blocks: usize,
    pub context_items: usize,
    pub relationships: usize,
    pub dumps: usize,
}

/// Cosine similarity between two embeddings. Returns 0.0 when either vector
/// is empty or lengths differ.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cosine_of_identical_vectors_is_one() {
        let v = vec![0.5, 0.25, 0.1];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn cosine_of_orthogonal_vectors_is_zero() {
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]), 0.0);
    }

    #[test]
    fn mismatched_lengths_yield_zero() {
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
    }

    #[test]
    fn zero_vector_yields_zero() {
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
    }
}
