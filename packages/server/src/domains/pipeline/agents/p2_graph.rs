//! P2 graph agent: optional relationship inference over current substrate.
//!
//! Activated by `OrchestratorConfig::enable_graph_stage`. Proposes
//! `CreateRelationship` ops through the same governance path as any other
//! substrate change.

use async_trait::async_trait;

use crate::common::OrchestratorResult;
use crate::domains::baskets::{cosine_similarity, BasketContext};
use crate::domains::governance::ops::Operation;
use crate::domains::governance::proposal::{ProposalDraft, ProposalOrigin};
use crate::domains::substrate::{SubstrateRef, SubstrateType};
use crate::kernel::work::WorkItem;

use super::{AgentDeps, AgentKind, AgentOutcome, StageAgent};

/// Blocks at or above this similarity are proposed as related; pairs at
/// dedup-level similarity are left for merge review instead.
const RELATED_SIMILARITY: f32 = 0.60;

/// Max relationship ops per proposal.
const MAX_EDGES: usize = 8;

pub struct P2GraphAgent;

impl P2GraphAgent {
    pub fn new() -> Self {
        Self
    }
}

impl Default for P2GraphAgent {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StageAgent for P2GraphAgent {
    fn kind(&self) -> AgentKind {
        AgentKind::P2Graph
    }

    async fn run(
        &self,
        _work: &WorkItem,
        ctx: &BasketContext,
        _deps: &AgentDeps,
    ) -> OrchestratorResult<AgentOutcome> {
        let embedded: Vec<_> = ctx
            .blocks
            .iter()
            .filter_map(|b| b.embedding.as_ref().map(|e| (b, e.to_vec())))
            .collect();

        let mut candidates: Vec<(SubstrateRef, SubstrateRef, f32)> = Vec::new();
        for (i, (a, ea)) in embedded.iter().enumerate() {
            for (b, eb) in embedded.iter().skip(i + 1) {
                let already = ctx.relationships.iter().any(|r| {
                    (r.from_id == a.id.into_uuid() && r.to_id == b.id.into_uuid())
                        || (r.from_id == b.id.into_uuid() && r.to_id == a.id.into_uuid())
                });
                if already {
                    continue;
                }
                let similarity = cosine_similarity(ea, &eb);
                if similarity >= RELATED_SIMILARITY {
                    candidates.push((
                        SubstrateRef { substrate_type: SubstrateType::Block, id: a.id.into_uuid() },
                        SubstrateRef { substrate_type: SubstrateType::Block, id: b.id.into_uuid() },
                        similarity,
                    ));
                }
            }
        }

        if candidates.is_empty() {
            return Ok(AgentOutcome::Nothing {
                reason: "no related block pairs above threshold".to_string(),
            });
        }

        candidates.sort_by(|a, b| b.2.total_cmp(&a.2));
        candidates.truncate(MAX_EDGES);

        let ops: Vec<Operation> = candidates
            .into_iter()
            .map(|(from, to, strength)| Operation::CreateRelationship {
                from,
                to,
                relationship_type: "related_to".to_string(),
                strength,
            })
            .collect();

        let draft = ProposalDraft::builder()
            .basket_id(ctx.basket_id())
            .workspace_id(ctx.workspace_id())
            .origin(ProposalOrigin::Agent(AgentKind::P2Graph))
            .ops(ops)
            .confidence(0.8)
            .build();

        Ok(AgentOutcome::Proposal(draft))
    }
}
