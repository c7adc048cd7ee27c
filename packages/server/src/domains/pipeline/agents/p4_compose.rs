//! P4 composition agent: composes documents by selecting and referencing
//! substrate. Writes through the artifact commit path, not governance.

use async_trait::async_trait;
use chrono::Utc;

use crate::common::{DocumentId, OrchestratorError, OrchestratorResult};
use crate::domains::baskets::BasketContext;
use crate::domains::documents::{CompositionMode, Document, NewSubstrateReference};
use crate::domains::substrate::{Block, SemanticType, SubstrateType};
use crate::kernel::store::SubstrateStore;
use crate::kernel::traits::Reasoner;
use crate::kernel::work::{WorkItem, WorkPayload};

use super::{AgentDeps, AgentKind, AgentOutcome, ArtifactOutcome, StageAgent};

/// Max substrate references composed into one document.
const MAX_REFERENCES: usize = 12;

pub struct P4ComposeAgent;

impl P4ComposeAgent {
    pub fn new() -> Self {
        Self
    }

    /// Relevance score for selecting substrate into a composition:
    /// anchors first, then confidence, then recency.
    fn score(block: &Block, index_from_newest: usize) -> f32 {
        let type_weight = match block.semantic_type {
            SemanticType::Goal | SemanticType::Constraint => 1.0,
            SemanticType::Finding | SemanticType::Insight => 0.8,
            SemanticType::Metric => 0.6,
            SemanticType::Entity | SemanticType::Question | SemanticType::Reference => 0.4,
        };
        let recency = 1.0 / (1.0 + index_from_newest as f32 * 0.1);
        type_weight * 0.5 + block.confidence.clamp(0.0, 1.0) * 0.3 + recency * 0.2
    }

    fn select_blocks(ctx: &BasketContext) -> Vec<(&Block, f32)> {
        let mut newest_first: Vec<&Block> = ctx.blocks.iter().collect();
        newest_first.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        let mut scored: Vec<(&Block, f32)> = newest_first
            .iter()
            .enumerate()
            .map(|(idx, block)| (*block, Self::score(block, idx)))
            .collect();
        scored.sort_by(|a, b| b.1.total_cmp(&a.1));
        scored.truncate(MAX_REFERENCES);
        scored
    }

    fn build_prompt(intent: Option<&str>, selected: &[(&Block, f32)]) -> String {
        let mut prompt = String::from("Compose a coherent document from the knowledge below.\n");
        if let Some(intent) = intent {
            prompt.push_str(&format!("Intent: {intent}\n"));
        }
        prompt.push_str("Reference the material faithfully; do not invent facts.\n\n");
        for (block, _) in selected {
            prompt.push_str(&format!(
                "## [{}] {}\n{}\n\n",
                block.semantic_type, block.title, block.content
            ));
        }
        prompt
    }
}

impl Default for P4ComposeAgent {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StageAgent for P4ComposeAgent {
    fn kind(&self) -> AgentKind {
        AgentKind::P4Compose
    }

    async fn run(
        &self,
        work: &WorkItem,
        ctx: &BasketContext,
        deps: &AgentDeps,
    ) -> OrchestratorResult<AgentOutcome> {
        let WorkPayload::Compose { document_id, intent } = work.payload()? else {
            return Err(OrchestratorError::Fatal(format!(
                "P4 received {} payload",
                work.work_type
            )));
        };

        let selected = Self::select_blocks(ctx);
        if selected.is_empty() {
            return Ok(AgentOutcome::Nothing { reason: "no substrate to compose".to_string() });
        }

        let prompt = Self::build_prompt(intent.as_deref(), &selected);
        let body = deps
            .reasoner
            .complete(&prompt)
            .await
            .map_err(|err| OrchestratorError::Transient(format!("reasoner: {err}")))?;

        let (id, mode) = match document_id {
            Some(id) => (id, CompositionMode::Refreshed),
            None => (DocumentId::new(), CompositionMode::Composed),
        };
        let title = intent.clone().unwrap_or_else(|| {
            selected
                .first()
                .map(|(block, _)| block.title.clone())
                .unwrap_or_else(|| "Composition".to_string())
        });

        let now = Utc::now();
        let document = Document {
            id,
            basket_id: ctx.basket_id(),
            workspace_id: ctx.workspace_id(),
            title,
            body,
            composition_mode: mode,
            created_at: now,
            updated_at: now,
        };

        let references: Vec<NewSubstrateReference> = selected
            .iter()
            .enumerate()
            .map(|(rank, (block, score))| NewSubstrateReference {
                substrate_type: SubstrateType::Block,
                substrate_id: block.id.into_uuid(),
                role: if rank == 0 { "primary".to_string() } else { "supporting".to_string() },
                weight: *score,
            })
            .collect();

        let stored = deps.store.upsert_document(&document, &references).await?;

        Ok(AgentOutcome::Artifact(ArtifactOutcome::Document {
            document_id: stored.id,
            references: references.len() as u32,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anchors_outscore_entities() {
        use crate::common::{BasketId, BlockId, WorkspaceId};
        use crate::domains::substrate::BlockState;

        let base = Block {
            id: BlockId::new(),
            basket_id: BasketId::new(),
            workspace_id: WorkspaceId::new(),
            semantic_type: SemanticType::Goal,
            title: "goal".into(),
            content: "content".into(),
            status: BlockState::Proposed,
            version: 1,
            confidence: 0.8,
            provenance: vec![],
            content_hash: None,
            embedding: None,
            last_validated_at: Utc::now(),
            metadata: serde_json::Value::Null,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let mut entity = base.clone();
        entity.semantic_type = SemanticType::Entity;

        assert!(P4ComposeAgent::score(&base, 0) > P4ComposeAgent::score(&entity, 0));
    }
}
