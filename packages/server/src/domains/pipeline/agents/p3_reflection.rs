//! P3 reflection agent: computes read-only insight over a substrate
//! window. Never proposes substrate changes.

use async_trait::async_trait;
use chrono::Utc;

use crate::common::{content_hash, OrchestratorError, OrchestratorResult, ReflectionId};
use crate::domains::baskets::BasketContext;
use crate::domains::reflections::{ReflectionArtifact, ReflectionKind, SubstrateWindow};
use crate::kernel::store::SubstrateStore;
use crate::kernel::traits::Reasoner;
use crate::kernel::work::WorkItem;

use super::{AgentDeps, AgentKind, AgentOutcome, ArtifactOutcome, StageAgent};

pub struct P3ReflectionAgent;

impl P3ReflectionAgent {
    pub fn new() -> Self {
        Self
    }

    /// Hash of the substrate window: block ids and versions. Two windows
    /// with the same hash produce the same reflection, so recomputation
    /// is skipped.
    fn window_hash(ctx: &BasketContext) -> String {
        let mut parts: Vec<String> =
            ctx.blocks.iter().map(|b| format!("{}:{}", b.id, b.version)).collect();
        parts.sort();
        content_hash(&parts.join("|"))
    }

    fn build_prompt(ctx: &BasketContext) -> String {
        let mut prompt = String::from(
            "Reflect on the knowledge below. Surface one substantive pattern, tension, or \
             open question a careful reader would want flagged. Two short paragraphs at most.\n\n",
        );
        for block in ctx.blocks.iter().take(40) {
            prompt.push_str(&format!(
                "- [{}] {} (confidence {:.2}): {}\n",
                block.semantic_type, block.title, block.confidence, block.content
            ));
        }
        for item in ctx.context_items.iter().take(30) {
            prompt.push_str(&format!("- tag: {}\n", item.label));
        }
        prompt
    }
}

impl Default for P3ReflectionAgent {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StageAgent for P3ReflectionAgent {
    fn kind(&self) -> AgentKind {
        AgentKind::P3Reflection
    }

    async fn run(
        &self,
        _work: &WorkItem,
        ctx: &BasketContext,
        deps: &AgentDeps,
    ) -> OrchestratorResult<AgentOutcome> {
        if ctx.blocks.is_empty() {
            return Ok(AgentOutcome::Nothing { reason: "no substrate to reflect on".to_string() });
        }

        let kind = ReflectionKind::Insight;
        let hash = Self::window_hash(ctx);

        if let Some(latest) = deps.store.latest_reflection(ctx.basket_id(), kind).await? {
            if latest.meta_derived_from == hash {
                return Ok(AgentOutcome::Nothing {
                    reason: "substrate window unchanged since last reflection".to_string(),
                });
            }
        }

        let prompt = Self::build_prompt(ctx);
        let body = deps
            .reasoner
            .complete(&prompt)
            .await
            .map_err(|err| OrchestratorError::Transient(format!("reasoner: {err}")))?;

        let window = SubstrateWindow {
            since: None,
            block_count: ctx.blocks.len(),
            dump_count: ctx.dump_ids.len(),
        };
        let artifact = ReflectionArtifact {
            id: ReflectionId::new(),
            basket_id: ctx.basket_id(),
            workspace_id: ctx.workspace_id(),
            kind,
            body,
            substrate_window: serde_json::to_value(&window)?,
            meta_derived_from: hash,
            computation_timestamp: Utc::now(),
        };
        deps.store.insert_reflection(&artifact).await?;

        Ok(AgentOutcome::Artifact(ArtifactOutcome::Reflection {
            reflection_id: artifact.id,
            kind,
        }))
    }
}
