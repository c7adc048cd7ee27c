//! P1 substrate agent: interprets a raw dump into proposed blocks and
//! context items.
//!
//! The agent never writes substrate. It reads the dump and the basket
//! context, asks the reasoner for structured candidates, and returns a
//! proposal draft carrying provenance and per-block confidence.

use async_trait::async_trait;
use serde::Deserialize;

use crate::common::{OrchestratorError, OrchestratorResult};
use crate::domains::baskets::BasketContext;
use crate::domains::dumps::split_dump;
use crate::domains::governance::ops::Operation;
use crate::domains::governance::proposal::{ProposalDraft, ProposalOrigin};
use crate::domains::substrate::{ContextItemType, SemanticType};
use crate::kernel::store::SubstrateStore;
use crate::kernel::traits::Reasoner;
use crate::kernel::work::{WorkItem, WorkPayload};

use super::{AgentDeps, AgentKind, AgentOutcome, StageAgent};

/// Shape the reasoner is asked to produce.
#[derive(Debug, Deserialize)]
struct ExtractionResponse {
    #[serde(default)]
    blocks: Vec<CandidateBlock>,
    #[serde(default)]
    context_items: Vec<CandidateItem>,
}

#[derive(Debug, Deserialize)]
struct CandidateBlock {
    title: String,
    semantic_type: SemanticType,
    content: String,
    confidence: f32,
}

#[derive(Debug, Deserialize)]
struct CandidateItem {
    item_type: ContextItemType,
    label: String,
}

pub struct P1SubstrateAgent;

impl P1SubstrateAgent {
    pub fn new() -> Self {
        Self
    }

    fn build_prompt(fragments: &[String], ctx: &BasketContext) -> String {
        let mut prompt = String::from(
            "Extract knowledge from the captured text below.\n\
             Return JSON: {\"blocks\": [{\"title\", \"semantic_type\", \"content\", \
             \"confidence\"}], \"context_items\": [{\"item_type\", \"label\"}]}.\n\
             semantic_type is one of goal, constraint, finding, insight, entity, metric, \
             question, reference. item_type is one of tag, entity, topic, cue. \
             confidence is 0..1.\n",
        );

        let anchors = ctx.anchors();
        if !anchors.is_empty() {
            prompt.push_str("\nExisting goals and constraints in this basket:\n");
            for block in anchors.iter().take(10) {
                prompt.push_str(&format!("- [{}] {}\n", block.semantic_type, block.title));
            }
        }

        prompt.push_str("\nCaptured text:\n");
        for fragment in fragments {
            prompt.push_str("---\n");
            prompt.push_str(fragment);
            prompt.push('\n');
        }
        prompt
    }
}

impl Default for P1SubstrateAgent {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StageAgent for P1SubstrateAgent {
    fn kind(&self) -> AgentKind {
        AgentKind::P1Substrate
    }

    async fn run(
        &self,
        work: &WorkItem,
        ctx: &BasketContext,
        deps: &AgentDeps,
    ) -> OrchestratorResult<AgentOutcome> {
        let WorkPayload::Substrate { dump_id } = work.payload()? else {
            return Err(OrchestratorError::Fatal(format!(
                "P1 received {} payload",
                work.work_type
            )));
        };

        let dump = deps
            .store
            .fetch_dump(dump_id)
            .await?
            .ok_or_else(|| OrchestratorError::Fatal(format!("dump {dump_id} does not exist")))?;

        let fragments = split_dump(&dump.body_text);
        if fragments.is_empty() {
            return Ok(AgentOutcome::Nothing { reason: "dump body is empty".to_string() });
        }

        let prompt = Self::build_prompt(&fragments, ctx);
        let raw = deps
            .reasoner
            .complete_json(&prompt)
            .await
            .map_err(|err| OrchestratorError::Transient(format!("reasoner: {err}")))?;

        let response: ExtractionResponse = serde_json::from_str(strip_fences(&raw))
            .map_err(|err| OrchestratorError::Fatal(format!("unparseable extraction: {err}")))?;

        if response.blocks.is_empty() && response.context_items.is_empty() {
            return Ok(AgentOutcome::Nothing {
                reason: "nothing extractable in dump".to_string(),
            });
        }

        let mut ops = Vec::new();
        let mut confidence: f32 = 1.0;
        for block in response.blocks {
            let block_confidence = block.confidence.clamp(0.0, 1.0);
            confidence = confidence.min(block_confidence);
            ops.push(Operation::CreateBlock {
                title: block.title,
                semantic_type: block.semantic_type,
                content: block.content,
                confidence: block_confidence,
                metadata: serde_json::json!({ "extracted_from": dump_id }),
            });
        }
        for item in response.context_items {
            ops.push(Operation::CreateContextItem {
                item_type: item.item_type,
                label: item.label,
                metadata: serde_json::Value::Null,
            });
        }

        let draft = ProposalDraft::builder()
            .basket_id(ctx.basket_id())
            .workspace_id(ctx.workspace_id())
            .origin(ProposalOrigin::Agent(AgentKind::P1Substrate))
            .ops(ops)
            .provenance(vec![dump_id])
            .confidence(confidence)
            .build();

        Ok(AgentOutcome::Proposal(draft))
    }
}

/// Tolerate markdown-fenced JSON from the reasoner.
fn strip_fences(raw: &str) -> &str {
    let trimmed = raw.trim();
    let without_open = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .unwrap_or(trimmed);
    without_open.strip_suffix("```").unwrap_or(without_open).trim()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_markdown_fences() {
        assert_eq!(strip_fences("```json\n{\"a\": 1}\n```"), "{\"a\": 1}");
        assert_eq!(strip_fences("{\"a\": 1}"), "{\"a\": 1}");
        assert_eq!(strip_fences("```\n[]\n```"), "[]");
    }

    #[test]
    fn extraction_response_tolerates_missing_sections() {
        let response: ExtractionResponse = serde_json::from_str("{}").unwrap();
        assert!(response.blocks.is_empty());
        assert!(response.context_items.is_empty());
    }
}
