//! Stage agents.
//!
//! Agents are thin adapters: given a work item and a basket context, they
//! turn reasoner output into a proposal draft or an artifact. They hold no
//! orchestrator state and depend only on the capability traits in
//! `kernel::traits`.

pub mod p1_substrate;
pub mod p2_graph;
pub mod p3_reflection;
pub mod p4_compose;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::common::{DocumentId, OrchestratorResult, ReflectionId};
use crate::domains::baskets::BasketContext;
use crate::domains::governance::proposal::ProposalDraft;
use crate::domains::reflections::ReflectionKind;
use crate::kernel::store::SubstrateStore;
use crate::kernel::traits::{Embedder, Reasoner, ToolProvider};
use crate::kernel::work::WorkItem;

pub use p1_substrate::P1SubstrateAgent;
pub use p2_graph::P2GraphAgent;
pub use p3_reflection::P3ReflectionAgent;
pub use p4_compose::P4ComposeAgent;

// ============================================================================
// Agent kinds
// ============================================================================

/// Closed set of pipeline agents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    P0Capture,
    P1Substrate,
    P2Graph,
    P3Reflection,
    P4Compose,
}

impl AgentKind {
    pub fn name(&self) -> &'static str {
        match self {
            AgentKind::P0Capture => "p0_capture",
            AgentKind::P1Substrate => "p1_substrate",
            AgentKind::P2Graph => "p2_graph",
            AgentKind::P3Reflection => "p3_reflection",
            AgentKind::P4Compose => "p4_compose",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "p0_capture" => Some(AgentKind::P0Capture),
            "p1_substrate" => Some(AgentKind::P1Substrate),
            "p2_graph" => Some(AgentKind::P2Graph),
            "p3_reflection" => Some(AgentKind::P3Reflection),
            "p4_compose" => Some(AgentKind::P4Compose),
            _ => None,
        }
    }
}

impl std::fmt::Display for AgentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

// ============================================================================
// Agent contract
// ============================================================================

/// Dependencies injected into every stage agent. Agents never see the bus,
/// the queue, or the governance engine.
#[derive(Clone)]
pub struct AgentDeps {
    pub store: Arc<dyn SubstrateStore>,
    pub reasoner: Arc<dyn Reasoner>,
    pub embedder: Arc<dyn Embedder>,
    pub tools: Arc<dyn ToolProvider>,
}

/// Artifact produced by a stage that does not mutate substrate.
#[derive(Debug, Clone)]
pub enum ArtifactOutcome {
    Reflection {
        reflection_id: ReflectionId,
        kind: ReflectionKind,
    },
    Document {
        document_id: DocumentId,
        references: u32,
    },
}

/// What an agent run produced.
#[derive(Debug, Clone)]
pub enum AgentOutcome {
    /// A governed change request, to be submitted through the engine.
    Proposal(ProposalDraft),
    /// A direct artifact written through its dedicated commit path.
    Artifact(ArtifactOutcome),
    /// The stage had nothing to do (e.g. unchanged reflection window).
    Nothing { reason: String },
}

#[async_trait]
pub trait StageAgent: Send + Sync {
    fn kind(&self) -> AgentKind;

    /// Execute the stage for one work item against a context snapshot.
    async fn run(
        &self,
        work: &WorkItem,
        ctx: &BasketContext,
        deps: &AgentDeps,
    ) -> OrchestratorResult<AgentOutcome>;
}

// ============================================================================
// Registry
// ============================================================================

/// Maps work types to agent implementations. The match is exhaustive over
/// the pipeline stages; non-agent work types have no agent.
pub struct AgentRegistry {
    p1: P1SubstrateAgent,
    p2: P2GraphAgent,
    p3: P3ReflectionAgent,
    p4: P4ComposeAgent,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self {
            p1: P1SubstrateAgent::new(),
            p2: P2GraphAgent::new(),
            p3: P3ReflectionAgent::new(),
            p4: P4ComposeAgent::new(),
        }
    }

    pub fn agent_for(&self, work_type: crate::kernel::work::WorkType) -> Option<&dyn StageAgent> {
        use crate::kernel::work::WorkType::*;
        match work_type {
            P1Substrate => Some(&self.p1),
            P2Graph => Some(&self.p2),
            P3Reflection => Some(&self.p3),
            P4Compose => Some(&self.p4),
            P0Capture | ManualEdit | ProposalReview | TimelineRestore => None,
        }
    }
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::work::WorkType;

    #[test]
    fn agent_names_round_trip() {
        for kind in [
            AgentKind::P0Capture,
            AgentKind::P1Substrate,
            AgentKind::P2Graph,
            AgentKind::P3Reflection,
            AgentKind::P4Compose,
        ] {
            assert_eq!(AgentKind::from_name(kind.name()), Some(kind));
        }
        assert_eq!(AgentKind::from_name("p9_unknown"), None);
    }

    #[test]
    fn pipeline_stages_have_agents() {
        let registry = AgentRegistry::new();
        assert!(registry.agent_for(WorkType::P1Substrate).is_some());
        assert!(registry.agent_for(WorkType::P3Reflection).is_some());
        assert!(registry.agent_for(WorkType::ProposalReview).is_none());
    }
}
