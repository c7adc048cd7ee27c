//! Proposal aggregate and its state machine.
//!
//! ```text
//! DRAFT → VALIDATED → APPROVED → COMMITTED
//!                  ↘          ↘
//!                   REJECTED   FAILED
//! ```
//!
//! Terminal states (`COMMITTED`, `REJECTED`, `FAILED`) never reopen and
//! their ops are immutable.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::common::{BasketId, DumpId, ProposalId, UserId, WorkspaceId};
use crate::domains::pipeline::agents::AgentKind;
use crate::domains::substrate::ActorKind;

use super::ops::Operation;
use super::validator::ValidationReport;

// ============================================================================
// Origin
// ============================================================================

/// Who authored a proposal. Serialized as `"human"` or `"agent:<name>"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProposalOrigin {
    Human,
    Agent(AgentKind),
}

impl ProposalOrigin {
    pub fn actor_kind(&self) -> ActorKind {
        match self {
            ProposalOrigin::Human => ActorKind::Human,
            ProposalOrigin::Agent(_) => ActorKind::Agent,
        }
    }

    pub fn as_string(&self) -> String {
        match self {
            ProposalOrigin::Human => "human".to_string(),
            ProposalOrigin::Agent(kind) => format!("agent:{}", kind.name()),
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        if raw == "human" {
            return Some(ProposalOrigin::Human);
        }
        raw.strip_prefix("agent:")
            .and_then(AgentKind::from_name)
            .map(ProposalOrigin::Agent)
    }
}

impl std::fmt::Display for ProposalOrigin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.as_string())
    }
}

impl Serialize for ProposalOrigin {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.as_string())
    }
}

impl<'de> Deserialize<'de> for ProposalOrigin {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        ProposalOrigin::parse(&raw)
            .ok_or_else(|| serde::de::Error::custom(format!("unknown origin: {raw}")))
    }
}

// ============================================================================
// State machine
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "proposal_state", rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum ProposalState {
    #[default]
    Draft,
    Validated,
    Approved,
    Committed,
    Rejected,
    Failed,
}

impl ProposalState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProposalState::Committed | ProposalState::Rejected | ProposalState::Failed
        )
    }

    /// Legal transitions of the governance FSM.
    pub fn can_transition(self, to: ProposalState) -> bool {
        use ProposalState::*;
        matches!(
            (self, to),
            (Draft, Validated)
                | (Validated, Approved)
                | (Validated, Rejected)
                | (Approved, Committed)
                | (Approved, Failed)
        )
    }
}

impl std::fmt::Display for ProposalState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ProposalState::Draft => "DRAFT",
            ProposalState::Validated => "VALIDATED",
            ProposalState::Approved => "APPROVED",
            ProposalState::Committed => "COMMITTED",
            ProposalState::Rejected => "REJECTED",
            ProposalState::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

/// A human or service decision on a validated proposal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Approve,
    Reject,
}

// ============================================================================
// Aggregate
// ============================================================================

#[derive(Debug, Clone)]
pub struct Proposal {
    pub id: ProposalId,
    pub basket_id: BasketId,
    pub workspace_id: WorkspaceId,
    pub origin: ProposalOrigin,
    pub ops: Vec<Operation>,
    /// Dumps the proposal derives from (weak references).
    pub provenance: Vec<DumpId>,
    pub confidence: f32,
    pub state: ProposalState,
    pub validation_report: Option<ValidationReport>,
    pub review_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub decided_at: Option<DateTime<Utc>>,
}

impl Proposal {
    pub fn from_draft(draft: ProposalDraft) -> Self {
        Self {
            id: ProposalId::new(),
            basket_id: draft.basket_id,
            workspace_id: draft.workspace_id,
            origin: draft.origin,
            ops: draft.ops,
            provenance: draft.provenance,
            confidence: draft.confidence,
            state: ProposalState::Draft,
            validation_report: None,
            review_reason: None,
            created_at: Utc::now(),
            decided_at: None,
        }
    }
}

/// The shape agents and humans submit; the engine assigns identity and
/// drives the state machine.
#[derive(Debug, Clone, TypedBuilder, Serialize, Deserialize)]
#[builder(field_defaults(setter(into)))]
pub struct ProposalDraft {
    pub basket_id: BasketId,
    pub workspace_id: WorkspaceId,
    pub origin: ProposalOrigin,
    pub ops: Vec<Operation>,
    #[builder(default)]
    pub provenance: Vec<DumpId>,
    #[builder(default = 1.0)]
    pub confidence: f32,
}

/// Outcome of submitting a proposal through governance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitOutcome {
    pub proposal_id: ProposalId,
    pub state: ProposalState,
    /// Present when the proposal auto-approved and committed.
    pub delta_id: Option<crate::common::DeltaId>,
}

/// Identity of the actor making a governance decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionActor {
    pub kind: ActorKind,
    pub user_id: Option<UserId>,
}

impl DecisionActor {
    pub fn human(user_id: UserId) -> Self {
        Self { kind: ActorKind::Human, user_id: Some(user_id) }
    }

    pub fn service() -> Self {
        Self { kind: ActorKind::Human, user_id: None }
    }

    pub fn agent() -> Self {
        Self { kind: ActorKind::Agent, user_id: None }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_never_reopen() {
        use ProposalState::*;
        for from in [Committed, Rejected, Failed] {
            for to in [Draft, Validated, Approved, Committed, Rejected, Failed] {
                assert!(!from.can_transition(to), "{from:?} -> {to:?}");
            }
        }
    }

    #[test]
    fn happy_path_transitions() {
        use ProposalState::*;
        assert!(Draft.can_transition(Validated));
        assert!(Validated.can_transition(Approved));
        assert!(Approved.can_transition(Committed));
    }

    #[test]
    fn rejection_only_from_validated() {
        use ProposalState::*;
        assert!(Validated.can_transition(Rejected));
        assert!(!Draft.can_transition(Rejected));
        assert!(!Approved.can_transition(Rejected));
    }

    #[test]
    fn failure_only_from_approved() {
        use ProposalState::*;
        assert!(Approved.can_transition(Failed));
        assert!(!Validated.can_transition(Failed));
    }

    #[test]
    fn origin_round_trips() {
        let origin = ProposalOrigin::Agent(AgentKind::P1Substrate);
        assert_eq!(origin.as_string(), "agent:p1_substrate");
        assert_eq!(ProposalOrigin::parse("agent:p1_substrate"), Some(origin));
        assert_eq!(ProposalOrigin::parse("human"), Some(ProposalOrigin::Human));
        assert_eq!(ProposalOrigin::parse("agent:unknown"), None);
    }
}
