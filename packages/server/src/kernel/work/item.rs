//! Work item model for the persistent pipeline queue.
//!
//! Every asynchronous unit of pipeline work is one row in `work_queue`.
//! Items move `pending → claimed → processing → (cascading) → completed`
//! or end at `failed` once the retry budget is spent.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::common::{
    BasketId, DeltaId, DocumentId, DumpId, ProposalId, ReflectionId, UserId, WorkId, WorkspaceId,
};

// ============================================================================
// Enums
// ============================================================================

/// Pipeline work types. Closed set; routing in the dispatcher is an
/// exhaustive match over this enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "work_type")]
pub enum WorkType {
    #[sqlx(rename = "P0_CAPTURE")]
    #[serde(rename = "P0_CAPTURE")]
    P0Capture,
    #[sqlx(rename = "P1_SUBSTRATE")]
    #[serde(rename = "P1_SUBSTRATE")]
    P1Substrate,
    #[sqlx(rename = "P2_GRAPH")]
    #[serde(rename = "P2_GRAPH")]
    P2Graph,
    #[sqlx(rename = "P3_REFLECTION")]
    #[serde(rename = "P3_REFLECTION")]
    P3Reflection,
    #[sqlx(rename = "P4_COMPOSE")]
    #[serde(rename = "P4_COMPOSE")]
    P4Compose,
    #[sqlx(rename = "MANUAL_EDIT")]
    #[serde(rename = "MANUAL_EDIT")]
    ManualEdit,
    #[sqlx(rename = "PROPOSAL_REVIEW")]
    #[serde(rename = "PROPOSAL_REVIEW")]
    ProposalReview,
    #[sqlx(rename = "TIMELINE_RESTORE")]
    #[serde(rename = "TIMELINE_RESTORE")]
    TimelineRestore,
}

impl WorkType {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkType::P0Capture => "P0_CAPTURE",
            WorkType::P1Substrate => "P1_SUBSTRATE",
            WorkType::P2Graph => "P2_GRAPH",
            WorkType::P3Reflection => "P3_REFLECTION",
            WorkType::P4Compose => "P4_COMPOSE",
            WorkType::ManualEdit => "MANUAL_EDIT",
            WorkType::ProposalReview => "PROPOSAL_REVIEW",
            WorkType::TimelineRestore => "TIMELINE_RESTORE",
        }
    }
}

impl std::fmt::Display for WorkType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Queue states for a work item.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type, Default,
)]
#[sqlx(type_name = "work_state", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum WorkState {
    #[default]
    Pending,
    Claimed,
    Processing,
    Cascading,
    Completed,
    Failed,
}

impl WorkState {
    /// Terminal states never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkState::Completed | WorkState::Failed)
    }

    /// States in which a worker currently holds the item.
    pub fn is_held(&self) -> bool {
        matches!(self, WorkState::Claimed | WorkState::Processing | WorkState::Cascading)
    }
}

// ============================================================================
// Payload / result / cascade metadata
// ============================================================================

/// Typed work payload. Persisted as permissive JSONB; decoded at the
/// boundary when a worker picks the item up.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkPayload {
    /// P1: interpret one dump into proposed substrate.
    Substrate { dump_id: DumpId },
    /// P2: propose relationships over current substrate.
    Graph,
    /// P3: compute a reflection artifact over a substrate window.
    Reflection,
    /// P4: compose or refresh a document.
    Compose {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        document_id: Option<DocumentId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        intent: Option<String>,
    },
    /// A human-submitted substrate edit routed through governance.
    ManualEdit { proposal_id: ProposalId },
    /// A proposal waiting on a human decision.
    ProposalReview { proposal_id: ProposalId },
}

/// Substrate impact counters accumulated by a completed work item.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubstrateImpact {
    pub proposals_created: u32,
    pub blocks_created: u32,
    pub context_items_created: u32,
    pub relationships_mapped: u32,
    pub artifacts_generated: u32,
}

impl SubstrateImpact {
    pub fn merge(&mut self, other: &SubstrateImpact) {
        self.proposals_created += other.proposals_created;
        self.blocks_created += other.blocks_created;
        self.context_items_created += other.context_items_created;
        self.relationships_mapped += other.relationships_mapped;
        self.artifacts_generated += other.artifacts_generated;
    }
}

/// Structured error record persisted in `work_result.error`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkErrorRecord {
    pub code: String,
    pub message: String,
    #[serde(default)]
    pub recovery_actions: Vec<String>,
}

impl WorkErrorRecord {
    pub fn from_error(err: &crate::common::OrchestratorError) -> Self {
        Self {
            code: err.code().to_string(),
            message: err.to_string(),
            recovery_actions: err.recovery_actions(),
        }
    }
}

/// Outcome of a finished work item, persisted as `work_result`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proposal_id: Option<ProposalId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta_id: Option<DeltaId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reflection_id: Option<ReflectionId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_id: Option<DocumentId>,
    #[serde(default)]
    pub substrate_impact: SubstrateImpact,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<WorkErrorRecord>,
}

/// Lineage and routing hints for cascade flows.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CascadeMetadata {
    /// Stage the coordinator should enqueue once this item completes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_stage: Option<WorkType>,
    /// Dump that started the cascade, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_dump_id: Option<DumpId>,
    /// Distance from the cascade root.
    #[serde(default)]
    pub depth: u32,
}

// ============================================================================
// WorkItem model
// ============================================================================

#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct WorkItem {
    #[builder(default = WorkId::new())]
    pub id: WorkId,

    pub work_type: WorkType,

    /// Permissive persisted payload; decode with [`WorkItem::payload`].
    pub work_payload: serde_json::Value,

    #[builder(default)]
    pub state: WorkState,

    /// Higher runs sooner; ties broken by `created_at`.
    #[builder(default = 5)]
    pub priority: i32,

    pub workspace_id: WorkspaceId,
    #[builder(default, setter(strip_option))]
    pub basket_id: Option<BasketId>,
    #[builder(default, setter(strip_option))]
    pub user_id: Option<UserId>,
    #[builder(default, setter(strip_option))]
    pub parent_work_id: Option<WorkId>,

    #[builder(default = 0)]
    pub attempts: i32,
    #[builder(default = 5)]
    pub max_attempts: i32,

    // Lease management
    #[builder(default, setter(strip_option))]
    pub claim_lease_expires_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub worker_id: Option<String>,
    /// Earliest time the item may be claimed again (retry backoff).
    #[builder(default, setter(strip_option))]
    pub next_attempt_at: Option<DateTime<Utc>>,

    /// Coalescing key; at most one non-terminal item per key.
    #[builder(default, setter(strip_option))]
    pub dedupe_key: Option<String>,

    pub cascade_metadata: serde_json::Value,
    #[builder(default, setter(strip_option))]
    pub work_result: Option<serde_json::Value>,

    #[builder(default = Utc::now())]
    pub created_at: DateTime<Utc>,
    #[builder(default = Utc::now())]
    pub updated_at: DateTime<Utc>,
}

impl WorkItem {
    /// Decode the typed payload.
    pub fn payload(&self) -> Result<WorkPayload, serde_json::Error> {
        serde_json::from_value(self.work_payload.clone())
    }

    /// Decode the cascade metadata.
    pub fn cascade(&self) -> CascadeMetadata {
        serde_json::from_value(self.cascade_metadata.clone()).unwrap_or_default()
    }

    /// Decode the persisted result, if any.
    pub fn result(&self) -> Option<WorkResult> {
        self.work_result
            .as_ref()
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// Whether the lease on a held item has lapsed.
    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.state.is_held()
            && self
                .claim_lease_expires_at
                .map(|at| at < now)
                .unwrap_or(true)
    }

    /// Whether the retry budget allows another attempt.
    pub fn attempts_remaining(&self) -> bool {
        self.attempts < self.max_attempts
    }
}

/// Inputs for enqueueing a new work item.
#[derive(Debug, Clone, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct NewWorkItem {
    pub work_type: WorkType,
    pub payload: WorkPayload,
    pub workspace_id: WorkspaceId,
    #[builder(default, setter(strip_option))]
    pub basket_id: Option<BasketId>,
    #[builder(default, setter(strip_option))]
    pub user_id: Option<UserId>,
    #[builder(default, setter(strip_option))]
    pub parent_work_id: Option<WorkId>,
    #[builder(default = 5)]
    pub priority: i32,
    #[builder(default = 5)]
    pub max_attempts: i32,
    #[builder(default, setter(strip_option))]
    pub dedupe_key: Option<String>,
    /// Hold the item back until this instant (debounce window).
    #[builder(default, setter(strip_option))]
    pub not_before: Option<DateTime<Utc>>,
    #[builder(default)]
    pub cascade: CascadeMetadata,
}

impl NewWorkItem {
    /// Materialize a pending [`WorkItem`] row.
    pub fn into_item(self) -> Result<WorkItem, serde_json::Error> {
        let payload = serde_json::to_value(&self.payload)?;
        let cascade = serde_json::to_value(&self.cascade)?;
        let mut item = WorkItem::builder()
            .work_type(self.work_type)
            .work_payload(payload)
            .priority(self.priority)
            .max_attempts(self.max_attempts)
            .workspace_id(self.workspace_id)
            .cascade_metadata(cascade)
            .build();
        item.basket_id = self.basket_id;
        item.user_id = self.user_id;
        item.parent_work_id = self.parent_work_id;
        item.dedupe_key = self.dedupe_key;
        item.next_attempt_at = self.not_before;
        Ok(item)
    }
}

/// Queue health metrics derived from `work_queue`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueHealth {
    pub total_items: i64,
    pub pending_items: i64,
    pub processing_items: i64,
    pub completed_items: i64,
    pub failed_items: i64,
    pub active_cascades: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_item() -> WorkItem {
        NewWorkItem::builder()
            .work_type(WorkType::P1Substrate)
            .payload(WorkPayload::Substrate { dump_id: DumpId::new() })
            .workspace_id(WorkspaceId::new())
            .build()
            .into_item()
            .unwrap()
    }

    #[test]
    fn new_item_starts_pending() {
        let item = sample_item();
        assert_eq!(item.state, WorkState::Pending);
        assert_eq!(item.attempts, 0);
    }

    #[test]
    fn payload_round_trips() {
        let dump_id = DumpId::new();
        let item = NewWorkItem::builder()
            .work_type(WorkType::P1Substrate)
            .payload(WorkPayload::Substrate { dump_id })
            .workspace_id(WorkspaceId::new())
            .build()
            .into_item()
            .unwrap();
        match item.payload().unwrap() {
            WorkPayload::Substrate { dump_id: got } => assert_eq!(got, dump_id),
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[test]
    fn held_item_without_lease_counts_as_expired() {
        let mut item = sample_item();
        item.state = WorkState::Processing;
        item.claim_lease_expires_at = None;
        assert!(item.lease_expired(Utc::now()));
    }

    #[test]
    fn pending_item_is_not_lease_expired() {
        let item = sample_item();
        assert!(!item.lease_expired(Utc::now()));
    }

    #[test]
    fn terminal_states() {
        assert!(WorkState::Completed.is_terminal());
        assert!(WorkState::Failed.is_terminal());
        assert!(!WorkState::Cascading.is_terminal());
        assert!(!WorkState::Pending.is_terminal());
    }

    #[test]
    fn work_type_strings_match_wire_names() {
        assert_eq!(WorkType::P1Substrate.as_str(), "P1_SUBSTRATE");
        assert_eq!(
            serde_json::to_string(&WorkType::P3Reflection).unwrap(),
            "\"P3_REFLECTION\""
        );
    }
}
