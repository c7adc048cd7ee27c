//! Durable, ordered, at-least-once event bus.
//!
//! Events are persisted to the `events` table before any notification is
//! sent, so a crash between insert and notify never loses an event.
//! Consumers are expected to be idempotent, keyed on the event id, and can
//! replay from a cursor after a disconnect.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

use crate::common::{
    BasketId, DeltaId, DocumentId, DumpId, OrchestratorResult, ProposalId, ReflectionId, UserId,
    WorkId, WorkspaceId,
};

pub use memory::MemoryEventBus;
pub use postgres::PostgresEventBus;

// ============================================================================
// Topics
// ============================================================================

/// Canonical bus topics. Closed set; dispatch routing matches exhaustively.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Topic {
    #[serde(rename = "dump.created")]
    DumpCreated,
    #[serde(rename = "substrate.committed")]
    SubstrateCommitted,
    #[serde(rename = "substrate.commit_failed")]
    SubstrateCommitFailed,
    #[serde(rename = "proposal.drafted")]
    ProposalDrafted,
    #[serde(rename = "proposal.validated")]
    ProposalValidated,
    #[serde(rename = "proposal.approved")]
    ProposalApproved,
    #[serde(rename = "proposal.rejected")]
    ProposalRejected,
    #[serde(rename = "proposal.review_requested")]
    ProposalReviewRequested,
    #[serde(rename = "reflection.computed")]
    ReflectionComputed,
    #[serde(rename = "document.composed")]
    DocumentComposed,
    #[serde(rename = "basket.compose_request")]
    BasketComposeRequest,
    #[serde(rename = "work.cascade_completed")]
    WorkCascadeCompleted,
}

impl Topic {
    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::DumpCreated => "dump.created",
            Topic::SubstrateCommitted => "substrate.committed",
            Topic::SubstrateCommitFailed => "substrate.commit_failed",
            Topic::ProposalDrafted => "proposal.drafted",
            Topic::ProposalValidated => "proposal.validated",
            Topic::ProposalApproved => "proposal.approved",
            Topic::ProposalRejected => "proposal.rejected",
            Topic::ProposalReviewRequested => "proposal.review_requested",
            Topic::ReflectionComputed => "reflection.computed",
            Topic::DocumentComposed => "document.composed",
            Topic::BasketComposeRequest => "basket.compose_request",
            Topic::WorkCascadeCompleted => "work.cascade_completed",
        }
    }
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Topic {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "dump.created" => Ok(Topic::DumpCreated),
            "substrate.committed" => Ok(Topic::SubstrateCommitted),
            "substrate.commit_failed" => Ok(Topic::SubstrateCommitFailed),
            "proposal.drafted" => Ok(Topic::ProposalDrafted),
            "proposal.validated" => Ok(Topic::ProposalValidated),
            "proposal.approved" => Ok(Topic::ProposalApproved),
            "proposal.rejected" => Ok(Topic::ProposalRejected),
            "proposal.review_requested" => Ok(Topic::ProposalReviewRequested),
            "reflection.computed" => Ok(Topic::ReflectionComputed),
            "document.composed" => Ok(Topic::DocumentComposed),
            "basket.compose_request" => Ok(Topic::BasketComposeRequest),
            "work.cascade_completed" => Ok(Topic::WorkCascadeCompleted),
            other => Err(format!("unknown topic: {other}")),
        }
    }
}

// ============================================================================
// Typed payloads
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DumpCreatedPayload {
    pub dump_id: DumpId,
    pub basket_id: BasketId,
    pub workspace_id: WorkspaceId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubstrateCommittedPayload {
    pub proposal_id: ProposalId,
    pub delta_id: DeltaId,
    pub basket_id: BasketId,
    pub workspace_id: WorkspaceId,
    /// Work item whose agent produced the committed proposal, when the
    /// commit came out of a pipeline stage. Threads cascade lineage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub work_id: Option<WorkId>,
    pub blocks_changed: u32,
    pub context_items_changed: u32,
    pub relationships_changed: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitFailedPayload {
    pub proposal_id: ProposalId,
    pub basket_id: BasketId,
    pub workspace_id: WorkspaceId,
    pub error_code: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProposalLifecyclePayload {
    pub proposal_id: ProposalId,
    pub basket_id: BasketId,
    pub workspace_id: WorkspaceId,
    pub origin: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReflectionComputedPayload {
    pub reflection_id: ReflectionId,
    pub basket_id: BasketId,
    pub workspace_id: WorkspaceId,
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub work_id: Option<WorkId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentComposedPayload {
    pub document_id: DocumentId,
    pub basket_id: BasketId,
    pub workspace_id: WorkspaceId,
    pub references: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComposeRequestPayload {
    pub basket_id: BasketId,
    pub workspace_id: WorkspaceId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_id: Option<DocumentId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intent: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CascadeCompletedPayload {
    pub root_work_id: WorkId,
    pub basket_id: Option<BasketId>,
    pub workspace_id: WorkspaceId,
    pub completed_stages: Vec<String>,
}

// ============================================================================
// Event records
// ============================================================================

/// A persisted bus event. `id` is a monotone sequence; per
/// `(basket_id, topic)` delivery follows insert order.
#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct EventRecord {
    pub id: i64,
    pub topic: String,
    pub payload: serde_json::Value,
    pub basket_id: Option<BasketId>,
    pub workspace_id: Option<WorkspaceId>,
    pub origin: String,
    pub actor_id: Option<UserId>,
    pub ts: DateTime<Utc>,
    pub delivered_at: Option<DateTime<Utc>>,
}

impl EventRecord {
    pub fn topic(&self) -> Option<Topic> {
        self.topic.parse().ok()
    }

    /// Decode the typed payload for this event's topic.
    pub fn payload_as<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }
}

/// An event about to be emitted.
#[derive(Debug, Clone)]
pub struct NewEvent {
    pub topic: Topic,
    pub payload: serde_json::Value,
    pub basket_id: Option<BasketId>,
    pub workspace_id: Option<WorkspaceId>,
    pub origin: String,
    pub actor_id: Option<UserId>,
}

impl NewEvent {
    pub fn new<P: Serialize>(topic: Topic, payload: &P) -> OrchestratorResult<Self> {
        Ok(Self {
            topic,
            payload: serde_json::to_value(payload)?,
            basket_id: None,
            workspace_id: None,
            origin: "system".to_string(),
            actor_id: None,
        })
    }

    pub fn scoped(mut self, workspace_id: WorkspaceId, basket_id: Option<BasketId>) -> Self {
        self.workspace_id = Some(workspace_id);
        self.basket_id = basket_id;
        self
    }

    pub fn from_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = origin.into();
        self
    }

    pub fn by_actor(mut self, actor_id: UserId) -> Self {
        self.actor_id = Some(actor_id);
        self
    }
}

/// Live subscription handle. Receives events as they are notified; gaps
/// after a disconnect are recovered with [`EventBus::replay_after`].
pub type EventStream = tokio::sync::mpsc::Receiver<EventRecord>;

// ============================================================================
// Bus trait
// ============================================================================

#[async_trait]
pub trait EventBus: Send + Sync {
    /// Durably persist and broadcast an event. Fails only if the insert
    /// fails; notification failures are left to the sweeper.
    async fn emit(&self, event: NewEvent) -> OrchestratorResult<EventRecord>;

    /// Subscribe to live delivery of the given topics.
    async fn subscribe(&self, topics: &[Topic]) -> OrchestratorResult<EventStream>;

    /// Fetch persisted events after `cursor`, oldest first, filtered by
    /// topic. Used by subscribers rejoining after a disconnect.
    async fn replay_after(&self, cursor: i64, topics: &[Topic])
        -> OrchestratorResult<Vec<EventRecord>>;

    /// Record that a consumer finished handling an event.
    async fn mark_delivered(&self, event_id: i64) -> OrchestratorResult<()>;

    /// Re-notify events older than `threshold` that were never marked
    /// delivered. Returns the re-notified records.
    async fn sweep_undelivered(&self, threshold: Duration)
        -> OrchestratorResult<Vec<EventRecord>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_names_round_trip() {
        for topic in [
            Topic::DumpCreated,
            Topic::SubstrateCommitted,
            Topic::SubstrateCommitFailed,
            Topic::ProposalDrafted,
            Topic::ProposalValidated,
            Topic::ProposalApproved,
            Topic::ProposalRejected,
            Topic::ProposalReviewRequested,
            Topic::ReflectionComputed,
            Topic::DocumentComposed,
            Topic::BasketComposeRequest,
            Topic::WorkCascadeCompleted,
        ] {
            assert_eq!(topic.as_str().parse::<Topic>().unwrap(), topic);
        }
    }

    #[test]
    fn unknown_topic_is_rejected() {
        assert!("block.audited".parse::<Topic>().is_err());
    }

    #[test]
    fn serde_uses_dotted_names() {
        assert_eq!(
            serde_json::to_string(&Topic::DumpCreated).unwrap(),
            "\"dump.created\""
        );
    }
}
