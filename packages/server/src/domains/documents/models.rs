//! Document and substrate reference models.
//!
//! Documents are artifact-layer: they are written through a dedicated
//! commit path, not through proposals, and reference substrate rather than
//! copying it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::common::{BasketId, DocumentId, WorkspaceId};
use crate::domains::substrate::SubstrateType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "composition_mode", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum CompositionMode {
    /// Composed fresh from current substrate.
    #[default]
    Composed,
    /// Recomposed after a reflection flagged it for refresh.
    Refreshed,
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct Document {
    pub id: DocumentId,
    pub basket_id: BasketId,
    pub workspace_id: WorkspaceId,
    pub title: String,
    pub body: String,
    pub composition_mode: CompositionMode,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Link from a document to the substrate it was composed from. Unique per
/// `(document_id, substrate_type, substrate_id)`.
#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct SubstrateReference {
    pub id: Uuid,
    pub document_id: DocumentId,
    pub substrate_type: SubstrateType,
    pub substrate_id: Uuid,
    pub role: String,
    pub weight: f32,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewSubstrateReference {
    pub substrate_type: SubstrateType,
    pub substrate_id: Uuid,
    pub role: String,
    pub weight: f32,
}
