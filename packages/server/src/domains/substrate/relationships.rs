//! Directed relationships between substrate elements.
//!
//! Unique per basket on the full `(from, to, relationship_type)` tuple.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::common::{BasketId, WorkspaceId};

/// Which table a relationship endpoint lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "substrate_type", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SubstrateType {
    Block,
    ContextItem,
    Dump,
}

/// A typed endpoint reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubstrateRef {
    pub substrate_type: SubstrateType,
    pub id: Uuid,
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct Relationship {
    pub id: Uuid,
    pub basket_id: BasketId,
    pub workspace_id: WorkspaceId,
    pub from_type: SubstrateType,
    pub from_id: Uuid,
    pub to_type: SubstrateType,
    pub to_id: Uuid,
    pub relationship_type: String,
    pub strength: f32,
    pub created_at: DateTime<Utc>,
}

impl Relationship {
    pub fn from_ref(&self) -> SubstrateRef {
        SubstrateRef { substrate_type: self.from_type, id: self.from_id }
    }

    pub fn to_ref(&self) -> SubstrateRef {
        SubstrateRef { substrate_type: self.to_type, id: self.to_id }
    }
}
