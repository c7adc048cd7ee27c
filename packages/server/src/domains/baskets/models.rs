//! Workspace and basket models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::common::{BasketId, WorkspaceId};

#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct Workspace {
    pub id: WorkspaceId,
    pub owner_ref: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "basket_status", rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum BasketStatus {
    #[default]
    Draft,
    Active,
    Archived,
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct Basket {
    pub id: BasketId,
    pub workspace_id: WorkspaceId,
    pub status: BasketStatus,
    pub created_at: DateTime<Utc>,
}

impl Basket {
    /// Whether substrate mutations are allowed.
    pub fn accepts_writes(&self) -> bool {
        !matches!(self.status, BasketStatus::Archived)
    }
}
