//! Context items: lightweight tags, entities, and cues extracted from
//! blocks or dumps.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::common::{BasketId, ContextItemId, WorkspaceId};

/// Kind of context item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "context_item_type", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ContextItemType {
    Tag,
    Entity,
    Topic,
    Cue,
}

/// Lifecycle state. Items are cheap; they are either live or retired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "context_item_state", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ContextItemState {
    #[default]
    Active,
    Archived,
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct ContextItem {
    pub id: ContextItemId,
    pub basket_id: BasketId,
    pub workspace_id: WorkspaceId,
    pub item_type: ContextItemType,
    pub label: String,
    pub state: ContextItemState,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl ContextItem {
    /// Normalized label used for uniqueness within a basket.
    pub fn normalized_label(label: &str) -> String {
        label.trim().to_lowercase()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_normalize_case_and_whitespace() {
        assert_eq!(ContextItem::normalized_label("  MTTR  "), "mttr");
        assert_eq!(
            ContextItem::normalized_label("Incident Response"),
            "incident response"
        );
    }
}
