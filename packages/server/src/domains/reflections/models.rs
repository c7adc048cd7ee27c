//! Reflection artifact model.
//!
//! Reflections never mutate substrate. They are versioned by
//! `(basket_id, kind, computation_timestamp)` and carry a hash of the
//! substrate window they derive from so unchanged windows skip
//! recomputation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::common::{BasketId, ReflectionId, WorkspaceId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "reflection_kind", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ReflectionKind {
    Pattern,
    Tension,
    Question,
    Insight,
}

impl ReflectionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReflectionKind::Pattern => "pattern",
            ReflectionKind::Tension => "tension",
            ReflectionKind::Question => "question",
            ReflectionKind::Insight => "insight",
        }
    }
}

/// Bounds of the substrate slice a reflection was computed over.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubstrateWindow {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since: Option<DateTime<Utc>>,
    pub block_count: usize,
    pub dump_count: usize,
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct ReflectionArtifact {
    pub id: ReflectionId,
    pub basket_id: BasketId,
    pub workspace_id: WorkspaceId,
    pub kind: ReflectionKind,
    pub body: String,
    pub substrate_window: serde_json::Value,
    /// Hash of the block ids + versions in the window. Unchanged hash means
    /// recomputation is skipped.
    pub meta_derived_from: String,
    pub computation_timestamp: DateTime<Utc>,
}

impl ReflectionArtifact {
    pub fn window(&self) -> SubstrateWindow {
        serde_json::from_value(self.substrate_window.clone()).unwrap_or_default()
    }
}
