//! Append-only revision log for block mutations.
//!
//! Every committed `UpdateBlock`/`ReviseBlock` writes one revision row with
//! a structural diff. Content excerpts are truncated; diff shape survives.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::common::{BlockId, UserId, WorkspaceId};

/// Max stored characters per diff side.
pub const REVISION_EXCERPT_LIMIT: usize = 2000;

/// Field-level before/after pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDiff {
    pub field: String,
    pub before: String,
    pub after: String,
}

/// Structural diff persisted as `diff_json`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BlockDiff {
    pub from_version: i32,
    pub to_version: i32,
    pub fields: Vec<FieldDiff>,
}

impl BlockDiff {
    pub fn new(from_version: i32, to_version: i32) -> Self {
        Self { from_version, to_version, fields: Vec::new() }
    }

    /// Record a changed field, truncating both sides to the excerpt limit.
    pub fn push_field(&mut self, field: &str, before: &str, after: &str) {
        self.fields.push(FieldDiff {
            field: field.to_string(),
            before: truncate(before),
            after: truncate(after),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

fn truncate(text: &str) -> String {
    if text.chars().count() <= REVISION_EXCERPT_LIMIT {
        text.to_string()
    } else {
        text.chars().take(REVISION_EXCERPT_LIMIT).collect()
    }
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct Revision {
    pub id: Uuid,
    pub block_id: BlockId,
    pub workspace_id: WorkspaceId,
    pub actor_id: Option<UserId>,
    pub summary: String,
    pub diff_json: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl Revision {
    pub fn diff(&self) -> Option<BlockDiff> {
        serde_json::from_value(self.diff_json.clone()).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn long_content_is_truncated_but_diff_structure_survives() {
        let long = "x".repeat(REVISION_EXCERPT_LIMIT + 500);
        let mut diff = BlockDiff::new(1, 2);
        diff.push_field("content", &long, "short");

        assert_eq!(diff.fields.len(), 1);
        assert_eq!(diff.fields[0].before.chars().count(), REVISION_EXCERPT_LIMIT);
        assert_eq!(diff.fields[0].after, "short");
        assert_eq!(diff.from_version, 1);
        assert_eq!(diff.to_version, 2);
    }

    #[test]
    fn short_content_is_kept_verbatim() {
        let mut diff = BlockDiff::new(3, 4);
        diff.push_field("title", "Reduce MTTR", "Reduce MTTR below 10m");
        assert_eq!(diff.fields[0].before, "Reduce MTTR");
    }
}
