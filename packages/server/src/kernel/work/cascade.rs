//! Cascade coordination.
//!
//! Work items link to their parent through `parent_work_id`, forming a tree
//! per pipeline run. The coordinator enqueues explicit next stages, derives
//! cascade status, and surfaces orphaned cascades.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::common::{OrchestratorResult, WorkId, WorkspaceId};

use super::item::{CascadeMetadata, NewWorkItem, WorkItem, WorkPayload, WorkState, WorkType};
use super::queue::WorkQueue;

/// Cascade flow status for pipeline operations.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CascadeFlow {
    pub active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_stage: Option<String>,
    pub completed_stages: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_stage: Option<String>,
    pub failed: bool,
}

pub struct CascadeCoordinator {
    queue: Arc<dyn WorkQueue>,
}

impl CascadeCoordinator {
    pub fn new(queue: Arc<dyn WorkQueue>) -> Self {
        Self { queue }
    }

    /// Enqueue the child stage named by a completed item's
    /// `cascade_metadata.next_stage`, recording lineage. Debounced via the
    /// same dedupe keys the dispatcher uses, so event-driven and explicit
    /// cascades coalesce.
    pub async fn enqueue_next(&self, parent: &WorkItem) -> OrchestratorResult<Option<WorkItem>> {
        let cascade = parent.cascade();
        let Some(next_stage) = cascade.next_stage else {
            return Ok(None);
        };

        let payload = match next_stage {
            WorkType::P2Graph => WorkPayload::Graph,
            WorkType::P3Reflection => WorkPayload::Reflection,
            WorkType::P4Compose => WorkPayload::Compose { document_id: None, intent: None },
            other => {
                tracing::warn!(parent = %parent.id, stage = %other,
                               "cascade next_stage is not an enqueueable pipeline stage");
                return Ok(None);
            }
        };

        let dedupe_key = parent
            .basket_id
            .map(|basket| format!("{}:{}", stage_key(next_stage), basket));

        let mut item = NewWorkItem::builder()
            .work_type(next_stage)
            .payload(payload)
            .workspace_id(parent.workspace_id)
            .parent_work_id(parent.id)
            .cascade(CascadeMetadata {
                next_stage: None,
                origin_dump_id: cascade.origin_dump_id,
                depth: cascade.depth + 1,
            })
            .build();
        item.basket_id = parent.basket_id;
        item.user_id = parent.user_id;
        item.dedupe_key = dedupe_key;

        let child = self.queue.enqueue(item).await?;
        Ok(Some(child))
    }

    /// All descendants of a work item, breadth-first.
    pub async fn descendants(&self, work_id: WorkId) -> OrchestratorResult<Vec<WorkItem>> {
        let mut out = Vec::new();
        let mut frontier = VecDeque::from([work_id]);
        while let Some(current) = frontier.pop_front() {
            for child in self.queue.children_of(current).await? {
                frontier.push_back(child.id);
                out.push(child);
            }
        }
        Ok(out)
    }

    /// Derive cascade status for a root item and its descendants.
    pub fn flow(root: &WorkItem, descendants: &[WorkItem]) -> CascadeFlow {
        let all = std::iter::once(root).chain(descendants.iter());

        let mut completed_stages = Vec::new();
        let mut current_stage = None;
        let mut active = false;
        let mut failed = false;

        for item in all {
            match item.state {
                WorkState::Completed => {
                    let stage = item.work_type.as_str().to_string();
                    if !completed_stages.contains(&stage) {
                        completed_stages.push(stage);
                    }
                }
                WorkState::Failed => failed = true,
                _ => {
                    active = true;
                    if current_stage.is_none() {
                        current_stage = Some(item.work_type.as_str().to_string());
                    }
                }
            }
        }

        let next_stage = descendants
            .iter()
            .chain(std::iter::once(root))
            .find(|i| i.state == WorkState::Pending)
            .map(|i| i.work_type.as_str().to_string());

        CascadeFlow { active, current_stage, completed_stages, next_stage, failed }
    }

    /// Cascades with no progress (no `updated_at` movement anywhere in the
    /// tree) within `timeout`. Returned roots need operator attention.
    pub async fn find_orphans(
        &self,
        workspace_id: WorkspaceId,
        timeout: Duration,
    ) -> OrchestratorResult<Vec<WorkItem>> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(timeout).unwrap_or_else(|_| chrono::Duration::seconds(600));
        let active = self.queue.active_for_workspace(workspace_id).await?;

        let mut orphans = Vec::new();
        for item in &active {
            if item.parent_work_id.is_some() {
                continue;
            }
            let descendants = self.descendants(item.id).await?;
            let latest_activity = descendants
                .iter()
                .map(|d| d.updated_at)
                .chain(std::iter::once(item.updated_at))
                .max()
                .unwrap_or(item.updated_at);
            if latest_activity < cutoff {
                orphans.push(item.clone());
            }
        }
        Ok(orphans)
    }
}

fn stage_key(work_type: WorkType) -> &'static str {
    match work_type {
        WorkType::P0Capture => "p0",
        WorkType::P1Substrate => "p1",
        WorkType::P2Graph => "p2",
        WorkType::P3Reflection => "p3",
        WorkType::P4Compose => "p4",
        WorkType::ManualEdit => "manual",
        WorkType::ProposalReview => "review",
        WorkType::TimelineRestore => "restore",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::WorkspaceId;

    fn item(work_type: WorkType, state: WorkState, parent: Option<WorkId>) -> WorkItem {
        let mut item = NewWorkItem::builder()
            .work_type(work_type)
            .payload(WorkPayload::Reflection)
            .workspace_id(WorkspaceId::new())
            .build()
            .into_item()
            .unwrap();
        item.state = state;
        item.parent_work_id = parent;
        item
    }

    #[test]
    fn completed_tree_is_inactive_with_all_stages() {
        let root = item(WorkType::P1Substrate, WorkState::Completed, None);
        let child = item(WorkType::P3Reflection, WorkState::Completed, Some(root.id));

        let flow = CascadeCoordinator::flow(&root, &[child]);
        assert!(!flow.active);
        assert!(!flow.failed);
        assert_eq!(flow.completed_stages, vec!["P1_SUBSTRATE", "P3_REFLECTION"]);
    }

    #[test]
    fn running_descendant_keeps_cascade_active() {
        let root = item(WorkType::P1Substrate, WorkState::Completed, None);
        let child = item(WorkType::P3Reflection, WorkState::Processing, Some(root.id));

        let flow = CascadeCoordinator::flow(&root, &[child]);
        assert!(flow.active);
        assert_eq!(flow.current_stage.as_deref(), Some("P3_REFLECTION"));
    }

    #[test]
    fn failed_descendant_marks_cascade_failed() {
        let root = item(WorkType::P1Substrate, WorkState::Completed, None);
        let child = item(WorkType::P3Reflection, WorkState::Failed, Some(root.id));

        let flow = CascadeCoordinator::flow(&root, &[child]);
        assert!(flow.failed);
        assert!(!flow.active);
    }
}
