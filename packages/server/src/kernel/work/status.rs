//! Work status views.
//!
//! Derived entirely from queue rows; nothing here writes state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::common::{BasketId, UserId, WorkId, WorkspaceId};

use super::cascade::{CascadeCoordinator, CascadeFlow};
use super::item::{SubstrateImpact, WorkErrorRecord, WorkItem, WorkState, WorkType};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkStatusView {
    pub work_id: WorkId,
    pub work_type: WorkType,
    pub status: WorkState,
    pub progress_percentage: u8,
    pub workspace_id: WorkspaceId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub basket_id: Option<BasketId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
    pub started_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub attempts: i32,
    pub substrate_impact: SubstrateImpact,
    pub cascade_flow: CascadeFlow,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<WorkErrorRecord>,
}

/// Build the status view for one item and its cascade descendants.
pub fn build_status(item: &WorkItem, descendants: &[WorkItem]) -> WorkStatusView {
    let mut impact = SubstrateImpact::default();
    for node in std::iter::once(item).chain(descendants.iter()) {
        if let Some(result) = node.result() {
            impact.merge(&result.substrate_impact);
        }
    }

    let error = item.result().and_then(|r| r.error);
    let cascade_flow = CascadeCoordinator::flow(item, descendants);

    WorkStatusView {
        work_id: item.id,
        work_type: item.work_type,
        status: item.state,
        progress_percentage: progress(item.state),
        workspace_id: item.workspace_id,
        basket_id: item.basket_id,
        user_id: item.user_id,
        started_at: item.created_at,
        last_activity: item.updated_at,
        attempts: item.attempts,
        substrate_impact: impact,
        cascade_flow,
        error,
    }
}

fn progress(state: WorkState) -> u8 {
    match state {
        WorkState::Pending => 5,
        WorkState::Claimed => 15,
        WorkState::Processing => 60,
        WorkState::Cascading => 85,
        WorkState::Completed | WorkState::Failed => 100,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::WorkspaceId;
    use crate::kernel::work::item::{NewWorkItem, WorkPayload, WorkResult};

    #[test]
    fn impact_aggregates_across_cascade() {
        let mut root = NewWorkItem::builder()
            .work_type(WorkType::P1Substrate)
            .payload(WorkPayload::Reflection)
            .workspace_id(WorkspaceId::new())
            .build()
            .into_item()
            .unwrap();
        root.state = WorkState::Completed;
        root.work_result = serde_json::to_value(WorkResult {
            substrate_impact: SubstrateImpact { blocks_created: 2, ..Default::default() },
            ..Default::default()
        })
        .ok();

        let mut child = root.clone();
        child.id = WorkId::new();
        child.work_type = WorkType::P3Reflection;
        child.parent_work_id = Some(root.id);
        child.work_result = serde_json::to_value(WorkResult {
            substrate_impact: SubstrateImpact { artifacts_generated: 1, ..Default::default() },
            ..Default::default()
        })
        .ok();

        let view = build_status(&root, &[child]);
        assert_eq!(view.substrate_impact.blocks_created, 2);
        assert_eq!(view.substrate_impact.artifacts_generated, 1);
        assert_eq!(view.progress_percentage, 100);
    }
}
