//! In-memory work queue for tests and single-process setups.
//!
//! Mirrors the Postgres queue's claim, lease, dedupe, and retry semantics
//! over a mutex-guarded table.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use crate::common::{OrchestratorError, OrchestratorResult, WorkId, WorkspaceId};
use crate::config::OrchestratorConfig;

use super::item::{
    NewWorkItem, QueueHealth, WorkErrorRecord, WorkItem, WorkResult, WorkState, WorkType,
};
use super::queue::{retry_backoff, WorkQueue};

#[derive(Clone)]
pub struct MemoryWorkQueue {
    items: Arc<Mutex<Vec<WorkItem>>>,
    workspace_cap: usize,
    backoff_base: Duration,
    backoff_max: Duration,
}

impl MemoryWorkQueue {
    pub fn new(config: &OrchestratorConfig) -> Self {
        Self {
            items: Arc::new(Mutex::new(Vec::new())),
            workspace_cap: config.workspace_concurrency_cap,
            backoff_base: config.backoff_base,
            backoff_max: config.backoff_max,
        }
    }

    /// Snapshot of every item. Test helper.
    pub fn all_items(&self) -> Vec<WorkItem> {
        self.items.lock().expect("queue poisoned").clone()
    }

    /// Force a held item's lease into the past, simulating a dead worker.
    /// Test helper.
    pub fn expire_lease(&self, work_id: WorkId) {
        let mut items = self.items.lock().expect("queue poisoned");
        if let Some(item) = items.iter_mut().find(|i| i.id == work_id) {
            item.claim_lease_expires_at = Some(Utc::now() - chrono::Duration::seconds(1));
        }
    }
}

#[async_trait]
impl WorkQueue for MemoryWorkQueue {
    async fn enqueue(&self, new_item: NewWorkItem) -> OrchestratorResult<WorkItem> {
        let row = new_item.into_item()?;
        let mut items = self.items.lock().expect("queue poisoned");

        if let Some(key) = &row.dedupe_key {
            if let Some(existing) = items
                .iter_mut()
                .find(|i| i.dedupe_key.as_deref() == Some(key.as_str()) && !i.state.is_terminal())
            {
                existing.updated_at = Utc::now();
                return Ok(existing.clone());
            }
        }

        items.push(row.clone());
        Ok(row)
    }

    async fn claim(
        &self,
        work_types: &[WorkType],
        worker_id: &str,
        lease: Duration,
    ) -> OrchestratorResult<Option<WorkItem>> {
        let now = Utc::now();
        let mut items = self.items.lock().expect("queue poisoned");

        let held_per_workspace = |items: &[WorkItem], workspace_id: WorkspaceId| {
            items
                .iter()
                .filter(|i| i.workspace_id == workspace_id && i.state.is_held())
                .count()
        };

        let mut candidate: Option<usize> = None;
        for (idx, item) in items.iter().enumerate() {
            if item.state != WorkState::Pending
                || !work_types.contains(&item.work_type)
                || item.next_attempt_at.map(|at| at > now).unwrap_or(false)
                || held_per_workspace(&items, item.workspace_id) >= self.workspace_cap
            {
                continue;
            }
            let better = match candidate {
                None => true,
                Some(best) => {
                    let best = &items[best];
                    item.priority > best.priority
                        || (item.priority == best.priority && item.created_at < best.created_at)
                }
            };
            if better {
                candidate = Some(idx);
            }
        }

        Ok(candidate.map(|idx| {
            let item = &mut items[idx];
            item.state = WorkState::Claimed;
            item.worker_id = Some(worker_id.to_string());
            item.claim_lease_expires_at =
                Some(now + chrono::Duration::from_std(lease).unwrap_or_else(|_| chrono::Duration::zero()));
            item.updated_at = now;
            item.clone()
        }))
    }

    async fn mark_processing(&self, work_id: WorkId) -> OrchestratorResult<()> {
        let mut items = self.items.lock().expect("queue poisoned");
        let item = items
            .iter_mut()
            .find(|i| i.id == work_id)
            .ok_or_else(|| OrchestratorError::Fatal(format!("unknown work item {work_id}")))?;
        if item.state != WorkState::Claimed {
            return Err(OrchestratorError::Conflict(format!(
                "work item {work_id} is not claimed"
            )));
        }
        item.state = WorkState::Processing;
        item.updated_at = Utc::now();
        Ok(())
    }

    async fn mark_cascading(&self, work_id: WorkId) -> OrchestratorResult<()> {
        let mut items = self.items.lock().expect("queue poisoned");
        if let Some(item) = items
            .iter_mut()
            .find(|i| i.id == work_id && i.state == WorkState::Processing)
        {
            item.state = WorkState::Cascading;
            item.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn heartbeat(&self, work_id: WorkId, lease: Duration) -> OrchestratorResult<()> {
        let mut items = self.items.lock().expect("queue poisoned");
        if let Some(item) = items.iter_mut().find(|i| i.id == work_id && i.state.is_held()) {
            item.claim_lease_expires_at =
                Some(Utc::now() + chrono::Duration::from_std(lease).unwrap_or_else(|_| chrono::Duration::zero()));
            item.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn complete(&self, work_id: WorkId, result: WorkResult) -> OrchestratorResult<WorkItem> {
        let mut items = self.items.lock().expect("queue poisoned");
        let item = items
            .iter_mut()
            .find(|i| i.id == work_id)
            .ok_or_else(|| OrchestratorError::Fatal(format!("unknown work item {work_id}")))?;
        if !item.state.is_held() {
            return Err(OrchestratorError::Conflict(format!(
                "work item {work_id} is not held"
            )));
        }
        item.state = WorkState::Completed;
        item.work_result = Some(serde_json::to_value(&result)?);
        item.claim_lease_expires_at = None;
        item.updated_at = Utc::now();
        Ok(item.clone())
    }

    async fn resolve_manual(
        &self,
        work_id: WorkId,
        result: WorkResult,
    ) -> OrchestratorResult<WorkItem> {
        let mut items = self.items.lock().expect("queue poisoned");
        let item = items
            .iter_mut()
            .find(|i| i.id == work_id)
            .ok_or_else(|| OrchestratorError::Fatal(format!("unknown work item {work_id}")))?;
        if item.state.is_terminal() {
            return Err(OrchestratorError::Conflict(format!(
                "work item {work_id} is already terminal"
            )));
        }
        item.state = WorkState::Completed;
        item.work_result = Some(serde_json::to_value(&result)?);
        item.claim_lease_expires_at = None;
        item.updated_at = Utc::now();
        Ok(item.clone())
    }

    async fn fail(
        &self,
        work_id: WorkId,
        error: WorkErrorRecord,
        retryable: bool,
    ) -> OrchestratorResult<WorkItem> {
        let mut items = self.items.lock().expect("queue poisoned");
        let item = items
            .iter_mut()
            .find(|i| i.id == work_id)
            .ok_or_else(|| OrchestratorError::Fatal(format!("unknown work item {work_id}")))?;

        let backoff = retry_backoff(self.backoff_base, self.backoff_max, item.attempts);
        item.attempts += 1;
        let requeue = retryable && item.attempts < item.max_attempts;

        let mut result = item.result().unwrap_or_default();
        result.error = Some(error);
        item.work_result = Some(serde_json::to_value(&result)?);

        if requeue {
            item.state = WorkState::Pending;
            item.next_attempt_at =
                Some(Utc::now() + chrono::Duration::from_std(backoff).unwrap_or_else(|_| chrono::Duration::zero()));
        } else {
            item.state = WorkState::Failed;
            item.next_attempt_at = None;
        }
        item.claim_lease_expires_at = None;
        item.worker_id = None;
        item.updated_at = Utc::now();
        Ok(item.clone())
    }

    async fn reap_expired(&self) -> OrchestratorResult<Vec<WorkItem>> {
        let now = Utc::now();
        let mut reaped = Vec::new();
        let mut items = self.items.lock().expect("queue poisoned");

        for item in items.iter_mut() {
            if !item.lease_expired(now) {
                continue;
            }
            let backoff = retry_backoff(self.backoff_base, self.backoff_max, item.attempts);
            item.attempts += 1;
            if item.attempts < item.max_attempts {
                item.state = WorkState::Pending;
                item.next_attempt_at =
                    Some(now + chrono::Duration::from_std(backoff).unwrap_or_else(|_| chrono::Duration::zero()));
            } else {
                item.state = WorkState::Failed;
                let mut result = item.result().unwrap_or_default();
                result.error = Some(WorkErrorRecord {
                    code: "transient_error".to_string(),
                    message: "lease expired past retry cap".to_string(),
                    recovery_actions: vec![],
                });
                item.work_result = serde_json::to_value(&result).ok();
                item.next_attempt_at = None;
            }
            item.claim_lease_expires_at = None;
            item.worker_id = None;
            item.updated_at = now;
            reaped.push(item.clone());
        }

        Ok(reaped)
    }

    async fn get(&self, work_id: WorkId) -> OrchestratorResult<Option<WorkItem>> {
        let items = self.items.lock().expect("queue poisoned");
        Ok(items.iter().find(|i| i.id == work_id).cloned())
    }

    async fn find_by_dedupe_key(&self, key: &str) -> OrchestratorResult<Option<WorkItem>> {
        let items = self.items.lock().expect("queue poisoned");
        Ok(items
            .iter()
            .find(|i| i.dedupe_key.as_deref() == Some(key) && !i.state.is_terminal())
            .cloned())
    }

    async fn children_of(&self, work_id: WorkId) -> OrchestratorResult<Vec<WorkItem>> {
        let items = self.items.lock().expect("queue poisoned");
        let mut children: Vec<WorkItem> = items
            .iter()
            .filter(|i| i.parent_work_id == Some(work_id))
            .cloned()
            .collect();
        children.sort_by_key(|i| i.created_at);
        Ok(children)
    }

    async fn active_for_workspace(
        &self,
        workspace_id: WorkspaceId,
    ) -> OrchestratorResult<Vec<WorkItem>> {
        let items = self.items.lock().expect("queue poisoned");
        Ok(items
            .iter()
            .filter(|i| i.workspace_id == workspace_id && !i.state.is_terminal())
            .cloned()
            .collect())
    }

    async fn health(&self) -> OrchestratorResult<QueueHealth> {
        let items = self.items.lock().expect("queue poisoned");
        let count = |state: WorkState| items.iter().filter(|i| i.state == state).count() as i64;
        Ok(QueueHealth {
            total_items: items.len() as i64,
            pending_items: count(WorkState::Pending),
            processing_items: count(WorkState::Claimed) + count(WorkState::Processing),
            completed_items: count(WorkState::Completed),
            failed_items: count(WorkState::Failed),
            active_cascades: count(WorkState::Cascading),
        })
    }
}
