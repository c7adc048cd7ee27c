//! Work queue contract.
//!
//! Claim is linearizable (a single guarded update); leases bound how long a
//! worker may hold an item before the reaper hands it back to the queue.

use std::time::Duration;

use async_trait::async_trait;

use crate::common::{OrchestratorResult, WorkId, WorkspaceId};

use super::item::{NewWorkItem, QueueHealth, WorkItem, WorkResult, WorkType};

#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Insert a pending item. If the item carries a `dedupe_key` and a
    /// non-terminal item with the same key exists, that item is refreshed
    /// and returned instead (debounced enqueue).
    async fn enqueue(&self, item: NewWorkItem) -> OrchestratorResult<WorkItem>;

    /// Atomically claim the highest-priority pending item of the requested
    /// types, honoring per-workspace concurrency caps and retry backoff.
    /// Returns `None` when nothing is claimable.
    async fn claim(
        &self,
        work_types: &[WorkType],
        worker_id: &str,
        lease: Duration,
    ) -> OrchestratorResult<Option<WorkItem>>;

    /// Move a claimed item to `processing`.
    async fn mark_processing(&self, work_id: WorkId) -> OrchestratorResult<()>;

    /// Move a processing item to `cascading` while children are enqueued.
    async fn mark_cascading(&self, work_id: WorkId) -> OrchestratorResult<()>;

    /// Extend the lease on a held item.
    async fn heartbeat(&self, work_id: WorkId, lease: Duration) -> OrchestratorResult<()>;

    /// Terminal success. Parent items complete only through their own agent
    /// returning, never through child completion.
    async fn complete(&self, work_id: WorkId, result: WorkResult) -> OrchestratorResult<WorkItem>;

    /// Settle a manual item (`PROPOSAL_REVIEW`, `MANUAL_EDIT`) directly.
    /// Manual items are resolved by a decision surface rather than a
    /// claiming worker, so `pending` items settle too.
    async fn resolve_manual(
        &self,
        work_id: WorkId,
        result: WorkResult,
    ) -> OrchestratorResult<WorkItem>;

    /// Record a failure. Retryable failures re-queue with backoff until the
    /// attempt budget is spent; non-retryable failures are terminal.
    async fn fail(
        &self,
        work_id: WorkId,
        error: super::item::WorkErrorRecord,
        retryable: bool,
    ) -> OrchestratorResult<WorkItem>;

    /// Return lease-expired held items to `pending` (attempts + 1, with
    /// backoff), or fail them past the retry cap. Returns affected items.
    async fn reap_expired(&self) -> OrchestratorResult<Vec<WorkItem>>;

    async fn get(&self, work_id: WorkId) -> OrchestratorResult<Option<WorkItem>>;

    /// The live (non-terminal) item carrying a dedupe key, if any.
    async fn find_by_dedupe_key(&self, key: &str) -> OrchestratorResult<Option<WorkItem>>;

    /// Direct children of a work item.
    async fn children_of(&self, work_id: WorkId) -> OrchestratorResult<Vec<WorkItem>>;

    /// All non-terminal items for a workspace. Used by orphan detection.
    async fn active_for_workspace(
        &self,
        workspace_id: WorkspaceId,
    ) -> OrchestratorResult<Vec<WorkItem>>;

    /// Aggregate queue metrics.
    async fn health(&self) -> OrchestratorResult<QueueHealth>;
}

/// Exponential backoff for retryable failures: `base * 2^attempts`, capped.
pub fn retry_backoff(base: Duration, max: Duration, attempts: i32) -> Duration {
    let exp = attempts.clamp(0, 30) as u32;
    let delay = base.saturating_mul(2u32.saturating_pow(exp));
    delay.min(max)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_per_attempt() {
        let base = Duration::from_secs(2);
        let max = Duration::from_secs(3600);
        assert_eq!(retry_backoff(base, max, 0), Duration::from_secs(2));
        assert_eq!(retry_backoff(base, max, 1), Duration::from_secs(4));
        assert_eq!(retry_backoff(base, max, 3), Duration::from_secs(16));
    }

    #[test]
    fn backoff_is_capped() {
        let base = Duration::from_secs(2);
        let max = Duration::from_secs(60);
        assert_eq!(retry_backoff(base, max, 10), Duration::from_secs(60));
        assert_eq!(retry_backoff(base, max, 29), Duration::from_secs(60));
    }
}
