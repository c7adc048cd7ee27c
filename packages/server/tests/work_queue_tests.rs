//! Work queue semantics: claim ordering, leases, retries, backpressure,
//! and debounced enqueues.

mod common;

use std::time::Duration;

use common::{harness, harness_with, test_config};
use server_core::common::{DumpId, WorkspaceId};
use server_core::kernel::work::{
    NewWorkItem, WorkErrorRecord, WorkPayload, WorkQueue, WorkState, WorkType,
};

fn p1_item(workspace_id: WorkspaceId, priority: i32) -> NewWorkItem {
    NewWorkItem::builder()
        .work_type(WorkType::P1Substrate)
        .payload(WorkPayload::Substrate { dump_id: DumpId::new() })
        .workspace_id(workspace_id)
        .priority(priority)
        .build()
}

fn transient_error() -> WorkErrorRecord {
    WorkErrorRecord {
        code: "transient_error".to_string(),
        message: "io".to_string(),
        recovery_actions: vec![],
    }
}

#[tokio::test]
async fn claim_prefers_priority_then_fifo() {
    let h = harness();
    let workspace = WorkspaceId::new();

    let low = h.queue.enqueue(p1_item(workspace, 1)).await.unwrap();
    let high = h.queue.enqueue(p1_item(workspace, 9)).await.unwrap();
    let mid_first = h.queue.enqueue(p1_item(workspace, 5)).await.unwrap();
    let mid_second = h.queue.enqueue(p1_item(workspace, 5)).await.unwrap();

    let lease = Duration::from_secs(60);
    let types = [WorkType::P1Substrate];
    let order: Vec<_> = [
        h.queue.claim(&types, "w", lease).await.unwrap().unwrap().id,
        h.queue.claim(&types, "w", lease).await.unwrap().unwrap().id,
        h.queue.claim(&types, "w", lease).await.unwrap().unwrap().id,
        h.queue.claim(&types, "w", lease).await.unwrap().unwrap().id,
    ]
    .to_vec();

    assert_eq!(order, vec![high.id, mid_first.id, mid_second.id, low.id]);
}

#[tokio::test]
async fn claim_only_returns_requested_types() {
    let h = harness();
    let workspace = WorkspaceId::new();
    h.queue.enqueue(p1_item(workspace, 5)).await.unwrap();

    let claimed = h
        .queue
        .claim(&[WorkType::P4Compose], "w", Duration::from_secs(60))
        .await
        .unwrap();
    assert!(claimed.is_none());
}

#[tokio::test]
async fn workspace_concurrency_cap_applies_backpressure() {
    let mut config = test_config();
    config.workspace_concurrency_cap = 2;
    let h = harness_with(config);
    let workspace = WorkspaceId::new();
    let other_workspace = WorkspaceId::new();

    for _ in 0..4 {
        h.queue.enqueue(p1_item(workspace, 5)).await.unwrap();
    }
    h.queue.enqueue(p1_item(other_workspace, 5)).await.unwrap();

    let lease = Duration::from_secs(60);
    let types = [WorkType::P1Substrate];
    assert!(h.queue.claim(&types, "w1", lease).await.unwrap().is_some());
    assert!(h.queue.claim(&types, "w2", lease).await.unwrap().is_some());

    // The capped workspace is saturated; only the other workspace's item
    // is claimable even though pending items exist.
    let third = h.queue.claim(&types, "w3", lease).await.unwrap().unwrap();
    assert_eq!(third.workspace_id, other_workspace);
    assert!(h.queue.claim(&types, "w4", lease).await.unwrap().is_none());
}

#[tokio::test]
async fn expired_lease_requeues_until_retry_cap() {
    let h = harness();
    let workspace = WorkspaceId::new();
    let mut item = p1_item(workspace, 5);
    item.max_attempts = 2;
    let item = h.queue.enqueue(item).await.unwrap();

    let lease = Duration::from_secs(60);
    let types = [WorkType::P1Substrate];

    // First loss: back to pending with one attempt burned.
    h.queue.claim(&types, "w1", lease).await.unwrap().unwrap();
    h.queue.expire_lease(item.id);
    let reaped = h.queue.reap_expired().await.unwrap();
    assert_eq!(reaped[0].state, WorkState::Pending);
    assert_eq!(reaped[0].attempts, 1);

    // Backoff gates the retry; nothing claimable right now.
    assert!(h.queue.claim(&types, "w2", lease).await.unwrap().is_none());
}

#[tokio::test]
async fn lease_loss_past_cap_fails_the_item() {
    let mut config = test_config();
    config.backoff_base = Duration::ZERO;
    let h = harness_with(config);
    let workspace = WorkspaceId::new();
    let mut new_item = p1_item(workspace, 5);
    new_item.max_attempts = 1;
    let item = h.queue.enqueue(new_item).await.unwrap();

    h.queue
        .claim(&[WorkType::P1Substrate], "w1", Duration::from_secs(60))
        .await
        .unwrap()
        .unwrap();
    h.queue.expire_lease(item.id);

    let reaped = h.queue.reap_expired().await.unwrap();
    assert_eq!(reaped[0].state, WorkState::Failed);
    let stored = h.queue.get(item.id).await.unwrap().unwrap();
    let error = stored.result().unwrap().error.unwrap();
    assert_eq!(error.code, "transient_error");
}

#[tokio::test]
async fn retryable_failure_sets_backoff() {
    let mut config = test_config();
    config.backoff_base = Duration::from_secs(60);
    let h = harness_with(config);
    let workspace = WorkspaceId::new();
    let item = h.queue.enqueue(p1_item(workspace, 5)).await.unwrap();

    let types = [WorkType::P1Substrate];
    let lease = Duration::from_secs(60);

    h.queue.claim(&types, "w", lease).await.unwrap().unwrap();
    let failed = h.queue.fail(item.id, transient_error(), true).await.unwrap();
    assert_eq!(failed.state, WorkState::Pending);
    assert_eq!(failed.attempts, 1);
    assert!(failed.next_attempt_at.unwrap() > chrono::Utc::now());

    // Still backing off.
    assert!(h.queue.claim(&types, "w", lease).await.unwrap().is_none());
}

#[tokio::test]
async fn retry_cap_exhaustion_fails_terminally() {
    let mut config = test_config();
    config.backoff_base = Duration::ZERO;
    let h = harness_with(config);
    let workspace = WorkspaceId::new();
    let mut new_item = p1_item(workspace, 5);
    new_item.max_attempts = 2;
    let item = h.queue.enqueue(new_item).await.unwrap();

    let types = [WorkType::P1Substrate];
    let lease = Duration::from_secs(60);

    h.queue.claim(&types, "w", lease).await.unwrap().unwrap();
    let first = h.queue.fail(item.id, transient_error(), true).await.unwrap();
    assert_eq!(first.state, WorkState::Pending);

    h.queue.claim(&types, "w", lease).await.unwrap().unwrap();
    let second = h.queue.fail(item.id, transient_error(), true).await.unwrap();
    assert_eq!(second.state, WorkState::Failed);
    assert_eq!(second.attempts, 2);
}

#[tokio::test]
async fn non_retryable_failure_is_terminal_immediately() {
    let h = harness();
    let workspace = WorkspaceId::new();
    let item = h.queue.enqueue(p1_item(workspace, 5)).await.unwrap();

    h.queue
        .claim(&[WorkType::P1Substrate], "w", Duration::from_secs(60))
        .await
        .unwrap()
        .unwrap();
    let failed = h
        .queue
        .fail(
            item.id,
            WorkErrorRecord {
                code: "cancellation_error".to_string(),
                message: "cancelled".to_string(),
                recovery_actions: vec![],
            },
            false,
        )
        .await
        .unwrap();

    assert_eq!(failed.state, WorkState::Failed);
    assert_eq!(failed.attempts, 1);
}

#[tokio::test]
async fn debounced_enqueue_reuses_live_item() {
    let h = harness();
    let workspace = WorkspaceId::new();

    let mut first = p1_item(workspace, 5);
    first.dedupe_key = Some("p3:basket-1".to_string());
    let mut second = p1_item(workspace, 5);
    second.dedupe_key = Some("p3:basket-1".to_string());

    let a = h.queue.enqueue(first).await.unwrap();
    let b = h.queue.enqueue(second).await.unwrap();
    assert_eq!(a.id, b.id);

    // Once terminal, the key frees up and a fresh item is created.
    h.queue
        .claim(&[WorkType::P1Substrate], "w", Duration::from_secs(60))
        .await
        .unwrap()
        .unwrap();
    h.queue.complete(a.id, Default::default()).await.unwrap();

    let mut third = p1_item(workspace, 5);
    third.dedupe_key = Some("p3:basket-1".to_string());
    let c = h.queue.enqueue(third).await.unwrap();
    assert_ne!(c.id, a.id);
}

#[tokio::test]
async fn duplicate_dump_events_enqueue_one_p1_item() {
    use server_core::domains::pipeline::PipelineDispatcher;
    use server_core::kernel::bus::{DumpCreatedPayload, EventBus, NewEvent, Topic};
    use std::sync::Arc;

    let h = harness();
    let (workspace, basket) = h.seed_basket().await;

    let kernel = h.orchestrator.kernel();
    let dispatcher = PipelineDispatcher::new(
        Arc::clone(&kernel.bus),
        Arc::clone(&kernel.queue),
        Arc::clone(&kernel.store),
        Arc::clone(&kernel.config),
    );

    let payload = DumpCreatedPayload {
        dump_id: DumpId::new(),
        basket_id: basket.id,
        workspace_id: workspace.id,
    };
    let event = h
        .bus
        .emit(
            NewEvent::new(Topic::DumpCreated, &payload)
                .unwrap()
                .scoped(workspace.id, Some(basket.id)),
        )
        .await
        .unwrap();

    // The same event delivered twice (at-least-once bus) coalesces.
    dispatcher.handle_event(&event).await.unwrap();
    dispatcher.handle_event(&event).await.unwrap();

    let p1_items: Vec<_> = h
        .queue
        .all_items()
        .into_iter()
        .filter(|i| i.work_type == WorkType::P1Substrate)
        .collect();
    assert_eq!(p1_items.len(), 1);
}

#[tokio::test]
async fn complete_requires_a_held_item() {
    let h = harness();
    let workspace = WorkspaceId::new();
    let item = h.queue.enqueue(p1_item(workspace, 5)).await.unwrap();

    let err = h.queue.complete(item.id, Default::default()).await.unwrap_err();
    assert_eq!(err.code(), "conflict_error");
}
