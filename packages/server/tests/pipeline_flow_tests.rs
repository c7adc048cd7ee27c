//! End-to-end pipeline scenarios against the in-memory kernel with all
//! background services running.

mod common;

use std::time::Duration;

use common::{goal_extraction_json, harness, harness_with, test_config, wait_until};
use server_core::common::UserId;
use server_core::domains::governance::{
    Decision, DecisionActor, Operation, ProposalDraft, ProposalOrigin, ProposalState,
};
use server_core::domains::substrate::{BlockState, SemanticType};
use server_core::kernel::bus::Topic;
use server_core::kernel::store::SubstrateStore;
use server_core::kernel::work::{WorkState, WorkType};
use server_core::CaptureRequest;

#[tokio::test]
async fn happy_capture_runs_p1_commit_and_reflection() {
    let h = harness();
    let (workspace, basket) = h.seed_basket().await;
    h.reasoner.push_response(goal_extraction_json());

    let handle = h.orchestrator.start();

    let receipt = h
        .orchestrator
        .capture_dump(
            CaptureRequest::builder()
                .workspace_id(workspace.id)
                .basket_id(basket.id)
                .body("We need to reduce MTTR below 10 minutes.")
                .request_id("req-1")
                .build(),
        )
        .await
        .unwrap();

    // Dump persisted immediately and dump.created emitted.
    assert!(h.store.fetch_dump(receipt.dump_id).await.unwrap().is_some());
    assert_eq!(h.bus.events_for(Topic::DumpCreated).len(), 1);

    // P1 claims the work, the proposal auto-approves, and substrate lands.
    let committed = wait_until(Duration::from_secs(5), || {
        !h.bus.events_for(Topic::SubstrateCommitted).is_empty()
    })
    .await;
    assert!(committed, "substrate.committed never emitted");

    let ctx = h.orchestrator.basket_context(basket.id).await.unwrap();
    assert_eq!(ctx.blocks.len(), 1);
    let block = &ctx.blocks[0];
    assert_eq!(block.semantic_type, SemanticType::Goal);
    assert_eq!(block.title, "Reduce MTTR");
    assert_eq!(block.status, BlockState::Proposed);
    assert_eq!(block.version, 1);
    assert_eq!(ctx.context_items.len(), 1);

    assert!(!h.bus.events_for(Topic::ProposalApproved).is_empty());

    // The cascade continues into a debounced reflection.
    let reflected = wait_until(Duration::from_secs(5), || {
        !h.bus.events_for(Topic::ReflectionComputed).is_empty()
    })
    .await;
    assert!(reflected, "reflection.computed never emitted");

    // The P1 item reports the full cascade in its status view.
    let p1_item = h
        .queue
        .all_items()
        .into_iter()
        .find(|i| i.work_type == WorkType::P1Substrate)
        .expect("P1 item exists");
    let settled = wait_until(Duration::from_secs(5), || {
        h.queue
            .all_items()
            .iter()
            .filter(|i| i.work_type == WorkType::P3Reflection)
            .all(|i| i.state == WorkState::Completed)
    })
    .await;
    assert!(settled, "P3 item never completed");

    let status = h.orchestrator.get_work_status(p1_item.id).await.unwrap().unwrap();
    assert_eq!(status.status, WorkState::Completed);
    assert!(status.cascade_flow.completed_stages.contains(&"P1_SUBSTRATE".to_string()));
    assert!(status.cascade_flow.completed_stages.contains(&"P3_REFLECTION".to_string()));
    assert!(status.substrate_impact.blocks_created >= 1);

    handle.shutdown().await;
}

#[tokio::test]
async fn repeated_request_id_returns_original_receipt() {
    let h = harness();
    let (workspace, basket) = h.seed_basket().await;

    let request = CaptureRequest::builder()
        .workspace_id(workspace.id)
        .basket_id(basket.id)
        .body("First capture body.")
        .request_id("req-dup")
        .build();

    let first = h.orchestrator.capture_dump(request.clone()).await.unwrap();
    let second = h.orchestrator.capture_dump(request).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(h.bus.events_for(Topic::DumpCreated).len(), 1);
    assert_eq!(h.store.all_deltas().len(), 1);
}

#[tokio::test]
async fn capture_rejects_cross_workspace_basket() {
    let h = harness();
    let (_, basket) = h.seed_basket().await;
    let other_workspace = h.store.create_workspace("other@example.com").await.unwrap();

    let err = h
        .orchestrator
        .capture_dump(
            CaptureRequest::builder()
                .workspace_id(other_workspace.id)
                .basket_id(basket.id)
                .body("Sneaky cross-workspace write.")
                .request_id("req-cross")
                .build(),
        )
        .await
        .unwrap_err();

    assert_eq!(err.code(), "validation_error");
    assert!(h.bus.events_for(Topic::DumpCreated).is_empty());
}

#[tokio::test]
async fn compose_request_produces_document_with_references() {
    let h = harness();
    let (workspace, basket) = h.seed_basket().await;
    h.reasoner.push_response(goal_extraction_json());

    let handle = h.orchestrator.start();

    h.orchestrator
        .capture_dump(
            CaptureRequest::builder()
                .workspace_id(workspace.id)
                .basket_id(basket.id)
                .body("We need to reduce MTTR below 10 minutes.")
                .request_id("req-compose")
                .build(),
        )
        .await
        .unwrap();

    let committed = wait_until(Duration::from_secs(5), || {
        !h.bus.events_for(Topic::SubstrateCommitted).is_empty()
    })
    .await;
    assert!(committed);

    h.orchestrator
        .request_compose(
            workspace.id,
            basket.id,
            None,
            Some("Reliability plan".to_string()),
        )
        .await
        .unwrap();

    let composed = wait_until(Duration::from_secs(5), || {
        !h.bus.events_for(Topic::DocumentComposed).is_empty()
    })
    .await;
    assert!(composed, "document.composed never emitted");

    let documents = h.store.documents_for_basket(basket.id).await.unwrap();
    assert_eq!(documents.len(), 1);
    assert_eq!(documents[0].title, "Reliability plan");

    let references = h.store.document_references(documents[0].id).await.unwrap();
    assert!(!references.is_empty());
    assert_eq!(references[0].role, "primary");

    handle.shutdown().await;
}

#[tokio::test]
async fn review_decision_settles_the_review_work_item() {
    let h = harness();
    let (_, basket) = h.seed_basket().await;
    let handle = h.orchestrator.start();

    // Low confidence keeps the create out of auto-approval.
    let draft = ProposalDraft::builder()
        .basket_id(basket.id)
        .workspace_id(basket.workspace_id)
        .origin(ProposalOrigin::Human)
        .ops(vec![Operation::CreateBlock {
            title: "Maybe a goal".to_string(),
            semantic_type: SemanticType::Goal,
            content: "Low confidence extraction.".to_string(),
            confidence: 0.4,
            metadata: serde_json::Value::Null,
        }])
        .confidence(0.4)
        .build();
    let outcome = h.orchestrator.submit_proposal(draft, "req-review").await.unwrap();
    assert_eq!(outcome.state, ProposalState::Validated);

    // The dispatcher routes review_requested into a PROPOSAL_REVIEW item.
    let enqueued = wait_until(Duration::from_secs(5), || {
        h.queue.all_items().iter().any(|i| i.work_type == WorkType::ProposalReview)
    })
    .await;
    assert!(enqueued, "review item never enqueued");

    let state = h
        .orchestrator
        .decide_proposal(
            outcome.proposal_id,
            Decision::Approve,
            DecisionActor::human(UserId::new()),
        )
        .await
        .unwrap();
    assert_eq!(state, ProposalState::Committed);

    // The manual item settles with the decision instead of lingering
    // pending forever.
    let review_item = h
        .queue
        .all_items()
        .into_iter()
        .find(|i| i.work_type == WorkType::ProposalReview)
        .expect("review item exists");
    assert_eq!(review_item.state, WorkState::Completed);
    let result = review_item.result().unwrap();
    assert_eq!(result.proposal_id, Some(outcome.proposal_id));
    assert!(result.delta_id.is_some());

    handle.shutdown().await;
}

#[tokio::test]
async fn dead_worker_item_is_reclaimed_and_finishes_identically() {
    // Services stay off; the test plays the dispatcher and both workers.
    let h = harness_with(test_config());
    let (workspace, basket) = h.seed_basket().await;
    h.reasoner.push_response(goal_extraction_json());

    h.orchestrator
        .capture_dump(
            CaptureRequest::builder()
                .workspace_id(workspace.id)
                .basket_id(basket.id)
                .body("We need to reduce MTTR below 10 minutes.")
                .request_id("req-crash")
                .build(),
        )
        .await
        .unwrap();

    // Route dump.created by hand so the P1 item exists.
    use server_core::domains::pipeline::PipelineDispatcher;
    use server_core::kernel::work::WorkQueue;
    use std::sync::Arc;

    let kernel = h.orchestrator.kernel();
    let dispatcher = PipelineDispatcher::new(
        Arc::clone(&kernel.bus),
        Arc::clone(&kernel.queue),
        Arc::clone(&kernel.store),
        Arc::clone(&kernel.config),
    );
    let event = h.bus.events_for(Topic::DumpCreated).pop().unwrap();
    dispatcher.handle_event(&event).await.unwrap();

    // Worker one claims and dies mid-execution.
    let item = h
        .queue
        .claim(&[WorkType::P1Substrate], "worker-1", Duration::from_secs(300))
        .await
        .unwrap()
        .expect("item claimable");
    h.queue.expire_lease(item.id);

    let reaped = h.queue.reap_expired().await.unwrap();
    assert_eq!(reaped.len(), 1);
    assert_eq!(reaped[0].state, WorkState::Pending);
    assert_eq!(reaped[0].attempts, 1);

    // A second worker finishes the run; substrate matches the happy path.
    let handle = h.orchestrator.start();
    let committed = wait_until(Duration::from_secs(5), || {
        !h.bus.events_for(Topic::SubstrateCommitted).is_empty()
    })
    .await;
    assert!(committed, "recovered item never committed");

    let ctx = h.orchestrator.basket_context(basket.id).await.unwrap();
    assert_eq!(ctx.blocks.len(), 1);
    assert_eq!(ctx.blocks[0].title, "Reduce MTTR");
    assert_eq!(ctx.blocks[0].version, 1);

    handle.shutdown().await;
}
