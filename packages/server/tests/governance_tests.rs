//! Governance protocol tests: validation, policy, decisions, commit
//! atomicity, and the block lifecycle. Driven directly against the engine
//! with no background services.

mod common;

use common::harness;
use server_core::common::UserId;
use server_core::domains::governance::{
    Decision, DecisionActor, Operation, PolicyDecision, ProposalDraft, ProposalOrigin,
    ProposalState,
};
use server_core::domains::pipeline::AgentKind;
use server_core::domains::substrate::{BlockPatch, BlockState, SemanticType};
use server_core::kernel::bus::Topic;
use server_core::kernel::store::SubstrateStore;

fn create_block_op(title: &str, content: &str, confidence: f32) -> Operation {
    Operation::CreateBlock {
        title: title.to_string(),
        semantic_type: SemanticType::Goal,
        content: content.to_string(),
        confidence,
        metadata: serde_json::Value::Null,
    }
}

fn human_draft(basket: &server_core::domains::baskets::Basket, ops: Vec<Operation>) -> ProposalDraft {
    let confidence = ops
        .iter()
        .filter_map(|op| match op {
            Operation::CreateBlock { confidence, .. } => Some(*confidence),
            _ => None,
        })
        .fold(1.0f32, f32::min);
    ProposalDraft::builder()
        .basket_id(basket.id)
        .workspace_id(basket.workspace_id)
        .origin(ProposalOrigin::Human)
        .ops(ops)
        .confidence(confidence)
        .build()
}

#[tokio::test]
async fn confident_create_auto_approves_and_commits() {
    let h = harness();
    let (_, basket) = h.seed_basket().await;

    let outcome = h
        .orchestrator
        .submit_proposal(
            human_draft(&basket, vec![create_block_op("Reduce MTTR", "Below 10 minutes.", 0.9)]),
            "req-g1",
        )
        .await
        .unwrap();

    assert_eq!(outcome.state, ProposalState::Committed);
    assert!(outcome.delta_id.is_some());

    let ctx = h.orchestrator.basket_context(basket.id).await.unwrap();
    assert_eq!(ctx.blocks.len(), 1);
    assert_eq!(ctx.blocks[0].status, BlockState::Proposed);

    for topic in [
        Topic::ProposalDrafted,
        Topic::ProposalValidated,
        Topic::ProposalApproved,
        Topic::SubstrateCommitted,
    ] {
        assert_eq!(h.bus.events_for(topic).len(), 1, "expected one {topic} event");
    }

    // Resubmission with the same request id returns the same outcome.
    let replay = h
        .orchestrator
        .submit_proposal(
            human_draft(&basket, vec![create_block_op("Reduce MTTR", "Below 10 minutes.", 0.9)]),
            "req-g1",
        )
        .await
        .unwrap();
    assert_eq!(replay.proposal_id, outcome.proposal_id);
    assert_eq!(replay.delta_id, outcome.delta_id);
    assert_eq!(h.bus.events_for(Topic::SubstrateCommitted).len(), 1);
}

#[tokio::test]
async fn empty_proposal_is_rejected_at_validation() {
    let h = harness();
    let (_, basket) = h.seed_basket().await;

    let outcome = h
        .orchestrator
        .submit_proposal(human_draft(&basket, vec![]), "req-empty")
        .await
        .unwrap();

    assert_eq!(outcome.state, ProposalState::Rejected);
    assert!(h.bus.events_for(Topic::ProposalRejected).len() == 1);
    let ctx = h.orchestrator.basket_context(basket.id).await.unwrap();
    assert!(ctx.blocks.is_empty());
}

#[tokio::test]
async fn concurrent_updates_one_commits_one_fails() {
    let h = harness();
    let (_, basket) = h.seed_basket().await;
    let reviewer = DecisionActor::human(UserId::new());

    h.orchestrator
        .submit_proposal(
            human_draft(&basket, vec![create_block_op("Goal", "Original content.", 0.9)]),
            "req-seed",
        )
        .await
        .unwrap();
    let block_id = h.orchestrator.basket_context(basket.id).await.unwrap().blocks[0].id;

    let update = |content: &str| {
        human_draft(
            &basket,
            vec![Operation::UpdateBlock {
                block_id,
                from_version: 1,
                patch: BlockPatch { content: Some(content.to_string()), ..Default::default() },
            }],
        )
    };

    // Both proposals validate against version 1 and go to review.
    let first = h.orchestrator.submit_proposal(update("First writer wins."), "req-u1").await.unwrap();
    let second = h.orchestrator.submit_proposal(update("Second writer loses."), "req-u2").await.unwrap();
    assert_eq!(first.state, ProposalState::Validated);
    assert_eq!(second.state, ProposalState::Validated);

    let first_state = h
        .orchestrator
        .decide_proposal(first.proposal_id, Decision::Approve, reviewer)
        .await
        .unwrap();
    assert_eq!(first_state, ProposalState::Committed);

    let second_state = h
        .orchestrator
        .decide_proposal(second.proposal_id, Decision::Approve, reviewer)
        .await
        .unwrap();
    assert_eq!(second_state, ProposalState::Failed);

    let block = h.store.fetch_block(block_id).await.unwrap().unwrap();
    assert_eq!(block.version, 2);
    assert_eq!(block.content, "First writer wins.");

    assert_eq!(h.bus.events_for(Topic::SubstrateCommitted).len(), 2);
    assert_eq!(h.bus.events_for(Topic::SubstrateCommitFailed).len(), 1);
}

#[tokio::test]
async fn locked_block_update_is_policy_rejected() {
    let h = harness();
    let (_, basket) = h.seed_basket().await;
    let user = DecisionActor::human(UserId::new());

    h.orchestrator
        .submit_proposal(
            human_draft(&basket, vec![create_block_op("Goal", "Content.", 0.9)]),
            "req-seed",
        )
        .await
        .unwrap();
    let block_id = h.orchestrator.basket_context(basket.id).await.unwrap().blocks[0].id;

    h.orchestrator.transition_block(block_id, BlockState::Accepted, user).await.unwrap();
    h.orchestrator.transition_block(block_id, BlockState::Locked, user).await.unwrap();

    let agent_update = ProposalDraft::builder()
        .basket_id(basket.id)
        .workspace_id(basket.workspace_id)
        .origin(ProposalOrigin::Agent(AgentKind::P1Substrate))
        .ops(vec![Operation::UpdateBlock {
            block_id,
            from_version: 1,
            patch: BlockPatch { content: Some("Agent rewrite.".to_string()), ..Default::default() },
        }])
        .confidence(0.99)
        .build();

    let outcome = h.orchestrator.submit_proposal(agent_update, "req-agent").await.unwrap();
    assert_eq!(outcome.state, ProposalState::Rejected);

    // No revision was written and the content is untouched.
    assert!(h.store.all_revisions().is_empty());
    let block = h.store.fetch_block(block_id).await.unwrap().unwrap();
    assert_eq!(block.content, "Content.");
    assert_eq!(block.status, BlockState::Locked);
}

#[tokio::test]
async fn near_duplicate_create_is_demoted_to_review() {
    let h = harness();
    let (_, basket) = h.seed_basket().await;

    h.orchestrator
        .submit_proposal(
            human_draft(
                &basket,
                vec![create_block_op("Reduce MTTR", "Reduce MTTR below 10 minutes.", 0.9)],
            ),
            "req-a",
        )
        .await
        .unwrap();

    // The mock embedder maps identical normalized text to the same vector,
    // so this duplicate sits at similarity 1.0.
    let outcome = h
        .orchestrator
        .submit_proposal(
            human_draft(
                &basket,
                vec![create_block_op("Reduce MTTR", "Reduce MTTR below 10 minutes.", 0.95)],
            ),
            "req-b",
        )
        .await
        .unwrap();

    assert_eq!(outcome.state, ProposalState::Validated);
    let proposal = h.store.fetch_proposal(outcome.proposal_id).await.unwrap().unwrap();
    let report = proposal.validation_report.unwrap();
    assert_eq!(report.policy_decision, PolicyDecision::RequireReview);
    assert!(!report.dedup_hints.is_empty());
    assert!(report.confidence < 0.95);
    assert_eq!(h.bus.events_for(Topic::ProposalReviewRequested).len(), 1);
}

#[tokio::test]
async fn merge_requires_review_then_supersedes_merged_blocks() {
    let h = harness();
    let (_, basket) = h.seed_basket().await;
    let user = DecisionActor::human(UserId::new());

    h.orchestrator
        .submit_proposal(
            human_draft(
                &basket,
                vec![
                    create_block_op("Goal A", "Distinct content about goal A.", 0.9),
                    create_block_op("Goal B", "Unrelated material concerning topic B.", 0.9),
                ],
            ),
            "req-seed",
        )
        .await
        .unwrap();

    let ctx = h.orchestrator.basket_context(basket.id).await.unwrap();
    let primary = ctx.blocks[0].id;
    let merged = ctx.blocks[1].id;
    h.orchestrator.transition_block(primary, BlockState::Accepted, user).await.unwrap();
    h.orchestrator.transition_block(merged, BlockState::Accepted, user).await.unwrap();

    let outcome = h
        .orchestrator
        .submit_proposal(
            human_draft(
                &basket,
                vec![Operation::MergeBlocks {
                    primary_id: primary,
                    merged_ids: vec![merged],
                    merged_title: Some("Goal A (merged)".to_string()),
                }],
            ),
            "req-merge",
        )
        .await
        .unwrap();
    assert_eq!(outcome.state, ProposalState::Validated);

    let state = h
        .orchestrator
        .decide_proposal(outcome.proposal_id, Decision::Approve, user)
        .await
        .unwrap();
    assert_eq!(state, ProposalState::Committed);

    let primary_block = h.store.fetch_block(primary).await.unwrap().unwrap();
    assert_eq!(primary_block.title, "Goal A (merged)");
    let merged_block = h.store.fetch_block(merged).await.unwrap().unwrap();
    assert_eq!(merged_block.status, BlockState::Superseded);

    // Superseded blocks drop out of the live context.
    let ctx = h.orchestrator.basket_context(basket.id).await.unwrap();
    assert_eq!(ctx.blocks.len(), 1);
}

#[tokio::test]
async fn committed_update_writes_revision_with_diff() {
    let h = harness();
    let (_, basket) = h.seed_basket().await;
    let user = DecisionActor::human(UserId::new());

    h.orchestrator
        .submit_proposal(
            human_draft(&basket, vec![create_block_op("Goal", "Old content.", 0.9)]),
            "req-seed",
        )
        .await
        .unwrap();
    let block_id = h.orchestrator.basket_context(basket.id).await.unwrap().blocks[0].id;

    let outcome = h
        .orchestrator
        .submit_proposal(
            human_draft(
                &basket,
                vec![Operation::UpdateBlock {
                    block_id,
                    from_version: 1,
                    patch: BlockPatch {
                        content: Some("New content.".to_string()),
                        ..Default::default()
                    },
                }],
            ),
            "req-update",
        )
        .await
        .unwrap();
    h.orchestrator.decide_proposal(outcome.proposal_id, Decision::Approve, user).await.unwrap();

    let revisions = h.store.fetch_revisions(block_id).await.unwrap();
    assert_eq!(revisions.len(), 1);
    let diff = revisions[0].diff().unwrap();
    assert_eq!(diff.from_version, 1);
    assert_eq!(diff.to_version, 2);
    assert_eq!(diff.fields[0].field, "content");
    assert_eq!(diff.fields[0].before, "Old content.");
    assert_eq!(diff.fields[0].after, "New content.");
}

#[tokio::test]
async fn terminal_proposals_never_reopen() {
    let h = harness();
    let (_, basket) = h.seed_basket().await;
    let user = DecisionActor::human(UserId::new());

    let outcome = h
        .orchestrator
        .submit_proposal(
            human_draft(&basket, vec![create_block_op("Goal", "Content.", 0.9)]),
            "req-1",
        )
        .await
        .unwrap();
    assert_eq!(outcome.state, ProposalState::Committed);

    let err = h
        .orchestrator
        .decide_proposal(outcome.proposal_id, Decision::Reject, user)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "conflict_error");

    let proposal = h.store.fetch_proposal(outcome.proposal_id).await.unwrap().unwrap();
    assert_eq!(proposal.state, ProposalState::Committed);
}

#[tokio::test]
async fn agents_cannot_promote_blocks() {
    let h = harness();
    let (_, basket) = h.seed_basket().await;

    h.orchestrator
        .submit_proposal(
            human_draft(&basket, vec![create_block_op("Goal", "Content.", 0.9)]),
            "req-1",
        )
        .await
        .unwrap();
    let block_id = h.orchestrator.basket_context(basket.id).await.unwrap().blocks[0].id;

    let err = h
        .orchestrator
        .transition_block(block_id, BlockState::Accepted, DecisionActor::agent())
        .await
        .unwrap_err();
    assert_eq!(err.code(), "policy_rejection");

    let block = h.store.fetch_block(block_id).await.unwrap().unwrap();
    assert_eq!(block.status, BlockState::Proposed);
}

#[tokio::test]
async fn failed_commit_applies_nothing() {
    let h = harness();
    let (_, basket) = h.seed_basket().await;
    let user = DecisionActor::human(UserId::new());

    h.orchestrator
        .submit_proposal(
            human_draft(&basket, vec![create_block_op("Goal", "Content.", 0.9)]),
            "req-seed",
        )
        .await
        .unwrap();
    let block_id = h.orchestrator.basket_context(basket.id).await.unwrap().blocks[0].id;

    // One good op and one stale-version op; the whole proposal must abort.
    let mixed = human_draft(
        &basket,
        vec![
            create_block_op("Another goal", "Completely different new material.", 0.9),
            Operation::UpdateBlock {
                block_id,
                from_version: 7,
                patch: BlockPatch { content: Some("Stale.".to_string()), ..Default::default() },
            },
        ],
    );

    let outcome = h.orchestrator.submit_proposal(mixed, "req-mixed").await.unwrap();
    assert_eq!(outcome.state, ProposalState::Validated);

    let state = h
        .orchestrator
        .decide_proposal(outcome.proposal_id, Decision::Approve, user)
        .await
        .unwrap();
    assert_eq!(state, ProposalState::Failed);

    // Neither the new block nor the update landed.
    let ctx = h.orchestrator.basket_context(basket.id).await.unwrap();
    assert_eq!(ctx.blocks.len(), 1);
    assert_eq!(ctx.blocks[0].content, "Content.");
    assert_eq!(ctx.blocks[0].version, 1);
}
