//! Governance: the proposal/validation/approval/commit protocol. The only
//! path to substrate mutation.

pub mod delta;
pub mod engine;
pub mod ops;
pub mod policy;
pub mod proposal;
pub mod validator;

pub use delta::{Delta, DeltaChange};
pub use engine::GovernanceEngine;
pub use ops::Operation;
pub use policy::{PolicyDecision, PolicyOverrides, PolicyTable};
pub use proposal::{
    Decision, DecisionActor, Proposal, ProposalDraft, ProposalOrigin, ProposalState,
    SubmitOutcome,
};
pub use validator::{DedupHint, OpReport, ValidationReport};
