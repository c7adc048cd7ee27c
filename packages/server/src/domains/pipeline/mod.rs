//! Pipeline: dispatcher, workers, and stage agents.

pub mod agents;
pub mod dispatcher;
pub mod worker;

pub use agents::{AgentDeps, AgentKind, AgentOutcome, AgentRegistry, ArtifactOutcome, StageAgent};
pub use dispatcher::PipelineDispatcher;
pub use worker::WorkerPool;
