//! Persistent work queue: typed items, claim/lease semantics, cascade
//! lineage, and status derivation.

pub mod cascade;
pub mod item;
pub mod memory;
pub mod postgres;
pub mod queue;
pub mod status;

pub use cascade::{CascadeCoordinator, CascadeFlow};
pub use item::{
    CascadeMetadata, NewWorkItem, QueueHealth, SubstrateImpact, WorkErrorRecord, WorkItem,
    WorkPayload, WorkResult, WorkState, WorkType,
};
pub use memory::MemoryWorkQueue;
pub use postgres::PostgresWorkQueue;
pub use queue::{retry_backoff, WorkQueue};
pub use status::{build_status, WorkStatusView};
