//! Baskets: per-user knowledge containers, plus the read-only context
//! projection used by validation and stage agents.

pub mod context;
pub mod models;

pub use context::{cosine_similarity, BasketContext, ContextUsage};
pub use models::{Basket, BasketStatus, Workspace};
