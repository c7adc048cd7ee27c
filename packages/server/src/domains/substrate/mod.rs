//! Substrate layer: blocks, context items, relationships, and the
//! revision log. All mutation goes through governance; these modules hold
//! the models and the block lifecycle rules.

pub mod blocks;
pub mod context_items;
pub mod relationships;
pub mod revisions;

pub use blocks::{ActorKind, Block, BlockPatch, BlockState, SemanticType};
pub use context_items::{ContextItem, ContextItemState, ContextItemType};
pub use relationships::{Relationship, SubstrateRef, SubstrateType};
pub use revisions::{BlockDiff, FieldDiff, Revision, REVISION_EXCERPT_LIMIT};
