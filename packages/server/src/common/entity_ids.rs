//! Typed id aliases for every entity in the substrate.
//!
//! Keeping one alias per entity means a `BlockId` can never be passed where
//! a `BasketId` is expected.

pub use super::id::Id;

// ============================================================================
// Entity marker types
// ============================================================================

/// Marker type for Workspace entities (tenancy root).
pub struct Workspace;

/// Marker type for Basket entities (per-user knowledge containers).
pub struct Basket;

/// Marker type for RawDump entities (immutable captured input).
pub struct Dump;

/// Marker type for Block entities (semantically typed knowledge units).
pub struct Block;

/// Marker type for ContextItem entities (tags/entities extracted from substrate).
pub struct ContextItem;

/// Marker type for Proposal entities (governed change requests).
pub struct Proposal;

/// Marker type for Delta entities (applied outcomes of committed proposals).
pub struct Delta;

/// Marker type for WorkItem entities (queue entries).
pub struct Work;

/// Marker type for ReflectionArtifact entities.
pub struct Reflection;

/// Marker type for Document entities (composed artifacts).
pub struct Document;

/// Marker type for users acting on the system.
pub struct User;

// ============================================================================
// Type aliases
// ============================================================================

pub type WorkspaceId = Id<Workspace>;
pub type BasketId = Id<Basket>;
pub type DumpId = Id<Dump>;
pub type BlockId = Id<Block>;
pub type ContextItemId = Id<ContextItem>;
pub type ProposalId = Id<Proposal>;
pub type DeltaId = Id<Delta>;
pub type WorkId = Id<Work>;
pub type ReflectionId = Id<Reflection>;
pub type DocumentId = Id<Document>;
pub type UserId = Id<User>;
