//! Reflection artifacts: read-only computed insight over substrate.

pub mod models;

pub use models::{ReflectionArtifact, ReflectionKind, SubstrateWindow};
