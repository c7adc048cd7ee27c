//! Documents: composed artifacts referencing substrate.

pub mod models;

pub use models::{CompositionMode, Document, NewSubstrateReference, SubstrateReference};
