//! Raw dumps: immutable captured input.

pub mod models;
pub mod splitter;

pub use models::{NewDump, RawDump};
pub use splitter::{normalize_newlines, split_dump};
