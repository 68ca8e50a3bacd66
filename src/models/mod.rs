//! Data models shared by the execution engines.
//!
//! This module re-exports the request and result types used throughout the crate.

pub mod execution;
pub mod instruction;

// Re-export commonly used types
pub use execution::{Output, Params, Row};
pub use instruction::{KvVerb, StatementKind};
