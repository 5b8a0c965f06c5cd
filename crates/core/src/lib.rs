//! Shared domain types for the lazyscale workspace.
//!
//! Everything in here is pure: no I/O, no async. The queue, pipeline and
//! watcher crates build on these definitions.

pub mod error;
pub mod geometry;
pub mod locator;
pub mod performance;
pub mod retry;
pub mod status;
pub mod types;
