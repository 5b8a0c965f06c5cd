//! Batch runner for the lazy upscale scheduler.
//!
//! Loads a document manifest, lets the watcher enhance every opted-in image
//! as the viewport scrolls past it and writes the results to disk.

pub mod config;
pub mod manifest;
pub mod runner;

pub use config::{ConfigError, WorkerConfig};
pub use manifest::{Manifest, ManifestError};
pub use runner::{run, run_with, RunSummary};
