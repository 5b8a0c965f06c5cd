//! Lazy enhancement of opted-in images in a document.
//!
//! - [`document`]: the in-process document model and its mutation feed.
//! - [`visibility`]: proximity checks against the viewport.
//! - [`registry`]: per-element markers and phase.
//! - [`watcher`]: ties them to the task queue and the event bus.

pub mod document;
pub mod enhancer;
pub mod registry;
pub mod visibility;
pub mod watcher;

pub use document::{Document, DocumentError, ImageElement, Mutation, Rect, Viewport, UPSCALE_MARKER};
pub use enhancer::{Enhanced, Enhancer};
pub use registry::{ElementMarkers, ElementPhase, ElementRecord, ElementRegistry, RegistrySummary};
pub use visibility::{VisibilityObserver, DEFAULT_PRELOAD_MARGIN_PX};
pub use watcher::{Watcher, WatcherConfig};
