//! lazyscale event primitives.
//!
//! - [`Emitter`]: synchronous typed observer registry with
//!   [`SubscriptionId`] handles. Used for queue status snapshots.
//! - [`EventBus`]: in-process fan-out backed by `tokio::sync::broadcast`.
//!   Used for document-wide completion notifications ([`UpscaleEvent`]).

pub mod bus;
pub mod emitter;

pub use bus::{EventBus, ImageUpscaled, UpscaleEvent, UpscaleFailed};
pub use emitter::{Callback, CallbackFailure, EmitReport, Emitter, SubscriptionId};
