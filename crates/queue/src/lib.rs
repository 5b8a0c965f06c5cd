//! Single-worker priority task queue.
//!
//! [`TaskQueue`] accepts zero-argument async closures with an integer
//! priority and runs them one at a time on a dedicated driver task. Any
//! number of [`TaskQueue::add`] calls only accumulate queued metadata;
//! heavy work never runs concurrently.
//!
//! Status snapshots ([`QueueStatus`](lazyscale_core::status::QueueStatus))
//! are emitted after every mutating operation through an
//! [`Emitter`](lazyscale_events::Emitter).

mod driver;
pub mod queue;

pub use queue::{QueueConfig, Task, TaskFuture, TaskId, TaskQueue};
