//! In-process event bus backed by a `tokio::sync::broadcast` channel.
//!
//! [`EventBus`] is the document-wide broadcast for [`UpscaleEvent`]s.
//! It is designed to be shared via `Arc<EventBus<_>>` between the watcher
//! and any number of presentation subscribers.

use lazyscale_core::types::{ElementId, Locator, Timestamp};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

// ---------------------------------------------------------------------------
// UpscaleEvent
// ---------------------------------------------------------------------------

/// Payload of the completion notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageUpscaled {
    /// Source locator of the element that was enhanced.
    pub original: Locator,
    /// Encoded result (a `data:image/png;base64,...` URI).
    pub upscaled: String,
    /// Element that was replaced.
    pub element_id: ElementId,
    pub width: u32,
    pub height: u32,
    pub timestamp: Timestamp,
}

/// A job attempt that did not produce a result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpscaleFailed {
    pub original: Locator,
    pub element_id: ElementId,
    /// Attempts made so far, including this one.
    pub attempts: u32,
    /// Whether the watcher scheduled another attempt.
    pub will_retry: bool,
    pub timestamp: Timestamp,
}

/// Notifications published by the watcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UpscaleEvent {
    /// Fired once per successfully completed job.
    Completed(ImageUpscaled),
    /// Fired for every failed attempt, so presentation layers may show
    /// their own failure indicator.
    Failed(UpscaleFailed),
}

impl UpscaleEvent {
    pub fn completed(
        original: impl Into<Locator>,
        upscaled: impl Into<String>,
        element_id: ElementId,
        width: u32,
        height: u32,
    ) -> Self {
        UpscaleEvent::Completed(ImageUpscaled {
            original: original.into(),
            upscaled: upscaled.into(),
            element_id,
            width,
            height,
            timestamp: chrono::Utc::now(),
        })
    }

    pub fn failed(
        original: impl Into<Locator>,
        element_id: ElementId,
        attempts: u32,
        will_retry: bool,
    ) -> Self {
        UpscaleEvent::Failed(UpscaleFailed {
            original: original.into(),
            element_id,
            attempts,
            will_retry,
            timestamp: chrono::Utc::now(),
        })
    }

    pub fn element_id(&self) -> ElementId {
        match self {
            UpscaleEvent::Completed(e) => e.element_id,
            UpscaleEvent::Failed(e) => e.element_id,
        }
    }
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

/// Default buffer capacity for the broadcast channel.
const DEFAULT_CAPACITY: usize = 256;

/// In-process fan-out event bus.
///
/// Wraps a [`broadcast::Sender`] so that any number of subscribers can
/// independently receive every published event.
///
/// # Usage
///
/// ```rust
/// use lazyscale_core::types::ElementId;
/// use lazyscale_events::bus::{EventBus, UpscaleEvent};
///
/// let bus = EventBus::default();
/// let mut rx = bus.subscribe();
///
/// bus.publish(UpscaleEvent::failed("https://example.com/a.png", ElementId(1), 1, true));
/// ```
pub struct EventBus<E = UpscaleEvent> {
    sender: broadcast::Sender<E>,
}

impl<E: Clone> EventBus<E> {
    /// Create a bus with a specific channel capacity.
    ///
    /// When the buffer is full, the oldest un-consumed messages are dropped
    /// and slow receivers will observe a `RecvError::Lagged`.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event to all current subscribers.
    ///
    /// If there are no active subscribers the event is silently dropped.
    pub fn publish(&self, event: E) {
        // Ignore the SendError -- it only means there are zero receivers.
        let _ = self.sender.send(event);
    }

    /// Subscribe to all events published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<E> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl<E: Clone> Default for EventBus<E> {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
