//! Discovery, visibility gating and node replacement.
//!
//! [`Watcher::start`] scans the document for opted-in images, observes each
//! one through a [`VisibilityObserver`] and enqueues exactly one job per
//! element once it comes near the viewport. A background loop follows the
//! document's mutation feed so images added later are picked up too.
//!
//! Job outcomes are handled here and nowhere else: a result is decoded once
//! more, swapped in as a fresh node and announced on the [`EventBus`]; a
//! miss is announced as a failure and retried with backoff until the
//! [`RetryConfig`] is exhausted.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use lazyscale_core::retry::RetryConfig;
use lazyscale_core::types::ElementId;
use lazyscale_events::{EventBus, UpscaleEvent};
use lazyscale_pipeline::raster;
use lazyscale_queue::TaskQueue;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::document::{Document, ImageElement, Mutation};
use crate::enhancer::{Enhanced, Enhancer};
use crate::registry::{ElementMarkers, ElementPhase, ElementRecord, ElementRegistry, RegistrySummary};
use crate::visibility::{VisibilityObserver, DEFAULT_PRELOAD_MARGIN_PX};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct WatcherConfig {
    /// Vertical distance outside the viewport at which loading starts.
    pub preload_margin_px: f64,
    pub retry: RetryConfig,
    /// Queue priority given to every upscale job.
    pub priority: i32,
    /// Upper bound on one enhancement attempt. An attempt that runs longer
    /// is abandoned and counted as a failure.
    pub attempt_timeout: Option<Duration>,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            preload_margin_px: DEFAULT_PRELOAD_MARGIN_PX,
            retry: RetryConfig::default(),
            priority: 0,
            attempt_timeout: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Shared context
// ---------------------------------------------------------------------------

struct WatchState {
    registry: ElementRegistry,
    visibility: VisibilityObserver,
}

struct Context {
    document: Arc<Document>,
    queue: Arc<TaskQueue>,
    enhancer: Arc<dyn Enhancer>,
    bus: Arc<EventBus>,
    config: WatcherConfig,
    state: Mutex<WatchState>,
    cancel: CancellationToken,
    /// Pending retry timers.
    retries: TaskTracker,
    /// Woken whenever a job settles or an element leaves.
    settled: Notify,
}

impl Context {
    fn lock(&self) -> MutexGuard<'_, WatchState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Register every opted-in element not seen before.
    fn discover(&self) -> usize {
        let eligible = self.document.query_eligible();
        let mut state = self.lock();
        let mut discovered = 0;
        for (id, element) in eligible {
            if state.registry.mark_observed(id, &element.src) {
                state.visibility.observe(id);
                discovered += 1;
            }
        }
        if discovered > 0 {
            tracing::debug!(discovered, observing = state.visibility.len(), "Discovered images");
        }
        discovered
    }

    /// Enqueue every observed element that is now near the viewport.
    fn check_visibility(self: &Arc<Self>) {
        if self.cancel.is_cancelled() {
            return;
        }
        let ready: Vec<ElementId> = {
            let mut state = self.lock();
            let WatchState {
                registry,
                visibility,
            } = &mut *state;
            let visible = visibility.intersecting(&self.document);
            visible
                .into_iter()
                .filter(|id| {
                    visibility.unobserve(*id);
                    registry.mark_queued(*id)
                })
                .collect()
        };
        for id in ready {
            tracing::debug!(element_id = %id, "Image entered the preload area");
            self.submit(id);
        }
    }

    /// Put one attempt for `id` on the queue.
    fn submit(self: &Arc<Self>, id: ElementId) {
        let ctx = Arc::clone(self);
        let task = self.queue.add(
            move || async move {
                ctx.process(id).await;
                Ok::<(), anyhow::Error>(())
            },
            self.config.priority,
        );
        self.lock().registry.set_task(id, task);
    }

    async fn process(self: Arc<Self>, id: ElementId) {
        self.run_attempt(id).await;
        self.settled.notify_waiters();
    }

    async fn run_attempt(self: &Arc<Self>, id: ElementId) {
        if self.cancel.is_cancelled() {
            return;
        }
        let Some(attempt) = self.lock().registry.begin(id) else {
            tracing::debug!(element_id = %id, "Element no longer pending, skipping job");
            return;
        };
        let Some(element) = self.document.get(id) else {
            self.lock().registry.forget(id);
            tracing::debug!(element_id = %id, "Element left the document before processing");
            return;
        };

        let guard = AttemptGuard::arm(self, id, &element, attempt);
        let started = Instant::now();
        let outcome = self.enhance(&element).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;
        guard.disarm();

        if self.cancel.is_cancelled() {
            tracing::debug!(element_id = %id, "Watcher disconnected, discarding result");
            return;
        }

        match outcome {
            Ok(enhanced) => match self.swap(id, &element, enhanced) {
                Ok(()) => {
                    tracing::info!(element_id = %id, locator = %element.src, attempt, elapsed_ms, "Image upscaled and swapped");
                }
                Err(reason) => self.fail(id, &element, attempt, &reason),
            },
            Err(reason) => self.fail(id, &element, attempt, &reason),
        }
    }

    async fn enhance(&self, element: &ImageElement) -> Result<Enhanced, String> {
        let attempt = self.enhancer.enhance(&element.src);
        let result = match self.config.attempt_timeout {
            Some(limit) => tokio::time::timeout(limit, attempt)
                .await
                .map_err(|_| format!("timed out after {}ms", limit.as_millis()))?,
            None => attempt.await,
        };
        result.ok_or_else(|| "no result".to_string())
    }

    /// Verify the result decodes, then replace the node and announce it.
    fn swap(&self, id: ElementId, element: &ImageElement, enhanced: Enhanced) -> Result<(), String> {
        let dimensions = raster::verify_encoded(&enhanced.data_uri)
            .map_err(|e| format!("replacement did not load: {e}"))?;
        if (dimensions.width, dimensions.height) != (enhanced.width, enhanced.height) {
            tracing::warn!(
                element_id = %id,
                reported = ?(enhanced.width, enhanced.height),
                decoded = ?(dimensions.width, dimensions.height),
                "Result size differs from the reported size",
            );
        }

        let replacement_id = self.document.allocate_id();
        // Registered as processed before it enters the document, so
        // discovery never picks it up.
        self.lock().registry.mark_swapped(id, replacement_id);
        let replacement = element.replacement(enhanced.data_uri.clone());
        if let Err(e) = self.document.replace(id, replacement_id, replacement) {
            self.lock().registry.forget(replacement_id);
            return Err(e.to_string());
        }

        self.bus.publish(UpscaleEvent::completed(
            element.src.clone(),
            enhanced.data_uri,
            id,
            dimensions.width,
            dimensions.height,
        ));
        Ok(())
    }

    fn fail(self: &Arc<Self>, id: ElementId, element: &ImageElement, attempt: u32, reason: &str) {
        let will_retry = self.config.retry.should_retry(attempt);
        {
            let mut state = self.lock();
            if state.registry.get(id).is_none() {
                tracing::debug!(element_id = %id, "Element left the document during processing");
                return;
            }
            if will_retry {
                state.registry.mark_retrying(id);
            } else {
                state.registry.mark_failed(id);
            }
        }

        tracing::warn!(
            element_id = %id,
            locator = %element.src,
            attempt,
            will_retry,
            reason,
            "Upscale attempt failed",
        );
        self.bus
            .publish(UpscaleEvent::failed(element.src.clone(), id, attempt, will_retry));

        if will_retry {
            self.schedule_retry(id, attempt);
        }
    }

    fn schedule_retry(self: &Arc<Self>, id: ElementId, attempt: u32) {
        let delay = self.config.retry.delay_for_attempt(attempt);
        tracing::debug!(element_id = %id, delay_ms = delay.as_millis() as u64, "Scheduling retry");

        let ctx = Arc::clone(self);
        self.retries.spawn(async move {
            tokio::select! {
                _ = ctx.cancel.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    let pending = ctx.lock().registry.phase(id) == ElementPhase::Queued;
                    if pending && ctx.document.contains(id) {
                        ctx.submit(id);
                    } else {
                        ctx.lock().registry.forget(id);
                    }
                }
            }
            ctx.settled.notify_waiters();
        });
    }

    fn handle_removed(&self, id: ElementId) {
        let record = {
            let mut state = self.lock();
            state.visibility.unobserve(id);
            state.registry.forget(id)
        };
        if let Some(task) = record.and_then(|r| r.task) {
            if self.queue.remove(task) {
                tracing::debug!(element_id = %id, "Dropped pending job for removed element");
            }
        }
        self.settled.notify_waiters();
    }

    fn is_settled(&self) -> bool {
        self.cancel.is_cancelled() || self.lock().registry.in_flight() == 0
    }
}

/// Fails the attempt if its future is dropped before it finishes, which
/// happens when the queue's own job timeout fires.
struct AttemptGuard {
    ctx: Arc<Context>,
    id: ElementId,
    attempt: u32,
    element: Option<ImageElement>,
}

impl AttemptGuard {
    fn arm(ctx: &Arc<Context>, id: ElementId, element: &ImageElement, attempt: u32) -> Self {
        Self {
            ctx: Arc::clone(ctx),
            id,
            attempt,
            element: Some(element.clone()),
        }
    }

    fn disarm(mut self) {
        self.element = None;
    }
}

impl Drop for AttemptGuard {
    fn drop(&mut self) {
        let Some(element) = self.element.take() else {
            return;
        };
        if self.ctx.cancel.is_cancelled() {
            return;
        }
        if tokio::runtime::Handle::try_current().is_err() {
            // No runtime left to schedule a retry on.
            self.ctx.lock().registry.mark_failed(self.id);
        } else {
            self.ctx
                .fail(self.id, &element, self.attempt, "job dropped before finishing");
        }
        self.ctx.settled.notify_waiters();
    }
}

// ---------------------------------------------------------------------------
// Mutation loop
// ---------------------------------------------------------------------------

async fn watch_mutations(ctx: Arc<Context>, mut mutations: broadcast::Receiver<Mutation>) {
    tracing::debug!("Mutation watcher started");

    loop {
        let mutation = tokio::select! {
            _ = ctx.cancel.cancelled() => break,
            m = mutations.recv() => m,
        };

        match mutation {
            Ok(Mutation::NodesAdded(ids)) => {
                tracing::trace!(added = ids.len(), "Nodes added");
                ctx.discover();
                ctx.check_visibility();
            }
            Ok(Mutation::Replaced { old, new }) => {
                // Our own swaps mark `old` as Swapped first; anything still
                // in flight was replaced by someone else.
                if ctx.lock().registry.phase(old).is_in_flight() {
                    ctx.handle_removed(old);
                }
                tracing::trace!(old = %old, new = %new, "Node replaced");
                ctx.discover();
                ctx.check_visibility();
            }
            Ok(Mutation::NodeRemoved(id)) => ctx.handle_removed(id),
            Ok(Mutation::Scrolled(_)) => ctx.check_visibility(),
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "Mutation feed lagged, rescanning document");
                ctx.discover();
                ctx.check_visibility();
            }
            Err(RecvError::Closed) => break,
        }
    }

    tracing::debug!("Mutation watcher stopped");
}

// ---------------------------------------------------------------------------
// Watcher
// ---------------------------------------------------------------------------

/// Drives lazy enhancement of one document.
///
/// Construction needs a ready [`Enhancer`], so observation never starts
/// before a model is loaded. Must be created inside a Tokio runtime.
pub struct Watcher {
    ctx: Arc<Context>,
    mutation_loop: Mutex<Option<JoinHandle<()>>>,
}

impl Watcher {
    pub fn start(
        document: Arc<Document>,
        queue: Arc<TaskQueue>,
        enhancer: Arc<dyn Enhancer>,
        bus: Arc<EventBus>,
        config: WatcherConfig,
    ) -> Self {
        // Subscribe before the first scan so no insertion slips between.
        let mutations = document.subscribe();
        let ctx = Arc::new(Context {
            document,
            queue,
            enhancer,
            bus,
            state: Mutex::new(WatchState {
                registry: ElementRegistry::new(),
                visibility: VisibilityObserver::new(config.preload_margin_px),
            }),
            config,
            cancel: CancellationToken::new(),
            retries: TaskTracker::new(),
            settled: Notify::new(),
        });

        let discovered = ctx.discover();
        ctx.check_visibility();
        tracing::info!(discovered, margin_px = ctx.config.preload_margin_px, "Watcher started");

        let handle = tokio::spawn(watch_mutations(Arc::clone(&ctx), mutations));
        Self {
            ctx,
            mutation_loop: Mutex::new(Some(handle)),
        }
    }

    pub fn config(&self) -> &WatcherConfig {
        &self.ctx.config
    }

    /// Run discovery and the visibility check now instead of waiting for
    /// the mutation feed.
    pub fn rescan(&self) {
        self.ctx.discover();
        self.ctx.check_visibility();
    }

    pub fn markers(&self, id: ElementId) -> Option<ElementMarkers> {
        self.ctx.lock().registry.markers(id)
    }

    pub fn phase(&self, id: ElementId) -> ElementPhase {
        self.ctx.lock().registry.phase(id)
    }

    pub fn record(&self, id: ElementId) -> Option<ElementRecord> {
        self.ctx.lock().registry.get(id).cloned()
    }

    pub fn summary(&self) -> RegistrySummary {
        self.ctx.lock().registry.summary()
    }

    pub fn is_connected(&self) -> bool {
        !self.ctx.cancel.is_cancelled()
    }

    /// Resolve once no element is queued, processing or waiting to retry.
    pub async fn wait_settled(&self) {
        loop {
            let notified = self.ctx.settled.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.ctx.is_settled() {
                return;
            }
            notified.await;
        }
    }

    /// Stop observing, drop pending jobs and stop the mutation loop.
    ///
    /// A job that is already running finishes, but its result is discarded.
    pub async fn disconnect(&self) {
        self.ctx.cancel.cancel();
        let abandoned = {
            let mut state = self.ctx.lock();
            state.visibility.disconnect();
            state.registry.abandon_pending()
        };
        self.ctx.queue.clear();

        self.ctx.retries.close();
        self.ctx.retries.wait().await;

        let handle = self
            .mutation_loop
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Mutation watcher panicked");
            }
        }
        self.ctx.settled.notify_waiters();
        tracing::info!(abandoned, "Watcher disconnected");
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        self.ctx.cancel.cancel();
    }
}
