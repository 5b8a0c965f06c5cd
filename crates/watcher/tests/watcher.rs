//! Integration tests for the watcher: discovery, visibility gating,
//! node replacement, failure handling and teardown.
//!
//! The end-to-end scenarios run the real pipeline over in-memory sources;
//! the scheduling tests use scripted enhancers.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use assert_matches::assert_matches;
use async_trait::async_trait;
use image::{Rgba, RgbaImage};
use lazyscale_core::locator::png_data_uri;
use lazyscale_core::retry::RetryConfig;
use lazyscale_events::{EventBus, UpscaleEvent};
use lazyscale_pipeline::raster::encode_png;
use lazyscale_pipeline::{MemoryLoader, PatchEmbedder, PipelineConfig, Upscaler};
use lazyscale_queue::{QueueConfig, TaskQueue};
use lazyscale_watcher::{
    Document, ElementPhase, Enhanced, Enhancer, ImageElement, Rect, Viewport, Watcher,
    WatcherConfig,
};
use tokio::sync::{broadcast, Semaphore};

const WAIT: Duration = Duration::from_secs(20);

fn gradient(w: u32, h: u32) -> RgbaImage {
    RgbaImage::from_fn(w, h, |x, y| {
        Rgba([(x % 256) as u8, (y % 256) as u8, ((x * y) % 256) as u8, 255])
    })
}

fn image_at(src: &str, y: f64) -> ImageElement {
    ImageElement::new(src, Rect::new(0.0, y, 320.0, 160.0))
        .with_alt(format!("photo {src}"))
        .with_class("gallery-item")
        .opted_in()
}

fn document() -> Arc<Document> {
    Arc::new(Document::new(Viewport::new(1024.0, 768.0)))
}

fn pipeline() -> (Arc<Upscaler>, Arc<MemoryLoader>) {
    let loader = Arc::new(MemoryLoader::new());
    let config = PipelineConfig {
        input_size: 64,
        grids: vec![4, 2],
        seed: Some(5),
        ..Default::default()
    };
    let upscaler = Upscaler::new(config, Arc::new(PatchEmbedder::new(4)), loader.clone())
        .expect("pipeline should build");
    (Arc::new(upscaler), loader)
}

fn no_retry() -> WatcherConfig {
    WatcherConfig {
        retry: RetryConfig::disabled(),
        ..Default::default()
    }
}

fn fast_retry(max_attempts: u32) -> WatcherConfig {
    WatcherConfig {
        retry: RetryConfig {
            max_attempts,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(40),
            multiplier: 2.0,
        },
        ..Default::default()
    }
}

fn tiny_png() -> Enhanced {
    let png = encode_png(&gradient(8, 4)).unwrap();
    Enhanced {
        data_uri: png_data_uri(&png),
        width: 8,
        height: 4,
    }
}

async fn next_event(rx: &mut broadcast::Receiver<UpscaleEvent>) -> UpscaleEvent {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for an event")
        .expect("event bus closed")
}

async fn settle(watcher: &Watcher, queue: &TaskQueue) {
    tokio::time::timeout(WAIT, async {
        watcher.wait_settled().await;
        queue.wait_idle().await;
    })
    .await
    .expect("watcher did not settle");
}

/// Plays back scripted outcomes, then succeeds. Counts every call.
#[derive(Default)]
struct ScriptedEnhancer {
    script: Mutex<VecDeque<bool>>,
    calls: AtomicUsize,
    seen: Mutex<Vec<String>>,
}

impl ScriptedEnhancer {
    fn failing_first(n: usize) -> Self {
        Self {
            script: Mutex::new(std::iter::repeat(false).take(n).collect()),
            ..Default::default()
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Enhancer for ScriptedEnhancer {
    async fn enhance(&self, locator: &str) -> Option<Enhanced> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().unwrap().push(locator.to_string());
        let succeed = self.script.lock().unwrap().pop_front().unwrap_or(true);
        succeed.then(tiny_png)
    }
}

/// Blocks every call until a permit is released.
struct GatedEnhancer {
    gate: Semaphore,
    seen: Mutex<Vec<String>>,
}

impl GatedEnhancer {
    fn new() -> Self {
        Self {
            gate: Semaphore::new(0),
            seen: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl Enhancer for GatedEnhancer {
    async fn enhance(&self, locator: &str) -> Option<Enhanced> {
        self.seen.lock().unwrap().push(locator.to_string());
        let permit = self.gate.acquire().await.ok()?;
        permit.forget();
        Some(tiny_png())
    }
}

/// Never finishes. Counts every call.
#[derive(Default)]
struct HangingEnhancer {
    calls: AtomicUsize,
}

#[async_trait]
impl Enhancer for HangingEnhancer {
    async fn enhance(&self, _locator: &str) -> Option<Enhanced> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        std::future::pending().await
    }
}

// ---------------------------------------------------------------------------
// Test: one visible image is upscaled, swapped and announced
// ---------------------------------------------------------------------------

#[tokio::test]
async fn single_visible_image_is_swapped() {
    let doc = document();
    let queue = Arc::new(TaskQueue::new());
    let bus = Arc::new(EventBus::default());
    let mut events = bus.subscribe();
    let (upscaler, loader) = pipeline();
    loader.insert("/img/a.png", gradient(128, 64));
    let original = doc.insert(image_at("/img/a.png", 0.0));

    let watcher = Watcher::start(doc.clone(), queue.clone(), upscaler, bus, no_retry());

    let done = assert_matches!(next_event(&mut events).await, UpscaleEvent::Completed(done) => done);
    assert_eq!(done.original, "/img/a.png");
    assert!(done.upscaled.starts_with("data:image/png;base64,"));
    assert_eq!((done.width, done.height), (128, 64));
    assert_eq!(done.element_id, original);

    settle(&watcher, &queue).await;

    let ids = doc.ids();
    assert_eq!(ids.len(), 1);
    let replacement_id = ids[0];
    assert_ne!(replacement_id, original);
    let replacement = doc.get(replacement_id).unwrap();
    assert_eq!(replacement.src, done.upscaled);
    assert_eq!(replacement.alt, "photo /img/a.png");
    assert_eq!(replacement.class_name, "gallery-item");
    assert!(replacement.is_opted_in());
    assert_eq!(replacement.style.get("width").map(String::as_str), Some("100%"));

    let markers = watcher.markers(replacement_id).unwrap();
    assert!(markers.processed && markers.succeeded);
    assert_eq!(watcher.phase(original), ElementPhase::Swapped);

    // The replacement is never picked up again.
    watcher.rescan();
    settle(&watcher, &queue).await;
    let status = queue.status();
    assert_eq!((status.total, status.completed), (1, 1));
}

// ---------------------------------------------------------------------------
// Test: a failing image does not block the next one
// ---------------------------------------------------------------------------

#[tokio::test]
async fn failure_is_isolated() {
    let doc = document();
    let queue = Arc::new(TaskQueue::new());
    let bus = Arc::new(EventBus::default());
    let mut events = bus.subscribe();
    let (upscaler, loader) = pipeline();
    // Wider than any drawing surface.
    loader.insert("/img/huge.png", gradient(16_385, 64));
    loader.insert("/img/ok.png", gradient(128, 64));
    let huge = doc.insert(image_at("/img/huge.png", 0.0));
    let ok = doc.insert(image_at("/img/ok.png", 200.0));

    let watcher = Watcher::start(doc.clone(), queue.clone(), upscaler, bus, no_retry());

    let failed = assert_matches!(next_event(&mut events).await, UpscaleEvent::Failed(f) => f);
    assert_eq!(failed.element_id, huge);
    assert_eq!(failed.attempts, 1);
    assert!(!failed.will_retry);
    let done = assert_matches!(next_event(&mut events).await, UpscaleEvent::Completed(d) => d);
    assert_eq!(done.element_id, ok);

    settle(&watcher, &queue).await;

    assert_eq!(queue.status().completed, 2);
    assert_eq!(watcher.phase(huge), ElementPhase::Failed);
    let markers = watcher.markers(huge).unwrap();
    assert!(markers.processed);
    assert!(!markers.succeeded);
    // The original stays displayed.
    assert_eq!(doc.get(huge).unwrap().src, "/img/huge.png");
    assert_eq!(watcher.phase(ok), ElementPhase::Swapped);
    assert!(!doc.contains(ok));
}

// ---------------------------------------------------------------------------
// Test: repeated discovery enqueues each element once
// ---------------------------------------------------------------------------

#[tokio::test]
async fn discovery_is_idempotent() {
    let doc = document();
    let queue = Arc::new(TaskQueue::new());
    let enhancer = Arc::new(ScriptedEnhancer::default());
    doc.insert(image_at("a.png", 0.0));

    let watcher = Watcher::start(
        doc.clone(),
        queue.clone(),
        enhancer.clone(),
        Arc::new(EventBus::default()),
        no_retry(),
    );
    watcher.rescan();
    watcher.rescan();
    // Unrelated insertions trigger discovery through the mutation feed.
    doc.insert(ImageElement::new("plain.png", Rect::new(0.0, 10.0, 50.0, 50.0)));
    doc.insert(ImageElement::new("plain2.png", Rect::new(0.0, 20.0, 50.0, 50.0)));

    settle(&watcher, &queue).await;
    watcher.rescan();
    settle(&watcher, &queue).await;

    assert_eq!(enhancer.calls(), 1);
    assert_eq!(queue.status().total, 1);
}

// ---------------------------------------------------------------------------
// Test: failures are retried with backoff until attempts run out
// ---------------------------------------------------------------------------

#[tokio::test]
async fn retries_until_exhausted() {
    let doc = document();
    let queue = Arc::new(TaskQueue::new());
    let bus = Arc::new(EventBus::default());
    let mut events = bus.subscribe();
    let enhancer = Arc::new(ScriptedEnhancer::failing_first(10));
    let id = doc.insert(image_at("flaky.png", 0.0));

    let watcher = Watcher::start(doc.clone(), queue.clone(), enhancer.clone(), bus, fast_retry(3));

    let mut seen = Vec::new();
    for _ in 0..3 {
        let failed = assert_matches!(next_event(&mut events).await, UpscaleEvent::Failed(f) => f);
        seen.push((failed.attempts, failed.will_retry));
    }
    assert_eq!(seen, vec![(1, true), (2, true), (3, false)]);

    settle(&watcher, &queue).await;

    assert_eq!(enhancer.calls(), 3);
    assert_eq!(watcher.phase(id), ElementPhase::Failed);
    assert_eq!(watcher.record(id).unwrap().attempts, 3);
    let markers = watcher.markers(id).unwrap();
    assert!(markers.queued && markers.processed && !markers.succeeded);
    assert_eq!(queue.status().completed, 3);
}

// ---------------------------------------------------------------------------
// Test: a retry that succeeds swaps the node
// ---------------------------------------------------------------------------

#[tokio::test]
async fn retry_can_recover() {
    let doc = document();
    let queue = Arc::new(TaskQueue::new());
    let bus = Arc::new(EventBus::default());
    let mut events = bus.subscribe();
    let enhancer = Arc::new(ScriptedEnhancer::failing_first(1));
    let id = doc.insert(image_at("once.png", 0.0));

    let watcher = Watcher::start(doc.clone(), queue.clone(), enhancer.clone(), bus, fast_retry(3));

    assert_matches!(
        next_event(&mut events).await,
        UpscaleEvent::Failed(f) if f.attempts == 1 && f.will_retry
    );
    assert_matches!(next_event(&mut events).await, UpscaleEvent::Completed(d) if d.element_id == id);

    settle(&watcher, &queue).await;
    assert_eq!(watcher.phase(id), ElementPhase::Swapped);
    assert_eq!(watcher.record(id).unwrap().attempts, 2);
    assert_eq!(enhancer.calls(), 2);
}

// ---------------------------------------------------------------------------
// Test: off-screen images wait until scrolled into the preload area
// ---------------------------------------------------------------------------

#[tokio::test]
async fn offscreen_image_waits_for_scroll() {
    let doc = document();
    let queue = Arc::new(TaskQueue::new());
    let bus = Arc::new(EventBus::default());
    let mut events = bus.subscribe();
    let enhancer = Arc::new(ScriptedEnhancer::default());
    // The preload area ends at 768 + 500 = 1268px.
    let near = doc.insert(image_at("near.png", 1200.0));
    let far = doc.insert(image_at("far.png", 3000.0));

    let watcher = Watcher::start(doc.clone(), queue.clone(), enhancer.clone(), bus, no_retry());

    assert_matches!(next_event(&mut events).await, UpscaleEvent::Completed(d) if d.element_id == near);
    settle(&watcher, &queue).await;
    assert_eq!(watcher.phase(far), ElementPhase::Observed);
    assert_eq!(enhancer.calls(), 1);

    doc.scroll_to(2000.0);

    assert_matches!(next_event(&mut events).await, UpscaleEvent::Completed(d) if d.element_id == far);
    assert_eq!(*enhancer.seen.lock().unwrap(), vec!["near.png", "far.png"]);
}

// ---------------------------------------------------------------------------
// Test: images inserted after start are discovered
// ---------------------------------------------------------------------------

#[tokio::test]
async fn inserted_images_are_discovered() {
    let doc = document();
    let queue = Arc::new(TaskQueue::new());
    let bus = Arc::new(EventBus::default());
    let mut events = bus.subscribe();
    let enhancer = Arc::new(ScriptedEnhancer::default());

    let watcher = Watcher::start(doc.clone(), queue.clone(), enhancer, bus, no_retry());
    assert_eq!(watcher.summary().observed, 0);

    let ids = doc.insert_all(vec![image_at("late-1.png", 0.0), image_at("late-2.png", 300.0)]);

    let first = next_event(&mut events).await;
    let second = next_event(&mut events).await;
    assert_eq!(first.element_id(), ids[0]);
    assert_eq!(second.element_id(), ids[1]);

    settle(&watcher, &queue).await;
    // Two originals and their two replacements.
    assert_eq!(watcher.summary().swapped, 4);
}

// ---------------------------------------------------------------------------
// Test: removing an element drops its pending job
// ---------------------------------------------------------------------------

#[tokio::test]
async fn removed_element_is_not_processed() {
    let doc = document();
    let queue = Arc::new(TaskQueue::new());
    let enhancer = Arc::new(GatedEnhancer::new());
    let first = doc.insert(image_at("first.png", 0.0));
    let second = doc.insert(image_at("second.png", 200.0));

    let watcher = Watcher::start(
        doc.clone(),
        queue.clone(),
        enhancer.clone(),
        Arc::new(EventBus::default()),
        no_retry(),
    );

    // The first job holds the queue; the second is pending.
    tokio::time::timeout(WAIT, async {
        while watcher.phase(first) != ElementPhase::Processing {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("first job never started");
    assert_eq!(queue.pending_len(), 1);

    doc.remove(second).unwrap();
    tokio::time::timeout(WAIT, async {
        while watcher.record(second).is_some() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("removal was never handled");
    assert_eq!(queue.pending_len(), 0);

    enhancer.gate.add_permits(1);
    settle(&watcher, &queue).await;

    assert_eq!(*enhancer.seen.lock().unwrap(), vec!["first.png"]);
    assert_eq!(watcher.phase(first), ElementPhase::Swapped);
    assert_eq!(queue.status().total, 1);
}

// ---------------------------------------------------------------------------
// Test: disconnect stops observation and clears the queue
// ---------------------------------------------------------------------------

#[tokio::test]
async fn disconnect_stops_everything() {
    let doc = document();
    let queue = Arc::new(TaskQueue::new());
    let enhancer = Arc::new(ScriptedEnhancer::default());
    let far = doc.insert(image_at("far.png", 5000.0));

    let watcher = Watcher::start(
        doc.clone(),
        queue.clone(),
        enhancer.clone(),
        Arc::new(EventBus::default()),
        no_retry(),
    );
    assert_eq!(watcher.phase(far), ElementPhase::Observed);

    watcher.disconnect().await;
    assert!(!watcher.is_connected());

    doc.scroll_to(4800.0);
    doc.insert(image_at("late.png", 4800.0));
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(enhancer.calls(), 0);
    assert_eq!(queue.status().total, 0);
    assert_eq!(watcher.phase(far), ElementPhase::Observed);
}

// ---------------------------------------------------------------------------
// Test: disconnect with a pending retry does not hang
// ---------------------------------------------------------------------------

#[tokio::test]
async fn disconnect_cancels_pending_retry() {
    let doc = document();
    let queue = Arc::new(TaskQueue::new());
    let bus = Arc::new(EventBus::default());
    let mut events = bus.subscribe();
    let enhancer = Arc::new(ScriptedEnhancer::failing_first(1));
    let id = doc.insert(image_at("slow-retry.png", 0.0));
    let config = WatcherConfig {
        retry: RetryConfig {
            max_attempts: 2,
            initial_delay: Duration::from_secs(60),
            max_delay: Duration::from_secs(60),
            multiplier: 1.0,
        },
        ..Default::default()
    };

    let watcher = Watcher::start(doc.clone(), queue.clone(), enhancer.clone(), bus, config);
    assert_matches!(next_event(&mut events).await, UpscaleEvent::Failed(f) if f.will_retry);

    tokio::time::timeout(Duration::from_secs(5), watcher.disconnect())
        .await
        .expect("disconnect waited for the backoff");
    tokio::time::timeout(Duration::from_secs(5), watcher.wait_settled())
        .await
        .expect("a disconnected watcher is settled");

    assert_eq!(enhancer.calls(), 1);
    assert_eq!(watcher.phase(id), ElementPhase::Observed);
}

// ---------------------------------------------------------------------------
// Test: an attempt that overruns its timeout fails and is retried
// ---------------------------------------------------------------------------

#[tokio::test]
async fn hung_attempt_times_out() {
    let doc = document();
    let queue = Arc::new(TaskQueue::new());
    let bus = Arc::new(EventBus::default());
    let mut events = bus.subscribe();
    let enhancer = Arc::new(HangingEnhancer::default());
    let id = doc.insert(image_at("stuck.png", 0.0));
    let config = WatcherConfig {
        attempt_timeout: Some(Duration::from_millis(50)),
        ..fast_retry(2)
    };

    let watcher = Watcher::start(doc.clone(), queue.clone(), enhancer.clone(), bus, config);

    let mut seen = Vec::new();
    for _ in 0..2 {
        let failed = assert_matches!(next_event(&mut events).await, UpscaleEvent::Failed(f) => f);
        seen.push((failed.attempts, failed.will_retry));
    }
    assert_eq!(seen, vec![(1, true), (2, false)]);

    settle(&watcher, &queue).await;

    assert_eq!(enhancer.calls.load(Ordering::SeqCst), 2);
    assert_eq!(watcher.phase(id), ElementPhase::Failed);
    assert_eq!(watcher.summary().processing, 0);
    assert_eq!(queue.status().completed, 2);
}

// ---------------------------------------------------------------------------
// Test: a job dropped by the queue's timeout still fails its element
// ---------------------------------------------------------------------------

#[tokio::test]
async fn queue_timeout_fails_dropped_job() {
    let doc = document();
    let queue = Arc::new(TaskQueue::with_config(QueueConfig {
        job_timeout: Some(Duration::from_millis(50)),
    }));
    let bus = Arc::new(EventBus::default());
    let mut events = bus.subscribe();
    let enhancer = Arc::new(HangingEnhancer::default());
    let id = doc.insert(image_at("stuck.png", 0.0));

    let watcher = Watcher::start(doc.clone(), queue.clone(), enhancer.clone(), bus, no_retry());

    assert_matches!(
        next_event(&mut events).await,
        UpscaleEvent::Failed(f) if f.element_id == id && f.attempts == 1 && !f.will_retry
    );

    settle(&watcher, &queue).await;

    assert_eq!(watcher.phase(id), ElementPhase::Failed);
    let markers = watcher.markers(id).unwrap();
    assert!(markers.queued && markers.processed && !markers.succeeded);
    assert_eq!(queue.status().completed, 1);
    assert!(doc.contains(id));
}
