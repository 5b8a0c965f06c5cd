//! One pass over a manifest: build the document, scroll through it and
//! collect every upscaled image on disk.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use lazyscale_core::locator::{decode_data_uri, is_data_uri};
use lazyscale_core::performance::PerformanceFeed;
use lazyscale_core::status::QueueStatus;
use lazyscale_core::types::ElementId;
use lazyscale_events::{EventBus, ImageUpscaled, UpscaleEvent};
use lazyscale_pipeline::reshape::PRIMARY_GRID;
use lazyscale_pipeline::{DefaultLoader, FeatureExtractor, PatchEmbedder, SourceLoader, Upscaler};
use lazyscale_queue::TaskQueue;
use lazyscale_watcher::{Document, Watcher};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;

use crate::config::WorkerConfig;
use crate::manifest::Manifest;

/// What a run produced.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub eligible: usize,
    pub upscaled: usize,
    pub failed: usize,
    pub written: Vec<PathBuf>,
    pub queue: QueueStatus,
    pub performance: PerformanceFeed,
}

#[derive(Debug, Default)]
struct OutputReport {
    written: Vec<PathBuf>,
    upscaled: usize,
    failed: usize,
}

/// Process the configured manifest with the default loader and model.
pub async fn run(config: &WorkerConfig) -> anyhow::Result<RunSummary> {
    let manifest = Manifest::load(&config.manifest).await?;
    let loader = DefaultLoader::new(manifest.origin.clone(), manifest.base_dir())?;
    run_with(
        config,
        &manifest,
        Arc::new(PatchEmbedder::new(PRIMARY_GRID)),
        Arc::new(loader),
    )
    .await
}

/// Process `manifest` with an explicit model and loader.
pub async fn run_with(
    config: &WorkerConfig,
    manifest: &Manifest,
    model: Arc<dyn FeatureExtractor>,
    loader: Arc<dyn SourceLoader>,
) -> anyhow::Result<RunSummary> {
    tokio::fs::create_dir_all(&config.output_dir).await?;

    let upscaler = Arc::new(Upscaler::new(config.pipeline_config(), model, loader)?);
    tracing::info!(
        input_size = config.input_size,
        scale_factor = config.scale_factor,
        seed = ?upscaler.seed(),
        "Upscale pipeline ready",
    );

    let document = Arc::new(manifest.to_document());
    let queue = Arc::new(TaskQueue::with_config(config.queue_config()));
    queue.on_status_update(Arc::new(|status: &QueueStatus| {
        tracing::debug!(
            total = status.total,
            processing = status.processing,
            completed = status.completed,
            "Queue status",
        );
    }));

    let bus = Arc::new(EventBus::default());
    let stop_writer = CancellationToken::new();
    let writer = tokio::spawn(write_outputs(
        bus.subscribe(),
        config.output_dir.clone(),
        stop_writer.clone(),
    ));

    let watcher = Watcher::start(
        Arc::clone(&document),
        Arc::clone(&queue),
        upscaler.clone(),
        bus,
        config.watcher_config(),
    );

    scroll_through(&document, &watcher, &queue, config.scroll_step_px).await;

    let status = queue.status();
    let performance = upscaler.performance().feed();
    watcher.disconnect().await;
    queue.shutdown().await;

    stop_writer.cancel();
    let report = writer.await?;

    tracing::info!(
        upscaled = report.upscaled,
        failed = report.failed,
        completed = status.completed,
        average_ms = ?performance.average_duration_ms,
        "Run finished",
    );

    Ok(RunSummary {
        eligible: manifest.eligible(),
        upscaled: report.upscaled,
        failed: report.failed,
        written: report.written,
        queue: status,
        performance,
    })
}

/// Step the viewport down the document, letting each pass settle before
/// the next scroll.
async fn scroll_through(document: &Document, watcher: &Watcher, queue: &TaskQueue, step: f64) {
    let mut scroll_y = document.viewport().scroll_y;
    loop {
        watcher.wait_settled().await;
        queue.wait_idle().await;

        let viewport = document.viewport();
        if scroll_y + viewport.height >= document.content_height() {
            break;
        }
        scroll_y += step;
        tracing::debug!(scroll_y, "Scrolling");
        document.scroll_to(scroll_y);
        watcher.rescan();
    }
}

async fn write_outputs(
    mut events: broadcast::Receiver<UpscaleEvent>,
    output_dir: PathBuf,
    stop: CancellationToken,
) -> OutputReport {
    let mut report = OutputReport::default();
    loop {
        let event = tokio::select! {
            biased;
            event = events.recv() => event,
            _ = stop.cancelled() => break,
        };
        match event {
            Ok(UpscaleEvent::Completed(done)) => {
                report.upscaled += 1;
                match write_png(&output_dir, &done).await {
                    Ok(path) => {
                        tracing::info!(element_id = %done.element_id, path = %path.display(), "Wrote upscaled image");
                        report.written.push(path);
                    }
                    Err(e) => {
                        tracing::error!(element_id = %done.element_id, error = %e, "Failed to write upscaled image");
                    }
                }
            }
            Ok(UpscaleEvent::Failed(failed)) => {
                if !failed.will_retry {
                    report.failed += 1;
                }
            }
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "Output writer lagged behind the event bus");
            }
            Err(RecvError::Closed) => break,
        }
    }
    report
}

async fn write_png(output_dir: &Path, done: &ImageUpscaled) -> anyhow::Result<PathBuf> {
    let uri = decode_data_uri(&done.upscaled)?;
    let path = output_dir.join(output_name(done.element_id, &done.original));
    tokio::fs::write(&path, &uri.bytes).await?;
    Ok(path)
}

/// `<element id>-<source file stem>.png`, restricted to safe characters.
pub fn output_name(element_id: ElementId, locator: &str) -> String {
    let stem = if is_data_uri(locator) {
        "inline".to_string()
    } else {
        let path = locator.split(['?', '#']).next().unwrap_or(locator);
        let file = path.rsplit('/').next().unwrap_or(path);
        let stem = file.rsplit_once('.').map_or(file, |(stem, _)| stem);
        stem.chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect()
    };
    let stem = if stem.is_empty() { "image".to_string() } else { stem };
    format!("{element_id}-{stem}.png")
}
