//! The upscale pipeline: acquisition through encoding, one job at a time.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use image::RgbaImage;
use lazyscale_core::geometry::{
    fit_within, Dimensions, DEFAULT_INPUT_SIZE, DEFAULT_MIN_DIMENSION, DEFAULT_SCALE_FACTOR,
    MAX_SURFACE_DIMENSION,
};
use lazyscale_core::locator::{png_data_uri, DEFAULT_RELAY_ENDPOINT};
use lazyscale_core::performance::{PerformanceAggregator, ResourceUsage};
use ndarray::Array3;

use crate::acquire::{acquire, SourceLoader};
use crate::decoder::{DecoderWeights, ProgressiveDecoder};
use crate::error::PipelineError;
use crate::model::{warm_up, FeatureExtractor};
use crate::ops::resize_bilinear;
use crate::raster::{encode_png, normalise, to_rgba, DEFAULT_GAMMA};
use crate::reshape::{reshape_embedding, FALLBACK_GRID, PRIMARY_GRID};
use crate::tensor::BufferTracker;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Square bound the source is fitted into before inference.
    pub input_size: u32,
    /// Output is `fitted dimensions * scale_factor`.
    pub scale_factor: u32,
    /// Sources smaller than this on either side are rejected.
    pub min_dimension: u32,
    pub relay_endpoint: String,
    /// Grid sides tried, in order, when reshaping a flat embedding.
    pub grids: Vec<usize>,
    pub gamma: f32,
    /// Decoder initialisation seed. A random seed is drawn (and logged)
    /// when `None` and no weights file is configured.
    pub seed: Option<u64>,
    /// JSON decoder weights; takes precedence over `seed`.
    pub weights_path: Option<PathBuf>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            input_size: DEFAULT_INPUT_SIZE,
            scale_factor: DEFAULT_SCALE_FACTOR,
            min_dimension: DEFAULT_MIN_DIMENSION,
            relay_endpoint: DEFAULT_RELAY_ENDPOINT.to_string(),
            grids: vec![PRIMARY_GRID, FALLBACK_GRID],
            gamma: DEFAULT_GAMMA,
            seed: None,
            weights_path: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

/// A finished job.
#[derive(Debug, Clone)]
pub struct UpscaleOutput {
    /// `data:image/png;base64,...`
    pub data_uri: String,
    pub png: Vec<u8>,
    pub dimensions: Dimensions,
    pub source: Dimensions,
    pub duration: Duration,
    /// Peak buffer usage of this job alone.
    pub usage: ResourceUsage,
}

// ---------------------------------------------------------------------------
// Upscaler
// ---------------------------------------------------------------------------

struct Inner {
    config: PipelineConfig,
    model: Arc<dyn FeatureExtractor>,
    loader: Arc<dyn SourceLoader>,
    decoder: ProgressiveDecoder,
    tracker: BufferTracker,
    performance: PerformanceAggregator,
}

/// Cheap-to-clone handle to a configured pipeline.
#[derive(Clone)]
pub struct Upscaler {
    inner: Arc<Inner>,
}

impl Upscaler {
    /// Build the decoder and warm the model up.
    pub fn new(
        config: PipelineConfig,
        model: Arc<dyn FeatureExtractor>,
        loader: Arc<dyn SourceLoader>,
    ) -> Result<Self, PipelineError> {
        if config.input_size == 0 || config.scale_factor == 0 {
            return Err(PipelineError::Unclassified(
                "input_size and scale_factor must be positive".to_string(),
            ));
        }

        let decoder = match (&config.weights_path, config.seed) {
            (Some(path), _) => {
                let decoder = ProgressiveDecoder::from_weights(DecoderWeights::load(path)?)?;
                tracing::info!(path = %path.display(), "Loaded decoder weights");
                decoder
            }
            (None, Some(seed)) => ProgressiveDecoder::seeded(seed),
            (None, None) => {
                let seed = rand::random::<u64>();
                tracing::info!(seed, "No decoder seed configured, drew a random one");
                ProgressiveDecoder::seeded(seed)
            }
        };

        let tracker = BufferTracker::new();
        warm_up(model.as_ref(), &tracker.scoped())?;

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                model,
                loader,
                decoder,
                tracker,
                performance: PerformanceAggregator::new(),
            }),
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.inner.config
    }

    /// Seed behind the decoder parameters, if they were not loaded.
    pub fn seed(&self) -> Option<u64> {
        self.inner.decoder.seed()
    }

    /// Run the full pipeline for `locator`.
    pub async fn upscale(&self, locator: &str) -> Result<UpscaleOutput, PipelineError> {
        self.upscale_with_scope(locator, self.inner.tracker.scoped())
            .await
    }

    /// Same as [`upscale`](Self::upscale), against a caller-provided
    /// tracker scope so the caller can inspect the job's buffers.
    pub async fn upscale_with_scope(
        &self,
        locator: &str,
        scope: BufferTracker,
    ) -> Result<UpscaleOutput, PipelineError> {
        let started = Instant::now();
        let config = &self.inner.config;

        let pixels = acquire(
            self.inner.loader.as_ref(),
            locator,
            &config.relay_endpoint,
            config.min_dimension,
        )
        .await?;
        let source = Dimensions::new(pixels.width(), pixels.height());

        let inner = Arc::clone(&self.inner);
        let job_scope = scope.clone();
        let (png, dimensions) =
            tokio::task::spawn_blocking(move || inner.transform(pixels, &job_scope))
                .await
                .map_err(|e| PipelineError::Unclassified(format!("pipeline task failed: {e}")))??;

        let leaked = scope.live_buffers();
        if leaked != 0 {
            tracing::warn!(locator, leaked, "Job finished with live buffers");
        }

        let duration = started.elapsed();
        let usage = scope.usage();
        self.inner.performance.record(duration, usage);
        tracing::info!(
            locator,
            source_width = source.width,
            source_height = source.height,
            width = dimensions.width,
            height = dimensions.height,
            duration_ms = duration.as_millis() as u64,
            peak_bytes = usage.peak_bytes,
            "Upscale finished"
        );

        Ok(UpscaleOutput {
            data_uri: png_data_uri(&png),
            png,
            dimensions,
            source,
            duration,
            usage,
        })
    }

    /// Pipeline boundary: any failure becomes `None` after being logged.
    pub async fn upscale_or_none(&self, locator: &str) -> Option<UpscaleOutput> {
        match self.upscale(locator).await {
            Ok(output) => Some(output),
            Err(e) => {
                tracing::warn!(locator, kind = %e.kind(), error = %e, "Upscale failed");
                None
            }
        }
    }

    pub fn performance(&self) -> &PerformanceAggregator {
        &self.inner.performance
    }

    pub fn reset_performance(&self) {
        self.inner.performance.reset();
    }

    /// Buffer usage across every job (and the warm-up) so far.
    pub fn memory(&self) -> ResourceUsage {
        self.inner.tracker.usage()
    }
}

impl Inner {
    /// Stages 2 to 8. Every tensor is tracked in `scope` and dropped by the
    /// time this returns.
    fn transform(
        &self,
        pixels: RgbaImage,
        scope: &BufferTracker,
    ) -> Result<(Vec<u8>, Dimensions), PipelineError> {
        let config = &self.config;

        let raw = scope.track(pixel_tensor(&pixels));
        drop(pixels);

        let (h, w, _) = raw.dim();
        let fit = fit_within(w as u32, h as u32, config.input_size)?;
        let resized = scope.track(resize_bilinear(
            raw.view(),
            fit.height as usize,
            fit.width as usize,
        ));
        drop(raw);

        let features = scope.track(self.model.infer(resized.view())?);
        let reshaped = scope.track(reshape_embedding(features.view(), &config.grids)?);
        drop(features);

        let decoded = self.decoder.decode(&reshaped, scope)?;
        drop(reshaped);

        let target = fit.scaled(config.scale_factor)?;
        if target.width > MAX_SURFACE_DIMENSION || target.height > MAX_SURFACE_DIMENSION {
            return Err(PipelineError::Context(format!(
                "{}x{} output exceeds the {MAX_SURFACE_DIMENSION}px surface limit",
                target.width, target.height
            )));
        }
        let enhanced = scope.track(resize_bilinear(
            decoded.view(),
            target.height as usize,
            target.width as usize,
        ));
        drop(decoded);

        let (normalised, _stats) = normalise(enhanced.view(), config.gamma);
        let normalised = scope.track(normalised);
        drop(enhanced);

        let img = to_rgba(normalised.view())?;
        drop(normalised);

        Ok((encode_png(&img)?, target))
    }
}

/// `H x W x 3` tensor of raw 0..255 channel values; alpha is dropped.
fn pixel_tensor(pixels: &RgbaImage) -> Array3<f32> {
    let (w, h) = pixels.dimensions();
    Array3::from_shape_fn((h as usize, w as usize, 3), |(y, x, c)| {
        f32::from(pixels.get_pixel(x as u32, y as u32)[c])
    })
}

#[cfg(test)]
mod tests {
    use image::Rgba;

    use super::*;

    #[test]
    fn pixel_tensor_is_hwc() {
        let mut img = RgbaImage::new(3, 2);
        img.put_pixel(2, 1, Rgba([1, 2, 3, 4]));

        let t = pixel_tensor(&img);

        assert_eq!(t.dim(), (2, 3, 3));
        assert_eq!(t[[1, 2, 0]], 1.0);
        assert_eq!(t[[1, 2, 2]], 3.0);
    }

    #[test]
    fn default_config_matches_model_constants() {
        let config = PipelineConfig::default();
        assert_eq!(config.input_size, 384);
        assert_eq!(config.scale_factor, 2);
        assert_eq!(config.min_dimension, 64);
        assert_eq!(config.grids, vec![16, 8]);
    }
}
