//! Source acquisition: load, draw onto an isolated surface, read back.
//!
//! Read-back from a surface that has had cross-origin pixels drawn onto it
//! fails. [`acquire`] then re-fetches the same source once through the
//! CORS relay and redraws; a second failure is fatal for the job.

use async_trait::async_trait;
use image::imageops::FilterType;
use image::RgbaImage;
use lazyscale_core::geometry::{validate_source_dimensions, Dimensions, MAX_SURFACE_DIMENSION};
use lazyscale_core::locator::relay_url;

use crate::error::PipelineError;

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

/// A decoded source raster plus its origin-cleanliness.
#[derive(Debug, Clone)]
pub struct SourceImage {
    pub pixels: RgbaImage,
    /// `false` when the pixels came from another origin without CORS
    /// approval. Drawing them taints the surface.
    pub cross_origin_clean: bool,
}

impl SourceImage {
    pub fn natural_dimensions(&self) -> Dimensions {
        Dimensions::new(self.pixels.width(), self.pixels.height())
    }
}

/// How a source is requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadMode {
    /// Plain load, as the document itself displays the image.
    Direct,
    /// CORS-mode request; the response is clean only if the server allows
    /// the document's origin.
    Anonymous,
}

/// Resolves a locator to pixels. Implementations await the load, so a
/// not-yet-loaded source simply takes longer.
#[async_trait]
pub trait SourceLoader: Send + Sync {
    async fn load(&self, locator: &str, mode: LoadMode) -> Result<SourceImage, PipelineError>;
}

// ---------------------------------------------------------------------------
// Canvas
// ---------------------------------------------------------------------------

/// Off-screen RGBA drawing surface.
#[derive(Debug)]
pub struct Canvas {
    surface: RgbaImage,
    smoothing: bool,
    tainted: bool,
}

impl Canvas {
    /// Allocate a surface. Zero or oversized sides have no context.
    pub fn new(width: u32, height: u32) -> Result<Self, PipelineError> {
        if width == 0 || height == 0 {
            return Err(PipelineError::Context(format!(
                "cannot create a {width}x{height} surface"
            )));
        }
        if width > MAX_SURFACE_DIMENSION || height > MAX_SURFACE_DIMENSION {
            return Err(PipelineError::Context(format!(
                "{width}x{height} exceeds the {MAX_SURFACE_DIMENSION}px surface limit"
            )));
        }
        Ok(Self {
            surface: RgbaImage::new(width, height),
            smoothing: false,
            tainted: false,
        })
    }

    pub fn set_image_smoothing(&mut self, enabled: bool) {
        self.smoothing = enabled;
    }

    pub fn dimensions(&self) -> Dimensions {
        Dimensions::new(self.surface.width(), self.surface.height())
    }

    pub fn is_tainted(&self) -> bool {
        self.tainted
    }

    /// Draw `source` stretched over the whole surface.
    pub fn draw_image(&mut self, source: &SourceImage) {
        let (w, h) = (self.surface.width(), self.surface.height());
        self.surface = if source.pixels.dimensions() == (w, h) {
            source.pixels.clone()
        } else {
            let filter = if self.smoothing {
                FilterType::CatmullRom
            } else {
                FilterType::Nearest
            };
            image::imageops::resize(&source.pixels, w, h, filter)
        };
        if !source.cross_origin_clean {
            self.tainted = true;
        }
    }

    /// Read the surface back. Fails once anything cross-origin was drawn.
    pub fn read_pixels(&self) -> Result<&RgbaImage, PipelineError> {
        if self.tainted {
            return Err(PipelineError::Tainted(
                "the surface has been tainted by cross-origin data".to_string(),
            ));
        }
        Ok(&self.surface)
    }

    pub fn into_pixels(self) -> Result<RgbaImage, PipelineError> {
        self.read_pixels()?;
        Ok(self.surface)
    }
}

// ---------------------------------------------------------------------------
// Acquisition stage
// ---------------------------------------------------------------------------

/// Load `locator` and copy it onto an isolated surface at natural size.
///
/// On a tainted read-back the source is fetched once more through
/// `relay_endpoint` in CORS mode.
pub async fn acquire(
    loader: &dyn SourceLoader,
    locator: &str,
    relay_endpoint: &str,
    min_dimension: u32,
) -> Result<RgbaImage, PipelineError> {
    let source = loader.load(locator, LoadMode::Direct).await?;
    match draw_isolated(&source, min_dimension) {
        Err(PipelineError::Tainted(reason)) => {
            let relayed = relay_url(relay_endpoint, locator);
            tracing::info!(locator, relay = %relayed, reason = %reason, "Retrying through CORS relay");
            let source = loader
                .load(&relayed, LoadMode::Anonymous)
                .await
                .map_err(|e| PipelineError::Acquisition(format!("relay fetch failed: {e}")))?;
            draw_isolated(&source, min_dimension).map_err(|e| match e {
                PipelineError::Tainted(r) => {
                    PipelineError::Acquisition(format!("still tainted after relay: {r}"))
                }
                other => other,
            })
        }
        other => other,
    }
}

fn draw_isolated(source: &SourceImage, min_dimension: u32) -> Result<RgbaImage, PipelineError> {
    let natural = source.natural_dimensions();
    validate_source_dimensions(natural.width, natural.height, min_dimension)
        .map_err(|e| PipelineError::Acquisition(e.to_string()))?;

    let mut canvas = Canvas::new(natural.width, natural.height)?;
    canvas.set_image_smoothing(true);
    canvas.draw_image(source);
    canvas.into_pixels()
}
