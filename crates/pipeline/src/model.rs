//! Feature-extraction model handle.
//!
//! The pipeline only needs "pixels in, embedding out". [`FeatureExtractor`]
//! is the seam where a real inference backend plugs in; [`PatchEmbedder`]
//! is the built-in model, a pooled colour/luma descriptor per grid cell.

use std::time::Instant;

use ndarray::{Array, Array3, ArrayD, ArrayView3, IxDyn};

use crate::error::PipelineError;
use crate::tensor::BufferTracker;

/// Side of the dummy input used to warm a freshly loaded model.
pub const WARM_UP_SIZE: usize = 64;

/// A pre-loaded, read-only model.
///
/// `infer` receives an `H x W x 3` tensor with values in `0..=255` and
/// returns either a flattened `[1, N]` embedding or a spatial
/// `[1, H, W, C]` one.
pub trait FeatureExtractor: Send + Sync {
    fn name(&self) -> &str;

    fn infer(&self, input: ArrayView3<'_, f32>) -> Result<ArrayD<f32>, PipelineError>;
}

/// Output layout of [`PatchEmbedder`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbeddingLayout {
    /// `[1, grid * grid * 4]`
    Flat,
    /// `[1, grid, grid, 4]`
    Spatial,
}

/// Mean R, G, B and luma over each cell of a `grid x grid` partition.
#[derive(Debug, Clone)]
pub struct PatchEmbedder {
    grid: usize,
    layout: EmbeddingLayout,
}

/// Channels per cell: R, G, B, luma.
pub const PATCH_CHANNELS: usize = 4;

impl PatchEmbedder {
    pub fn new(grid: usize) -> Self {
        Self {
            grid,
            layout: EmbeddingLayout::Flat,
        }
    }

    pub fn spatial(grid: usize) -> Self {
        Self {
            grid,
            layout: EmbeddingLayout::Spatial,
        }
    }

    pub fn grid(&self) -> usize {
        self.grid
    }

    fn pool(&self, input: ArrayView3<'_, f32>) -> Result<Array3<f32>, PipelineError> {
        let (h, w, c) = input.dim();
        if c < 3 {
            return Err(PipelineError::Shape(format!(
                "model expects 3 colour channels, got {c}"
            )));
        }
        if h == 0 || w == 0 || self.grid == 0 {
            return Err(PipelineError::Shape(format!(
                "cannot pool a {h}x{w} input into a {}-cell grid",
                self.grid
            )));
        }

        let g = self.grid;
        let mut out = Array3::<f32>::zeros((g, g, PATCH_CHANNELS));
        for cy in 0..g {
            let (y0, y1) = cell_bounds(cy, g, h);
            for cx in 0..g {
                let (x0, x1) = cell_bounds(cx, g, w);
                let mut sum = [0.0f32; 3];
                for y in y0..y1 {
                    for x in x0..x1 {
                        for (ch, acc) in sum.iter_mut().enumerate() {
                            *acc += input[[y, x, ch]];
                        }
                    }
                }
                let n = ((y1 - y0) * (x1 - x0)) as f32 * 255.0;
                let [r, gr, b] = sum.map(|s| s / n);
                out[[cy, cx, 0]] = r;
                out[[cy, cx, 1]] = gr;
                out[[cy, cx, 2]] = b;
                out[[cy, cx, 3]] = 0.299 * r + 0.587 * gr + 0.114 * b;
            }
        }
        Ok(out)
    }
}

/// Pixel range covered by cell `i` of `cells` along an axis of `len`.
/// Never empty, even when the axis is shorter than the grid.
fn cell_bounds(i: usize, cells: usize, len: usize) -> (usize, usize) {
    let start = (i * len / cells).min(len - 1);
    let end = ((i + 1) * len / cells).clamp(start + 1, len);
    (start, end)
}

impl FeatureExtractor for PatchEmbedder {
    fn name(&self) -> &str {
        "patch-embedder"
    }

    fn infer(&self, input: ArrayView3<'_, f32>) -> Result<ArrayD<f32>, PipelineError> {
        let pooled = self.pool(input)?;
        let g = self.grid;
        let shape = match self.layout {
            EmbeddingLayout::Flat => vec![1, g * g * PATCH_CHANNELS],
            EmbeddingLayout::Spatial => vec![1, g, g, PATCH_CHANNELS],
        };
        Ok(pooled.into_shape_with_order(IxDyn(&shape))?)
    }
}

/// Run one dummy forward pass so the first real job does not pay for
/// lazy initialisation. The output is dropped immediately.
pub fn warm_up(model: &dyn FeatureExtractor, tracker: &BufferTracker) -> Result<(), PipelineError> {
    let started = Instant::now();
    let input = tracker.track(Array::zeros((WARM_UP_SIZE, WARM_UP_SIZE, 3)));
    let output = tracker.track(model.infer(input.view())?);
    tracing::info!(
        model = model.name(),
        output_shape = ?output.shape(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Model warmed up",
    );
    Ok(())
}
