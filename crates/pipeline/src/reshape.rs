//! Embedding to spatial grid.

use ndarray::{Array3, ArrayViewD, Axis, Ix3};

use crate::error::PipelineError;

/// Grid side tried first for flattened embeddings.
pub const PRIMARY_GRID: usize = 16;

/// Grid side used when the primary does not divide the embedding length.
pub const FALLBACK_GRID: usize = 8;

/// Bring an embedding into `grid x grid x channels` form.
///
/// A flattened `[1, N]` (or `[N]`) embedding is laid out on the first
/// grid in `grids` whose cell count divides `N`. A `[1, H, W, C]`
/// embedding is only validated: every axis must be non-empty and the
/// batch must be 1.
pub fn reshape_embedding(
    embedding: ArrayViewD<'_, f32>,
    grids: &[usize],
) -> Result<Array3<f32>, PipelineError> {
    match embedding.ndim() {
        1 | 2 => reshape_flat(embedding, grids),
        4 => validate_spatial(embedding),
        n => Err(PipelineError::Shape(format!(
            "expected a 2-D or 4-D embedding, got {n}-D {:?}",
            embedding.shape()
        ))),
    }
}

fn reshape_flat(
    embedding: ArrayViewD<'_, f32>,
    grids: &[usize],
) -> Result<Array3<f32>, PipelineError> {
    let shape = embedding.shape();
    if shape.len() == 2 && shape[0] != 1 {
        return Err(PipelineError::Shape(format!(
            "expected batch size 1, got {:?}",
            shape
        )));
    }
    let len = embedding.len();
    if len == 0 {
        return Err(PipelineError::Shape("embedding is empty".to_string()));
    }

    let grid = grids
        .iter()
        .copied()
        .find(|g| *g > 0 && len % (g * g) == 0)
        .ok_or_else(|| {
            PipelineError::Shape(format!(
                "embedding of length {len} fits none of the grids {grids:?}"
            ))
        })?;
    let channels = len / (grid * grid);

    tracing::debug!(len, grid, channels, "Reshaped flat embedding");
    let values: Vec<f32> = embedding.iter().copied().collect();
    Ok(Array3::from_shape_vec((grid, grid, channels), values)?)
}

fn validate_spatial(embedding: ArrayViewD<'_, f32>) -> Result<Array3<f32>, PipelineError> {
    let shape = embedding.shape();
    if shape.iter().any(|d| *d == 0) {
        return Err(PipelineError::Shape(format!(
            "spatial embedding has an empty axis: {shape:?}"
        )));
    }
    if shape[0] != 1 {
        return Err(PipelineError::Shape(format!(
            "expected batch size 1, got {shape:?}"
        )));
    }
    Ok(embedding
        .index_axis(Axis(0), 0)
        .to_owned()
        .into_dimensionality::<Ix3>()?)
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use ndarray::{Array, ArrayD, IxDyn};

    use super::*;

    const GRIDS: [usize; 2] = [PRIMARY_GRID, FALLBACK_GRID];

    fn flat(len: usize) -> ArrayD<f32> {
        Array::from_shape_fn(IxDyn(&[1, len]), |i| i[1] as f32)
    }

    #[test]
    fn primary_grid_used_when_it_divides() {
        let out = reshape_embedding(flat(16 * 16 * 4).view(), &GRIDS).unwrap();
        assert_eq!(out.dim(), (16, 16, 4));
        // Row-major: channel varies fastest.
        assert_eq!(out[[0, 1, 0]], 4.0);
        assert_eq!(out[[1, 0, 0]], 64.0);
    }

    #[test]
    fn falls_back_to_alternate_grid() {
        let out = reshape_embedding(flat(8 * 8 * 3).view(), &GRIDS).unwrap();
        assert_eq!(out.dim(), (8, 8, 3));
    }

    #[test]
    fn no_grid_fits_is_a_shape_error() {
        assert_matches!(
            reshape_embedding(flat(100).view(), &GRIDS),
            Err(PipelineError::Shape(msg)) if msg.contains("100")
        );
    }

    #[test]
    fn batched_flat_embedding_is_rejected() {
        let batched = ArrayD::<f32>::zeros(IxDyn(&[2, 256]));
        assert_matches!(
            reshape_embedding(batched.view(), &GRIDS),
            Err(PipelineError::Shape(_))
        );
    }

    #[test]
    fn spatial_embedding_passes_through() {
        let spatial = Array::from_shape_fn(IxDyn(&[1, 6, 5, 7]), |i| (i[1] + i[2] + i[3]) as f32);
        let out = reshape_embedding(spatial.view(), &GRIDS).unwrap();
        assert_eq!(out.dim(), (6, 5, 7));
        assert_eq!(out[[2, 3, 4]], 9.0);
    }

    #[test]
    fn spatial_embedding_with_zero_axis_is_rejected() {
        let spatial = ArrayD::<f32>::zeros(IxDyn(&[1, 4, 0, 8]));
        assert_matches!(
            reshape_embedding(spatial.view(), &GRIDS),
            Err(PipelineError::Shape(_))
        );
    }

    #[test]
    fn three_dimensional_embedding_is_rejected() {
        let odd = ArrayD::<f32>::zeros(IxDyn(&[1, 4, 4]));
        assert_matches!(reshape_embedding(odd.view(), &GRIDS), Err(PipelineError::Shape(_)));
    }
}
