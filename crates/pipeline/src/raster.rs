//! Normalisation, rasterisation and PNG encoding of the decoded tensor.

use std::io::Cursor;

use image::{ImageFormat, Rgba, RgbaImage};
use lazyscale_core::geometry::Dimensions;
use lazyscale_core::locator::{decode_data_uri, PNG_MIME};
use ndarray::{Array3, ArrayView3};

use crate::error::PipelineError;

/// Contrast curve applied after remapping to `[0, 1]`.
pub const DEFAULT_GAMMA: f32 = 0.8;

/// Value range of the enhanced tensor before clipping.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RasterStats {
    pub min: f32,
    pub max: f32,
}

/// Remap `[-1, 1]` to `[0, 1]`, apply `gamma`, clip.
pub fn normalise(enhanced: ArrayView3<'_, f32>, gamma: f32) -> (Array3<f32>, RasterStats) {
    let mut out = enhanced.mapv(|v| ((v + 1.0) * 0.5).max(0.0).powf(gamma));

    let stats = out.iter().fold(
        RasterStats {
            min: f32::INFINITY,
            max: f32::NEG_INFINITY,
        },
        |acc, v| RasterStats {
            min: acc.min.min(*v),
            max: acc.max.max(*v),
        },
    );
    tracing::debug!(min = stats.min, max = stats.max, "Enhanced tensor range");

    out.mapv_inplace(|v| v.clamp(0.0, 1.0));
    (out, stats)
}

/// Scale a `[0, 1]` RGB tensor to an opaque RGBA buffer.
pub fn to_rgba(normalised: ArrayView3<'_, f32>) -> Result<RgbaImage, PipelineError> {
    let (h, w, c) = normalised.dim();
    if c != 3 {
        return Err(PipelineError::Shape(format!(
            "expected 3 output channels, got {c}"
        )));
    }
    let (width, height) = (to_u32(w)?, to_u32(h)?);

    let mut img = RgbaImage::new(width, height);
    for (x, y, px) in img.enumerate_pixels_mut() {
        let (yy, xx) = (y as usize, x as usize);
        let channel = |ch: usize| (normalised[[yy, xx, ch]] * 255.0) as u8;
        *px = Rgba([channel(0), channel(1), channel(2), 255]);
    }
    Ok(img)
}

fn to_u32(v: usize) -> Result<u32, PipelineError> {
    u32::try_from(v).map_err(|_| PipelineError::Context(format!("{v}px does not fit a surface")))
}

pub fn encode_png(img: &RgbaImage) -> Result<Vec<u8>, PipelineError> {
    let mut buf = Cursor::new(Vec::new());
    img.write_to(&mut buf, ImageFormat::Png)?;
    Ok(buf.into_inner())
}

/// Decode an encoded result back to confirm it is displayable, returning
/// its dimensions.
pub fn verify_encoded(data_uri: &str) -> Result<Dimensions, PipelineError> {
    let uri = decode_data_uri(data_uri).map_err(|e| PipelineError::Unclassified(e.to_string()))?;
    if uri.mime != PNG_MIME {
        return Err(PipelineError::Unclassified(format!(
            "unexpected result type {}",
            uri.mime
        )));
    }
    let img = image::load_from_memory_with_format(&uri.bytes, ImageFormat::Png)?;
    Ok(Dimensions::new(img.width(), img.height()))
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use lazyscale_core::locator::png_data_uri;
    use ndarray::Array;

    use super::*;

    #[test]
    fn normalise_maps_bounds_and_clips() {
        let input = Array::from_shape_vec((1, 1, 3), vec![-1.0, 1.0, 3.0]).unwrap();
        let (out, stats) = normalise(input.view(), DEFAULT_GAMMA);

        assert_eq!(out[[0, 0, 0]], 0.0);
        assert_eq!(out[[0, 0, 1]], 1.0);
        assert_eq!(out[[0, 0, 2]], 1.0, "values above range are clipped");
        assert!(stats.max > 1.0, "stats are taken before clipping");
        assert_eq!(stats.min, 0.0);
    }

    #[test]
    fn gamma_brightens_midtones() {
        let input = Array::from_shape_vec((1, 1, 3), vec![0.0, 0.0, 0.0]).unwrap();
        let (out, _) = normalise(input.view(), DEFAULT_GAMMA);
        let expected = 0.5f32.powf(0.8);
        assert!((out[[0, 0, 0]] - expected).abs() < 1e-6);
        assert!(out[[0, 0, 0]] > 0.5);
    }

    #[test]
    fn to_rgba_truncates_and_is_opaque() {
        let input = Array::from_shape_vec((1, 2, 3), vec![0.0, 0.5, 1.0, 0.999, 0.0, 0.1]).unwrap();
        let img = to_rgba(input.view()).unwrap();

        assert_eq!(img.dimensions(), (2, 1));
        assert_eq!(img.get_pixel(0, 0), &Rgba([0, 127, 255, 255]));
        assert_eq!(img.get_pixel(1, 0), &Rgba([254, 0, 25, 255]));
    }

    #[test]
    fn to_rgba_requires_three_channels() {
        let input = Array3::<f32>::zeros((2, 2, 4));
        assert_matches!(to_rgba(input.view()), Err(PipelineError::Shape(_)));
    }

    #[test]
    fn encoded_result_verifies() {
        let img = RgbaImage::from_pixel(6, 4, Rgba([1, 2, 3, 255]));
        let uri = png_data_uri(&encode_png(&img).unwrap());

        assert_eq!(verify_encoded(&uri).unwrap(), Dimensions::new(6, 4));
    }

    #[test]
    fn corrupt_result_fails_verification() {
        let uri = png_data_uri(b"definitely not a png");
        assert_matches!(verify_encoded(&uri), Err(PipelineError::Decode(_)));
    }
}
