//! Raster dimension helpers: validation and aspect-preserving fits.

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/* --------------------------------------------------------------------------
Named constants
-------------------------------------------------------------------------- */

/// Default square bound of the feature-extraction model input.
pub const DEFAULT_INPUT_SIZE: u32 = 384;

/// Default integer upscale factor applied after decoding.
pub const DEFAULT_SCALE_FACTOR: u32 = 2;

/// Sources smaller than this on either side are not worth enhancing.
pub const DEFAULT_MIN_DIMENSION: u32 = 64;

/// Largest off-screen surface we are willing to allocate.
pub const MAX_SURFACE_DIMENSION: u32 = 16_384;

/// Width and height of a raster, in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
}

impl Dimensions {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Multiply both sides by an integer factor.
    pub fn scaled(self, factor: u32) -> Result<Self, CoreError> {
        match (self.width.checked_mul(factor), self.height.checked_mul(factor)) {
            (Some(width), Some(height)) => Ok(Self { width, height }),
            _ => Err(CoreError::Validation(format!(
                "{}x{} scaled by {factor} overflows",
                self.width, self.height
            ))),
        }
    }

    pub fn area(self) -> u64 {
        u64::from(self.width) * u64::from(self.height)
    }
}

/* --------------------------------------------------------------------------
Validation functions
-------------------------------------------------------------------------- */

/// Validate natural dimensions of a loaded source.
///
/// Zero sides mean the image never finished loading; anything under
/// `min_dimension` is rejected as too small to enhance. Oversized sources
/// pass here and fail when a surface is requested for them.
pub fn validate_source_dimensions(
    width: u32,
    height: u32,
    min_dimension: u32,
) -> Result<(), CoreError> {
    if width == 0 || height == 0 {
        return Err(CoreError::Validation(
            "Image has no valid dimensions after load".to_string(),
        ));
    }
    if width < min_dimension || height < min_dimension {
        return Err(CoreError::Validation(format!(
            "Image is smaller than {min_dimension}px (got {width}x{height})"
        )));
    }
    Ok(())
}

/// Fit `width x height` inside a square `bound`, preserving aspect ratio.
///
/// The longer side maps exactly onto `bound`; the shorter side scales
/// proportionally and is rounded to the nearest integer (never below 1).
pub fn fit_within(width: u32, height: u32, bound: u32) -> Result<Dimensions, CoreError> {
    if width == 0 || height == 0 {
        return Err(CoreError::Validation(
            "Cannot fit a raster with a zero side".to_string(),
        ));
    }
    if bound == 0 {
        return Err(CoreError::Validation(
            "Fit bound must be greater than 0".to_string(),
        ));
    }

    let aspect = f64::from(width) / f64::from(height);
    let (fit_width, fit_height) = if aspect > 1.0 {
        (bound, (f64::from(bound) / aspect).round() as u32)
    } else {
        ((f64::from(bound) * aspect).round() as u32, bound)
    };

    Ok(Dimensions {
        width: fit_width.max(1),
        height: fit_height.max(1),
    })
}

/* --------------------------------------------------------------------------
Tests
-------------------------------------------------------------------------- */

#[cfg(test)]
mod tests {
    use super::*;

    // -- fit_within --

    #[test]
    fn landscape_pins_width_to_bound() {
        let fit = fit_within(800, 400, 384).unwrap();
        assert_eq!(fit, Dimensions::new(384, 192));
    }

    #[test]
    fn portrait_pins_height_to_bound() {
        let fit = fit_within(300, 600, 384).unwrap();
        assert_eq!(fit, Dimensions::new(192, 384));
    }

    #[test]
    fn square_fills_bound() {
        let fit = fit_within(1000, 1000, 384).unwrap();
        assert_eq!(fit, Dimensions::new(384, 384));
    }

    #[test]
    fn shorter_side_rounds_to_nearest() {
        // 384 / (1000 / 333) = 127.87...
        let fit = fit_within(1000, 333, 384).unwrap();
        assert_eq!(fit, Dimensions::new(384, 128));
    }

    #[test]
    fn small_sources_are_scaled_up_to_bound() {
        let fit = fit_within(100, 50, 384).unwrap();
        assert_eq!(fit, Dimensions::new(384, 192));
    }

    #[test]
    fn extreme_aspect_never_collapses_to_zero() {
        let fit = fit_within(10_000, 1, 384).unwrap();
        assert_eq!(fit.height, 1);
    }

    #[test]
    fn zero_side_rejected() {
        assert!(fit_within(0, 100, 384).is_err());
        assert!(fit_within(100, 100, 0).is_err());
    }

    // -- validate_source_dimensions --

    #[test]
    fn valid_source_accepted() {
        assert!(validate_source_dimensions(640, 480, DEFAULT_MIN_DIMENSION).is_ok());
        assert!(validate_source_dimensions(64, 64, DEFAULT_MIN_DIMENSION).is_ok());
    }

    #[test]
    fn unloaded_source_rejected() {
        let msg = validate_source_dimensions(0, 0, DEFAULT_MIN_DIMENSION)
            .unwrap_err()
            .to_string();
        assert!(msg.contains("no valid dimensions"));
    }

    #[test]
    fn tiny_source_rejected() {
        assert!(validate_source_dimensions(32, 640, DEFAULT_MIN_DIMENSION).is_err());
    }

    // -- Dimensions --

    #[test]
    fn scaled_multiplies_both_sides() {
        assert_eq!(
            Dimensions::new(384, 192).scaled(DEFAULT_SCALE_FACTOR).unwrap(),
            Dimensions::new(768, 384)
        );
    }

    #[test]
    fn scaled_overflow_is_an_error() {
        let err = Dimensions::new(384, 192).scaled(u32::MAX).unwrap_err();
        assert!(err.to_string().contains("overflows"));
    }
}
