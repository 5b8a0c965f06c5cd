//! Pipeline failure taxonomy.
//!
//! Every stage error is one of these variants. The [`Upscaler`](crate::Upscaler)
//! boundary collapses them into a single "no result" outcome; [`ErrorKind`]
//! is what gets logged.

use lazyscale_core::error::CoreError;

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// The source (or its relay copy) could not be loaded.
    #[error("Failed to load image: {0}")]
    Acquisition(String),

    /// Pixel read-back was refused because the surface holds cross-origin data.
    #[error("Canvas is tainted by cross-origin data: {0}")]
    Tainted(String),

    /// The embedding has no valid spatial layout.
    #[error("Invalid embedding shape: {0}")]
    Shape(String),

    /// No drawing surface could be obtained.
    #[error("Could not obtain a drawing surface: {0}")]
    Context(String),

    /// Encoding, or decoding the encoded result back, failed.
    #[error("Image codec error: {0}")]
    Decode(#[from] image::ImageError),

    #[error("Pipeline stage failed: {0}")]
    Unclassified(String),
}

/// Coarse classification used in logs and failure events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Acquisition,
    Shape,
    Context,
    Unclassified,
}

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::Acquisition(_) | PipelineError::Tainted(_) => ErrorKind::Acquisition,
            PipelineError::Shape(_) => ErrorKind::Shape,
            PipelineError::Context(_) => ErrorKind::Context,
            PipelineError::Decode(_) | PipelineError::Unclassified(_) => ErrorKind::Unclassified,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorKind::Acquisition => "acquisition",
            ErrorKind::Shape => "shape",
            ErrorKind::Context => "context",
            ErrorKind::Unclassified => "unclassified",
        };
        f.write_str(name)
    }
}

impl From<CoreError> for PipelineError {
    fn from(e: CoreError) -> Self {
        PipelineError::Unclassified(e.to_string())
    }
}

impl From<ndarray::ShapeError> for PipelineError {
    fn from(e: ndarray::ShapeError) -> Self {
        PipelineError::Shape(e.to_string())
    }
}
