//! Image upscale pipeline.
//!
//! [`Upscaler::upscale`] runs the fixed stage sequence for one source:
//!
//! 1. acquire pixels on an isolated surface (with one CORS-relay retry),
//! 2. extract an `H x W x 3` tensor,
//! 3. fit it inside the model input bound (bilinear),
//! 4. extract features with the shared [`FeatureExtractor`],
//! 5. reshape the embedding onto a spatial grid,
//! 6. decode progressively ([`ProgressiveDecoder`]),
//! 7. resize to `fitted * scale_factor`,
//! 8. normalise, rasterise and PNG-encode.
//!
//! Every intermediate tensor is tracked by a [`BufferTracker`] scope and
//! released before the job settles.

pub mod acquire;
pub mod decoder;
pub mod error;
pub mod loader;
pub mod model;
pub mod ops;
pub mod raster;
pub mod reshape;
pub mod tensor;
pub mod upscaler;

pub use acquire::{Canvas, LoadMode, SourceImage, SourceLoader};
pub use decoder::{DecoderWeights, ProgressiveDecoder};
pub use error::{ErrorKind, PipelineError};
pub use loader::{DefaultLoader, MemoryLoader};
pub use model::{FeatureExtractor, PatchEmbedder};
pub use tensor::{BufferTracker, Tensor};
pub use upscaler::{PipelineConfig, UpscaleOutput, Upscaler};
