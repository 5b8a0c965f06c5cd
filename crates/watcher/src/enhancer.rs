//! Seam between the watcher and whatever produces enhanced images.

use async_trait::async_trait;
use lazyscale_pipeline::Upscaler;

/// A finished enhancement, ready to be swapped in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Enhanced {
    /// `data:image/png;base64,...`
    pub data_uri: String,
    pub width: u32,
    pub height: u32,
}

/// Produces an enhanced image for a locator, or `None` on any failure.
///
/// Implementations log their own failures; the watcher only needs to know
/// whether there is something to swap in.
#[async_trait]
pub trait Enhancer: Send + Sync {
    async fn enhance(&self, locator: &str) -> Option<Enhanced>;
}

#[async_trait]
impl Enhancer for Upscaler {
    async fn enhance(&self, locator: &str) -> Option<Enhanced> {
        let output = self.upscale_or_none(locator).await?;
        Some(Enhanced {
            data_uri: output.data_uri,
            width: output.dimensions.width,
            height: output.dimensions.height,
        })
    }
}
