//! JSON description of the document a run processes.
//!
//! ```json
//! {
//!   "origin": "https://gallery.example",
//!   "viewport": { "width": 1280, "height": 800 },
//!   "images": [
//!     { "src": "photos/a.jpg", "alt": "A",
//!       "attributes": { "data-upscale": "true" },
//!       "rect": { "x": 0, "y": 0, "width": 640, "height": 480 } }
//!   ]
//! }
//! ```

use std::path::{Path, PathBuf};

use lazyscale_watcher::{Document, ImageElement, Viewport};
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("Failed to read manifest {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid manifest {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ViewportSize {
    pub width: f64,
    pub height: f64,
}

impl Default for ViewportSize {
    fn default() -> Self {
        Self {
            width: 1280.0,
            height: 800.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    /// Origin the document is served from; drives the cross-origin check
    /// for http(s) sources.
    #[serde(default)]
    pub origin: Option<String>,
    #[serde(default)]
    pub viewport: ViewportSize,
    /// Directory relative sources resolve against. Defaults to the
    /// manifest's own directory.
    #[serde(default)]
    pub base_dir: Option<PathBuf>,
    pub images: Vec<ImageElement>,
}

impl Manifest {
    pub async fn load(path: &Path) -> Result<Self, ManifestError> {
        let raw = tokio::fs::read(path).await.map_err(|source| ManifestError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut manifest: Manifest =
            serde_json::from_slice(&raw).map_err(|source| ManifestError::Parse {
                path: path.to_path_buf(),
                source,
            })?;

        let manifest_dir = path.parent().unwrap_or_else(|| Path::new("."));
        manifest.base_dir = Some(match manifest.base_dir.take() {
            Some(dir) if dir.is_relative() => manifest_dir.join(dir),
            Some(dir) => dir,
            None => manifest_dir.to_path_buf(),
        });
        Ok(manifest)
    }

    pub fn base_dir(&self) -> PathBuf {
        self.base_dir.clone().unwrap_or_else(|| PathBuf::from("."))
    }

    /// Number of images carrying the opt-in marker.
    pub fn eligible(&self) -> usize {
        self.images.iter().filter(|e| e.is_opted_in()).count()
    }

    /// Build the document with its viewport at the top.
    pub fn to_document(&self) -> Document {
        let document = Document::new(Viewport::new(self.viewport.width, self.viewport.height));
        document.insert_all(self.images.iter().cloned());
        document
    }
}
