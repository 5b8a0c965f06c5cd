//! [`SourceLoader`] implementations.
//!
//! - [`DefaultLoader`] resolves `data:` URIs in-process, `http(s)://` through
//!   `reqwest`, and anything else as a file path.
//! - [`MemoryLoader`] serves pre-registered rasters and records every
//!   request; used by tests and demos.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use image::RgbaImage;
use lazyscale_core::locator::{decode_data_uri, is_data_uri};
use reqwest::header::ACCESS_CONTROL_ALLOW_ORIGIN;
use reqwest::Url;

use crate::acquire::{LoadMode, SourceImage, SourceLoader};
use crate::error::PipelineError;

/// Upper bound on a single source fetch.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

// ---------------------------------------------------------------------------
// DefaultLoader
// ---------------------------------------------------------------------------

pub struct DefaultLoader {
    client: reqwest::Client,
    /// Serialized origin of the document, e.g. `https://example.com`.
    origin: Option<String>,
    base_dir: PathBuf,
}

impl DefaultLoader {
    /// `origin` decides which remote sources are same-origin; relative
    /// paths resolve against `base_dir`.
    pub fn new(origin: Option<String>, base_dir: impl Into<PathBuf>) -> Result<Self, PipelineError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| PipelineError::Context(format!("building HTTP client: {e}")))?;
        Ok(Self {
            client,
            origin: origin.map(|o| o.trim_end_matches('/').to_string()),
            base_dir: base_dir.into(),
        })
    }

    async fn fetch_http(&self, url: Url, mode: LoadMode) -> Result<SourceImage, PipelineError> {
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| PipelineError::Acquisition(format!("fetching {url}: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(PipelineError::Acquisition(format!(
                "fetching {url}: HTTP {}",
                status.as_u16()
            )));
        }

        let allow_origin = response
            .headers()
            .get(ACCESS_CONTROL_ALLOW_ORIGIN)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let same_origin = self
            .origin
            .as_deref()
            .is_some_and(|origin| url.origin().ascii_serialization() == origin);
        let cross_origin_clean = cors_clean(
            same_origin,
            mode,
            allow_origin.as_deref(),
            self.origin.as_deref(),
        )
        .ok_or_else(|| PipelineError::Acquisition(format!("CORS request to {url} was not allowed")))?;

        let bytes = response
            .bytes()
            .await
            .map_err(|e| PipelineError::Acquisition(format!("reading {url}: {e}")))?;
        Ok(SourceImage {
            pixels: decode(&bytes, url.as_str())?,
            cross_origin_clean,
        })
    }

    /// `file://` URLs keep their path; any other locator is document-relative,
    /// so a leading `/` means the root of `base_dir`.
    fn resolve_path(&self, locator: &str) -> PathBuf {
        match locator.strip_prefix("file://") {
            Some(path) => self.base_dir.join(path),
            None => self.base_dir.join(locator.trim_start_matches('/')),
        }
    }

    async fn read_file(&self, locator: &str) -> Result<SourceImage, PipelineError> {
        let path = self.resolve_path(locator);
        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|e| PipelineError::Acquisition(format!("reading {}: {e}", path.display())))?;
        Ok(SourceImage {
            pixels: decode(&bytes, locator)?,
            cross_origin_clean: true,
        })
    }
}

/// Whether a fetched response may be read back, or `None` when a CORS-mode
/// request must fail outright.
fn cors_clean(
    same_origin: bool,
    mode: LoadMode,
    allow_origin: Option<&str>,
    origin: Option<&str>,
) -> Option<bool> {
    if same_origin {
        return Some(true);
    }
    match mode {
        LoadMode::Direct => Some(false),
        LoadMode::Anonymous => match allow_origin {
            Some("*") => Some(true),
            Some(allowed) if Some(allowed) == origin => Some(true),
            _ => None,
        },
    }
}

fn decode(bytes: &[u8], locator: &str) -> Result<RgbaImage, PipelineError> {
    image::load_from_memory(bytes)
        .map(|img| img.to_rgba8())
        .map_err(|e| PipelineError::Acquisition(format!("decoding {locator}: {e}")))
}

#[async_trait]
impl SourceLoader for DefaultLoader {
    async fn load(&self, locator: &str, mode: LoadMode) -> Result<SourceImage, PipelineError> {
        if is_data_uri(locator) {
            let uri = decode_data_uri(locator)
                .map_err(|e| PipelineError::Acquisition(e.to_string()))?;
            return Ok(SourceImage {
                pixels: decode(&uri.bytes, "data URI")?,
                cross_origin_clean: true,
            });
        }

        if locator.starts_with("http://") || locator.starts_with("https://") {
            let url = Url::parse(locator)
                .map_err(|e| PipelineError::Acquisition(format!("invalid URL {locator}: {e}")))?;
            return self.fetch_http(url, mode).await;
        }

        self.read_file(locator).await
    }
}

// ---------------------------------------------------------------------------
// MemoryLoader
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum MemoryEntry {
    Image { pixels: RgbaImage, cross_origin: bool },
    Failing(String),
}

/// In-memory loader keyed by exact locator.
///
/// Cross-origin entries load tainted in [`LoadMode::Direct`] and are
/// refused in [`LoadMode::Anonymous`].
#[derive(Debug, Default)]
pub struct MemoryLoader {
    entries: Mutex<HashMap<String, MemoryEntry>>,
    requests: Mutex<Vec<(String, LoadMode)>>,
}

impl MemoryLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, locator: &str, pixels: RgbaImage) {
        self.put(
            locator,
            MemoryEntry::Image {
                pixels,
                cross_origin: false,
            },
        );
    }

    pub fn insert_cross_origin(&self, locator: &str, pixels: RgbaImage) {
        self.put(
            locator,
            MemoryEntry::Image {
                pixels,
                cross_origin: true,
            },
        );
    }

    /// Every load of `locator` fails with `reason`.
    pub fn insert_failing(&self, locator: &str, reason: &str) {
        self.put(locator, MemoryEntry::Failing(reason.to_string()));
    }

    /// Requests seen so far, in order.
    pub fn requests(&self) -> Vec<(String, LoadMode)> {
        self.requests
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    fn put(&self, locator: &str, entry: MemoryEntry) {
        self.entries
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(locator.to_string(), entry);
    }
}

#[async_trait]
impl SourceLoader for MemoryLoader {
    async fn load(&self, locator: &str, mode: LoadMode) -> Result<SourceImage, PipelineError> {
        self.requests
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push((locator.to_string(), mode));

        let entry = self
            .entries
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(locator)
            .cloned();

        match entry {
            None => Err(PipelineError::Acquisition(format!("no image at {locator}"))),
            Some(MemoryEntry::Failing(reason)) => Err(PipelineError::Acquisition(reason)),
            Some(MemoryEntry::Image { pixels, cross_origin }) => {
                let cross_origin_clean =
                    cors_clean(!cross_origin, mode, None, None).ok_or_else(|| {
                        PipelineError::Acquisition(format!(
                            "CORS request to {locator} was not allowed"
                        ))
                    })?;
                Ok(SourceImage {
                    pixels,
                    cross_origin_clean,
                })
            }
        }
    }
}
