//! Locator helpers: CORS relay URLs and `data:` URIs.

use base64::Engine as _;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};

use crate::error::CoreError;

/// Public relay used when direct pixel read-back is blocked.
pub const DEFAULT_RELAY_ENDPOINT: &str = "https://api.allorigins.win/raw";

/// MIME type of every encoded result.
pub const PNG_MIME: &str = "image/png";

/// Characters left untouched when percent-encoding a URI component.
const URI_COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'!')
    .remove(b'~')
    .remove(b'*')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')');

/// Build `<relay-endpoint>?url=<percent-encoded locator>`.
pub fn relay_url(endpoint: &str, locator: &str) -> String {
    format!(
        "{endpoint}?url={}",
        utf8_percent_encode(locator, URI_COMPONENT)
    )
}

/// True when the locator carries its payload inline.
pub fn is_data_uri(locator: &str) -> bool {
    locator.starts_with("data:")
}

/// Encode PNG bytes as a `data:image/png;base64,...` URI.
pub fn png_data_uri(png: &[u8]) -> String {
    format!(
        "data:{PNG_MIME};base64,{}",
        base64::engine::general_purpose::STANDARD.encode(png)
    )
}

/// A decoded `data:` URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataUri {
    pub mime: String,
    pub bytes: Vec<u8>,
}

/// Decode a base64 `data:` URI into its MIME type and payload.
pub fn decode_data_uri(uri: &str) -> Result<DataUri, CoreError> {
    let rest = uri
        .strip_prefix("data:")
        .ok_or_else(|| CoreError::MalformedDataUri("missing 'data:' scheme".to_string()))?;
    let (header, payload) = rest
        .split_once(',')
        .ok_or_else(|| CoreError::MalformedDataUri("missing ',' separator".to_string()))?;
    let mime = header
        .strip_suffix(";base64")
        .ok_or_else(|| CoreError::MalformedDataUri("only base64 payloads are supported".into()))?;

    let bytes = base64::engine::general_purpose::STANDARD
        .decode(payload)
        .map_err(|e| CoreError::MalformedDataUri(e.to_string()))?;

    Ok(DataUri {
        mime: mime.to_string(),
        bytes,
    })
}
