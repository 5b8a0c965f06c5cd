#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Malformed data URI: {0}")]
    MalformedDataUri(String),

    #[error("Internal error: {0}")]
    Internal(String),
}
