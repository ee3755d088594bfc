// Extractor error types

/// Extractor-specific errors
#[derive(Debug, thiserror::Error)]
pub enum ExtractorError {
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Extraction failed: {0}")]
    Failed(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Service temporarily unavailable: {0}")]
    Unavailable(String),

    #[error("No extractor registered for key: {0}")]
    UnknownKey(String),
}

impl ExtractorError {
    /// Temporary upstream conditions are reported as 503 and never logged
    /// with a backtrace.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Unavailable(_) => true,
            Self::Network(msg) | Self::Failed(msg) => crate::Error::is_transient_message(msg),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, ExtractorError>;
