use bytes::Bytes;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid or missing API password")]
    Unauthorized,

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Extraction failed: {0}")]
    Extraction(String),

    #[error("Service temporarily unavailable: {0}")]
    TransientUpstream(String),

    /// Non-2xx upstream response. The body is relayed verbatim to the client
    /// together with the upstream status to aid diagnosis.
    #[error("Upstream returned status {status}")]
    Upstream {
        status: u16,
        content_type: Option<String>,
        body: Bytes,
    },

    #[error("Upstream download timed out: {0}")]
    DownloadTimeout(String),

    #[error("Upstream connection failed: {0}")]
    UpstreamConnection(String),

    #[error("Decryption failed: {0}")]
    Decrypt(String),

    #[error("Client disconnected")]
    ClientDisconnected,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Recognize upstream failures that are temporary (origin offline,
    /// blocked by an intermediary) rather than bugs. These are reported as
    /// 503 and logged without a backtrace.
    #[must_use]
    pub fn is_transient_message(message: &str) -> bool {
        let lower = message.to_lowercase();
        ["403", "forbidden", "502", "bad gateway", "timeout", "connection", "temporarily unavailable"]
            .iter()
            .any(|token| lower.contains(token))
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::DownloadTimeout(err.to_string())
        } else {
            Self::UpstreamConnection(err.to_string())
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_message_recognition() {
        assert!(Error::is_transient_message("upstream returned 403 Forbidden"));
        assert!(Error::is_transient_message("502 Bad Gateway"));
        assert!(Error::is_transient_message("request timeout"));
        assert!(Error::is_transient_message("Connection refused"));
        assert!(Error::is_transient_message("service temporarily unavailable"));
        assert!(!Error::is_transient_message("missing key_id parameter"));
    }
}
