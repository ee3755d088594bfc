// HTTP error handling

use axum::{
    body::Body,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::fmt;

use streamgate_core::extractor::ExtractorError;
use streamgate_core::Error;

/// Result type for HTTP handlers
pub type AppResult<T> = Result<T, AppError>;

/// Application error carrying the HTTP status it maps to.
#[derive(Debug)]
pub enum AppError {
    Status { status: StatusCode, message: String },
    /// Upstream response relayed verbatim to aid client diagnosis.
    UpstreamRelay {
        status: StatusCode,
        content_type: Option<String>,
        body: bytes::Bytes,
    },
}

impl AppError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self::Status {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn bad_gateway(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_GATEWAY, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }

    pub fn service_unavailable(message: impl Into<String>) -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, message)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Status { status, message } => write!(f, "{status}: {message}"),
            Self::UpstreamRelay { status, .. } => write!(f, "upstream relay {status}"),
        }
    }
}

impl std::error::Error for AppError {}

/// Error response JSON structure
#[derive(Debug, Serialize, Deserialize)]
struct ErrorResponse {
    error: String,
    status: u16,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            Self::Status { status, message } => {
                let body = Json(ErrorResponse {
                    error: message,
                    status: status.as_u16(),
                });
                (status, body).into_response()
            }
            Self::UpstreamRelay {
                status,
                content_type,
                body,
            } => {
                let mut builder = Response::builder()
                    .status(status)
                    .header("Access-Control-Allow-Origin", "*");
                if let Some(content_type) = content_type {
                    builder = builder.header("Content-Type", content_type);
                }
                builder
                    .body(Body::from(body))
                    .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
            }
        }
    }
}

/// Client closed the connection before the response completed.
pub const STATUS_CLIENT_CLOSED: u16 = 499;

impl From<Error> for AppError {
    fn from(err: Error) -> Self {
        match err {
            Error::Unauthorized => Self::unauthorized("Unauthorized: Invalid API Password"),
            Error::BadRequest(msg) => Self::bad_request(msg),
            Error::NotFound(msg) => Self::not_found(msg),
            Error::Extraction(msg) => {
                if Error::is_transient_message(&msg) {
                    tracing::warn!("Service temporarily unavailable: {msg}");
                    Self::service_unavailable(format!("Service temporarily unavailable: {msg}"))
                } else {
                    tracing::error!("Extraction error: {msg}");
                    Self::internal(format!("Extraction failed: {msg}"))
                }
            }
            Error::TransientUpstream(msg) => {
                tracing::warn!("Service temporarily unavailable: {msg}");
                Self::service_unavailable(format!("Service temporarily unavailable: {msg}"))
            }
            Error::Upstream {
                status,
                content_type,
                body,
            } => Self::UpstreamRelay {
                status: StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY),
                content_type,
                body,
            },
            Error::DownloadTimeout(msg) => Self::new(StatusCode::REQUEST_TIMEOUT, msg),
            Error::UpstreamConnection(msg) => {
                tracing::warn!("Upstream connection failed: {msg}");
                Self::bad_gateway(format!("Upstream connection lost: {msg}"))
            }
            Error::Decrypt(msg) => {
                tracing::error!("Decryption error: {msg}");
                Self::internal(format!("Decryption failed: {msg}"))
            }
            Error::ClientDisconnected => {
                tracing::info!("Client disconnected");
                Self::new(
                    StatusCode::from_u16(STATUS_CLIENT_CLOSED)
                        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
                    "Client disconnected",
                )
            }
            Error::Internal(msg) => {
                tracing::error!("Internal error: {msg}");
                Self::internal(msg)
            }
        }
    }
}

impl From<ExtractorError> for AppError {
    fn from(err: ExtractorError) -> Self {
        if err.is_transient() {
            tracing::warn!("Extractor unavailable: {err}");
            Self::service_unavailable(format!("Service temporarily unavailable: {err}"))
        } else {
            tracing::error!("Extractor error: {err}");
            Self::internal(err.to_string())
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        tracing::error!("Unhandled error: {err}");
        Self::internal("Internal server error")
    }
}
