// Upstream relay plumbing
//
// Shared helpers for sending upstream requests and streaming response
// bodies back to the client.

use std::collections::HashMap;

use axum::body::Body;
use bytes::Bytes;
use streamgate_core::{Error, Result};
use tokio_stream::wrappers::ReceiverStream;

/// Upstream response headers copied through to the client.
pub const PERMITTED_RESPONSE_HEADERS: [&str; 6] = [
    "content-type",
    "content-length",
    "content-range",
    "accept-ranges",
    "last-modified",
    "etag",
];

/// Issue a GET with the prepared header set. Non-success statuses become
/// `Error::Upstream` carrying the verbatim body for relay.
pub async fn get_checked(
    client: &reqwest::Client,
    url: &str,
    headers: &HashMap<String, String>,
) -> Result<reqwest::Response> {
    let mut request = client.get(url);
    for (name, value) in headers {
        request = request.header(name.as_str(), value.as_str());
    }

    let response = request.send().await?;
    let status = response.status();
    if status.as_u16() != 200 && status.as_u16() != 206 {
        let content_type = response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response.bytes().await.unwrap_or_default();
        tracing::warn!("Upstream returned {status} for {url}");
        return Err(Error::Upstream {
            status: status.as_u16(),
            content_type,
            body,
        });
    }
    Ok(response)
}

/// Stream an upstream body to the client chunk by chunk. A failing send
/// means the client went away: logged at info level, upstream read aborted.
/// Prefetch tasks are unaffected — they run detached.
pub fn streaming_body(mut upstream: reqwest::Response, url: String) -> Body {
    let (tx, rx) = tokio::sync::mpsc::channel::<std::io::Result<Bytes>>(8);

    tokio::spawn(async move {
        loop {
            match upstream.chunk().await {
                Ok(Some(chunk)) => {
                    if tx.send(Ok(chunk)).await.is_err() {
                        tracing::info!("Client disconnected from stream: {url}");
                        break;
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    tracing::warn!("Connection lost with source: {url} ({err})");
                    let _ = tx
                        .send(Err(std::io::Error::other(err.to_string())))
                        .await;
                    break;
                }
            }
        }
    });

    Body::from_stream(ReceiverStream::new(rx))
}

/// Copy the permitted upstream header subset, forcing `video/MP2T` when the
/// path denotes an MPEG-TS segment the origin mislabeled.
pub fn copied_response_headers(
    response: &reqwest::Response,
    force_ts: bool,
) -> Vec<(String, String)> {
    let mut headers = Vec::new();
    for name in PERMITTED_RESPONSE_HEADERS {
        if let Some(value) = response.headers().get(name).and_then(|v| v.to_str().ok()) {
            headers.push((name.to_string(), value.to_string()));
        }
    }

    if force_ts {
        let already_ts = headers
            .iter()
            .any(|(name, value)| name == "content-type" && value.to_lowercase().contains("video/mp2t"));
        if !already_ts {
            headers.retain(|(name, _)| name != "content-type");
            headers.push(("content-type".to_string(), "video/MP2T".to_string()));
        }
    }

    headers
}
