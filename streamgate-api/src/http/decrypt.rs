// Server-side CENC decryption endpoint
//
// `/decrypt/segment.mp4` drives the segment pipeline: cache probe, parallel
// init+media fetch, off-thread ClearKey decrypt, remux-to-TS with raw-fMP4
// fallback, and background prefetch of the successors.

use std::collections::HashMap;

use axum::{
    body::Body,
    extract::{Query, State},
    http::HeaderMap,
    response::{IntoResponse, Response},
};

use streamgate_proxy::segment::DecryptJob;

use super::auth;
use super::error::{AppError, AppResult};
use super::headers;
use super::AppState;

pub async fn decrypt_segment(
    State(state): State<AppState>,
    Query(query): Query<HashMap<String, String>>,
    request_headers: HeaderMap,
) -> AppResult<Response> {
    auth::check_password(&state.config, &query, &request_headers)?;

    let url = query
        .get("url")
        .filter(|v| !v.is_empty())
        .ok_or_else(|| AppError::bad_request("Missing url, key, or key_id"))?;
    let key = query
        .get("key")
        .filter(|v| !v.is_empty())
        .ok_or_else(|| AppError::bad_request("Missing url, key, or key_id"))?;
    let key_id = query
        .get("key_id")
        .filter(|v| !v.is_empty())
        .ok_or_else(|| AppError::bad_request("Missing url, key, or key_id"))?;

    tracing::info!(
        "Decrypt request: {}",
        url.rsplit('/').next().unwrap_or("segment")
    );

    let mut upstream_headers = headers::h_params(&query, true);
    upstream_headers.insert("Accept-Encoding".to_string(), "identity".to_string());
    headers::sanitize_upstream_headers(&mut upstream_headers);

    let job = DecryptJob {
        url: url.clone(),
        init_url: query.get("init_url").filter(|v| !v.is_empty()).cloned(),
        key_id: key_id.clone(),
        key: key.clone(),
        skip_decrypt: query.get("skip_decrypt").map(String::as_str) == Some("1"),
        headers: upstream_headers,
    };

    let served = state.segments.serve_decrypted(job).await?;

    Ok(Response::builder()
        .header("Content-Type", served.content_type)
        .header("Access-Control-Allow-Origin", "*")
        .header("Cache-Control", "no-cache")
        .body(Body::from(served.bytes))
        .unwrap_or_else(|_| ().into_response()))
}
