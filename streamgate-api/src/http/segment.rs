// Media segment relay
//
// `GET /segment/{name}?base_url=…` streams one segment from the origin with
// a forced `video/MP2T` content type and an attachment disposition.

use std::collections::HashMap;

use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::HeaderMap,
    response::{IntoResponse, Response},
};

use streamgate_core::extractor::generic::DEFAULT_USER_AGENT;

use super::auth;
use super::error::{AppError, AppResult};
use super::headers;
use super::relay;
use super::AppState;

/// Extensions marking `base_url` as a complete media URL rather than a
/// directory prefix.
const MEDIA_EXTENSIONS: [&str; 6] = [".mp4", ".m4s", ".ts", ".m4i", ".m4a", ".m4v"];

pub async fn serve_segment(
    State(state): State<AppState>,
    Path(segment_name): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    request_headers: HeaderMap,
) -> AppResult<Response> {
    auth::check_password(&state.config, &query, &request_headers)?;

    let base_url = query
        .get("base_url")
        .filter(|v| !v.is_empty())
        .ok_or_else(|| AppError::bad_request("Base URL missing for segment"))?;

    let segment_url = resolve_segment_url(base_url, &segment_name);
    tracing::info!("Proxying segment: {segment_name}");

    let mut upstream_headers = HashMap::new();
    upstream_headers.insert("User-Agent".to_string(), DEFAULT_USER_AGENT.to_string());
    upstream_headers.insert("Referer".to_string(), base_url.clone());
    for (name, value) in headers::h_params(&query, false) {
        upstream_headers.insert(name, value);
    }
    headers::forward_range_headers(&mut upstream_headers, &request_headers, &segment_url);
    headers::sanitize_upstream_headers(&mut upstream_headers);

    let client = state.pool.acquire(&segment_url);
    let response = relay::get_checked(&client, &segment_url, &upstream_headers).await?;

    let status = response.status();
    let mut builder = Response::builder().status(status.as_u16());
    for (name, value) in relay::copied_response_headers(&response, true) {
        if name == "content-type" {
            continue;
        }
        builder = builder.header(name, value);
    }
    builder = builder
        .header("Content-Type", "video/MP2T")
        .header(
            "Content-Disposition",
            format!("attachment; filename=\"{segment_name}\""),
        )
        .header("Access-Control-Allow-Origin", "*")
        .header("Access-Control-Allow-Methods", "GET, HEAD, OPTIONS")
        .header("Access-Control-Allow-Headers", "Range, Content-Type");

    Ok(builder
        .body(relay::streaming_body(response, segment_url))
        .unwrap_or_else(|_| ().into_response()))
}

/// Join the playlist-provided base with the segment name. A trailing slash
/// means a directory prefix; a full media URL (converter-generated) is used
/// directly; anything else replaces the last path component.
fn resolve_segment_url(base_url: &str, segment_name: &str) -> String {
    if base_url.ends_with('/') {
        return format!("{base_url}{segment_name}");
    }
    if MEDIA_EXTENSIONS.iter().any(|ext| base_url.contains(ext)) {
        return base_url.to_string();
    }
    match base_url.rsplit_once('/') {
        Some((dir, _)) => format!("{dir}/{segment_name}"),
        None => format!("{base_url}/{segment_name}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directory_prefix_appends_name() {
        assert_eq!(
            resolve_segment_url("https://o.example/v/", "seg1.ts"),
            "https://o.example/v/seg1.ts"
        );
    }

    #[test]
    fn full_media_url_wins_over_name() {
        assert_eq!(
            resolve_segment_url("https://o.example/v/seg-42.m4s", "other.m4s"),
            "https://o.example/v/seg-42.m4s"
        );
    }

    #[test]
    fn other_urls_replace_last_component() {
        assert_eq!(
            resolve_segment_url("https://o.example/v/playlist", "seg1.ts"),
            "https://o.example/v/seg1.ts"
        );
    }
}
