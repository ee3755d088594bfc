// Extractor endpoint
//
// `GET /extractor/video` resolves a channel/page URL into a stream
// descriptor and either redirects to the matching proxy endpoint or
// returns the descriptor as JSON. The `url` parameter may be plain,
// percent-encoded, or base64.

use std::collections::HashMap;

use axum::{
    extract::{Query, State},
    http::HeaderMap,
    response::{IntoResponse, Redirect, Response},
    Json,
};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde_json::json;

use super::auth;
use super::error::AppResult;
use super::headers;
use super::AppState;

pub async fn extract_video(
    State(state): State<AppState>,
    Query(query): Query<HashMap<String, String>>,
    request_headers: HeaderMap,
) -> AppResult<Response> {
    auth::check_password(&state.config, &query, &request_headers)?;

    let Some(raw_url) = query
        .get("url")
        .or_else(|| query.get("d"))
        .filter(|v| !v.is_empty())
    else {
        return Ok(usage_response(&headers::proxy_base(&request_headers)));
    };

    let url = normalize_url(raw_url);
    let host_hint = query.get("host").map(String::as_str);
    let redirect_stream = query
        .get("redirect_stream")
        .is_some_and(|v| v.eq_ignore_ascii_case("true"));
    let force_refresh = query
        .get("force")
        .is_some_and(|v| v.eq_ignore_ascii_case("true"));

    tracing::info!(
        "Extracting: {url} (host: {:?}, redirect: {redirect_stream})",
        host_hint
    );

    let mut combined = headers::client_headers(&request_headers, &url);
    headers::apply_h_overrides(&mut combined, &query);

    let descriptor = state
        .registry
        .resolve(&url, &combined, host_hint, force_refresh)
        .await?;

    let proxy_base = headers::proxy_base(&request_headers);
    let endpoint = descriptor.endpoint_kind.path();
    let api_password = query.get("api_password").map(String::as_str);

    if redirect_stream {
        let suffix = headers::query_suffix(&descriptor.request_headers, api_password);
        let full_url = format!(
            "{proxy_base}{endpoint}?d={}{suffix}",
            streamgate_proxy::encode_query_value(&descriptor.destination_url),
        );
        tracing::info!("Redirecting to proxied stream");
        return Ok(Redirect::temporary(&full_url).into_response());
    }

    let mut query_params = serde_json::Map::new();
    if let Some(password) = api_password {
        query_params.insert("api_password".to_string(), json!(password));
    }

    Ok(Json(json!({
        "destination_url": descriptor.destination_url,
        "request_headers": descriptor.request_headers,
        "endpoint_kind": descriptor.endpoint_kind,
        "proxy_url": format!("{proxy_base}{endpoint}"),
        "query_params": query_params,
    }))
    .into_response())
}

/// Accept plain, percent-encoded, or base64 URLs.
fn normalize_url(raw: &str) -> String {
    let decoded = percent_encoding::percent_decode_str(raw)
        .decode_utf8()
        .map_or_else(|_| raw.to_string(), |s| s.to_string());
    if decoded.starts_with("http://") || decoded.starts_with("https://") {
        return decoded;
    }

    // Base64 attempt, with padding tolerated.
    let padded = format!("{}{}", decoded, "=".repeat((4 - decoded.len() % 4) % 4));
    if let Ok(bytes) = STANDARD.decode(padded) {
        if let Ok(text) = String::from_utf8(bytes) {
            let text = text.trim().to_string();
            if text.starts_with("http://") || text.starts_with("https://") {
                tracing::info!("Base64 URL decoded");
                return text;
            }
        }
    }

    decoded
}

fn usage_response(proxy_base: &str) -> Response {
    Json(json!({
        "message": "Streamgate Extractor API",
        "usage": {
            "endpoint": "/extractor/video",
            "parameters": {
                "url": "(Required) URL to extract. Plain, percent-encoded, or base64.",
                "host": "(Optional) Force a specific extractor, bypassing auto-detection.",
                "redirect_stream": "(Optional) 'true' redirects to the stream, 'false' returns JSON.",
                "api_password": "(Optional) API password when configured."
            }
        },
        "examples": [
            format!("{proxy_base}/extractor/video?url=https://example.org/channel/123"),
            format!("{proxy_base}/extractor/video?host=generic&url=https://custom-link.example"),
        ]
    }))
    .into_response()
}
