// AES-128 key relay
//
// `GET /key` serves either a static hex key or relays the key bytes from
// the provider, optionally preceded by a heartbeat ping that keeps the
// provider session alive. A failed key fetch invalidates the extractor
// cache for the originating channel.

use std::collections::HashMap;

use axum::{
    body::Body,
    extract::{Query, State},
    http::HeaderMap,
    response::{IntoResponse, Response},
};

use streamgate_core::extractor::generic::DEFAULT_USER_AGENT;
use streamgate_core::Error;

use super::auth;
use super::error::{AppError, AppResult};
use super::headers;
use super::AppState;

pub async fn serve_key(
    State(state): State<AppState>,
    Query(query): Query<HashMap<String, String>>,
    request_headers: HeaderMap,
) -> AppResult<Response> {
    auth::check_password(&state.config, &query, &request_headers)?;

    // Static key embedded by the MPD converter.
    if let Some(static_key) = query.get("static_key") {
        let key_bytes = hex::decode(static_key)
            .map_err(|_| AppError::bad_request("Invalid static key"))?;
        return Ok(key_response(key_bytes.into()));
    }

    let key_url = query
        .get("key_url")
        .filter(|v| !v.is_empty())
        .ok_or_else(|| AppError::bad_request("Missing key_url or static_key parameter"))?;

    let mut upstream_headers = headers::h_params(&query, true);
    upstream_headers.retain(|name, _| !name.eq_ignore_ascii_case("range"));

    // Heartbeat: an opt-in pre-key ping carried via pseudo-headers.
    let heartbeat_url = remove_case_insensitive(&mut upstream_headers, "heartbeat-url");
    let client_token = remove_case_insensitive(&mut upstream_headers, "x-client-token");

    headers::sanitize_upstream_headers(&mut upstream_headers);

    let client = state.pool.acquire(key_url);

    if let Some(heartbeat_url) = heartbeat_url {
        let mut heartbeat_headers = HashMap::new();
        for name in ["Authorization", "X-Channel-Key", "Referer", "Origin"] {
            if let Some(value) = get_case_insensitive(&upstream_headers, name) {
                heartbeat_headers.insert(name.to_string(), value);
            }
        }
        heartbeat_headers.insert(
            "User-Agent".to_string(),
            get_case_insensitive(&upstream_headers, "user-agent")
                .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string()),
        );
        if let Some(token) = client_token {
            heartbeat_headers.insert("X-Client-Token".to_string(), token);
        }

        tracing::info!("Pre-key heartbeat to: {heartbeat_url}");
        let mut request = client.get(&heartbeat_url);
        for (name, value) in &heartbeat_headers {
            request = request.header(name.as_str(), value.as_str());
        }
        match request.send().await {
            Ok(response) => {
                tracing::info!("Heartbeat response: {}", response.status());
            }
            Err(err) => {
                tracing::warn!("Pre-key heartbeat failed: {err}");
            }
        }
    }

    tracing::info!("Fetching AES key from: {key_url}");
    let mut request = client.get(key_url);
    for (name, value) in &upstream_headers {
        request = request.header(name.as_str(), value.as_str());
    }

    let response = request.send().await.map_err(Error::from)?;
    let status = response.status().as_u16();

    if status == 200 || status == 206 {
        let key_data = response.bytes().await.map_err(Error::from)?;
        tracing::info!("AES key fetched: {} bytes", key_data.len());
        return Ok(key_response(key_data));
    }

    tracing::warn!("Key fetch failed with status {status}");
    // The channel's cached resolution is likely stale; drop it so the next
    // playlist request re-derives fresh key URLs.
    if let Some(channel_url) = query.get("original_channel_url") {
        state.registry.invalidate(channel_url).await;
    }

    Err(AppError::new(
        axum::http::StatusCode::from_u16(status)
            .unwrap_or(axum::http::StatusCode::BAD_GATEWAY),
        format!("Key fetch failed: {status}"),
    ))
}

fn key_response(body: bytes::Bytes) -> Response {
    Response::builder()
        .header("Content-Type", "application/octet-stream")
        .header("Access-Control-Allow-Origin", "*")
        .header("Access-Control-Allow-Headers", "*")
        .header("Cache-Control", "no-cache, no-store, must-revalidate")
        .body(Body::from(body))
        .unwrap_or_else(|_| ().into_response())
}

fn remove_case_insensitive(headers: &mut HashMap<String, String>, name: &str) -> Option<String> {
    let key = headers
        .keys()
        .find(|k| k.eq_ignore_ascii_case(name))?
        .clone();
    headers.remove(&key)
}

fn get_case_insensitive(headers: &HashMap<String, String>, name: &str) -> Option<String> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.clone())
}
