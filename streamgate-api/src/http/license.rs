// DRM license endpoint
//
// ClearKey mode synthesizes a JWK set from `clearkey=KID:KEY[,…]`;
// license-proxy mode forwards the client's challenge body to the provider
// with the method preserved and relays status and body back.

use std::collections::HashMap;

use axum::{
    body::Body,
    extract::{Query, State},
    http::{HeaderMap, Method},
    response::{IntoResponse, Response},
    Json,
};
use bytes::Bytes;

use streamgate_core::extractor::generic::DEFAULT_USER_AGENT;
use streamgate_core::Error;
use streamgate_proxy::license::clearkey_jwk;

use super::auth;
use super::error::{AppError, AppResult};
use super::headers;
use super::AppState;

pub async fn serve_license(
    State(state): State<AppState>,
    Query(query): Query<HashMap<String, String>>,
    method: Method,
    request_headers: HeaderMap,
    body: Bytes,
) -> AppResult<Response> {
    auth::check_password(&state.config, &query, &request_headers)?;

    // 1. Static ClearKey mode
    if let Some(clearkey) = query.get("clearkey").filter(|v| !v.is_empty()) {
        tracing::info!("Serving static ClearKey license");
        let jwk = clearkey_jwk(clearkey)
            .map_err(|_| AppError::bad_request("Invalid ClearKey format"))?;
        return Ok(Json(jwk).into_response());
    }

    // 2. License-proxy mode
    let license_url = query
        .get("url")
        .filter(|v| !v.is_empty())
        .ok_or_else(|| AppError::bad_request("Missing url parameter"))?;

    let mut upstream_headers = headers::h_params(&query, true);
    if let Some(content_type) = request_headers
        .get("content-type")
        .and_then(|v| v.to_str().ok())
    {
        upstream_headers.insert("Content-Type".to_string(), content_type.to_string());
    }
    if !upstream_headers
        .keys()
        .any(|k| k.eq_ignore_ascii_case("user-agent"))
    {
        upstream_headers.insert("User-Agent".to_string(), DEFAULT_USER_AGENT.to_string());
    }
    headers::sanitize_upstream_headers(&mut upstream_headers);

    tracing::info!("Proxying license request to: {license_url}");

    let client = state.pool.acquire(license_url);
    let reqwest_method = reqwest::Method::from_bytes(method.as_str().as_bytes())
        .map_err(|_| AppError::bad_request("Unsupported method"))?;
    let mut request = client.request(reqwest_method, license_url).body(body);
    for (name, value) in &upstream_headers {
        request = request.header(name.as_str(), value.as_str());
    }

    let response = request.send().await.map_err(Error::from)?;
    let status = response.status().as_u16();
    let content_type = response
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let response_body = response.bytes().await.map_err(Error::from)?;
    tracing::info!("License response: {status} ({} bytes)", response_body.len());

    let mut builder = Response::builder()
        .status(status)
        .header("Access-Control-Allow-Origin", "*")
        .header("Access-Control-Allow-Headers", "*")
        .header("Access-Control-Allow-Methods", "GET, POST, OPTIONS");
    if let Some(content_type) = content_type {
        builder = builder.header("Content-Type", content_type);
    }

    Ok(builder
        .body(Body::from(response_body))
        .unwrap_or_else(|_| ().into_response()))
}
