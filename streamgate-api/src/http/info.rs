// Service info & diagnostics
//
// `/api/info` describes the running service; `/proxy/ip` reports the
// public address of the configured egress path; OPTIONS preflight for the
// media routes.

use std::collections::HashMap;

use axum::{
    extract::{Query, State},
    http::HeaderMap,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use streamgate_core::Error;

use super::auth;
use super::error::AppResult;
use super::AppState;

pub async fn api_info(State(state): State<AppState>) -> Response {
    let egress = &state.config.egress;
    Json(json!({
        "service": "streamgate",
        "version": env!("CARGO_PKG_VERSION"),
        "extractors_loaded": state.registry.loaded_keys(),
        "proxy_config": {
            "global_proxies": egress.global_proxies.len(),
            "transport_routes": egress.routes.len(),
            "routes": egress.routes.iter().map(|route| json!({
                "url": route.url_pattern,
                "has_proxy": route.proxy.is_some(),
                "disable_tls_verify": route.disable_tls_verify,
            })).collect::<Vec<_>>(),
        },
        "endpoints": {
            "/proxy/hls/manifest.m3u8": "HLS proxy - ?d=<URL>",
            "/proxy/mpd/manifest.m3u8": "DASH proxy - ?d=<URL>",
            "/proxy/stream": "Raw stream proxy - ?d=<URL>",
            "/key": "AES-128 key relay - ?key_url=<URL>",
            "/license": "DRM license / ClearKey JWK - ?url=<URL> or ?clearkey=<kid:key>",
            "/segment/{name}": "Segment relay - ?base_url=<URL>",
            "/decrypt/segment.mp4": "CENC decrypt - ?url=…&init_url=…&key=…&key_id=…",
            "/generate_urls": "Batch URL builder (POST)",
            "/extractor/video": "Extractor entry - ?url=…&host=…",
            "/proxy/ip": "Egress IP diagnostic",
        },
    }))
    .into_response()
}

/// Report the public IP of the egress path (the proxy's own address, or
/// the outbound proxy's when one is configured).
pub async fn proxy_ip(
    State(state): State<AppState>,
    Query(query): Query<HashMap<String, String>>,
    request_headers: HeaderMap,
) -> AppResult<Response> {
    auth::check_password(&state.config, &query, &request_headers)?;

    const IP_SERVICE: &str = "https://api.ipify.org?format=json";
    let client = state.pool.acquire(IP_SERVICE);
    let response = client.get(IP_SERVICE).send().await.map_err(Error::from)?;

    if !response.status().is_success() {
        return Err(Error::UpstreamConnection(format!(
            "IP service returned {}",
            response.status()
        ))
        .into());
    }

    let body: serde_json::Value = response.json().await.map_err(Error::from)?;
    Ok(Json(body).into_response())
}

/// CORS preflight for the media routes.
pub async fn preflight() -> Response {
    (
        axum::http::StatusCode::OK,
        [
            ("Access-Control-Allow-Origin", "*"),
            ("Access-Control-Allow-Methods", "GET, HEAD, OPTIONS"),
            ("Access-Control-Allow-Headers", "Range, Content-Type"),
            ("Access-Control-Max-Age", "86400"),
        ],
    )
        .into_response()
}
