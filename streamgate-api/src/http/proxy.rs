// Stream proxy entry points
//
// `/proxy/hls/manifest.m3u8`, `/proxy/mpd/manifest.m3u8`, `/proxy/stream`
// and the legacy `/proxy/manifest.m3u8` alias all resolve the target
// through the extractor registry, fetch it under egress policy, classify
// the response and either rewrite (HLS), convert (DASH) or relay it.

use std::collections::HashMap;

use axum::{
    body::Body,
    extract::{Query, State},
    http::HeaderMap,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use serde_json::json;
use url::Url;

use streamgate_core::config::MpdMode;
use streamgate_core::extractor::{EndpointKind, StreamDescriptor};
use streamgate_core::Error;
use streamgate_proxy::hls::{rewrite_playlist, RewriteOptions};
use streamgate_proxy::license::{merge_key_params, parse_clearkey};
use streamgate_proxy::mpd;

use super::auth;
use super::error::{AppError, AppResult};
use super::headers;
use super::relay;
use super::AppState;

pub async fn hls_manifest(
    State(state): State<AppState>,
    Query(query): Query<HashMap<String, String>>,
    request_headers: HeaderMap,
) -> AppResult<Response> {
    handle_proxy_request(state, query, request_headers).await
}

pub async fn mpd_manifest(
    State(state): State<AppState>,
    Query(query): Query<HashMap<String, String>>,
    request_headers: HeaderMap,
) -> AppResult<Response> {
    handle_proxy_request(state, query, request_headers).await
}

pub async fn stream(
    State(state): State<AppState>,
    Query(query): Query<HashMap<String, String>>,
    request_headers: HeaderMap,
) -> AppResult<Response> {
    handle_proxy_request(state, query, request_headers).await
}

/// JSON descriptor returned when `redirect_stream=false`.
#[derive(Serialize)]
struct DescriptorResponse<'a> {
    destination_url: &'a str,
    request_headers: &'a HashMap<String, String>,
    endpoint_kind: EndpointKind,
    proxy_url: String,
    query_params: serde_json::Value,
}

async fn handle_proxy_request(
    state: AppState,
    query: HashMap<String, String>,
    request_headers: HeaderMap,
) -> AppResult<Response> {
    auth::check_password(&state.config, &query, &request_headers)?;

    let target = query
        .get("d")
        .or_else(|| query.get("url"))
        .filter(|v| !v.is_empty())
        .ok_or_else(|| AppError::bad_request("Missing 'url' or 'd' parameter"))?
        .clone();

    let force_refresh = query
        .get("force")
        .is_some_and(|v| v.eq_ignore_ascii_case("true"));
    let redirect_stream = query
        .get("redirect_stream")
        .map_or(true, |v| v.eq_ignore_ascii_case("true"));

    // Only the safe subset of the client's own headers reaches the
    // extractor; h_ parameters always take priority over them.
    let mut combined = headers::client_headers(&request_headers, &target);
    headers::apply_h_overrides(&mut combined, &query);

    tracing::debug!("Resolving stream for {target}");
    let descriptor = state
        .registry
        .resolve(&target, &combined, None, force_refresh)
        .await?;

    let mut stream_headers = descriptor.request_headers.clone();
    headers::apply_h_overrides(&mut stream_headers, &query);

    let proxy_base = headers::proxy_base(&request_headers);

    if !redirect_stream {
        return Ok(descriptor_response(&descriptor, &stream_headers, &proxy_base, &query));
    }

    serve_stream(
        &state,
        &query,
        &request_headers,
        &proxy_base,
        &descriptor.destination_url,
        stream_headers,
        &target,
    )
    .await
}

fn descriptor_response(
    descriptor: &StreamDescriptor,
    stream_headers: &HashMap<String, String>,
    proxy_base: &str,
    query: &HashMap<String, String>,
) -> Response {
    let mut query_params = serde_json::Map::new();
    if let Some(password) = query.get("api_password") {
        query_params.insert("api_password".to_string(), json!(password));
    }

    Json(DescriptorResponse {
        destination_url: &descriptor.destination_url,
        request_headers: stream_headers,
        endpoint_kind: descriptor.endpoint_kind,
        proxy_url: format!("{proxy_base}{}", descriptor.endpoint_kind.path()),
        query_params: serde_json::Value::Object(query_params),
    })
    .into_response()
}

async fn serve_stream(
    state: &AppState,
    query: &HashMap<String, String>,
    request_headers: &HeaderMap,
    proxy_base: &str,
    stream_url: &str,
    mut upstream_headers: HashMap<String, String>,
    original_url: &str,
) -> AppResult<Response> {
    headers::forward_range_headers(&mut upstream_headers, request_headers, stream_url);
    headers::sanitize_upstream_headers(&mut upstream_headers);

    let client = state.pool.acquire(stream_url);
    let response = relay::get_checked(&client, stream_url, &upstream_headers).await?;

    let final_url = response.url().to_string();
    let content_type = response
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_lowercase();
    let path = Url::parse(&final_url)
        .map(|u| u.path().to_string())
        .unwrap_or_else(|_| final_url.clone());

    let is_hls = content_type.contains("mpegurl") || path.ends_with(".m3u8");
    // DLHD-style masking serves playlists (and sometimes raw MPEG-TS) under
    // a CSS content type.
    let is_css = path.ends_with(".css") || content_type.contains("text/css");
    let is_dash = content_type.contains("dash+xml") || path.ends_with(".mpd");

    if is_hls || is_css {
        let body = response.bytes().await.map_err(Error::from)?;
        let Ok(text) = std::str::from_utf8(&body) else {
            tracing::warn!("Binary payload masked as {content_type} at {final_url}");
            return Ok(binary_response(body.clone()));
        };

        if text.trim_start().starts_with("#EXTM3U") {
            let rewritten = rewrite_playlist(
                text,
                &RewriteOptions {
                    upstream_url: &final_url,
                    proxy_base,
                    forward_headers: &upstream_headers,
                    original_url,
                    api_password: query.get("api_password").map(String::as_str),
                    no_bypass: query.get("no_bypass").map(String::as_str) == Some("1"),
                },
            );
            return Ok(playlist_response(rewritten));
        }

        if is_css {
            // Genuine stylesheet; hand it back untouched.
            return Ok(Response::builder()
                .header(
                    "Content-Type",
                    if content_type.is_empty() {
                        "text/css"
                    } else {
                        content_type.as_str()
                    },
                )
                .header("Access-Control-Allow-Origin", "*")
                .body(Body::from(body))
                .unwrap_or_else(|_| ().into_response()));
        }
        // Content type said HLS but the body disagrees; treat as binary.
        return Ok(binary_response(body));
    }

    if is_dash {
        let text = response.text().await.map_err(Error::from)?;
        return serve_mpd(state, query, proxy_base, &final_url, &upstream_headers, &text);
    }

    // Plain byte relay.
    let force_ts = path.ends_with(".ts");
    let header_pairs = relay::copied_response_headers(&response, force_ts);
    let status = response.status();

    let mut builder = Response::builder().status(status.as_u16());
    for (name, value) in header_pairs {
        builder = builder.header(name, value);
    }
    builder = builder
        .header("Access-Control-Allow-Origin", "*")
        .header("Access-Control-Allow-Methods", "GET, HEAD, OPTIONS")
        .header("Access-Control-Allow-Headers", "Range, Content-Type");

    Ok(builder
        .body(relay::streaming_body(response, final_url))
        .unwrap_or_else(|_| ().into_response()))
}

fn serve_mpd(
    state: &AppState,
    query: &HashMap<String, String>,
    proxy_base: &str,
    manifest_url: &str,
    upstream_headers: &HashMap<String, String>,
    manifest: &str,
) -> AppResult<Response> {
    if state.config.mpd.mode == MpdMode::Ffmpeg {
        let rewritten = mpd::passthrough_rewrite(manifest, manifest_url);
        return Ok(Response::builder()
            .header("Content-Type", "application/dash+xml")
            .header("Content-Disposition", "attachment; filename=\"stream.mpd\"")
            .header("Access-Control-Allow-Origin", "*")
            .header("Cache-Control", "no-cache")
            .body(Body::from(rewritten))
            .unwrap_or_else(|_| ().into_response()));
    }

    let clearkey = merge_key_params(
        query.get("clearkey").map(String::as_str),
        query.get("key_id").map(String::as_str),
        query.get("key").map(String::as_str),
    );

    let mut extra_params = headers::query_suffix(
        upstream_headers,
        query.get("api_password").map(String::as_str),
    );
    if let Some(clearkey) = clearkey.as_deref() {
        extra_params.push_str("&clearkey=");
        extra_params.push_str(&streamgate_proxy::encode_query_value(clearkey));
    }

    let first_pair = clearkey.as_deref().map(parse_clearkey).unwrap_or_default();
    let clearkey_ref = first_pair
        .first()
        .map(|pair| (pair.key_id.as_str(), pair.key.as_str()));

    let parsed = match mpd::parse_mpd(manifest) {
        Ok(parsed) => parsed,
        Err(err) => {
            // Unparseable manifests fall back to pass-through rewriting.
            tracing::error!("MPD conversion failed ({err}), serving rewritten MPD");
            let rewritten = mpd::passthrough_rewrite(manifest, manifest_url);
            return Ok(Response::builder()
                .header("Content-Type", "application/dash+xml")
                .header("Content-Disposition", "attachment; filename=\"stream.mpd\"")
                .header("Access-Control-Allow-Origin", "*")
                .header("Cache-Control", "no-cache")
                .body(Body::from(rewritten))
                .unwrap_or_else(|_| ().into_response()));
        }
    };

    let options = mpd::ConvertOptions {
        proxy_base,
        manifest_url,
        extra_params: &extra_params,
        clearkey: clearkey_ref,
    };

    let playlist = match query.get("rep_id") {
        Some(rep_id) => {
            tracing::info!("Converting MPD media playlist for representation {rep_id}");
            mpd::media_playlist(&parsed, rep_id, &options).map_err(|err| match err {
                mpd::MpdConvertError::RepresentationNotFound(id) => {
                    AppError::not_found(format!("Representation not found: {id}"))
                }
                other => AppError::bad_gateway(other.to_string()),
            })?
        }
        None => {
            tracing::info!("Converting MPD master playlist");
            mpd::master_playlist(&parsed, &options)
        }
    };

    Ok(playlist_response(playlist))
}

fn playlist_response(playlist: String) -> Response {
    Response::builder()
        .header("Content-Type", "application/vnd.apple.mpegurl")
        .header("Content-Disposition", "attachment; filename=\"stream.m3u8\"")
        .header("Access-Control-Allow-Origin", "*")
        .header("Cache-Control", "no-cache")
        .body(Body::from(playlist))
        .unwrap_or_else(|_| ().into_response())
}

fn binary_response(body: bytes::Bytes) -> Response {
    Response::builder()
        .header("Content-Type", "video/MP2T")
        .header("Access-Control-Allow-Origin", "*")
        .body(Body::from(body))
        .unwrap_or_else(|_| ().into_response())
}
