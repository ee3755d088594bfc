// Batch proxy-URL builder
//
// `POST /generate_urls` turns a list of stream descriptors into ready
// proxy URLs, embedding forwarded headers and the API password.

use std::collections::HashMap;

use axum::{
    extract::{Query, State},
    http::HeaderMap,
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use serde_json::json;

use super::auth;
use super::error::AppResult;
use super::headers;
use super::AppState;

#[derive(Debug, Deserialize)]
pub struct GenerateUrlsRequest {
    #[serde(default)]
    pub urls: Vec<UrlItem>,
    #[serde(default)]
    pub api_password: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UrlItem {
    pub destination_url: Option<String>,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub request_headers: HashMap<String, String>,
}

pub async fn generate_urls(
    State(state): State<AppState>,
    Query(query): Query<HashMap<String, String>>,
    request_headers: HeaderMap,
    Json(payload): Json<GenerateUrlsRequest>,
) -> AppResult<Response> {
    auth::check_password_with_body(
        &state.config,
        &query,
        &request_headers,
        payload.api_password.as_deref(),
    )?;

    let proxy_base = headers::proxy_base(&request_headers);
    let api_password = state.config.auth.api_password.as_deref();

    tracing::info!(
        "Generating {} proxy URLs",
        payload.urls.len()
    );

    let mut generated = Vec::with_capacity(payload.urls.len());
    for item in &payload.urls {
        let Some(destination) = item.destination_url.as_deref().filter(|v| !v.is_empty()) else {
            continue;
        };

        let mut endpoint = item
            .endpoint
            .clone()
            .unwrap_or_else(|| "/proxy/stream".to_string());
        if !endpoint.starts_with('/') {
            endpoint.insert(0, '/');
        }

        let mut params = vec![format!(
            "d={}",
            streamgate_proxy::encode_query_value(destination)
        )];
        let mut names: Vec<&String> = item.request_headers.keys().collect();
        names.sort();
        for name in names {
            params.push(format!(
                "h_{}={}",
                streamgate_proxy::encode_query_value(name),
                streamgate_proxy::encode_query_value(&item.request_headers[name]),
            ));
        }
        if let Some(password) = api_password {
            params.push(format!(
                "api_password={}",
                streamgate_proxy::encode_query_value(password)
            ));
        }

        generated.push(format!("{proxy_base}{endpoint}?{}", params.join("&")));
    }

    Ok(Json(json!({ "urls": generated })).into_response())
}
