// Module: http
//
// Router construction and shared application state for the proxy's HTTP
// surface.

pub mod auth;
pub mod batch;
pub mod decrypt;
pub mod error;
pub mod extractor;
pub mod headers;
pub mod info;
pub mod key;
pub mod license;
pub mod proxy;
pub mod relay;
pub mod segment;

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use streamgate_core::extractor::ExtractorRegistry;
use streamgate_core::{ClientPool, Config};
use streamgate_proxy::segment::SegmentPipeline;

pub use error::{AppError, AppResult};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub pool: ClientPool,
    pub registry: Arc<ExtractorRegistry>,
    pub segments: SegmentPipeline,
}

impl AppState {
    #[must_use]
    pub fn new(config: Config) -> Self {
        let config = Arc::new(config);
        let pool = ClientPool::new(&config.egress);
        let registry = Arc::new(ExtractorRegistry::new(pool.clone()));
        let segments = SegmentPipeline::new(pool.clone());
        Self {
            config,
            pool,
            registry,
            segments,
        }
    }

    /// Release extractor instances and cached sessions on shutdown.
    pub async fn cleanup(&self) {
        self.registry.close_all().await;
    }
}

/// Build the HTTP router with all proxy routes and shared layers.
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route(
            "/proxy/hls/manifest.m3u8",
            get(proxy::hls_manifest).options(info::preflight),
        )
        .route(
            "/proxy/mpd/manifest.m3u8",
            get(proxy::mpd_manifest).options(info::preflight),
        )
        // Legacy alias of the HLS entry.
        .route("/proxy/manifest.m3u8", get(proxy::hls_manifest))
        .route(
            "/proxy/stream",
            get(proxy::stream).options(info::preflight),
        )
        .route("/key", get(key::serve_key))
        .route(
            "/license",
            get(license::serve_license).post(license::serve_license),
        )
        .route(
            "/segment/{name}",
            get(segment::serve_segment).options(info::preflight),
        )
        .route(
            "/decrypt/segment.mp4",
            get(decrypt::decrypt_segment).post(decrypt::decrypt_segment),
        )
        .route("/generate_urls", post(batch::generate_urls))
        .route("/extractor/video", get(extractor::extract_video))
        .route("/proxy/ip", get(info::proxy_ip))
        .route("/api/info", get(info::api_info))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
