// Extractor traits
//
// Core interface every extractor implements.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::error::ExtractorError;

/// Which proxy endpoint should serve the resolved stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointKind {
    /// HLS playlist proxy (`/proxy/hls/manifest.m3u8`)
    HlsProxy,
    /// DASH manifest entry (`/proxy/mpd/manifest.m3u8`)
    Mpd,
    /// Raw byte relay (`/proxy/stream`)
    StreamProxy,
}

impl EndpointKind {
    /// Proxy path serving this kind of stream.
    #[must_use]
    pub fn path(self) -> &'static str {
        match self {
            Self::HlsProxy => "/proxy/hls/manifest.m3u8",
            Self::Mpd => "/proxy/mpd/manifest.m3u8",
            Self::StreamProxy => "/proxy/stream",
        }
    }

    /// Classify a resolved URL: `.mpd` goes to the MPD entry, container
    /// files to the raw relay, everything else to the HLS proxy.
    #[must_use]
    pub fn for_url(url: &str) -> Self {
        if url.contains(".mpd") {
            Self::Mpd
        } else if [".mp4", ".mkv", ".avi"].iter().any(|ext| url.contains(ext)) {
            Self::StreamProxy
        } else {
            Self::HlsProxy
        }
    }
}

/// Resolved stream descriptor produced by an extractor. Request-scoped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamDescriptor {
    /// Final upstream URL to fetch.
    pub destination_url: String,
    /// Headers the upstream requires (Referer, cookies, auth tokens).
    #[serde(default)]
    pub request_headers: HashMap<String, String>,
    /// Proxy endpoint that should serve this stream.
    pub endpoint_kind: EndpointKind,
}

/// A per-host-family stream resolver.
///
/// Instances are created on first use and memoized for the process
/// lifetime; they must not retain client-identifying state across requests
/// (per-request headers are passed into `extract`).
#[async_trait]
pub trait Extractor: Send + Sync {
    /// Host-family key (e.g. "generic").
    fn name(&self) -> &'static str;

    /// Resolve `url` into a stream descriptor. `force_refresh` bypasses any
    /// internal caches and re-derives a fresh URL.
    async fn extract(
        &self,
        url: &str,
        request_headers: &HashMap<String, String>,
        force_refresh: bool,
    ) -> Result<StreamDescriptor, ExtractorError>;

    /// Drop any cached state for `url` (called when a downstream key fetch
    /// fails and the channel needs re-resolution).
    async fn invalidate(&self, _url: &str) {}

    /// Release resources on shutdown.
    async fn close(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_kind_for_url() {
        assert_eq!(
            EndpointKind::for_url("https://x.org/stream.mpd?a=1"),
            EndpointKind::Mpd
        );
        assert_eq!(
            EndpointKind::for_url("https://x.org/movie.mkv"),
            EndpointKind::StreamProxy
        );
        assert_eq!(
            EndpointKind::for_url("https://x.org/live/pl.m3u8"),
            EndpointKind::HlsProxy
        );
        assert_eq!(
            EndpointKind::for_url("https://x.org/channel/123"),
            EndpointKind::HlsProxy
        );
    }

    #[test]
    fn endpoint_kind_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&EndpointKind::HlsProxy).unwrap(),
            "\"hls_proxy\""
        );
        assert_eq!(serde_json::to_string(&EndpointKind::Mpd).unwrap(), "\"mpd\"");
        assert_eq!(
            serde_json::to_string(&EndpointKind::StreamProxy).unwrap(),
            "\"stream_proxy\""
        );
    }
}
