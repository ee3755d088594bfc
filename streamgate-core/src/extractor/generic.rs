// Generic extractor
//
// Fallback resolver for URLs no site-specific extractor claims. Computes a
// safe browser header set, merges caller headers under anti-leak rules, and
// performs manual single-hop redirect resolution for known redirectors so
// problematic client headers (Range, validators) never reach the resolver.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use url::Url;

use super::error::ExtractorError;
use super::traits::{EndpointKind, Extractor, StreamDescriptor};
use crate::client::ClientPool;
use crate::routing;

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/136.0.0.0 Safari/537.36";

/// Neutral referer used toward redirectors instead of the target origin.
const NEUTRAL_REFERER: &str = "https://strem.io/";

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(15);

/// URL tokens that mark single-hop redirector services.
const REDIRECTOR_TOKENS: [&str; 2] = ["/resolve/", "torrentio"];

/// Headers that may carry upstream credentials and are forwarded verbatim.
const PASSTHROUGH_HEADERS: [&str; 5] = [
    "authorization",
    "x-api-key",
    "x-auth-token",
    "cookie",
    "x-channel-key",
];

/// Headers that would leak the client's address. Never forwarded.
pub const IP_LEAK_HEADERS: [&str; 4] = ["x-forwarded-for", "x-real-ip", "forwarded", "via"];

#[must_use]
pub fn is_redirector(url: &str) -> bool {
    let lower = url.to_lowercase();
    REDIRECTOR_TOKENS.iter().any(|token| lower.contains(token))
}

pub struct GenericExtractor {
    pool: ClientPool,
    /// Redirect-disabled clients for the handshake, keyed by proxy URI
    /// ("direct" for none).
    handshake_clients: DashMap<String, reqwest::Client>,
}

impl GenericExtractor {
    #[must_use]
    pub fn new(pool: ClientPool) -> Self {
        Self {
            pool,
            handshake_clients: DashMap::new(),
        }
    }

    /// Compute the upstream header set for `url` from the caller's headers.
    ///
    /// Base set: browser User-Agent, `Accept`, `Accept-Language`. Referer
    /// and Origin default to the target's own origin, except toward
    /// redirectors where a fixed neutral referer is used. Caller values are
    /// merged under these rules: User-Agent only with a browser marker,
    /// Referer/Origin dropped when unrelated to a redirector target,
    /// credentials passed through, IP-revealing headers never forwarded.
    /// All produced keys are lowercase.
    #[must_use]
    pub fn build_request_headers(
        url: &str,
        caller: &HashMap<String, String>,
    ) -> HashMap<String, String> {
        let mut headers = HashMap::new();
        headers.insert("user-agent".to_string(), DEFAULT_USER_AGENT.to_string());
        headers.insert("accept".to_string(), "*/*".to_string());
        headers.insert("accept-language".to_string(), "en-US,en;q=0.9".to_string());

        let redirector = is_redirector(url);
        let caller_has =
            |name: &str| caller.keys().any(|k| k.eq_ignore_ascii_case(name));

        if redirector {
            if !caller_has("referer") {
                headers.insert("referer".to_string(), NEUTRAL_REFERER.to_string());
            }
        } else if let Some(origin) = url_origin(url) {
            if !caller_has("referer") {
                headers.insert("referer".to_string(), origin.clone());
            }
            if !caller_has("origin") {
                headers.insert("origin".to_string(), origin);
            }
        }

        for (name, value) in caller {
            let lower = name.to_lowercase();
            match lower.as_str() {
                "user-agent" => {
                    let marker = value.to_lowercase();
                    if marker.contains("chrome") || marker.contains("applewebkit") {
                        headers.insert(lower.clone(), value.clone());
                    }
                }
                "referer" | "origin" => {
                    // A Referer pointing at an unrelated provider while we
                    // talk to a redirector is leakage from a previous stream.
                    if redirector && !same_host(url, value) {
                        continue;
                    }
                    headers.insert(lower.clone(), value.clone());
                }
                name if PASSTHROUGH_HEADERS.contains(&name) => {
                    headers.insert(lower.clone(), value.clone());
                }
                name if IP_LEAK_HEADERS.contains(&name) => {}
                _ => {}
            }
        }

        headers
    }

    /// Perform the single-hop redirect handshake: one `GET` with redirects
    /// disabled, expecting a `3xx` with a `Location` header. First attempt
    /// honors the egress policy; when that fails and a proxy pool is
    /// configured, a direct connection is tried once.
    async fn resolve_redirect(
        &self,
        url: &str,
        stream_headers: &HashMap<String, String>,
    ) -> Option<String> {
        let safe_url = encode_spaces(url);
        let user_agent = stream_headers
            .get("user-agent")
            .map_or(DEFAULT_USER_AGENT, String::as_str);

        let proxy = routing::resolve_proxy(
            &safe_url,
            self.pool.routes(),
            self.pool.global_proxies(),
        );

        tracing::info!("Resolving redirect for suspected redirector: {safe_url}");

        match self
            .handshake_attempt(&safe_url, user_agent, proxy.as_deref())
            .await
        {
            Ok(location) => return Some(location),
            Err(err) => {
                tracing::warn!("Redirect handshake failed ({err})");
            }
        }

        // Redirectors behind CDN protection often block datacenter proxies;
        // retry once over a direct connection.
        if proxy.is_some() || !self.pool.global_proxies().is_empty() {
            match self.handshake_attempt(&safe_url, user_agent, None).await {
                Ok(location) => return Some(location),
                Err(err) => {
                    tracing::warn!("Direct redirect handshake failed ({err})");
                }
            }
        }

        None
    }

    async fn handshake_attempt(
        &self,
        url: &str,
        user_agent: &str,
        proxy: Option<&str>,
    ) -> Result<String, ExtractorError> {
        let client = self.handshake_client(proxy)?;

        let response = client
            .get(url)
            .header("User-Agent", user_agent)
            .header(
                "Accept",
                "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,*/*;q=0.8",
            )
            .header("Accept-Language", "en-US,en;q=0.5")
            .header("Referer", NEUTRAL_REFERER)
            .timeout(HANDSHAKE_TIMEOUT)
            .send()
            .await
            .map_err(|e| ExtractorError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_redirection() {
            return Err(ExtractorError::Failed(format!(
                "redirector answered {status}, expected 3xx"
            )));
        }

        let location = response
            .headers()
            .get("location")
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| {
                ExtractorError::Failed(format!("redirector answered {status} without Location"))
            })?;

        if location.starts_with("http://") || location.starts_with("https://") {
            return Ok(location.to_string());
        }

        let base = Url::parse(url).map_err(|e| ExtractorError::InvalidUrl(e.to_string()))?;
        let joined = base
            .join(location)
            .map_err(|e| ExtractorError::InvalidUrl(e.to_string()))?;
        Ok(joined.to_string())
    }

    fn handshake_client(&self, proxy: Option<&str>) -> Result<reqwest::Client, ExtractorError> {
        let key = proxy.unwrap_or("direct").to_string();
        if let Some(cached) = self.handshake_clients.get(&key) {
            return Ok(cached.clone());
        }

        let mut builder = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .danger_accept_invalid_certs(true)
            .timeout(HANDSHAKE_TIMEOUT);
        if let Some(uri) = proxy {
            builder = builder
                .proxy(reqwest::Proxy::all(uri).map_err(|e| ExtractorError::Network(e.to_string()))?);
        }

        let client = builder
            .build()
            .map_err(|e| ExtractorError::Network(e.to_string()))?;
        self.handshake_clients.insert(key, client.clone());
        Ok(client)
    }
}

#[async_trait]
impl Extractor for GenericExtractor {
    fn name(&self) -> &'static str {
        "generic"
    }

    async fn extract(
        &self,
        url: &str,
        request_headers: &HashMap<String, String>,
        _force_refresh: bool,
    ) -> Result<StreamDescriptor, ExtractorError> {
        let headers = Self::build_request_headers(url, request_headers);

        if is_redirector(url) {
            if let Some(resolved) = self.resolve_redirect(url, &headers).await {
                tracing::info!("Resolved redirector to final URL: {resolved}");
                return Ok(StreamDescriptor {
                    endpoint_kind: EndpointKind::for_url(&resolved),
                    destination_url: resolved,
                    request_headers: headers,
                });
            }
            // Handshake failures fall through to the pass-through
            // descriptor; the stream proxy surfaces the upstream error.
        }

        Ok(StreamDescriptor {
            endpoint_kind: EndpointKind::for_url(url),
            destination_url: url.to_string(),
            request_headers: headers,
        })
    }
}

fn url_origin(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let host = parsed.host_str()?;
    match parsed.port() {
        Some(port) => Some(format!("{}://{}:{}", parsed.scheme(), host, port)),
        None => Some(format!("{}://{}", parsed.scheme(), host)),
    }
}

fn same_host(url: &str, header_value: &str) -> bool {
    let target = Url::parse(url).ok().and_then(|u| u.host_str().map(str::to_string));
    let value = Url::parse(header_value)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string));
    match (target, value) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

fn encode_spaces(url: &str) -> String {
    if url.contains(' ') {
        url.replace(' ', "%20")
    } else {
        url.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EgressConfig;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn extractor() -> GenericExtractor {
        GenericExtractor::new(ClientPool::new(&EgressConfig::default()))
    }

    #[test]
    fn base_headers_carry_origin_for_plain_urls() {
        let headers =
            GenericExtractor::build_request_headers("https://origin.example:8443/pl.m3u8", &HashMap::new());
        assert_eq!(headers["referer"], "https://origin.example:8443");
        assert_eq!(headers["origin"], "https://origin.example:8443");
        assert_eq!(headers["user-agent"], DEFAULT_USER_AGENT);
    }

    #[test]
    fn redirector_gets_neutral_referer_and_no_origin() {
        let headers = GenericExtractor::build_request_headers(
            "https://r.example/resolve/42",
            &HashMap::new(),
        );
        assert_eq!(headers["referer"], NEUTRAL_REFERER);
        assert!(!headers.contains_key("origin"));
    }

    #[test]
    fn user_agent_requires_browser_marker() {
        let mut caller = HashMap::new();
        caller.insert("User-Agent".to_string(), "curl/8.5".to_string());
        let headers = GenericExtractor::build_request_headers("https://x.example/a", &caller);
        assert_eq!(headers["user-agent"], DEFAULT_USER_AGENT);

        caller.insert(
            "User-Agent".to_string(),
            "Mozilla/5.0 AppleWebKit/537.36 Chrome/120".to_string(),
        );
        let headers = GenericExtractor::build_request_headers("https://x.example/a", &caller);
        assert!(headers["user-agent"].contains("Chrome/120"));
    }

    #[test]
    fn ip_revealing_headers_are_never_forwarded() {
        let mut caller = HashMap::new();
        caller.insert("X-Forwarded-For".to_string(), "1.2.3.4".to_string());
        caller.insert("X-Real-IP".to_string(), "1.2.3.4".to_string());
        caller.insert("Forwarded".to_string(), "for=1.2.3.4".to_string());
        caller.insert("Via".to_string(), "1.1 edge".to_string());
        caller.insert("Authorization".to_string(), "Bearer tok".to_string());

        let headers = GenericExtractor::build_request_headers("https://x.example/a", &caller);
        for name in IP_LEAK_HEADERS {
            assert!(!headers.contains_key(name), "{name} must be stripped");
        }
        assert_eq!(headers["authorization"], "Bearer tok");
    }

    #[test]
    fn unrelated_referer_dropped_for_redirector() {
        let mut caller = HashMap::new();
        caller.insert(
            "Referer".to_string(),
            "https://some-other-provider.example/live".to_string(),
        );
        let headers = GenericExtractor::build_request_headers(
            "https://r.example/resolve/42",
            &caller,
        );
        assert_eq!(headers["referer"], NEUTRAL_REFERER);

        // The same referer toward a non-redirector target is kept.
        let headers = GenericExtractor::build_request_headers("https://cdn.example/a.ts", &caller);
        assert_eq!(headers["referer"], "https://some-other-provider.example/live");
    }

    #[tokio::test]
    async fn redirector_handshake_resolves_single_hop() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/resolve/stream1"))
            .respond_with(
                ResponseTemplate::new(302)
                    .insert_header("Location", "https://o.example/final.m3u8"),
            )
            .expect(1)
            .mount(&server)
            .await;

        let url = format!("{}/resolve/stream1", server.uri());
        let descriptor = extractor()
            .extract(&url, &HashMap::new(), false)
            .await
            .unwrap();

        assert_eq!(descriptor.destination_url, "https://o.example/final.m3u8");
        assert_eq!(descriptor.endpoint_kind, EndpointKind::HlsProxy);
        assert_eq!(descriptor.request_headers["referer"], NEUTRAL_REFERER);
        assert_eq!(descriptor.request_headers["user-agent"], DEFAULT_USER_AGENT);
    }

    #[tokio::test]
    async fn relative_location_is_made_absolute() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/resolve/stream2"))
            .respond_with(ResponseTemplate::new(301).insert_header("Location", "/hls/live.m3u8"))
            .mount(&server)
            .await;

        let url = format!("{}/resolve/stream2", server.uri());
        let descriptor = extractor()
            .extract(&url, &HashMap::new(), false)
            .await
            .unwrap();

        assert_eq!(
            descriptor.destination_url,
            format!("{}/hls/live.m3u8", server.uri())
        );
    }

    #[tokio::test]
    async fn non_redirect_answer_falls_through_to_passthrough() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/resolve/stream3"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let url = format!("{}/resolve/stream3", server.uri());
        let descriptor = extractor()
            .extract(&url, &HashMap::new(), false)
            .await
            .unwrap();

        assert_eq!(descriptor.destination_url, url);
    }

    #[test]
    fn plain_urls_skip_the_handshake() {
        // No server: extract on a non-redirector URL must not touch the
        // network at all.
        let descriptor = futures_executor_block_on(async {
            extractor()
                .extract("https://o.example/pl.m3u8", &HashMap::new(), false)
                .await
                .unwrap()
        });
        assert_eq!(descriptor.destination_url, "https://o.example/pl.m3u8");
    }

    fn futures_executor_block_on<F: std::future::Future>(fut: F) -> F::Output {
        tokio::runtime::Builder::new_current_thread()
            .build()
            .expect("runtime")
            .block_on(fut)
    }
}
