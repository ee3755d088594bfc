// Upstream header hygiene
//
// Every outbound request goes through these helpers: IP-revealing headers
// are dropped, critical names are canonicalized, redirector targets never
// see Range or cache validators, and a browser User-Agent is injected when
// none survived.

use std::collections::HashMap;

use axum::http::HeaderMap;
use streamgate_core::extractor::generic::{is_redirector, DEFAULT_USER_AGENT, IP_LEAK_HEADERS};
use url::Url;

/// Canonical casing applied to headers whose spelling upstreams care about.
const CANONICAL: [(&str, &str); 5] = [
    ("user-agent", "User-Agent"),
    ("referer", "Referer"),
    ("origin", "Origin"),
    ("authorization", "Authorization"),
    ("cookie", "Cookie"),
];

/// Extract forwarded headers from `h_*` query parameters. `hyphenate`
/// converts underscores in the name to hyphens (key/license/decrypt
/// endpoints, where names like `h_User_Agent` arrive flattened).
#[must_use]
pub fn h_params(query: &HashMap<String, String>, hyphenate: bool) -> HashMap<String, String> {
    let mut headers = HashMap::new();
    for (name, value) in query {
        if let Some(header_name) = name.strip_prefix("h_") {
            let header_name = if hyphenate {
                header_name.replace('_', "-")
            } else {
                header_name.to_string()
            };
            headers.insert(header_name, value.clone());
        }
    }
    headers
}

/// Overlay `h_*` parameters onto extractor-produced headers. The query
/// parameters always win; existing keys differing only in case are
/// replaced.
pub fn apply_h_overrides(
    headers: &mut HashMap<String, String>,
    query: &HashMap<String, String>,
) {
    for (name, value) in h_params(query, false) {
        headers.retain(|existing, _| !existing.eq_ignore_ascii_case(&name));
        headers.insert(name, value);
    }
}

/// Pick the safe subset of the client's own request headers. Referer and
/// Origin are dropped when they point at a host unrelated to a redirector
/// target (leakage from a previous stream).
#[must_use]
pub fn client_headers(headers: &HeaderMap, target_url: &str) -> HashMap<String, String> {
    let mut picked = HashMap::new();
    for name in ["User-Agent", "Referer", "Origin", "Cookie", "Authorization"] {
        let Some(value) = headers.get(name).and_then(|v| v.to_str().ok()) else {
            continue;
        };
        if matches!(name, "Referer" | "Origin") && is_redirector(target_url) {
            let target_host = Url::parse(target_url)
                .ok()
                .and_then(|u| u.host_str().map(str::to_string));
            let value_host = Url::parse(value)
                .ok()
                .and_then(|u| u.host_str().map(str::to_string));
            if let (Some(target_host), Some(value_host)) = (target_host, value_host) {
                if target_host != value_host {
                    tracing::debug!("Stripping unrelated {name} toward redirector");
                    continue;
                }
            }
        }
        picked.insert(name.to_string(), value.to_string());
    }
    picked
}

/// Forward the client's Range and cache-validator headers, except toward
/// redirectors, which often fail on them.
pub fn forward_range_headers(
    upstream: &mut HashMap<String, String>,
    client: &HeaderMap,
    target_url: &str,
) {
    if is_redirector(target_url) {
        tracing::info!("Stripping Range/validator headers for redirector target");
        return;
    }
    for name in ["range", "if-none-match", "if-modified-since"] {
        if let Some(value) = client.get(name).and_then(|v| v.to_str().ok()) {
            upstream.insert(name.to_string(), value.to_string());
        }
    }
}

/// Final hygiene before any upstream request: drop IP-revealing headers,
/// canonicalize the critical names, inject the default User-Agent.
pub fn sanitize_upstream_headers(headers: &mut HashMap<String, String>) {
    headers.retain(|name, _| {
        !IP_LEAK_HEADERS
            .iter()
            .any(|leak| name.eq_ignore_ascii_case(leak))
    });

    for (lower, canonical) in CANONICAL {
        let found: Vec<String> = headers
            .keys()
            .filter(|k| k.eq_ignore_ascii_case(lower) && k.as_str() != canonical)
            .cloned()
            .collect();
        for key in found {
            if let Some(value) = headers.remove(&key) {
                headers.insert(canonical.to_string(), value);
            }
        }
    }

    if !headers.keys().any(|k| k.eq_ignore_ascii_case("user-agent")) {
        headers.insert("User-Agent".to_string(), DEFAULT_USER_AGENT.to_string());
    }
}

/// Public base URL of this proxy as seen by the client, honoring
/// `X-Forwarded-Proto` / `X-Forwarded-Host` from a fronting reverse proxy.
#[must_use]
pub fn proxy_base(headers: &HeaderMap) -> String {
    let scheme = headers
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("http");
    let host = headers
        .get("x-forwarded-host")
        .or_else(|| headers.get("host"))
        .and_then(|v| v.to_str().ok())
        .unwrap_or("localhost");
    format!("{scheme}://{host}")
}

/// Build the `&h_*=…[&api_password=…]` query suffix propagated into
/// generated playlists. Sorted for deterministic output.
#[must_use]
pub fn query_suffix(headers: &HashMap<String, String>, api_password: Option<&str>) -> String {
    let mut names: Vec<&String> = headers.keys().collect();
    names.sort();

    let mut suffix = String::new();
    for name in names {
        suffix.push_str("&h_");
        suffix.push_str(&streamgate_proxy::encode_query_value(name));
        suffix.push('=');
        suffix.push_str(&streamgate_proxy::encode_query_value(&headers[name]));
    }
    if let Some(password) = api_password {
        suffix.push_str("&api_password=");
        suffix.push_str(&streamgate_proxy::encode_query_value(password));
    }
    suffix
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn h_params_extraction_and_hyphenation() {
        let mut query = HashMap::new();
        query.insert("h_Referer".to_string(), "https://r.example/".to_string());
        query.insert("h_User_Agent".to_string(), "UA".to_string());
        query.insert("d".to_string(), "ignored".to_string());

        let plain = h_params(&query, false);
        assert_eq!(plain["Referer"], "https://r.example/");
        assert_eq!(plain["User_Agent"], "UA");

        let hyphenated = h_params(&query, true);
        assert_eq!(hyphenated["User-Agent"], "UA");
    }

    #[test]
    fn overrides_replace_case_insensitive_duplicates() {
        let mut headers = HashMap::new();
        headers.insert("referer".to_string(), "https://old.example/".to_string());

        let mut query = HashMap::new();
        query.insert("h_Referer".to_string(), "https://new.example/".to_string());
        apply_h_overrides(&mut headers, &query);

        assert_eq!(headers.len(), 1);
        assert_eq!(headers["Referer"], "https://new.example/");
    }

    #[test]
    fn sanitize_strips_ip_leaks_regardless_of_casing() {
        let mut headers = HashMap::new();
        headers.insert("X-Forwarded-For".to_string(), "1.2.3.4".to_string());
        headers.insert("x-real-ip".to_string(), "1.2.3.4".to_string());
        headers.insert("FORWARDED".to_string(), "for=1.2.3.4".to_string());
        headers.insert("Via".to_string(), "1.1 edge".to_string());
        headers.insert("cookie".to_string(), "sid=1".to_string());

        sanitize_upstream_headers(&mut headers);

        assert!(!headers.keys().any(|k| k.to_lowercase().contains("forward")));
        assert!(!headers.contains_key("x-real-ip"));
        assert!(!headers.keys().any(|k| k.eq_ignore_ascii_case("via")));
        assert_eq!(headers["Cookie"], "sid=1");
        assert_eq!(headers["User-Agent"], DEFAULT_USER_AGENT);
    }

    #[test]
    fn sanitize_canonicalizes_critical_names() {
        let mut headers = HashMap::new();
        headers.insert("user-agent".to_string(), "Chrome UA".to_string());
        headers.insert("ORIGIN".to_string(), "https://o.example".to_string());

        sanitize_upstream_headers(&mut headers);
        assert_eq!(headers["User-Agent"], "Chrome UA");
        assert_eq!(headers["Origin"], "https://o.example");
        assert!(!headers.contains_key("user-agent"));
    }

    #[test]
    fn range_headers_skipped_for_redirectors() {
        let mut client = HeaderMap::new();
        client.insert("range", "bytes=0-100".parse().unwrap());
        client.insert("if-none-match", "\"abc\"".parse().unwrap());

        let mut upstream = HashMap::new();
        forward_range_headers(&mut upstream, &client, "https://cdn.example/seg.ts");
        assert_eq!(upstream["range"], "bytes=0-100");

        let mut upstream = HashMap::new();
        forward_range_headers(&mut upstream, &client, "https://r.example/resolve/1");
        assert!(upstream.is_empty());
    }

    #[test]
    fn proxy_base_honors_forwarded_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("host", "internal:7860".parse().unwrap());
        assert_eq!(proxy_base(&headers), "http://internal:7860");

        headers.insert("x-forwarded-proto", "https".parse().unwrap());
        headers.insert("x-forwarded-host", "proxy.example".parse().unwrap());
        assert_eq!(proxy_base(&headers), "https://proxy.example");
    }

    #[test]
    fn query_suffix_is_sorted_and_encoded() {
        let mut headers = HashMap::new();
        headers.insert("referer".to_string(), "https://o.example/".to_string());
        headers.insert("authorization".to_string(), "Bearer a/b".to_string());

        let suffix = query_suffix(&headers, Some("pw"));
        assert_eq!(
            suffix,
            "&h_authorization=Bearer%20a%2Fb&h_referer=https%3A%2F%2Fo.example%2F&api_password=pw"
        );
    }
}
