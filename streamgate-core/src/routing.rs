//! Egress routing
//!
//! Resolves the outbound proxy and TLS-verification policy for a destination
//! URL from the ordered `TRANSPORT_ROUTES` table and the global proxy pool.

use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

/// A single transport route rule.
///
/// `url_pattern` is a case-sensitive substring test against the full
/// destination URL. The first matching rule wins.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportRoute {
    pub url_pattern: String,
    /// Outbound proxy URI for matching destinations; `None` forces a direct
    /// connection even when a global pool is configured.
    pub proxy: Option<String>,
    #[serde(default)]
    pub disable_tls_verify: bool,
}

/// Resolve the outbound proxy for `url`.
///
/// First route whose pattern is a substring of `url` decides: its proxy, or
/// direct when the route carries none. Without a match, a uniform-random
/// member of the global pool is used; an empty pool means direct.
#[must_use]
pub fn resolve_proxy(url: &str, routes: &[TransportRoute], pool: &[String]) -> Option<String> {
    if url.is_empty() {
        return None;
    }

    for route in routes {
        if url.contains(&route.url_pattern) {
            return route.proxy.clone();
        }
    }

    pool.choose(&mut rand::thread_rng()).cloned()
}

/// Resolve the TLS-verification policy for `url` with the same matcher.
/// Returns `true` when certificate verification must be disabled.
#[must_use]
pub fn resolve_tls(url: &str, routes: &[TransportRoute]) -> bool {
    if url.is_empty() {
        return false;
    }

    for route in routes {
        if url.contains(&route.url_pattern) {
            return route.disable_tls_verify;
        }
    }

    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route(pattern: &str, proxy: Option<&str>, disable_tls: bool) -> TransportRoute {
        TransportRoute {
            url_pattern: pattern.to_string(),
            proxy: proxy.map(str::to_string),
            disable_tls_verify: disable_tls,
        }
    }

    #[test]
    fn first_matching_route_wins() {
        let routes = vec![
            route("cdn.example", Some("socks5://first:1080"), false),
            route("example", Some("socks5://second:1080"), false),
        ];
        assert_eq!(
            resolve_proxy("https://cdn.example/seg.ts", &routes, &[]),
            Some("socks5://first:1080".to_string())
        );
        assert_eq!(
            resolve_proxy("https://www.example/pl.m3u8", &routes, &[]),
            Some("socks5://second:1080".to_string())
        );
    }

    #[test]
    fn matching_route_without_proxy_forces_direct() {
        let routes = vec![route("direct.example", None, false)];
        let pool = vec!["http://pool:8080".to_string()];
        assert_eq!(
            resolve_proxy("https://direct.example/x", &routes, &pool),
            None
        );
    }

    #[test]
    fn no_match_falls_back_to_pool_member() {
        let routes = vec![route("other.example", Some("http://p:1"), false)];
        let pool = vec!["http://a:1".to_string(), "http://b:2".to_string()];
        // Any outcome must be a member of the pool, never an unrelated string.
        for _ in 0..20 {
            let picked = resolve_proxy("https://unrelated.org/x", &routes, &pool)
                .expect("non-empty pool must yield a proxy");
            assert!(pool.contains(&picked));
        }
    }

    #[test]
    fn empty_pool_and_no_match_is_direct() {
        assert_eq!(resolve_proxy("https://x.org/", &[], &[]), None);
    }

    #[test]
    fn empty_url_is_direct_and_verified() {
        let routes = vec![route("", Some("http://p:1"), true)];
        let pool = vec!["http://a:1".to_string()];
        assert_eq!(resolve_proxy("", &routes, &pool), None);
        assert!(!resolve_tls("", &routes));
    }

    #[test]
    fn tls_policy_uses_same_matcher() {
        let routes = vec![
            route("insecure.example", None, true),
            route("example", None, false),
        ];
        assert!(resolve_tls("https://insecure.example/a", &routes));
        assert!(!resolve_tls("https://ok.example/a", &routes));
        assert!(!resolve_tls("https://elsewhere.org/a", &routes));
    }

    #[test]
    fn matching_is_case_sensitive() {
        let routes = vec![route("CDN.Example", Some("http://p:1"), false)];
        assert_eq!(resolve_proxy("https://cdn.example/x", &routes, &[]), None);
    }
}
