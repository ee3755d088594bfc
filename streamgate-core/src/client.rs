//! Outbound HTTP client pool
//!
//! Clients are cached per outbound proxy (plus TLS policy) and reused across
//! requests; `direct` is a distinguished key. Callers never close a
//! pool-owned client — `reqwest::Client` is reference-counted and the pool
//! keeps the canonical handle for the process lifetime.

use std::time::Duration;

use dashmap::DashMap;

use crate::config::EgressConfig;
use crate::routing::{self, TransportRoute};

const DEFAULT_TOTAL_TIMEOUT: Duration = Duration::from_secs(30);
const KEEP_ALIVE: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum PoolKey {
    Direct { insecure: bool },
    Proxied { uri: String, insecure: bool },
}

#[derive(Clone)]
pub struct ClientPool {
    clients: std::sync::Arc<DashMap<PoolKey, reqwest::Client>>,
    routes: std::sync::Arc<Vec<TransportRoute>>,
    global_proxies: std::sync::Arc<Vec<String>>,
}

impl ClientPool {
    #[must_use]
    pub fn new(egress: &EgressConfig) -> Self {
        Self {
            clients: std::sync::Arc::new(DashMap::new()),
            routes: std::sync::Arc::new(egress.routes.clone()),
            global_proxies: std::sync::Arc::new(egress.global_proxies.clone()),
        }
    }

    #[must_use]
    pub fn routes(&self) -> &[TransportRoute] {
        &self.routes
    }

    #[must_use]
    pub fn global_proxies(&self) -> &[String] {
        &self.global_proxies
    }

    /// Resolve the egress policy for `url` and return a client honoring it.
    ///
    /// A failure to construct a proxied client falls back to the direct
    /// client rather than surfacing an error.
    #[must_use]
    pub fn acquire(&self, url: &str) -> reqwest::Client {
        let proxy = routing::resolve_proxy(url, &self.routes, &self.global_proxies);
        let insecure = routing::resolve_tls(url, &self.routes);
        self.client_for(proxy.as_deref(), insecure)
    }

    /// The direct, certificate-verifying client.
    #[must_use]
    pub fn direct(&self) -> reqwest::Client {
        self.client_for(None, false)
    }

    /// TLS-verification policy for `url` per the route table.
    #[must_use]
    pub fn tls_disabled_for(&self, url: &str) -> bool {
        routing::resolve_tls(url, &self.routes)
    }

    fn client_for(&self, proxy: Option<&str>, insecure: bool) -> reqwest::Client {
        let key = match proxy {
            Some(uri) => PoolKey::Proxied {
                uri: uri.to_string(),
                insecure,
            },
            None => PoolKey::Direct { insecure },
        };

        if let Some(cached) = self.clients.get(&key) {
            return cached.clone();
        }

        match build_client(proxy, insecure) {
            Ok(client) => {
                self.clients.insert(key, client.clone());
                client
            }
            Err(err) => {
                tracing::warn!(
                    proxy = proxy.unwrap_or("direct"),
                    "Failed to build outbound client ({err}), falling back to direct"
                );
                let direct_key = PoolKey::Direct { insecure: false };
                if let Some(cached) = self.clients.get(&direct_key) {
                    return cached.clone();
                }
                let client = build_client(None, false)
                    .unwrap_or_else(|_| reqwest::Client::new());
                self.clients.insert(direct_key, client.clone());
                client
            }
        }
    }
}

/// Construct a client: 30 s total timeout, 60 s idle keep-alive, no
/// per-host connection limit (reqwest default), proxy and TLS policy as
/// requested. HTTP(S) and SOCKS5 proxy URIs are both accepted.
fn build_client(proxy: Option<&str>, insecure: bool) -> reqwest::Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .timeout(DEFAULT_TOTAL_TIMEOUT)
        .pool_idle_timeout(KEEP_ALIVE);

    if insecure {
        builder = builder.danger_accept_invalid_certs(true);
    }

    if let Some(uri) = proxy {
        builder = builder.proxy(reqwest::Proxy::all(uri)?);
    }

    builder.build()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool_with(routes: Vec<TransportRoute>, proxies: Vec<String>) -> ClientPool {
        ClientPool::new(&EgressConfig {
            global_proxies: proxies,
            routes,
        })
    }

    #[test]
    fn direct_client_is_cached() {
        let pool = pool_with(Vec::new(), Vec::new());
        let _ = pool.acquire("https://example.org/x");
        let _ = pool.acquire("https://example.org/y");
        assert_eq!(pool.clients.len(), 1);
    }

    #[test]
    fn proxied_and_direct_use_distinct_keys() {
        let routes = vec![TransportRoute {
            url_pattern: "proxied.example".to_string(),
            proxy: Some("http://127.0.0.1:3128".to_string()),
            disable_tls_verify: false,
        }];
        let pool = pool_with(routes, Vec::new());
        let _ = pool.acquire("https://proxied.example/a");
        let _ = pool.acquire("https://open.example/b");
        assert_eq!(pool.clients.len(), 2);
    }

    #[test]
    fn invalid_proxy_uri_falls_back_to_direct() {
        let routes = vec![TransportRoute {
            url_pattern: "broken.example".to_string(),
            proxy: Some("not a proxy uri".to_string()),
            disable_tls_verify: false,
        }];
        let pool = pool_with(routes, Vec::new());
        // Must not panic; the direct client is returned and cached.
        let _ = pool.acquire("https://broken.example/a");
        assert_eq!(pool.clients.len(), 1);
    }

    #[test]
    fn tls_policy_separates_cache_entries() {
        let routes = vec![TransportRoute {
            url_pattern: "insecure.example".to_string(),
            proxy: None,
            disable_tls_verify: true,
        }];
        let pool = pool_with(routes, Vec::new());
        let _ = pool.acquire("https://insecure.example/a");
        let _ = pool.acquire("https://normal.example/a");
        assert_eq!(pool.clients.len(), 2);
    }
}
