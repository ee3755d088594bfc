// Extractor Registry
//
// Factory-based registry for extractor instances. Dispatch runs in three
// steps: explicit host hint, URL-substring table, generic fallback.
// Instances are memoized per key for the process lifetime.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;

use super::error::ExtractorError;
use super::generic::GenericExtractor;
use super::traits::{Extractor, StreamDescriptor};
use crate::client::ClientPool;

/// Extractor factory function type
pub type ExtractorFactory = Box<dyn Fn(&ClientPool) -> Arc<dyn Extractor> + Send + Sync>;

pub const GENERIC_KEY: &str = "generic";

pub struct ExtractorRegistry {
    pool: ClientPool,
    /// Registered factories by host-family key
    factories: HashMap<String, ExtractorFactory>,
    /// Ordered URL-substring dispatch table: `(pattern, key)`
    dispatch: Vec<(String, String)>,
    /// Host-hint aliases (e.g. "daddylive" → "dlhd")
    aliases: HashMap<String, String>,
    /// Memoized instances by key
    instances: DashMap<String, Arc<dyn Extractor>>,
}

impl ExtractorRegistry {
    /// Create a registry with the generic extractor pre-registered.
    #[must_use]
    pub fn new(pool: ClientPool) -> Self {
        let mut registry = Self {
            pool,
            factories: HashMap::new(),
            dispatch: Vec::new(),
            aliases: HashMap::new(),
            instances: DashMap::new(),
        };
        registry.register(
            GENERIC_KEY,
            Box::new(|pool| Arc::new(GenericExtractor::new(pool.clone()))),
        );
        registry
    }

    /// Register an extractor factory under a host-family key.
    pub fn register(&mut self, key: &str, factory: ExtractorFactory) {
        self.factories.insert(key.to_string(), factory);
    }

    /// Add a URL-substring dispatch rule. Order of registration is the
    /// match order.
    pub fn register_pattern(&mut self, pattern: &str, key: &str) {
        self.dispatch.push((pattern.to_string(), key.to_string()));
    }

    /// Add a host-hint alias resolving to a registered key.
    pub fn register_alias(&mut self, alias: &str, key: &str) {
        self.aliases.insert(alias.to_string(), key.to_string());
    }

    /// Select an extractor for `url`, optionally forced via `host_hint`.
    pub fn select(
        &self,
        url: &str,
        host_hint: Option<&str>,
    ) -> Result<Arc<dyn Extractor>, ExtractorError> {
        if let Some(hint) = host_hint {
            let hint = hint.to_lowercase();
            let key = self.aliases.get(&hint).map_or(hint.as_str(), String::as_str);
            return self.instance(key);
        }

        for (pattern, key) in &self.dispatch {
            if url.contains(pattern.as_str()) {
                return self.instance(key);
            }
        }

        self.instance(GENERIC_KEY)
    }

    /// Resolve `url` into a stream descriptor, retrying once with
    /// `force_refresh=true` when the first attempt fails.
    pub async fn resolve(
        &self,
        url: &str,
        request_headers: &HashMap<String, String>,
        host_hint: Option<&str>,
        force_refresh: bool,
    ) -> Result<StreamDescriptor, ExtractorError> {
        let extractor = self.select(url, host_hint)?;

        match extractor.extract(url, request_headers, force_refresh).await {
            Ok(descriptor) => Ok(descriptor),
            Err(err) => {
                tracing::warn!(
                    extractor = extractor.name(),
                    "Extraction failed, retrying with forced refresh: {err}"
                );
                extractor.extract(url, request_headers, true).await
            }
        }
    }

    /// Invalidate cached state for `url` on the extractor that owns it.
    pub async fn invalidate(&self, url: &str) {
        if let Ok(extractor) = self.select(url, None) {
            extractor.invalidate(url).await;
        }
    }

    /// Keys of all instantiated extractors.
    #[must_use]
    pub fn loaded_keys(&self) -> Vec<String> {
        self.instances.iter().map(|e| e.key().clone()).collect()
    }

    /// Release all extractor instances on shutdown.
    pub async fn close_all(&self) {
        for entry in self.instances.iter() {
            entry.value().close().await;
        }
        self.instances.clear();
    }

    fn instance(&self, key: &str) -> Result<Arc<dyn Extractor>, ExtractorError> {
        if let Some(existing) = self.instances.get(key) {
            return Ok(existing.clone());
        }

        let factory = self
            .factories
            .get(key)
            .ok_or_else(|| ExtractorError::UnknownKey(key.to_string()))?;
        let instance = factory(&self.pool);
        self.instances.insert(key.to_string(), instance.clone());
        Ok(instance)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::config::EgressConfig;
    use crate::extractor::traits::EndpointKind;
    use async_trait::async_trait;

    struct FlakyExtractor {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Extractor for FlakyExtractor {
        fn name(&self) -> &'static str {
            "flaky"
        }

        async fn extract(
            &self,
            url: &str,
            _request_headers: &HashMap<String, String>,
            force_refresh: bool,
        ) -> Result<StreamDescriptor, ExtractorError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call == 0 {
                return Err(ExtractorError::Failed("stale cache".to_string()));
            }
            assert!(force_refresh, "retry must force a refresh");
            Ok(StreamDescriptor {
                destination_url: url.to_string(),
                request_headers: HashMap::new(),
                endpoint_kind: EndpointKind::HlsProxy,
            })
        }
    }

    fn registry() -> ExtractorRegistry {
        let pool = ClientPool::new(&EgressConfig::default());
        ExtractorRegistry::new(pool)
    }

    #[tokio::test]
    async fn unknown_url_dispatches_to_generic() {
        let registry = registry();
        let extractor = registry.select("https://nobody-knows.example/x", None).unwrap();
        assert_eq!(extractor.name(), "generic");
    }

    #[tokio::test]
    async fn pattern_dispatch_and_memoization() {
        let mut registry = registry();
        registry.register(
            "flaky",
            Box::new(|_| {
                Arc::new(FlakyExtractor {
                    calls: AtomicUsize::new(1),
                })
            }),
        );
        registry.register_pattern("flaky.example", "flaky");

        let first = registry.select("https://flaky.example/ch/1", None).unwrap();
        let second = registry.select("https://flaky.example/ch/2", None).unwrap();
        assert_eq!(first.name(), "flaky");
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn host_hint_overrides_dispatch_and_aliases_resolve() {
        let mut registry = registry();
        registry.register(
            "flaky",
            Box::new(|_| {
                Arc::new(FlakyExtractor {
                    calls: AtomicUsize::new(1),
                })
            }),
        );
        registry.register_alias("flk", "flaky");

        let by_alias = registry.select("https://unrelated.org/", Some("FLK")).unwrap();
        assert_eq!(by_alias.name(), "flaky");

        let unknown = registry.select("https://unrelated.org/", Some("nope"));
        assert!(matches!(unknown, Err(ExtractorError::UnknownKey(_))));
    }

    #[tokio::test]
    async fn resolve_retries_once_with_forced_refresh() {
        let mut registry = registry();
        registry.register(
            "flaky",
            Box::new(|_| {
                Arc::new(FlakyExtractor {
                    calls: AtomicUsize::new(0),
                })
            }),
        );
        registry.register_pattern("flaky.example", "flaky");

        let descriptor = registry
            .resolve("https://flaky.example/ch/1", &HashMap::new(), None, false)
            .await
            .unwrap();
        assert_eq!(descriptor.destination_url, "https://flaky.example/ch/1");
    }
}
