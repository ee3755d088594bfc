//! Segment pipeline
//!
//! Fetches media segments, optionally decrypts (CENC ClearKey) and remuxes
//! them, caches the results, and prefetches the successors of a served
//! segment in the background.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::LazyLock;
use std::time::{Duration, Instant};

use bytes::Bytes;
use moka::future::Cache;
use parking_lot::Mutex;
use regex::Regex;
use streamgate_core::{ClientPool, Error, Result};
use url::Url;

use crate::{cenc, remux};

pub const SEGMENT_CACHE_TTL: Duration = Duration::from_secs(30);
pub const SEGMENT_CACHE_CAPACITY: usize = 50;
const SEGMENT_CACHE_EVICTION_BATCH: usize = 20;

const INIT_FETCH_TIMEOUT: Duration = Duration::from_secs(10);
const MEDIA_FETCH_TIMEOUT: Duration = Duration::from_secs(15);

/// How many successor segments are prefetched after a cache miss.
const PREFETCH_DEPTH: u64 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SegmentVariant {
    /// Decrypted fMP4 as produced by the decryptor.
    Raw,
    /// Remuxed MPEG-TS (or the served fallback bytes).
    Ts,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SegmentCacheKey {
    pub url: String,
    pub key_id: String,
    pub variant: SegmentVariant,
}

#[derive(Clone)]
pub struct CachedSegment {
    pub bytes: Bytes,
    pub content_type: &'static str,
}

/// TTL+capacity segment cache: 30 s entries, 50 slots, the 20 oldest
/// evicted on overflow.
#[derive(Default)]
pub struct SegmentCache {
    entries: Mutex<HashMap<SegmentCacheKey, (CachedSegment, Instant)>>,
}

impl SegmentCache {
    pub fn get(&self, key: &SegmentCacheKey) -> Option<CachedSegment> {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some((segment, inserted)) if inserted.elapsed() < SEGMENT_CACHE_TTL => {
                Some(segment.clone())
            }
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    pub fn contains(&self, key: &SegmentCacheKey) -> bool {
        self.get(key).is_some()
    }

    pub fn insert(&self, key: SegmentCacheKey, segment: CachedSegment) {
        self.insert_at(key, segment, Instant::now());
    }

    fn insert_at(&self, key: SegmentCacheKey, segment: CachedSegment, when: Instant) {
        let mut entries = self.entries.lock();
        entries.insert(key, (segment, when));

        if entries.len() > SEGMENT_CACHE_CAPACITY {
            let mut by_age: Vec<(SegmentCacheKey, Instant)> = entries
                .iter()
                .map(|(k, (_, at))| (k.clone(), *at))
                .collect();
            by_age.sort_by_key(|(_, at)| *at);
            for (old, _) in by_age.into_iter().take(SEGMENT_CACHE_EVICTION_BATCH) {
                entries.remove(&old);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One CENC decrypt request.
#[derive(Debug, Clone)]
pub struct DecryptJob {
    pub url: String,
    pub init_url: Option<String>,
    pub key_id: String,
    pub key: String,
    /// Concatenate init+segment without decrypting (null-key streams).
    pub skip_decrypt: bool,
    pub headers: HashMap<String, String>,
}

struct Inner {
    pool: ClientPool,
    /// Init segments are small, few per stream, and immutable.
    init_cache: Cache<String, Bytes>,
    segments: SegmentCache,
    pending_prefetch: Mutex<HashSet<SegmentCacheKey>>,
}

#[derive(Clone)]
pub struct SegmentPipeline {
    inner: Arc<Inner>,
}

impl SegmentPipeline {
    #[must_use]
    pub fn new(pool: ClientPool) -> Self {
        Self {
            inner: Arc::new(Inner {
                pool,
                init_cache: Cache::builder().max_capacity(1024).build(),
                segments: SegmentCache::default(),
                pending_prefetch: Mutex::new(HashSet::new()),
            }),
        }
    }

    #[must_use]
    pub fn segment_cache(&self) -> &SegmentCache {
        &self.inner.segments
    }

    /// Serve a CENC segment: cache probe, parallel init+media fetch,
    /// off-thread decrypt, remux with raw-fMP4 fallback, cache insert and
    /// successor prefetch.
    pub async fn serve_decrypted(&self, job: DecryptJob) -> Result<CachedSegment> {
        let ts_key = SegmentCacheKey {
            url: job.url.clone(),
            key_id: job.key_id.clone(),
            variant: SegmentVariant::Ts,
        };
        if let Some(cached) = self.inner.segments.get(&ts_key) {
            tracing::info!("Segment cache hit: {}", tail(&job.url));
            return Ok(cached);
        }

        let raw_key = SegmentCacheKey {
            url: job.url.clone(),
            key_id: job.key_id.clone(),
            variant: SegmentVariant::Raw,
        };
        let decrypted = if let Some(prefetched) = self.inner.segments.get(&raw_key) {
            tracing::debug!("Prefetched segment available: {}", tail(&job.url));
            prefetched.bytes
        } else {
            self.download_and_decrypt(&job).await?
        };

        let served = match remux::remux_to_ts(decrypted.clone()).await {
            Some(ts) => CachedSegment {
                bytes: ts,
                content_type: "video/MP2T",
            },
            None => {
                tracing::warn!("Remux failed, serving raw fMP4");
                CachedSegment {
                    bytes: decrypted,
                    content_type: "video/mp4",
                }
            }
        };

        self.inner.segments.insert(ts_key, served.clone());
        self.spawn_prefetch(&job);
        Ok(served)
    }

    /// Fetch init and media in parallel and run the decryptor off-thread.
    async fn download_and_decrypt(&self, job: &DecryptJob) -> Result<Bytes> {
        let (init, media) = tokio::join!(
            self.fetch_init(job.init_url.as_deref(), &job.headers),
            self.fetch_bytes(&job.url, &job.headers, MEDIA_FETCH_TIMEOUT),
        );
        let init = init?;
        let media = media?;

        if job.skip_decrypt {
            let mut combined = Vec::with_capacity(init.len() + media.len());
            combined.extend_from_slice(&init);
            combined.extend_from_slice(&media);
            return Ok(Bytes::from(combined));
        }

        let key_id = job.key_id.clone();
        let key = job.key.clone();
        let decrypted = tokio::task::spawn_blocking(move || {
            cenc::decrypt_segment(&init, &media, &key_id, &key)
        })
        .await
        .map_err(|e| Error::Internal(format!("decrypt task panicked: {e}")))?
        .map_err(|e| Error::Decrypt(e.to_string()))?;

        Ok(Bytes::from(decrypted))
    }

    async fn fetch_init(
        &self,
        init_url: Option<&str>,
        headers: &HashMap<String, String>,
    ) -> Result<Bytes> {
        let Some(init_url) = init_url else {
            return Ok(Bytes::new());
        };
        if let Some(cached) = self.inner.init_cache.get(init_url).await {
            return Ok(cached);
        }

        let bytes = self
            .fetch_bytes(init_url, headers, INIT_FETCH_TIMEOUT)
            .await?;
        self.inner
            .init_cache
            .insert(init_url.to_string(), bytes.clone())
            .await;
        Ok(bytes)
    }

    async fn fetch_bytes(
        &self,
        url: &str,
        headers: &HashMap<String, String>,
        timeout: Duration,
    ) -> Result<Bytes> {
        let client = self.inner.pool.acquire(url);
        let mut request = client.get(url).timeout(timeout);
        for (name, value) in headers {
            request = request.header(name.as_str(), value.as_str());
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::UpstreamConnection(format!(
                "segment fetch returned {status} for {url}"
            )));
        }
        Ok(response.bytes().await?)
    }

    /// Enqueue background fetch+decrypt of the next three segments. Each
    /// task is tracked in a pending set so concurrent requests never
    /// duplicate work; completed prefetches only populate the cache.
    fn spawn_prefetch(&self, job: &DecryptJob) {
        for successor in successor_urls(&job.url, PREFETCH_DEPTH) {
            let key = SegmentCacheKey {
                url: successor.clone(),
                key_id: job.key_id.clone(),
                variant: SegmentVariant::Raw,
            };

            if self.inner.segments.contains(&key) {
                continue;
            }
            {
                let mut pending = self.inner.pending_prefetch.lock();
                if !pending.insert(key.clone()) {
                    continue;
                }
            }

            let pipeline = self.clone();
            let mut prefetch_job = job.clone();
            prefetch_job.url = successor;
            tokio::spawn(async move {
                match pipeline.download_and_decrypt(&prefetch_job).await {
                    Ok(bytes) => {
                        tracing::info!("Prefetched segment: {}", tail(&prefetch_job.url));
                        pipeline.inner.segments.insert(
                            key.clone(),
                            CachedSegment {
                                bytes,
                                content_type: "video/mp4",
                            },
                        );
                    }
                    Err(err) => {
                        tracing::debug!("Prefetch failed for {}: {err}", tail(&prefetch_job.url));
                    }
                }
                pipeline.inner.pending_prefetch.lock().remove(&key);
            });
        }
    }
}

static SEGMENT_NUMBER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"([-_])(\d+)(\.[^./]+)$").expect("valid segment number regex")
});

/// Compute the next `depth` segment URLs by incrementing the trailing
/// number in the path (`…-123.m4s` → `…-124.m4s`). URLs without a numeric
/// tail yield nothing.
#[must_use]
pub fn successor_urls(url: &str, depth: u64) -> Vec<String> {
    let Ok(mut parsed) = Url::parse(url) else {
        return Vec::new();
    };
    let path = parsed.path().to_string();
    let Some(captures) = SEGMENT_NUMBER.captures(&path) else {
        return Vec::new();
    };

    let separator = &captures[1];
    let Ok(number) = captures[2].parse::<u64>() else {
        return Vec::new();
    };
    let width = captures[2].len();
    let extension = &captures[3];
    let prefix = &path[..captures.get(0).map_or(0, |m| m.start())];

    let mut urls = Vec::with_capacity(depth as usize);
    for i in 1..=depth {
        let next = number + i;
        // Preserve zero-padding when the origin uses fixed-width numbers.
        let next_path = if captures[2].starts_with('0') {
            format!("{prefix}{separator}{next:0width$}{extension}")
        } else {
            format!("{prefix}{separator}{next}{extension}")
        };
        parsed.set_path(&next_path);
        urls.push(parsed.to_string());
    }
    urls
}

fn tail(url: &str) -> &str {
    url.rsplit('/').next().unwrap_or(url)
}
