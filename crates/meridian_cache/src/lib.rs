//! Two-tier result cache.
//!
//! L1 is a bounded LRU with per-entry TTL; L2 is an optional external
//! key-value store behind [`KeyValueStore`]. Reads check L1 then L2
//! (promoting on hit); writes go to both. `get_or_set` is single-flight:
//! concurrent callers for the same absent key run the factory exactly once.
//!
//! Keys are fingerprints of the normalized request, so the direct query tool
//! and the code-API evaluator share entries for identical work.

use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use lru::LruCache;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::debug;

/// Cache configuration.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub enabled: bool,
    /// Default TTL when a set does not specify one.
    pub default_ttl: Duration,
    /// Maximum number of L1 entries.
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_ttl: Duration::from_secs(300),
            max_entries: 1024,
        }
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    value: Value,
    expires_at: Instant,
}

/// Pluggable external store interface for the second tier.
///
/// Implementations map onto external key-value services; the in-memory
/// default keeps the interface honest in tests and single-process deploys.
#[async_trait]
pub trait KeyValueStore: Send + Sync + 'static {
    async fn get(&self, key: &str) -> Option<String>;
    async fn set(&self, key: &str, value: String, ttl: Duration);
    async fn remove(&self, key: &str);
    async fn clear(&self);
    async fn remove_by_prefix(&self, prefix: &str);
}

/// In-memory [`KeyValueStore`] with lazy expiry.
#[derive(Default)]
pub struct InMemoryStore {
    inner: DashMap<String, (String, Instant)>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStore for InMemoryStore {
    async fn get(&self, key: &str) -> Option<String> {
        if let Some(entry) = self.inner.get(key) {
            let (value, expires_at) = entry.value();
            if Instant::now() < *expires_at {
                return Some(value.clone());
            }
            drop(entry);
            self.inner.remove(key);
        }
        None
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) {
        self.inner
            .insert(key.to_string(), (value, Instant::now() + ttl));
    }

    async fn remove(&self, key: &str) {
        self.inner.remove(key);
    }

    async fn clear(&self) {
        self.inner.clear();
    }

    async fn remove_by_prefix(&self, prefix: &str) {
        self.inner.retain(|k, _| !k.starts_with(prefix));
    }
}

/// Counters surfaced through health reports.
#[derive(Debug, Default)]
pub struct CacheCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
    evictions: AtomicU64,
}

/// Point-in-time stats snapshot.
#[derive(Debug, Clone, serde::Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub evictions: u64,
    pub entries: usize,
    pub enabled: bool,
}

/// The two-tier cache.
pub struct QueryCache {
    config: CacheConfig,
    l1: Mutex<LruCache<String, CacheEntry>>,
    l2: Option<Arc<dyn KeyValueStore>>,
    inflight: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    counters: CacheCounters,
}

impl QueryCache {
    pub fn new(config: CacheConfig, l2: Option<Arc<dyn KeyValueStore>>) -> Self {
        let capacity = NonZeroUsize::new(config.max_entries.max(1)).expect("non-zero capacity");
        Self {
            config,
            l1: Mutex::new(LruCache::new(capacity)),
            l2,
            inflight: DashMap::new(),
            counters: CacheCounters::default(),
        }
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    /// Get a value, checking L1 then L2. An L2 hit is promoted into L1.
    pub async fn get(&self, key: &str) -> Option<Value> {
        if !self.config.enabled {
            return None;
        }

        {
            let mut l1 = self.l1.lock().expect("cache lock poisoned");
            if let Some(entry) = l1.get(key) {
                if Instant::now() < entry.expires_at {
                    self.counters.hits.fetch_add(1, Ordering::Relaxed);
                    return Some(entry.value.clone());
                }
                l1.pop(key);
            }
        }

        if let Some(l2) = &self.l2 {
            if let Some(raw) = l2.get(key).await {
                if let Ok(value) = serde_json::from_str::<Value>(&raw) {
                    self.counters.hits.fetch_add(1, Ordering::Relaxed);
                    self.put_l1(key, value.clone(), self.config.default_ttl);
                    return Some(value);
                }
            }
        }

        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Write a value to both tiers.
    pub async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) {
        if !self.config.enabled {
            return;
        }
        let ttl = ttl.unwrap_or(self.config.default_ttl);
        self.put_l1(key, value.clone(), ttl);
        self.counters.sets.fetch_add(1, Ordering::Relaxed);
        if let Some(l2) = &self.l2 {
            if let Ok(raw) = serde_json::to_string(&value) {
                l2.set(key, raw, ttl).await;
            }
        }
    }

    fn put_l1(&self, key: &str, value: Value, ttl: Duration) {
        let entry = CacheEntry {
            value,
            expires_at: Instant::now() + ttl,
        };
        let mut l1 = self.l1.lock().expect("cache lock poisoned");
        if let Some((evicted_key, _)) = l1.push(key.to_string(), entry) {
            if evicted_key != key {
                self.counters.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Remove one key from both tiers.
    pub async fn delete(&self, key: &str) {
        self.l1.lock().expect("cache lock poisoned").pop(key);
        if let Some(l2) = &self.l2 {
            l2.remove(key).await;
        }
    }

    /// Purge everything, or one namespace prefix.
    pub async fn clear(&self, namespace: Option<&str>) {
        match namespace {
            None => {
                self.l1.lock().expect("cache lock poisoned").clear();
                if let Some(l2) = &self.l2 {
                    l2.clear().await;
                }
            }
            Some(ns) => {
                let prefix = format!("{ns}:");
                self.remove_l1_matching(|key| key.starts_with(&prefix));
                if let Some(l2) = &self.l2 {
                    l2.remove_by_prefix(&prefix).await;
                }
            }
        }
    }

    /// Remove L1 keys matching a regex; L2 gets a namespace purge since
    /// external stores only support prefix deletion.
    pub async fn invalidate_pattern(
        &self,
        pattern: &str,
        namespace: Option<&str>,
    ) -> Result<usize, regex::Error> {
        let re = regex::Regex::new(pattern)?;
        let removed = self.remove_l1_matching(|key| re.is_match(key));
        if let (Some(l2), Some(ns)) = (&self.l2, namespace) {
            l2.remove_by_prefix(&format!("{ns}:")).await;
        }
        debug!("invalidated {} cache entries matching {}", removed, pattern);
        Ok(removed)
    }

    fn remove_l1_matching(&self, predicate: impl Fn(&str) -> bool) -> usize {
        let mut l1 = self.l1.lock().expect("cache lock poisoned");
        let matching: Vec<String> = l1
            .iter()
            .filter(|(k, _)| predicate(k))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &matching {
            l1.pop(key);
        }
        matching.len()
    }

    /// Get, or populate with at-most-one concurrent factory per key.
    pub async fn get_or_set<F, Fut, E>(
        &self,
        key: &str,
        ttl: Option<Duration>,
        factory: F,
    ) -> Result<Value, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Value, E>>,
    {
        if !self.config.enabled {
            return factory().await;
        }

        if let Some(value) = self.get(key).await {
            return Ok(value);
        }

        let gate = {
            let entry = self
                .inflight
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())));
            Arc::clone(entry.value())
        };
        let _guard = gate.lock().await;

        // A winner may have populated the key while we waited on the gate.
        if let Some(value) = self.get(key).await {
            return Ok(value);
        }

        let value = factory().await?;
        self.set(key, value.clone(), ttl).await;
        drop(_guard);
        self.inflight.remove(key);
        Ok(value)
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            sets: self.counters.sets.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            entries: self.l1.lock().expect("cache lock poisoned").len(),
            enabled: self.config.enabled,
        }
    }
}

/// Fingerprint of a normalized request. Identical SQL + parameters +
/// connection id hash to the same key regardless of whitespace.
pub fn fingerprint(namespace: &str, sql: &str, params: &Value, connection_id: &str) -> String {
    let normalized: String = sql.split_whitespace().collect::<Vec<_>>().join(" ");
    let canonical_params = serde_json::to_string(params).unwrap_or_default();

    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    hasher.update(b"\0");
    hasher.update(canonical_params.as_bytes());
    hasher.update(b"\0");
    hasher.update(connection_id.as_bytes());
    format!("{namespace}:{}", hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicU32;

    fn cache() -> QueryCache {
        QueryCache::new(
            CacheConfig {
                enabled: true,
                default_ttl: Duration::from_secs(60),
                max_entries: 4,
            },
            Some(Arc::new(InMemoryStore::new())),
        )
    }

    #[tokio::test]
    async fn test_set_then_get() {
        let cache = cache();
        cache.set("k", json!({"v": 1}), None).await;
        assert_eq!(cache.get("k").await, Some(json!({"v": 1})));

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.sets, 1);
    }

    #[tokio::test]
    async fn test_ttl_expiry() {
        let cache = cache();
        cache
            .set("k", json!(1), Some(Duration::from_millis(10)))
            .await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        // Expired in L1; L2 entry also expired.
        assert_eq!(cache.get("k").await, None);
    }

    #[tokio::test]
    async fn test_l2_promotion() {
        let l2 = Arc::new(InMemoryStore::new());
        let cache = QueryCache::new(CacheConfig::default(), Some(l2.clone()));

        l2.set("warm", "{\"v\":9}".to_string(), Duration::from_secs(60))
            .await;
        assert_eq!(cache.get("warm").await, Some(json!({"v": 9})));
        // Promoted: a second read hits L1.
        assert_eq!(cache.get("warm").await, Some(json!({"v": 9})));
        assert_eq!(cache.stats().hits, 2);
    }

    #[tokio::test]
    async fn test_lru_eviction() {
        let cache = cache();
        for i in 0..6 {
            cache.set(&format!("k{i}"), json!(i), None).await;
        }
        let stats = cache.stats();
        assert_eq!(stats.entries, 4);
        assert!(stats.evictions >= 2);
        assert_eq!(cache.get("k0").await, None);
        assert_eq!(cache.get("k5").await, Some(json!(5)));
    }

    #[tokio::test]
    async fn test_single_flight() {
        let cache = Arc::new(cache());
        let calls = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = Arc::clone(&cache);
            let calls = Arc::clone(&calls);
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_set("shared", None, || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        Ok::<_, std::convert::Infallible>(json!("value"))
                    })
                    .await
                    .unwrap()
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap(), json!("value"));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_invalidate_pattern() {
        let cache = cache();
        cache.set("db:a", json!(1), None).await;
        cache.set("db:b", json!(2), None).await;
        cache.set("other:c", json!(3), None).await;

        let removed = cache.invalidate_pattern("^db:", Some("db")).await.unwrap();
        assert_eq!(removed, 2);
        assert_eq!(cache.get("db:a").await, None);
        assert_eq!(cache.get("other:c").await, Some(json!(3)));
    }

    #[tokio::test]
    async fn test_clear_namespace() {
        let cache = cache();
        cache.set("ns1:a", json!(1), None).await;
        cache.set("ns2:b", json!(2), None).await;

        cache.clear(Some("ns1")).await;
        assert_eq!(cache.get("ns1:a").await, None);
        assert_eq!(cache.get("ns2:b").await, Some(json!(2)));
    }

    #[test]
    fn test_fingerprint_normalizes_whitespace() {
        let a = fingerprint("q", "SELECT  1", &json!([]), "primary");
        let b = fingerprint("q", "SELECT 1", &json!([]), "primary");
        let c = fingerprint("q", "SELECT 2", &json!([]), "primary");
        let d = fingerprint("q", "SELECT 1", &json!([]), "replica");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
    }

    #[tokio::test]
    async fn test_disabled_cache_is_passthrough() {
        let cache = QueryCache::new(
            CacheConfig {
                enabled: false,
                ..CacheConfig::default()
            },
            None,
        );
        cache.set("k", json!(1), None).await;
        assert_eq!(cache.get("k").await, None);
    }
}
