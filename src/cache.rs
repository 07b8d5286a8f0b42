//! Two-tier idempotence cache for completed execution results.
//!
//! L1 is an in-process LRU with TTL and a periodic sweep. L2 is an
//! optional [`DistributedStore`] sharing the same keys plus two index
//! sets (`cg:tenant:{t}`, `cg:intent:{i}`) that make tenant- and
//! intent-wide invalidation O(k). Every L2 operation runs behind a
//! circuit breaker: when the distributed tier misbehaves the cache
//! degrades to L1-only and the execution path never fails because of it.

use lru::LruCache;
use sha2::{Digest, Sha256};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use crate::outcome::ExecutionResult;
use crate::store::DistributedStore;

const KEY_PREFIX: &str = "cg:exec:";
const TENANT_INDEX_PREFIX: &str = "cg:tenant:";
const INTENT_INDEX_PREFIX: &str = "cg:intent:";

/// Extra lifetime on L2 entries so the index sets outlive the values
/// they point at.
const L2_TTL_SLACK: Duration = Duration::from_secs(60);

const SCAN_PAGE: usize = 100;

/// Stable fingerprint of an intent context: SHA-256 over the map
/// serialized with deterministically sorted keys, first 16 hex chars.
pub fn context_fingerprint(context: &serde_json::Map<String, serde_json::Value>) -> String {
    fn canonicalize(value: &serde_json::Value, out: &mut String) {
        match value {
            serde_json::Value::Object(map) => {
                let mut entries: Vec<(&String, &serde_json::Value)> = map.iter().collect();
                entries.sort_by(|a, b| a.0.cmp(b.0));
                out.push('{');
                for (i, (key, value)) in entries.into_iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    out.push_str(&serde_json::Value::String(key.clone()).to_string());
                    out.push(':');
                    canonicalize(value, out);
                }
                out.push('}');
            }
            serde_json::Value::Array(items) => {
                out.push('[');
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    canonicalize(item, out);
                }
                out.push(']');
            }
            leaf => out.push_str(&leaf.to_string()),
        }
    }

    let mut canonical = String::new();
    canonicalize(&serde_json::Value::Object(context.clone()), &mut canonical);
    let digest = Sha256::digest(canonical.as_bytes());
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    hex[..16].to_owned()
}

/// Fully-qualified cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub tenant_id: String,
    pub intent_id: String,
    pub handler_name: String,
    pub fingerprint: String,
}

impl CacheKey {
    pub fn new(
        tenant_id: impl Into<String>,
        intent_id: impl Into<String>,
        handler_name: impl Into<String>,
        context: &serde_json::Map<String, serde_json::Value>,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            intent_id: intent_id.into(),
            handler_name: handler_name.into(),
            fingerprint: context_fingerprint(context),
        }
    }

    pub fn serialize(&self) -> String {
        format!(
            "{KEY_PREFIX}{}:{}:{}:{}",
            self.tenant_id, self.intent_id, self.handler_name, self.fingerprint
        )
    }
}

#[derive(Debug, Clone)]
struct L1Entry {
    result: ExecutionResult,
    expires_at: Instant,
    last_accessed: Instant,
    access_count: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct CacheConfig {
    pub max_entries: usize,
    pub ttl: Duration,
    pub sweep_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 5_000,
            ttl: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Default)]
struct CacheCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    l2_hits: AtomicU64,
    l2_errors: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub l2_hits: u64,
    pub l2_errors: u64,
    pub entries: usize,
}

/// Two-tier result cache; see the module docs.
#[derive(Clone)]
pub struct ExecutionCache {
    config: CacheConfig,
    l1: Arc<Mutex<LruCache<String, L1Entry>>>,
    store: Option<Arc<dyn DistributedStore>>,
    breaker: CircuitBreaker,
    counters: Arc<CacheCounters>,
    sweeper: CancellationToken,
}

impl std::fmt::Debug for ExecutionCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionCache").field("stats", &self.stats()).finish_non_exhaustive()
    }
}

impl ExecutionCache {
    pub fn new(config: CacheConfig, store: Option<Arc<dyn DistributedStore>>) -> Self {
        let capacity = NonZeroUsize::new(config.max_entries).unwrap_or(NonZeroUsize::MIN);
        let cache = Self {
            config,
            l1: Arc::new(Mutex::new(LruCache::new(capacity))),
            store,
            breaker: CircuitBreaker::new("cognigate-cache-l2", CircuitBreakerConfig::default()),
            counters: Arc::new(CacheCounters::default()),
            sweeper: CancellationToken::new(),
        };

        // The sweep is an optimization; expiry is also enforced on read,
        // so skipping it outside a runtime is harmless.
        if tokio::runtime::Handle::try_current().is_ok() {
            let sweep_cache = cache.clone();
            let stop = cache.sweeper.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = stop.cancelled() => break,
                        _ = tokio::time::sleep(sweep_cache.config.sweep_interval) => {
                            sweep_cache.sweep();
                        }
                    }
                }
            });
        }
        cache
    }

    fn l1_lock(&self) -> MutexGuard<'_, LruCache<String, L1Entry>> {
        self.l1.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// L1 lookup, falling back to L2 with promotion on hit.
    pub async fn get(&self, key: &CacheKey) -> Option<ExecutionResult> {
        let serialized = key.serialize();
        let now = Instant::now();

        {
            let mut l1 = self.l1_lock();
            match l1.get_mut(&serialized) {
                Some(entry) if entry.expires_at > now => {
                    entry.last_accessed = now;
                    entry.access_count += 1;
                    self.counters.hits.fetch_add(1, Ordering::Relaxed);
                    return Some(entry.result.clone());
                }
                Some(_) => {
                    l1.pop(&serialized);
                }
                None => {}
            }
        }

        if let Some(result) = self.l2_get(&serialized).await {
            self.promote(&serialized, result.clone());
            self.counters.hits.fetch_add(1, Ordering::Relaxed);
            self.counters.l2_hits.fetch_add(1, Ordering::Relaxed);
            return Some(result);
        }

        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Cache a completed result in both tiers and the index sets.
    /// Non-completed results are ignored.
    pub async fn put(&self, key: &CacheKey, result: &ExecutionResult) {
        if !result.is_completed() {
            return;
        }
        let serialized = key.serialize();
        self.promote(&serialized, result.clone());

        let Some(store) = &self.store else { return };
        let payload = match serde_json::to_string(result) {
            Ok(payload) => payload,
            Err(err) => {
                tracing::warn!(%err, "failed to serialize result for cache");
                return;
            }
        };
        let ttl = self.config.ttl + L2_TTL_SLACK;
        let tenant_index = format!("{TENANT_INDEX_PREFIX}{}", key.tenant_id);
        let intent_index = format!("{INTENT_INDEX_PREFIX}{}", key.intent_id);

        let outcome = self
            .breaker
            .run(|| {
                let store = Arc::clone(store);
                let serialized = serialized.clone();
                let payload = payload.clone();
                let tenant_index = tenant_index.clone();
                let intent_index = intent_index.clone();
                async move {
                    store.set(&serialized, &payload, Some(ttl)).await?;
                    store.set_add(&tenant_index, &serialized).await?;
                    store.set_add(&intent_index, &serialized).await?;
                    Ok::<_, crate::store::StoreError>(())
                }
            })
            .await;
        if let Err(err) = outcome {
            self.counters.l2_errors.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(%err, "cache write degraded to l1-only");
        }
    }

    /// Drop every entry belonging to `execution_id`. Returns how many
    /// entries were removed across both tiers.
    pub async fn invalidate(&self, execution_id: &str) -> usize {
        let mut removed = 0;

        let l1_keys: Vec<String> = {
            let l1 = self.l1_lock();
            l1.iter()
                .filter(|(_, entry)| entry.result.execution_id == execution_id)
                .map(|(key, _)| key.clone())
                .collect()
        };
        {
            let mut l1 = self.l1_lock();
            for key in &l1_keys {
                if l1.pop(key).is_some() {
                    removed += 1;
                }
            }
        }

        if let Some(store) = &self.store {
            let keys = self.l2_scan_keys(KEY_PREFIX).await;
            for key in keys {
                let Some(result) = self.l2_get(&key).await else { continue };
                if result.execution_id == execution_id {
                    let tenant_index = format!("{TENANT_INDEX_PREFIX}{}", result.tenant_id);
                    let intent_index = format!("{INTENT_INDEX_PREFIX}{}", result.intent_id);
                    let _ = store.delete(&key).await;
                    let _ = store.set_remove(&tenant_index, &key).await;
                    let _ = store.set_remove(&intent_index, &key).await;
                    removed += 1;
                }
            }
        }
        removed
    }

    /// Invalidate every cached result for one intent using the intent
    /// index set.
    pub async fn invalidate_by_intent(&self, intent_id: &str) -> usize {
        self.invalidate_via_index(&format!("{INTENT_INDEX_PREFIX}{intent_id}"), |entry| {
            entry.result.intent_id == intent_id
        })
        .await
    }

    /// Invalidate every cached result for one tenant using the tenant
    /// index set.
    pub async fn invalidate_tenant(&self, tenant_id: &str) -> usize {
        self.invalidate_via_index(&format!("{TENANT_INDEX_PREFIX}{tenant_id}"), |entry| {
            entry.result.tenant_id == tenant_id
        })
        .await
    }

    /// Drop both tiers entirely, including the index sets.
    pub async fn clear(&self) {
        self.l1_lock().clear();
        if self.store.is_some() {
            for prefix in [KEY_PREFIX, TENANT_INDEX_PREFIX, INTENT_INDEX_PREFIX] {
                let keys = self.l2_scan_keys(prefix).await;
                if let Some(store) = &self.store {
                    for key in keys {
                        let _ = store.delete(&key).await;
                    }
                }
            }
        }
    }

    /// Drop expired L1 entries.
    pub fn sweep(&self) {
        let now = Instant::now();
        let mut l1 = self.l1_lock();
        let expired: Vec<String> = l1
            .iter()
            .filter(|(_, entry)| entry.expires_at <= now)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            l1.pop(key);
        }
        if !expired.is_empty() {
            tracing::debug!(count = expired.len(), "cache sweep dropped expired entries");
        }
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            l2_hits: self.counters.l2_hits.load(Ordering::Relaxed),
            l2_errors: self.counters.l2_errors.load(Ordering::Relaxed),
            entries: self.l1_lock().len(),
        }
    }

    /// True when the distributed tier is configured and its breaker is
    /// not open.
    pub fn l2_healthy(&self) -> bool {
        self.store.is_some()
            && self.breaker.state() != crate::circuit_breaker::CircuitState::Open
    }

    pub fn shutdown(&self) {
        self.sweeper.cancel();
    }

    fn promote(&self, serialized: &str, result: ExecutionResult) {
        let now = Instant::now();
        self.l1_lock().put(
            serialized.to_owned(),
            L1Entry {
                result,
                expires_at: now + self.config.ttl,
                last_accessed: now,
                access_count: 0,
            },
        );
    }

    async fn l2_get(&self, serialized: &str) -> Option<ExecutionResult> {
        let store = self.store.as_ref()?;
        let fetched = self
            .breaker
            .run(|| {
                let store = Arc::clone(store);
                let key = serialized.to_owned();
                async move { store.get(&key).await }
            })
            .await;

        match fetched {
            Ok(Some(payload)) => match serde_json::from_str::<ExecutionResult>(&payload) {
                Ok(result) => Some(result),
                Err(err) => {
                    // Malformed value: delete and treat as a miss.
                    tracing::warn!(key = serialized, %err, "malformed cache value dropped");
                    let _ = store.delete(serialized).await;
                    None
                }
            },
            Ok(None) => None,
            Err(err) => {
                self.counters.l2_errors.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(%err, "cache read degraded to l1-only");
                None
            }
        }
    }

    async fn l2_scan_keys(&self, prefix: &str) -> Vec<String> {
        let Some(store) = &self.store else { return Vec::new() };
        let mut keys = Vec::new();
        let mut cursor = 0;
        loop {
            match store.scan(prefix, cursor, SCAN_PAGE).await {
                Ok((next, page)) => {
                    keys.extend(page);
                    if next == 0 {
                        break;
                    }
                    cursor = next;
                }
                Err(err) => {
                    self.counters.l2_errors.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(%err, "cache scan aborted");
                    break;
                }
            }
        }
        keys
    }

    async fn invalidate_via_index<F>(&self, index_key: &str, l1_match: F) -> usize
    where
        F: Fn(&L1Entry) -> bool,
    {
        let mut removed = 0;

        let l1_keys: Vec<String> = {
            let l1 = self.l1_lock();
            l1.iter()
                .filter(|(_, entry)| l1_match(entry))
                .map(|(key, _)| key.clone())
                .collect()
        };
        {
            let mut l1 = self.l1_lock();
            for key in &l1_keys {
                if l1.pop(key).is_some() {
                    removed += 1;
                }
            }
        }

        if let Some(store) = &self.store {
            let members = store.set_members(index_key).await.unwrap_or_default();
            for member in &members {
                if matches!(store.delete(member).await, Ok(true)) {
                    removed += 1;
                }
            }
            let _ = store.delete(index_key).await;
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limits::ResourceUsage;
    use crate::outcome::ExecutionStatus;
    use crate::store::MemoryStore;
    use chrono::Utc;

    fn result(execution_id: &str, tenant: &str, intent: &str) -> ExecutionResult {
        ExecutionResult {
            execution_id: execution_id.into(),
            tenant_id: tenant.into(),
            intent_id: intent.into(),
            handler_name: "h".into(),
            status: ExecutionStatus::Completed,
            outputs: serde_json::Map::new(),
            usage: ResourceUsage::default(),
            error: None,
            retry_count: 0,
            started_at: Utc::now(),
            finished_at: Utc::now(),
            wall_time_ms: 5,
            from_cache: false,
        }
    }

    fn key(tenant: &str, intent: &str) -> CacheKey {
        CacheKey::new(tenant, intent, "h", &serde_json::Map::new())
    }

    #[test]
    fn fingerprint_is_stable_under_key_order() {
        let a: serde_json::Map<String, serde_json::Value> =
            serde_json::from_str(r#"{"x": 1, "y": {"b": [1, 2], "a": "z"}}"#).unwrap();
        let b: serde_json::Map<String, serde_json::Value> =
            serde_json::from_str(r#"{"y": {"a": "z", "b": [1, 2]}, "x": 1}"#).unwrap();
        assert_eq!(context_fingerprint(&a), context_fingerprint(&b));
        assert_eq!(context_fingerprint(&a).len(), 16);
    }

    #[test]
    fn fingerprint_differs_on_different_values() {
        let a: serde_json::Map<String, serde_json::Value> =
            serde_json::from_str(r#"{"x": 1}"#).unwrap();
        let b: serde_json::Map<String, serde_json::Value> =
            serde_json::from_str(r#"{"x": 2}"#).unwrap();
        assert_ne!(context_fingerprint(&a), context_fingerprint(&b));
    }

    #[test]
    fn key_serialization_carries_all_components() {
        let key = key("acme", "i-1");
        let serialized = key.serialize();
        assert!(serialized.starts_with("cg:exec:acme:i-1:h:"));
    }

    #[tokio::test]
    async fn l1_round_trip_and_stats() {
        let cache = ExecutionCache::new(CacheConfig::default(), None);
        let key = key("acme", "i-1");
        assert!(cache.get(&key).await.is_none());

        cache.put(&key, &result("e-1", "acme", "i-1")).await;
        let hit = cache.get(&key).await.expect("hit");
        assert_eq!(hit.execution_id, "e-1");

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.entries, 1);
    }

    #[tokio::test]
    async fn non_completed_results_are_not_cached() {
        let cache = ExecutionCache::new(CacheConfig::default(), None);
        let key = key("acme", "i-1");
        let mut failed = result("e-1", "acme", "i-1");
        failed.status = ExecutionStatus::Failed;
        cache.put(&key, &failed).await;
        assert!(cache.get(&key).await.is_none());
    }

    #[tokio::test]
    async fn entries_expire_after_ttl() {
        let config = CacheConfig { ttl: Duration::from_millis(30), ..Default::default() };
        let cache = ExecutionCache::new(config, None);
        let key = key("acme", "i-1");
        cache.put(&key, &result("e-1", "acme", "i-1")).await;
        assert!(cache.get(&key).await.is_some());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(cache.get(&key).await.is_none(), "expired entry must read as miss");
    }

    #[tokio::test]
    async fn lru_evicts_least_recently_accessed_on_overflow() {
        let config = CacheConfig { max_entries: 2, ..Default::default() };
        let cache = ExecutionCache::new(config, None);
        let k1 = key("acme", "i-1");
        let k2 = key("acme", "i-2");
        let k3 = key("acme", "i-3");
        cache.put(&k1, &result("e-1", "acme", "i-1")).await;
        cache.put(&k2, &result("e-2", "acme", "i-2")).await;

        // Touch k1 so k2 is the eviction candidate.
        assert!(cache.get(&k1).await.is_some());
        cache.put(&k3, &result("e-3", "acme", "i-3")).await;

        assert!(cache.get(&k1).await.is_some());
        assert!(cache.get(&k2).await.is_none());
        assert!(cache.get(&k3).await.is_some());
    }

    #[tokio::test]
    async fn l2_miss_promotes_on_hit() {
        let store = MemoryStore::new();
        let cache = ExecutionCache::new(CacheConfig::default(), Some(Arc::new(store.clone())));
        let key = key("acme", "i-1");
        cache.put(&key, &result("e-1", "acme", "i-1")).await;

        // Fresh cache sharing the same store: L1 cold, L2 warm.
        let other = ExecutionCache::new(CacheConfig::default(), Some(Arc::new(store)));
        let hit = other.get(&key).await.expect("l2 hit");
        assert_eq!(hit.execution_id, "e-1");
        assert_eq!(other.stats().l2_hits, 1);
        // Promoted: second read is an L1 hit.
        assert!(other.get(&key).await.is_some());
        assert_eq!(other.stats().l2_hits, 1);
    }

    #[tokio::test]
    async fn malformed_l2_values_are_deleted_and_count_as_miss() {
        let store = MemoryStore::new();
        let cache = ExecutionCache::new(CacheConfig::default(), Some(Arc::new(store.clone())));
        let key = key("acme", "i-1");
        store.set(&key.serialize(), "{not json", None).await.unwrap();

        assert!(cache.get(&key).await.is_none());
        assert_eq!(store.get(&key.serialize()).await.unwrap(), None, "malformed value deleted");
    }

    #[tokio::test]
    async fn store_failure_degrades_to_l1_only() {
        let store = MemoryStore::new();
        let cache = ExecutionCache::new(CacheConfig::default(), Some(Arc::new(store.clone())));
        let key = key("acme", "i-1");

        store.set_failing(true);
        cache.put(&key, &result("e-1", "acme", "i-1")).await;
        // L1 still serves despite the broken distributed tier.
        assert!(cache.get(&key).await.is_some());
        assert!(cache.stats().l2_errors > 0);
        store.set_failing(false);
    }

    #[tokio::test]
    async fn invalidate_by_intent_uses_the_index() {
        let store = MemoryStore::new();
        let cache = ExecutionCache::new(CacheConfig::default(), Some(Arc::new(store.clone())));
        let k1 = key("acme", "i-1");
        let k2 = key("acme", "i-2");
        cache.put(&k1, &result("e-1", "acme", "i-1")).await;
        cache.put(&k2, &result("e-2", "acme", "i-2")).await;

        let removed = cache.invalidate_by_intent("i-1").await;
        assert!(removed >= 1);
        assert!(cache.get(&k1).await.is_none());
        assert!(cache.get(&k2).await.is_some());
    }

    #[tokio::test]
    async fn invalidate_tenant_sweeps_all_tenant_entries() {
        let store = MemoryStore::new();
        let cache = ExecutionCache::new(CacheConfig::default(), Some(Arc::new(store)));
        let k1 = key("acme", "i-1");
        let k2 = key("umbrella", "i-9");
        cache.put(&k1, &result("e-1", "acme", "i-1")).await;
        cache.put(&k2, &result("e-2", "umbrella", "i-9")).await;

        cache.invalidate_tenant("acme").await;
        assert!(cache.get(&k1).await.is_none());
        assert!(cache.get(&k2).await.is_some());
    }

    #[tokio::test]
    async fn invalidate_by_execution_id_scans_both_tiers() {
        let store = MemoryStore::new();
        let cache = ExecutionCache::new(CacheConfig::default(), Some(Arc::new(store)));
        let k1 = key("acme", "i-1");
        cache.put(&k1, &result("e-1", "acme", "i-1")).await;

        let removed = cache.invalidate("e-1").await;
        assert!(removed >= 1);
        assert!(cache.get(&k1).await.is_none());
    }

    #[tokio::test]
    async fn clear_empties_everything() {
        let store = MemoryStore::new();
        let cache = ExecutionCache::new(CacheConfig::default(), Some(Arc::new(store.clone())));
        let k1 = key("acme", "i-1");
        cache.put(&k1, &result("e-1", "acme", "i-1")).await;

        cache.clear().await;
        assert_eq!(cache.stats().entries, 0);
        assert!(cache.get(&k1).await.is_none());
        assert!(store.set_members("cg:tenant:acme").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn sweep_drops_expired_entries() {
        let config = CacheConfig { ttl: Duration::from_millis(10), ..Default::default() };
        let cache = ExecutionCache::new(config, None);
        let key = key("acme", "i-1");
        cache.put(&key, &result("e-1", "acme", "i-1")).await;
        tokio::time::sleep(Duration::from_millis(30)).await;

        cache.sweep();
        assert_eq!(cache.stats().entries, 0);
    }
}
