//! Distributed key-value store boundary.
//!
//! The lock service and the cache's distributed tier both sit on this
//! trait. The contract mirrors what a Redis-class store provides:
//! atomic set-if-absent with expiry, scripted compare-and-delete /
//! compare-and-expire, TTL'd get/set, set membership, and bounded-cursor
//! scans. [`MemoryStore`] implements it in-process for tests and
//! single-node deployments.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("store operation failed: {0}")]
    Operation(String),
}

#[async_trait]
pub trait DistributedStore: Send + Sync {
    /// Atomically set `key` only when absent, with an expiry. Returns
    /// whether the write won.
    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError>;

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError>;

    /// Returns whether the key existed.
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    /// Delete `key` only when its value equals `expected` (owner-token
    /// release). Returns whether a delete happened.
    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, StoreError>;

    /// Refresh the expiry of `key` only when its value equals `expected`.
    async fn compare_and_expire(
        &self,
        key: &str,
        expected: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError>;

    async fn set_add(&self, key: &str, member: &str) -> Result<(), StoreError>;

    async fn set_remove(&self, key: &str, member: &str) -> Result<(), StoreError>;

    async fn set_members(&self, key: &str) -> Result<Vec<String>, StoreError>;

    /// Bounded-cursor scan over keys with `prefix`. Cursor 0 starts a
    /// scan; a returned cursor of 0 ends it.
    async fn scan(
        &self,
        prefix: &str,
        cursor: u64,
        count: usize,
    ) -> Result<(u64, Vec<String>), StoreError>;
}

#[derive(Debug, Clone)]
struct ValueEntry {
    value: String,
    expires_at: Option<Instant>,
}

impl ValueEntry {
    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    values: BTreeMap<String, ValueEntry>,
    sets: HashMap<String, HashSet<String>>,
}

/// In-process [`DistributedStore`]. Expired values are dropped lazily on
/// access. `fail_all` flips every operation into an error, which tests
/// use to exercise circuit-breaker fallbacks.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
    fail_all: Arc<AtomicBool>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent operation fail until called with `false`.
    pub fn set_failing(&self, failing: bool) {
        self.fail_all.store(failing, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.fail_all.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("injected failure".into()))
        } else {
            Ok(())
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl DistributedStore for MemoryStore {
    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        self.check_available()?;
        let mut state = self.lock();
        let live = state.values.get(key).is_some_and(|e| !e.is_expired());
        if live {
            return Ok(false);
        }
        state.values.insert(
            key.to_owned(),
            ValueEntry { value: value.to_owned(), expires_at: Some(Instant::now() + ttl) },
        );
        Ok(true)
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.check_available()?;
        let mut state = self.lock();
        match state.values.get(key) {
            Some(entry) if entry.is_expired() => {
                state.values.remove(key);
                Ok(None)
            }
            Some(entry) => Ok(Some(entry.value.clone())),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        self.check_available()?;
        self.lock().values.insert(
            key.to_owned(),
            ValueEntry {
                value: value.to_owned(),
                expires_at: ttl.map(|ttl| Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        self.check_available()?;
        let mut state = self.lock();
        let existed = state.values.remove(key).is_some_and(|e| !e.is_expired());
        Ok(existed)
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, StoreError> {
        self.check_available()?;
        let mut state = self.lock();
        let matches = match state.values.get(key) {
            Some(entry) if !entry.is_expired() => entry.value == expected,
            _ => false,
        };
        if matches {
            state.values.remove(key);
        }
        Ok(matches)
    }

    async fn compare_and_expire(
        &self,
        key: &str,
        expected: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        self.check_available()?;
        let mut state = self.lock();
        match state.values.get_mut(key) {
            Some(entry) if !entry.is_expired() && entry.value == expected => {
                entry.expires_at = Some(Instant::now() + ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<(), StoreError> {
        self.check_available()?;
        self.lock().sets.entry(key.to_owned()).or_default().insert(member.to_owned());
        Ok(())
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<(), StoreError> {
        self.check_available()?;
        let mut state = self.lock();
        if let Some(set) = state.sets.get_mut(key) {
            set.remove(member);
            if set.is_empty() {
                state.sets.remove(key);
            }
        }
        Ok(())
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, StoreError> {
        self.check_available()?;
        let state = self.lock();
        let mut members: Vec<String> =
            state.sets.get(key).map(|s| s.iter().cloned().collect()).unwrap_or_default();
        members.sort();
        Ok(members)
    }

    async fn scan(
        &self,
        prefix: &str,
        cursor: u64,
        count: usize,
    ) -> Result<(u64, Vec<String>), StoreError> {
        self.check_available()?;
        let mut state = self.lock();
        state.values.retain(|_, entry| !entry.is_expired());
        let matching: Vec<String> =
            state.values.keys().filter(|k| k.starts_with(prefix)).cloned().collect();

        let start = cursor as usize;
        let end = (start + count.max(1)).min(matching.len());
        let page = matching[start.min(matching.len())..end].to_vec();
        let next = if end >= matching.len() { 0 } else { end as u64 };
        Ok((next, page))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_if_absent_wins_only_once() {
        let store = MemoryStore::new();
        assert!(store.set_if_absent("lock:a", "tok-1", Duration::from_secs(1)).await.unwrap());
        assert!(!store.set_if_absent("lock:a", "tok-2", Duration::from_secs(1)).await.unwrap());
        assert_eq!(store.get("lock:a").await.unwrap().as_deref(), Some("tok-1"));
    }

    #[tokio::test]
    async fn expired_values_read_as_absent() {
        let store = MemoryStore::new();
        store.set_if_absent("k", "v", Duration::from_millis(20)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
        assert!(store.set_if_absent("k", "v2", Duration::from_secs(1)).await.unwrap());
    }

    #[tokio::test]
    async fn compare_and_delete_requires_matching_value() {
        let store = MemoryStore::new();
        store.set("k", "mine", None).await.unwrap();
        assert!(!store.compare_and_delete("k", "theirs").await.unwrap());
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("mine"));
        assert!(store.compare_and_delete("k", "mine").await.unwrap());
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn compare_and_expire_extends_only_for_owner() {
        let store = MemoryStore::new();
        store.set("k", "mine", Some(Duration::from_millis(30))).await.unwrap();
        assert!(!store.compare_and_expire("k", "theirs", Duration::from_secs(5)).await.unwrap());
        assert!(store.compare_and_expire("k", "mine", Duration::from_secs(5)).await.unwrap());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("mine"));
    }

    #[tokio::test]
    async fn set_membership_round_trip() {
        let store = MemoryStore::new();
        store.set_add("tenant:acme", "key-b").await.unwrap();
        store.set_add("tenant:acme", "key-a").await.unwrap();
        assert_eq!(store.set_members("tenant:acme").await.unwrap(), vec!["key-a", "key-b"]);
        store.set_remove("tenant:acme", "key-a").await.unwrap();
        assert_eq!(store.set_members("tenant:acme").await.unwrap(), vec!["key-b"]);
    }

    #[tokio::test]
    async fn bounded_scan_pages_through_prefix() {
        let store = MemoryStore::new();
        for i in 0..5 {
            store.set(&format!("exec:{i}"), "v", None).await.unwrap();
        }
        store.set("other:x", "v", None).await.unwrap();

        let mut cursor = 0;
        let mut seen = Vec::new();
        loop {
            let (next, keys) = store.scan("exec:", cursor, 2).await.unwrap();
            seen.extend(keys);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        assert_eq!(seen.len(), 5);
        assert!(seen.iter().all(|k| k.starts_with("exec:")));
    }

    #[tokio::test]
    async fn injected_failures_surface_as_unavailable() {
        let store = MemoryStore::new();
        store.set_failing(true);
        assert!(matches!(store.get("k").await, Err(StoreError::Unavailable(_))));
        store.set_failing(false);
        assert!(store.get("k").await.is_ok());
    }
}
