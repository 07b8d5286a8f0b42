//! Distributed lock primitive with TTL leases and token-owned release.
//!
//! Acquisition is one atomic set-if-absent-with-expiry under a fresh
//! owner token; release is compare-and-delete on that token, so a
//! non-owner can never free somebody else's lock. Failing to acquire is
//! an expected outcome, not an error. The TTL bounds how long a crashed
//! owner can hold the resource.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::jitter::Jitter;
use crate::store::DistributedStore;
use crate::time::{Clock, MonotonicClock, Sleeper, TokioSleeper};

pub const MIN_LOCK_TTL: Duration = Duration::from_millis(100);
pub const MAX_LOCK_TTL: Duration = Duration::from_secs(300);

const LOCK_PREFIX: &str = "cg:lock:";

/// Safety margin subtracted from the lease when judging validity.
const VALIDITY_MARGIN_MS: u64 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockOptions {
    pub ttl: Duration,
    pub retries: u32,
    pub retry_delay: Duration,
    pub acquisition_timeout: Option<Duration>,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(30),
            retries: 3,
            retry_delay: Duration::from_millis(100),
            acquisition_timeout: Some(Duration::from_secs(5)),
        }
    }
}

fn clamp_ttl(ttl: Duration) -> Duration {
    ttl.clamp(MIN_LOCK_TTL, MAX_LOCK_TTL)
}

/// Named mutual exclusion over a [`DistributedStore`].
#[derive(Clone)]
pub struct LockService {
    store: Arc<dyn DistributedStore>,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
    jitter: Jitter,
}

impl std::fmt::Debug for LockService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockService").finish_non_exhaustive()
    }
}

impl LockService {
    pub fn new(store: Arc<dyn DistributedStore>) -> Self {
        Self {
            store,
            clock: Arc::new(MonotonicClock::default()),
            sleeper: Arc::new(TokioSleeper),
            jitter: Jitter::fraction(0.25),
        }
    }

    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn with_sleeper<S: Sleeper + 'static>(mut self, sleeper: S) -> Self {
        self.sleeper = Arc::new(sleeper);
        self
    }

    /// Try to take the lock for `resource`. `None` means somebody else
    /// holds it; the caller decides what that means.
    pub async fn acquire(&self, resource: &str, opts: LockOptions) -> Option<Lock> {
        let ttl = clamp_ttl(opts.ttl);
        let key = format!("{LOCK_PREFIX}{resource}");
        let token = Uuid::new_v4().to_string();
        let started = self.clock.now_millis();

        for attempt in 0..=opts.retries {
            match self.store.set_if_absent(&key, &token, ttl).await {
                Ok(true) => {
                    let now = self.clock.now_millis();
                    return Some(Lock {
                        key,
                        token,
                        ttl_ms: AtomicU64::new(ttl.as_millis() as u64),
                        expires_at_millis: AtomicU64::new(now + ttl.as_millis() as u64),
                        released: AtomicBool::new(false),
                        store: Arc::clone(&self.store),
                        clock: Arc::clone(&self.clock),
                    });
                }
                Ok(false) => {}
                Err(err) => {
                    tracing::warn!(resource, attempt, %err, "lock acquisition attempt errored");
                }
            }

            if attempt == opts.retries {
                break;
            }
            if let Some(timeout) = opts.acquisition_timeout {
                let elapsed = self.clock.now_millis().saturating_sub(started);
                if elapsed >= timeout.as_millis() as u64 {
                    break;
                }
            }
            self.sleeper.sleep(self.jitter.apply(opts.retry_delay)).await;
        }
        None
    }

    /// Run `operation` only while holding the lock; release on every exit
    /// path including panic. `None` means the lock was not acquired and
    /// the operation never ran.
    pub async fn with_lock<T, Fut, Op>(
        &self,
        resource: &str,
        opts: LockOptions,
        operation: Op,
    ) -> Option<T>
    where
        T: Send,
        Fut: std::future::Future<Output = T> + Send,
        Op: FnOnce() -> Fut + Send,
    {
        use futures::FutureExt;

        let lock = self.acquire(resource, opts).await?;
        let outcome = std::panic::AssertUnwindSafe(operation()).catch_unwind().await;
        lock.release().await;
        match outcome {
            Ok(value) => Some(value),
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }
}

/// A held lease. Dropping an unreleased lock fires a best-effort async
/// release; the TTL covers the case where even that cannot run.
pub struct Lock {
    key: String,
    token: String,
    ttl_ms: AtomicU64,
    expires_at_millis: AtomicU64,
    released: AtomicBool,
    store: Arc<dyn DistributedStore>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for Lock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lock")
            .field("key", &self.key)
            .field("valid", &self.is_valid())
            .finish_non_exhaustive()
    }
}

impl Lock {
    pub fn resource_key(&self) -> &str {
        &self.key
    }

    /// Compare-and-delete under the owner token. Store errors are logged
    /// and swallowed; the TTL guarantees eventual cleanup.
    pub async fn release(&self) -> bool {
        if self.released.swap(true, Ordering::SeqCst) {
            return false;
        }
        match self.store.compare_and_delete(&self.key, &self.token).await {
            Ok(deleted) => deleted,
            Err(err) => {
                tracing::warn!(key = %self.key, %err, "lock release failed; ttl will clean up");
                false
            }
        }
    }

    /// Refresh the lease for another `ttl` from now. Fails when the lock
    /// was lost (expired or taken over).
    pub async fn extend(&self, ttl: Duration) -> bool {
        if self.released.load(Ordering::SeqCst) {
            return false;
        }
        let ttl = clamp_ttl(ttl);
        match self.store.compare_and_expire(&self.key, &self.token, ttl).await {
            Ok(true) => {
                let ttl_ms = ttl.as_millis() as u64;
                self.ttl_ms.store(ttl_ms, Ordering::SeqCst);
                self.expires_at_millis.store(self.clock.now_millis() + ttl_ms, Ordering::SeqCst);
                true
            }
            Ok(false) => false,
            Err(err) => {
                tracing::warn!(key = %self.key, %err, "lock extend failed");
                false
            }
        }
    }

    /// Advisory validity check: local clock against the lease minus 1 %
    /// drift allowance and a small fixed margin.
    pub fn is_valid(&self) -> bool {
        if self.released.load(Ordering::SeqCst) {
            return false;
        }
        let drift_ms = self.ttl_ms.load(Ordering::SeqCst) / 100;
        let horizon = self
            .expires_at_millis
            .load(Ordering::SeqCst)
            .saturating_sub(drift_ms)
            .saturating_sub(VALIDITY_MARGIN_MS);
        self.clock.now_millis() < horizon
    }
}

impl Drop for Lock {
    fn drop(&mut self) {
        if self.released.load(Ordering::SeqCst) {
            return;
        }
        let store = Arc::clone(&self.store);
        let key = std::mem::take(&mut self.key);
        let token = std::mem::take(&mut self.token);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(err) = store.compare_and_delete(&key, &token).await {
                    tracing::warn!(key, %err, "best-effort lock release on drop failed");
                }
            });
        } else {
            tracing::warn!(key, "lock dropped outside a runtime; ttl will clean up");
        }
    }
}
