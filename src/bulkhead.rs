//! Admission control: nested concurrency-slot groups with bounded FIFO
//! wait queues.
//!
//! Three groups gate every execution: global, per-tenant, per-handler
//! (the latter two optional by configuration). A full group queues the
//! caller FIFO up to `max_queued`, after which it rejects. Freed slots
//! are handed directly to the head waiter under the group lock, so
//! ownership transfers without a re-race. Grants are RAII: dropping one
//! on any path (success, error, panic, cancellation) releases the slot.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::oneshot;

use crate::error::{EngineError, RejectReason};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupLimits {
    pub max_concurrent: usize,
    pub max_queued: usize,
    pub queue_timeout: Duration,
}

impl GroupLimits {
    pub fn new(max_concurrent: usize, max_queued: usize, queue_timeout: Duration) -> Self {
        Self { max_concurrent, max_queued, queue_timeout }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BulkheadConfig {
    pub global: GroupLimits,
    pub per_tenant: Option<GroupLimits>,
    pub per_handler: Option<GroupLimits>,
}

impl Default for BulkheadConfig {
    fn default() -> Self {
        Self {
            global: GroupLimits::new(100, 50, Duration::from_secs(5)),
            per_tenant: Some(GroupLimits::new(20, 20, Duration::from_secs(5))),
            per_handler: Some(GroupLimits::new(20, 20, Duration::from_secs(5))),
        }
    }
}

struct Waiter {
    id: u64,
    tx: oneshot::Sender<SlotGrant>,
}

#[derive(Default)]
struct GroupState {
    active: usize,
    waiters: VecDeque<Waiter>,
}

struct GroupCore {
    scope: String,
    limits: GroupLimits,
    state: Mutex<GroupState>,
    next_waiter_id: AtomicU64,
    rejected: AtomicU64,
    timed_out: AtomicU64,
}

impl GroupCore {
    fn new(scope: String, limits: GroupLimits) -> Arc<Self> {
        Arc::new(Self {
            scope,
            limits,
            state: Mutex::new(GroupState::default()),
            next_waiter_id: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            timed_out: AtomicU64::new(0),
        })
    }

    fn lock(&self) -> MutexGuard<'_, GroupState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Return one slot: hand it to the head waiter if any, else free it.
    /// Waiters whose receiving side vanished are skipped.
    fn release_slot(self: &Arc<Self>) {
        let mut state = self.lock();
        while let Some(waiter) = state.waiters.pop_front() {
            let grant = SlotGrant { core: Arc::clone(self), released: false };
            match waiter.tx.send(grant) {
                Ok(()) => return,
                Err(mut unclaimed) => {
                    // Receiver gone; neutralize the grant and try the next
                    // waiter with the same slot.
                    unclaimed.released = true;
                }
            }
        }
        state.active = state.active.saturating_sub(1);
    }

    async fn acquire_slot(self: &Arc<Self>) -> Result<SlotGrant, EngineError> {
        let (mut rx, waiter_id) = {
            let mut state = self.lock();
            if state.active < self.limits.max_concurrent {
                state.active += 1;
                return Ok(SlotGrant { core: Arc::clone(self), released: false });
            }
            if state.waiters.len() >= self.limits.max_queued {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(scope = %self.scope, "bulkhead queue full; rejecting");
                return Err(EngineError::bulkhead_rejected(&self.scope, RejectReason::QueueFull));
            }
            let (tx, rx) = oneshot::channel();
            let id = self.next_waiter_id.fetch_add(1, Ordering::Relaxed);
            state.waiters.push_back(Waiter { id, tx });
            (rx, id)
        };

        tokio::select! {
            granted = &mut rx => match granted {
                Ok(grant) => Ok(grant),
                Err(_) => {
                    // Bulkhead torn down while we waited.
                    self.rejected.fetch_add(1, Ordering::Relaxed);
                    Err(EngineError::bulkhead_rejected(&self.scope, RejectReason::QueueFull))
                }
            },
            _ = tokio::time::sleep(self.limits.queue_timeout) => {
                let removed = {
                    let mut state = self.lock();
                    match state.waiters.iter().position(|w| w.id == waiter_id) {
                        Some(index) => {
                            state.waiters.remove(index);
                            true
                        }
                        None => false,
                    }
                };
                if removed {
                    self.rejected.fetch_add(1, Ordering::Relaxed);
                    self.timed_out.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(scope = %self.scope, "bulkhead queue timeout");
                    return Err(EngineError::bulkhead_rejected(
                        &self.scope,
                        RejectReason::QueueTimeout,
                    ));
                }
                // A grant raced the timeout and is already in the channel.
                match rx.await {
                    Ok(grant) => Ok(grant),
                    Err(_) => {
                        self.rejected.fetch_add(1, Ordering::Relaxed);
                        Err(EngineError::bulkhead_rejected(&self.scope, RejectReason::QueueFull))
                    }
                }
            }
        }
    }

    fn stats(&self) -> GroupStats {
        let state = self.lock();
        GroupStats {
            scope: self.scope.clone(),
            active: state.active,
            queued: state.waiters.len(),
            max_concurrent: self.limits.max_concurrent,
            max_queued: self.limits.max_queued,
            rejected: self.rejected.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
        }
    }
}

/// One held slot in one group. Dropping releases (or hands off) the slot.
pub struct SlotGrant {
    core: Arc<GroupCore>,
    released: bool,
}

impl Drop for SlotGrant {
    fn drop(&mut self) {
        if !self.released {
            self.released = true;
            self.core.release_slot();
        }
    }
}

impl std::fmt::Debug for SlotGrant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotGrant").field("scope", &self.core.scope).finish()
    }
}

/// The set of grants one execution holds, released LIFO.
#[derive(Debug, Default)]
pub struct BulkheadToken {
    grants: Vec<SlotGrant>,
}

impl BulkheadToken {
    /// Release all held slots, innermost group first.
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for BulkheadToken {
    fn drop(&mut self) {
        while let Some(grant) = self.grants.pop() {
            drop(grant);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct GroupStats {
    pub scope: String,
    pub active: usize,
    pub queued: usize,
    pub max_concurrent: usize,
    pub max_queued: usize,
    pub rejected: u64,
    pub timed_out: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct BulkheadStats {
    pub global: GroupStats,
    pub tenants: Vec<GroupStats>,
    pub handlers: Vec<GroupStats>,
}

/// Nested admission gate; see the module docs.
pub struct Bulkhead {
    config: BulkheadConfig,
    global: Arc<GroupCore>,
    tenants: Mutex<HashMap<String, Arc<GroupCore>>>,
    handlers: Mutex<HashMap<String, Arc<GroupCore>>>,
}

impl std::fmt::Debug for Bulkhead {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bulkhead").field("global", &self.global.stats()).finish_non_exhaustive()
    }
}

impl Bulkhead {
    pub fn new(config: BulkheadConfig) -> Self {
        Self {
            config,
            global: GroupCore::new("global".into(), config.global),
            tenants: Mutex::new(HashMap::new()),
            handlers: Mutex::new(HashMap::new()),
        }
    }

    fn tenant_group(&self, tenant: &str) -> Option<Arc<GroupCore>> {
        let limits = self.config.per_tenant?;
        let mut groups = self.tenants.lock().unwrap_or_else(|p| p.into_inner());
        Some(Arc::clone(
            groups
                .entry(tenant.to_owned())
                .or_insert_with(|| GroupCore::new(format!("tenant:{tenant}"), limits)),
        ))
    }

    fn handler_group(&self, handler: &str) -> Option<Arc<GroupCore>> {
        let limits = self.config.per_handler?;
        let mut groups = self.handlers.lock().unwrap_or_else(|p| p.into_inner());
        Some(Arc::clone(
            groups
                .entry(handler.to_owned())
                .or_insert_with(|| GroupCore::new(format!("handler:{handler}"), limits)),
        ))
    }

    /// Acquire global → tenant → handler slots. If a nested acquire
    /// fails, everything already held is released LIFO before the error
    /// propagates.
    pub async fn acquire(&self, tenant: &str, handler: &str) -> Result<BulkheadToken, EngineError> {
        let mut token = BulkheadToken::default();

        match self.global.acquire_slot().await {
            Ok(grant) => token.grants.push(grant),
            Err(err) => return Err(err),
        }

        if let Some(group) = self.tenant_group(tenant) {
            match group.acquire_slot().await {
                Ok(grant) => token.grants.push(grant),
                // Dropping the token unwinds the global grant.
                Err(err) => return Err(err),
            }
        }

        if let Some(group) = self.handler_group(handler) {
            match group.acquire_slot().await {
                Ok(grant) => token.grants.push(grant),
                Err(err) => return Err(err),
            }
        }

        Ok(token)
    }

    pub fn stats(&self) -> BulkheadStats {
        let mut tenants: Vec<GroupStats> = self
            .tenants
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .values()
            .map(|g| g.stats())
            .collect();
        tenants.sort_by(|a, b| a.scope.cmp(&b.scope));
        let mut handlers: Vec<GroupStats> = self
            .handlers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .values()
            .map(|g| g.stats())
            .collect();
        handlers.sort_by(|a, b| a.scope.cmp(&b.scope));
        BulkheadStats { global: self.global.stats(), tenants, handlers }
    }

    /// Fraction of global capacity currently in use, for health checks.
    pub fn global_utilization(&self) -> f64 {
        let stats = self.global.stats();
        if stats.max_concurrent == 0 {
            return 1.0;
        }
        stats.active as f64 / stats.max_concurrent as f64
    }
}
