//! Named circuit breaker gating calls to failure-prone collaborators.
//!
//! Closed counts failures inside a sliding monitor window; reaching the
//! threshold opens the circuit, which rejects without invoking the
//! operation until the reset timeout elapses. Half-open admits a bounded
//! number of probes; one success closes the circuit, any failure
//! re-opens it. All transitions are lock-free CAS on atomics and logged.

use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::time::{Clock, MonotonicClock};

const STATE_CLOSED: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_HALF_OPEN: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Failures within the monitor window before the circuit opens.
    pub failure_threshold: usize,
    /// How long an open circuit rejects before probing.
    pub reset_timeout: Duration,
    /// Concurrent probes admitted while half-open.
    pub half_open_max_attempts: usize,
    /// Sliding window over which closed-state failures are counted.
    pub monitor_window: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
            half_open_max_attempts: 1,
            monitor_window: Duration::from_secs(60),
        }
    }
}

impl CircuitBreakerConfig {
    /// A breaker that never opens; useful to switch protection off.
    pub fn disabled() -> Self {
        Self { failure_threshold: usize::MAX, ..Default::default() }
    }
}

/// Rejection or passthrough failure from [`CircuitBreaker::run`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CircuitError<E> {
    /// The circuit rejected the call without invoking the operation.
    Open { failures: usize, retry_after: Duration },
    /// The operation ran and failed.
    Inner(E),
}

impl<E> CircuitError<E> {
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open { .. })
    }

    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }
}

impl<E: std::fmt::Display> std::fmt::Display for CircuitError<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open { failures, retry_after } => {
                write!(f, "circuit open ({failures} failures, retry in {retry_after:?})")
            }
            Self::Inner(e) => write!(f, "{e}"),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for CircuitError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub(crate) struct BreakerState {
    state: AtomicU8,
    failure_count: AtomicUsize,
    window_start_millis: AtomicU64,
    opened_at_millis: AtomicU64,
    half_open_calls: AtomicUsize,
}

impl BreakerState {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(STATE_CLOSED),
            failure_count: AtomicUsize::new(0),
            window_start_millis: AtomicU64::new(0),
            opened_at_millis: AtomicU64::new(0),
            half_open_calls: AtomicUsize::new(0),
        }
    }

    pub(crate) fn current_state(&self) -> CircuitState {
        match self.state.load(Ordering::Acquire) {
            STATE_OPEN => CircuitState::Open,
            STATE_HALF_OPEN => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }

    pub(crate) fn reset(&self) {
        self.state.store(STATE_CLOSED, Ordering::Release);
        self.failure_count.store(0, Ordering::Release);
        self.opened_at_millis.store(0, Ordering::Release);
        self.half_open_calls.store(0, Ordering::Release);
    }
}

/// Cloneable handle to one named circuit; clones share state.
#[derive(Clone)]
pub struct CircuitBreaker {
    name: Arc<str>,
    state: Arc<BreakerState>,
    config: Arc<CircuitBreakerConfig>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &self.state.current_state())
            .finish()
    }
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: Arc::from(name.into()),
            state: Arc::new(BreakerState::new()),
            config: Arc::new(config),
            clock: Arc::new(MonotonicClock::default()),
        }
    }

    /// Override the clock for deterministic tests.
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> CircuitState {
        self.state.current_state()
    }

    /// Force-close the circuit, clearing counters.
    pub fn reset(&self) {
        self.state.reset();
        tracing::info!(circuit = %self.name, "circuit breaker reset → closed");
    }

    /// Gate `operation` by the current circuit state.
    pub async fn run<T, E, Fut, Op>(&self, mut operation: Op) -> Result<T, CircuitError<E>>
    where
        T: Send,
        E: Send,
        Fut: Future<Output = Result<T, E>> + Send,
        Op: FnMut() -> Fut + Send,
    {
        loop {
            match self.state.state.load(Ordering::Acquire) {
                STATE_OPEN => {
                    let opened_at = self.state.opened_at_millis.load(Ordering::Acquire);
                    let elapsed = self.clock.now_millis().saturating_sub(opened_at);
                    let reset_ms = self.config.reset_timeout.as_millis() as u64;

                    if elapsed >= reset_ms {
                        match self.state.state.compare_exchange(
                            STATE_OPEN,
                            STATE_HALF_OPEN,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        ) {
                            Ok(_) => {
                                tracing::info!(circuit = %self.name, "circuit breaker → half-open");
                                self.state.half_open_calls.store(1, Ordering::Release);
                                break;
                            }
                            Err(_) => continue,
                        }
                    } else {
                        return Err(CircuitError::Open {
                            failures: self.state.failure_count.load(Ordering::Acquire),
                            retry_after: Duration::from_millis(reset_ms - elapsed),
                        });
                    }
                }
                STATE_HALF_OPEN => {
                    let probes = self.state.half_open_calls.fetch_add(1, Ordering::AcqRel);
                    if probes >= self.config.half_open_max_attempts {
                        self.state.half_open_calls.fetch_sub(1, Ordering::Release);
                        return Err(CircuitError::Open {
                            failures: self.state.failure_count.load(Ordering::Acquire),
                            retry_after: self.config.reset_timeout,
                        });
                    }
                    break;
                }
                _ => break,
            }
        }

        let was_half_open = self.state.state.load(Ordering::Acquire) == STATE_HALF_OPEN;
        let result = operation().await;
        if was_half_open {
            self.state.half_open_calls.fetch_sub(1, Ordering::Release);
        }

        match &result {
            Ok(_) => self.on_success(),
            Err(_) => self.on_failure(),
        }

        result.map_err(CircuitError::Inner)
    }

    /// Time until an open circuit admits a probe; zero when not open.
    pub fn retry_after(&self) -> Duration {
        if self.state.current_state() != CircuitState::Open {
            return Duration::ZERO;
        }
        let opened_at = self.state.opened_at_millis.load(Ordering::Acquire);
        let elapsed = self.clock.now_millis().saturating_sub(opened_at);
        self.config.reset_timeout.saturating_sub(Duration::from_millis(elapsed))
    }

    fn on_success(&self) {
        match self.state.state.load(Ordering::Acquire) {
            STATE_HALF_OPEN => {
                if self
                    .state
                    .state
                    .compare_exchange(
                        STATE_HALF_OPEN,
                        STATE_CLOSED,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
                {
                    self.state.failure_count.store(0, Ordering::Release);
                    self.state.opened_at_millis.store(0, Ordering::Release);
                    tracing::info!(circuit = %self.name, "circuit breaker → closed");
                }
            }
            STATE_CLOSED => {
                self.state.failure_count.store(0, Ordering::Release);
            }
            _ => {}
        }
    }

    fn on_failure(&self) {
        let now = self.clock.now_millis();
        match self.state.state.load(Ordering::Acquire) {
            STATE_HALF_OPEN => {
                if self
                    .state
                    .state
                    .compare_exchange(
                        STATE_HALF_OPEN,
                        STATE_OPEN,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
                {
                    self.state.opened_at_millis.store(now, Ordering::Release);
                    tracing::warn!(circuit = %self.name, "circuit breaker: probe failed → open");
                }
            }
            STATE_CLOSED => {
                let window_ms = self.config.monitor_window.as_millis() as u64;
                let window_start = self.state.window_start_millis.load(Ordering::Acquire);
                let failures = if now.saturating_sub(window_start) >= window_ms {
                    // Window rolled over; this failure starts a fresh one.
                    self.state.window_start_millis.store(now, Ordering::Release);
                    self.state.failure_count.store(1, Ordering::Release);
                    1
                } else {
                    self.state.failure_count.fetch_add(1, Ordering::AcqRel) + 1
                };

                if failures >= self.config.failure_threshold
                    && self
                        .state
                        .state
                        .compare_exchange(
                            STATE_CLOSED,
                            STATE_OPEN,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                {
                    self.state.opened_at_millis.store(now, Ordering::Release);
                    tracing::error!(
                        circuit = %self.name,
                        failures,
                        threshold = self.config.failure_threshold,
                        "circuit breaker → open"
                    );
                }
            }
            _ => {}
        }
    }
}
