//! Per-execution resource accounting and breach detection.
//!
//! Handlers report network, filesystem, memory, and concurrency usage
//! through [`ResourceMonitor`] handles; an optional host sampler adds
//! process-level memory/CPU readings on a fixed interval. `check()`
//! enforces hard limits in a fixed dimension order; threshold fractions
//! emit advisory warning/critical signals that the engine surfaces via
//! audit but does not enforce.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::limits::{ResourceLimits, ResourceUsage, Violation, ViolationKind};

/// Host-process readings, when the platform exposes them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessSample {
    pub memory_mb: u64,
    pub cpu_ms: u64,
}

/// Source of host-process samples. The default [`NoopSampler`] reports
/// nothing, leaving usage purely handler-reported.
pub trait ProcessSampler: Send + Sync + std::fmt::Debug {
    fn sample(&self) -> Option<ProcessSample>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSampler;

impl ProcessSampler for NoopSampler {
    fn sample(&self) -> Option<ProcessSample> {
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThresholdLevel {
    Warning,
    Critical,
}

/// Advisory signal emitted when usage crosses a configured fraction of
/// its hard limit.
#[derive(Debug, Clone, PartialEq)]
pub struct ThresholdSignal {
    pub execution_id: String,
    pub kind: ViolationKind,
    pub level: ThresholdLevel,
    pub fraction: f64,
    pub usage: ResourceUsage,
}

#[derive(Debug, Clone, Copy)]
pub struct MonitorConfig {
    pub sample_interval: Duration,
    pub memory_warning_fraction: f64,
    pub memory_critical_fraction: f64,
    pub cpu_warning_fraction: f64,
    pub cpu_critical_fraction: f64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            sample_interval: Duration::from_millis(100),
            memory_warning_fraction: 0.75,
            memory_critical_fraction: 0.90,
            cpu_warning_fraction: 0.80,
            cpu_critical_fraction: 0.95,
        }
    }
}

#[derive(Debug)]
struct Counters {
    peak_memory_mb: AtomicU64,
    current_memory_mb: AtomicU64,
    cpu_ms: AtomicU64,
    network_requests: AtomicU64,
    network_bytes_in: AtomicU64,
    network_bytes_out: AtomicU64,
    filesystem_reads: AtomicU64,
    filesystem_writes: AtomicU64,
    concurrent_ops: AtomicU64,
}

impl Counters {
    fn new() -> Self {
        Self {
            peak_memory_mb: AtomicU64::new(0),
            current_memory_mb: AtomicU64::new(0),
            cpu_ms: AtomicU64::new(0),
            network_requests: AtomicU64::new(0),
            network_bytes_in: AtomicU64::new(0),
            network_bytes_out: AtomicU64::new(0),
            filesystem_reads: AtomicU64::new(0),
            filesystem_writes: AtomicU64::new(0),
            concurrent_ops: AtomicU64::new(0),
        }
    }
}

#[derive(Debug)]
struct MonitorInner {
    execution_id: String,
    limits: ResourceLimits,
    started: Instant,
    counters: Counters,
    // Dedup flags so each threshold fires at most once per execution.
    memory_warned: AtomicBool,
    memory_critical: AtomicBool,
    cpu_warned: AtomicBool,
    cpu_critical: AtomicBool,
    violation: Mutex<Option<Violation>>,
    signals: mpsc::UnboundedSender<ThresholdSignal>,
    config: MonitorConfig,
}

/// Owned by the engine for the lifetime of one execution attempt.
/// Cloning shares the counters so a [`crate::handler::HandlerContext`]
/// can record into the same accounting.
#[derive(Debug, Clone)]
pub struct ResourceMonitor {
    inner: Arc<MonitorInner>,
    stop: CancellationToken,
}

impl ResourceMonitor {
    /// Create the monitor and spawn its sampling task. `cancel` is
    /// tripped when a sampled hard limit is breached, so a runaway
    /// handler is cancelled without its cooperation.
    pub fn start(
        execution_id: impl Into<String>,
        limits: ResourceLimits,
        config: MonitorConfig,
        sampler: Arc<dyn ProcessSampler>,
        cancel: CancellationToken,
    ) -> (Self, mpsc::UnboundedReceiver<ThresholdSignal>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let inner = Arc::new(MonitorInner {
            execution_id: execution_id.into(),
            limits,
            started: Instant::now(),
            counters: Counters::new(),
            memory_warned: AtomicBool::new(false),
            memory_critical: AtomicBool::new(false),
            cpu_warned: AtomicBool::new(false),
            cpu_critical: AtomicBool::new(false),
            violation: Mutex::new(None),
            signals: tx,
            config,
        });
        let stop = CancellationToken::new();

        let monitor = Self { inner: Arc::clone(&inner), stop: stop.clone() };
        let tick_monitor = monitor.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(config.sample_interval) => {}
                }
                if let Some(sample) = sampler.sample() {
                    tick_monitor.record_memory(sample.memory_mb);
                    tick_monitor.inner.counters.cpu_ms.store(sample.cpu_ms, Ordering::Relaxed);
                }
                tick_monitor.evaluate_thresholds();
                if let Some(violation) = tick_monitor.check() {
                    tracing::warn!(
                        execution_id = %tick_monitor.inner.execution_id,
                        %violation,
                        "hard resource limit breached; cancelling execution"
                    );
                    cancel.cancel();
                    break;
                }
            }
        });

        (monitor, rx)
    }

    pub fn execution_id(&self) -> &str {
        &self.inner.execution_id
    }

    pub fn record_network(&self, bytes_in: u64, bytes_out: u64) {
        self.inner.counters.network_requests.fetch_add(1, Ordering::Relaxed);
        self.inner.counters.network_bytes_in.fetch_add(bytes_in, Ordering::Relaxed);
        self.inner.counters.network_bytes_out.fetch_add(bytes_out, Ordering::Relaxed);
    }

    pub fn record_filesystem_read(&self) {
        self.inner.counters.filesystem_reads.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_filesystem_write(&self) {
        self.inner.counters.filesystem_writes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_memory(&self, memory_mb: u64) {
        self.inner.counters.current_memory_mb.store(memory_mb, Ordering::Relaxed);
        self.inner.counters.peak_memory_mb.fetch_max(memory_mb, Ordering::Relaxed);
        self.evaluate_thresholds();
    }

    /// Advisory gauge reported by the handler; the core does not verify it.
    pub fn set_concurrent(&self, count: u64) {
        self.inner.counters.concurrent_ops.store(count, Ordering::Relaxed);
    }

    pub fn add_cpu_ms(&self, cpu_ms: u64) {
        self.inner.counters.cpu_ms.fetch_add(cpu_ms, Ordering::Relaxed);
    }

    pub fn usage(&self) -> ResourceUsage {
        let c = &self.inner.counters;
        ResourceUsage {
            peak_memory_mb: c.peak_memory_mb.load(Ordering::Relaxed),
            current_memory_mb: c.current_memory_mb.load(Ordering::Relaxed),
            cpu_ms: c.cpu_ms.load(Ordering::Relaxed),
            wall_ms: self.inner.started.elapsed().as_millis() as u64,
            network_requests: c.network_requests.load(Ordering::Relaxed),
            network_bytes_in: c.network_bytes_in.load(Ordering::Relaxed),
            network_bytes_out: c.network_bytes_out.load(Ordering::Relaxed),
            filesystem_reads: c.filesystem_reads.load(Ordering::Relaxed),
            filesystem_writes: c.filesystem_writes.load(Ordering::Relaxed),
            concurrent_ops: c.concurrent_ops.load(Ordering::Relaxed),
        }
    }

    /// First exceeded dimension in fixed order: memory, CPU %, wall
    /// deadline, network count, filesystem ops, concurrent ops, network
    /// bytes.
    pub fn check(&self) -> Option<Violation> {
        let usage = self.usage();
        let limits = &self.inner.limits;
        let id = &self.inner.execution_id;

        let violation = if usage.peak_memory_mb > limits.max_memory_mb {
            Some(Violation::new(ViolationKind::Memory, limits.max_memory_mb, usage.peak_memory_mb, id))
        } else if usage.cpu_percent() > limits.max_cpu_percent {
            Some(Violation::new(ViolationKind::Cpu, limits.max_cpu_percent, usage.cpu_percent(), id))
        } else if usage.wall_ms > limits.timeout_ms {
            Some(Violation::new(ViolationKind::WallClock, limits.timeout_ms, usage.wall_ms, id))
        } else if usage.network_requests > limits.max_network_requests {
            Some(Violation::new(
                ViolationKind::NetworkRequests,
                limits.max_network_requests,
                usage.network_requests,
                id,
            ))
        } else if usage.filesystem_reads + usage.filesystem_writes > limits.max_filesystem_ops {
            Some(Violation::new(
                ViolationKind::FilesystemOps,
                limits.max_filesystem_ops,
                usage.filesystem_reads + usage.filesystem_writes,
                id,
            ))
        } else if usage.concurrent_ops > limits.max_concurrent_ops {
            Some(Violation::new(
                ViolationKind::ConcurrentOps,
                limits.max_concurrent_ops,
                usage.concurrent_ops,
                id,
            ))
        } else if usage.network_bytes_in + usage.network_bytes_out > limits.max_payload_bytes {
            Some(Violation::new(
                ViolationKind::NetworkBytes,
                limits.max_payload_bytes,
                usage.network_bytes_in + usage.network_bytes_out,
                id,
            ))
        } else {
            None
        };

        if let Some(violation) = &violation {
            let mut slot = self.inner.violation.lock().unwrap_or_else(|p| p.into_inner());
            slot.get_or_insert_with(|| violation.clone());
        }
        violation
    }

    /// The first hard breach observed, if any (kept after `check`).
    pub fn violation(&self) -> Option<Violation> {
        self.inner.violation.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// Stop sampling and return the final usage snapshot.
    pub fn stop(self) -> ResourceUsage {
        self.stop.cancel();
        self.usage()
    }

    fn evaluate_thresholds(&self) {
        let usage = self.usage();
        let limits = &self.inner.limits;
        let cfg = &self.inner.config;

        let memory_fraction = usage.peak_memory_mb as f64 / limits.max_memory_mb as f64;
        if memory_fraction >= cfg.memory_critical_fraction {
            self.emit_once(&self.inner.memory_critical, ViolationKind::Memory, ThresholdLevel::Critical, memory_fraction, usage);
        } else if memory_fraction >= cfg.memory_warning_fraction {
            self.emit_once(&self.inner.memory_warned, ViolationKind::Memory, ThresholdLevel::Warning, memory_fraction, usage);
        }

        let cpu_fraction = usage.cpu_percent() as f64 / limits.max_cpu_percent as f64;
        if cpu_fraction >= cfg.cpu_critical_fraction {
            self.emit_once(&self.inner.cpu_critical, ViolationKind::Cpu, ThresholdLevel::Critical, cpu_fraction, usage);
        } else if cpu_fraction >= cfg.cpu_warning_fraction {
            self.emit_once(&self.inner.cpu_warned, ViolationKind::Cpu, ThresholdLevel::Warning, cpu_fraction, usage);
        }
    }

    fn emit_once(
        &self,
        flag: &AtomicBool,
        kind: ViolationKind,
        level: ThresholdLevel,
        fraction: f64,
        usage: ResourceUsage,
    ) {
        if flag.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.inner.signals.send(ThresholdSignal {
            execution_id: self.inner.execution_id.clone(),
            kind,
            level,
            fraction,
            usage,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor(limits: ResourceLimits) -> (ResourceMonitor, mpsc::UnboundedReceiver<ThresholdSignal>) {
        ResourceMonitor::start(
            "exec-1",
            limits,
            MonitorConfig { sample_interval: Duration::from_secs(3600), ..Default::default() },
            Arc::new(NoopSampler),
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn counters_accumulate() {
        let (mon, _rx) = monitor(ResourceLimits::default());
        mon.record_network(100, 50);
        mon.record_network(10, 5);
        mon.record_filesystem_read();
        mon.record_filesystem_write();
        mon.record_memory(64);
        mon.set_concurrent(3);

        let usage = mon.usage();
        assert_eq!(usage.network_requests, 2);
        assert_eq!(usage.network_bytes_in, 110);
        assert_eq!(usage.network_bytes_out, 55);
        assert_eq!(usage.filesystem_reads, 1);
        assert_eq!(usage.filesystem_writes, 1);
        assert_eq!(usage.peak_memory_mb, 64);
        assert_eq!(usage.concurrent_ops, 3);
    }

    #[tokio::test]
    async fn peak_memory_is_monotone() {
        let (mon, _rx) = monitor(ResourceLimits::default());
        mon.record_memory(100);
        mon.record_memory(40);
        let usage = mon.usage();
        assert_eq!(usage.peak_memory_mb, 100);
        assert_eq!(usage.current_memory_mb, 40);
    }

    #[tokio::test]
    async fn check_reports_first_dimension_in_fixed_order() {
        let limits = ResourceLimits {
            max_memory_mb: 10,
            max_network_requests: 1,
            ..Default::default()
        };
        let (mon, _rx) = monitor(limits);
        // Breach both memory and network; memory is tested first.
        mon.record_memory(20);
        mon.record_network(1, 1);
        mon.record_network(1, 1);

        let violation = mon.check().expect("violation");
        assert_eq!(violation.kind, ViolationKind::Memory);
        assert_eq!(violation.execution_id, "exec-1");
        assert_eq!(mon.violation().unwrap().kind, ViolationKind::Memory);
    }

    #[tokio::test]
    async fn network_count_violation() {
        let limits = ResourceLimits { max_network_requests: 2, ..Default::default() };
        let (mon, _rx) = monitor(limits);
        for _ in 0..3 {
            mon.record_network(1, 1);
        }
        assert_eq!(mon.check().unwrap().kind, ViolationKind::NetworkRequests);
    }

    #[tokio::test]
    async fn no_violation_under_limits() {
        let (mon, _rx) = monitor(ResourceLimits::default());
        mon.record_memory(1);
        mon.record_network(10, 10);
        assert!(mon.check().is_none());
        assert!(mon.violation().is_none());
    }

    #[tokio::test]
    async fn threshold_signals_fire_once_per_level() {
        let limits = ResourceLimits { max_memory_mb: 100, ..Default::default() };
        let (mon, mut rx) = monitor(limits);

        mon.record_memory(80); // warning band
        mon.record_memory(81); // still warning; deduped
        let signal = rx.try_recv().expect("warning signal");
        assert_eq!(signal.level, ThresholdLevel::Warning);
        assert_eq!(signal.kind, ViolationKind::Memory);
        assert!(rx.try_recv().is_err(), "warning must fire once");

        mon.record_memory(95); // critical band
        let signal = rx.try_recv().expect("critical signal");
        assert_eq!(signal.level, ThresholdLevel::Critical);
    }

    #[tokio::test]
    async fn sampler_breach_cancels_execution_token() {
        let cancel = CancellationToken::new();
        let limits = ResourceLimits { max_memory_mb: 10, ..Default::default() };
        let (mon, _rx) = ResourceMonitor::start(
            "exec-1",
            limits,
            MonitorConfig { sample_interval: Duration::from_millis(10), ..Default::default() },
            Arc::new(NoopSampler),
            cancel.clone(),
        );
        mon.record_memory(50);

        tokio::time::timeout(Duration::from_secs(1), cancel.cancelled())
            .await
            .expect("sampler should cancel on breach");
        assert_eq!(mon.violation().unwrap().kind, ViolationKind::Memory);
    }

    #[tokio::test]
    async fn stop_returns_final_snapshot() {
        let (mon, _rx) = monitor(ResourceLimits::default());
        mon.record_network(5, 5);
        let usage = mon.stop();
        assert_eq!(usage.network_requests, 1);
    }
}
