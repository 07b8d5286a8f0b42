//! Resource limits, usage accounting, and violation records.
//!
//! Invariants
//! - Every limit is positive; CPU percent lives in [1, 100].
//! - Usage counters are monotone non-decreasing, except the `current_*`
//!   gauges which may fall as resources are released.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Hard per-execution caps. Enforcement happens in the resource monitor;
/// threshold warnings are advisory and separate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub max_memory_mb: u64,
    pub max_cpu_percent: u64,
    pub timeout_ms: u64,
    pub max_network_requests: u64,
    pub max_filesystem_ops: u64,
    pub max_concurrent_ops: u64,
    pub max_payload_bytes: u64,
    pub max_retries: u32,
    pub network_timeout_ms: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_memory_mb: 512,
            max_cpu_percent: 80,
            timeout_ms: 30_000,
            max_network_requests: 100,
            max_filesystem_ops: 1_000,
            max_concurrent_ops: 10,
            max_payload_bytes: 10 * 1024 * 1024,
            max_retries: 3,
            network_timeout_ms: 5_000,
        }
    }
}

/// Rejections raised by [`ResourceLimits::validate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum LimitsError {
    #[error("max_memory_mb must be > 0")]
    ZeroMemory,
    #[error("max_cpu_percent must be in [1, 100] (got {0})")]
    CpuPercentOutOfRange(u64),
    #[error("timeout_ms must be > 0")]
    ZeroTimeout,
    #[error("{field} must be > 0")]
    ZeroCounter { field: &'static str },
}

impl ResourceLimits {
    pub fn validate(&self) -> Result<(), LimitsError> {
        if self.max_memory_mb == 0 {
            return Err(LimitsError::ZeroMemory);
        }
        if self.max_cpu_percent == 0 || self.max_cpu_percent > 100 {
            return Err(LimitsError::CpuPercentOutOfRange(self.max_cpu_percent));
        }
        if self.timeout_ms == 0 {
            return Err(LimitsError::ZeroTimeout);
        }
        for (field, value) in [
            ("max_network_requests", self.max_network_requests),
            ("max_filesystem_ops", self.max_filesystem_ops),
            ("max_concurrent_ops", self.max_concurrent_ops),
            ("max_payload_bytes", self.max_payload_bytes),
            ("network_timeout_ms", self.network_timeout_ms),
        ] {
            if value == 0 {
                return Err(LimitsError::ZeroCounter { field });
            }
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Apply a partial override on top of these limits (right wins).
    pub fn merged(mut self, overrides: &LimitOverrides) -> Self {
        if let Some(v) = overrides.max_memory_mb {
            self.max_memory_mb = v;
        }
        if let Some(v) = overrides.max_cpu_percent {
            self.max_cpu_percent = v;
        }
        if let Some(v) = overrides.timeout_ms {
            self.timeout_ms = v;
        }
        if let Some(v) = overrides.max_network_requests {
            self.max_network_requests = v;
        }
        if let Some(v) = overrides.max_filesystem_ops {
            self.max_filesystem_ops = v;
        }
        if let Some(v) = overrides.max_concurrent_ops {
            self.max_concurrent_ops = v;
        }
        if let Some(v) = overrides.max_payload_bytes {
            self.max_payload_bytes = v;
        }
        if let Some(v) = overrides.max_retries {
            self.max_retries = v;
        }
        if let Some(v) = overrides.network_timeout_ms {
            self.network_timeout_ms = v;
        }
        self
    }
}

/// Sparse limit overrides carried by handler definitions and execution
/// contexts. `None` fields defer to the layer below.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitOverrides {
    pub max_memory_mb: Option<u64>,
    pub max_cpu_percent: Option<u64>,
    pub timeout_ms: Option<u64>,
    pub max_network_requests: Option<u64>,
    pub max_filesystem_ops: Option<u64>,
    pub max_concurrent_ops: Option<u64>,
    pub max_payload_bytes: Option<u64>,
    pub max_retries: Option<u32>,
    pub network_timeout_ms: Option<u64>,
}

impl LimitOverrides {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    pub fn timeout_ms(mut self, ms: u64) -> Self {
        self.timeout_ms = Some(ms);
        self
    }

    pub fn max_memory_mb(mut self, mb: u64) -> Self {
        self.max_memory_mb = Some(mb);
        self
    }

    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = Some(retries);
        self
    }
}

/// Point-in-time usage snapshot for one execution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub peak_memory_mb: u64,
    pub current_memory_mb: u64,
    pub cpu_ms: u64,
    pub wall_ms: u64,
    pub network_requests: u64,
    pub network_bytes_in: u64,
    pub network_bytes_out: u64,
    pub filesystem_reads: u64,
    pub filesystem_writes: u64,
    pub concurrent_ops: u64,
}

impl ResourceUsage {
    /// CPU utilization as a percentage of wall time; zero before any
    /// wall time has elapsed.
    pub fn cpu_percent(&self) -> u64 {
        if self.wall_ms == 0 {
            0
        } else {
            self.cpu_ms.saturating_mul(100) / self.wall_ms
        }
    }
}

/// Dimension that exceeded its hard limit. Order matters: the monitor
/// checks dimensions in this declaration order and reports the first hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    Memory,
    Cpu,
    WallClock,
    NetworkRequests,
    FilesystemOps,
    ConcurrentOps,
    NetworkBytes,
}

impl ViolationKind {
    pub fn resource(&self) -> &'static str {
        match self {
            Self::Memory => "memory_mb",
            Self::Cpu => "cpu_percent",
            Self::WallClock => "wall_ms",
            Self::NetworkRequests => "network_requests",
            Self::FilesystemOps => "filesystem_ops",
            Self::ConcurrentOps => "concurrent_ops",
            Self::NetworkBytes => "network_bytes",
        }
    }
}

/// Typed record of one hard-limit breach.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    pub kind: ViolationKind,
    pub limit: u64,
    pub actual: u64,
    pub execution_id: String,
    pub timestamp: DateTime<Utc>,
}

impl Violation {
    pub fn new(kind: ViolationKind, limit: u64, actual: u64, execution_id: &str) -> Self {
        Self { kind, limit, actual, execution_id: execution_id.to_owned(), timestamp: Utc::now() }
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} > limit {}", self.kind.resource(), self.actual, self.limit)
    }
}
