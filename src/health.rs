//! Aggregate health and readiness reports.

use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    fn rank(&self) -> u8 {
        match self {
            Self::Healthy => 0,
            Self::Degraded => 1,
            Self::Unhealthy => 2,
        }
    }

    pub fn worst(statuses: impl IntoIterator<Item = HealthStatus>) -> HealthStatus {
        statuses
            .into_iter()
            .max_by_key(HealthStatus::rank)
            .unwrap_or(HealthStatus::Healthy)
    }
}

/// One dependency's contribution to the overall report.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthCheck {
    pub status: HealthStatus,
    pub detail: String,
    /// Critical checks drag the overall status to unhealthy; non-critical
    /// ones cap out at degraded.
    pub critical: bool,
}

impl HealthCheck {
    pub fn healthy(detail: impl Into<String>) -> Self {
        Self { status: HealthStatus::Healthy, detail: detail.into(), critical: true }
    }

    pub fn degraded(detail: impl Into<String>) -> Self {
        Self { status: HealthStatus::Degraded, detail: detail.into(), critical: true }
    }

    pub fn unhealthy(detail: impl Into<String>) -> Self {
        Self { status: HealthStatus::Unhealthy, detail: detail.into(), critical: true }
    }

    pub fn non_critical(mut self) -> Self {
        self.critical = false;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub checks: BTreeMap<String, HealthCheck>,
}

impl HealthReport {
    /// Overall = unhealthy if any critical check is unhealthy, else
    /// degraded if anything is degraded, else healthy.
    pub fn aggregate(checks: BTreeMap<String, HealthCheck>) -> Self {
        let mut status = HealthStatus::Healthy;
        for check in checks.values() {
            let effective = match (check.status, check.critical) {
                (HealthStatus::Unhealthy, false) => HealthStatus::Degraded,
                (status, _) => status,
            };
            status = HealthStatus::worst([status, effective]);
        }
        Self { status, checks }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReadinessReport {
    pub ready: bool,
    pub checks: BTreeMap<String, bool>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(entries: Vec<(&str, HealthCheck)>) -> HealthReport {
        HealthReport::aggregate(
            entries.into_iter().map(|(name, check)| (name.to_owned(), check)).collect(),
        )
    }

    #[test]
    fn all_healthy_is_healthy() {
        let r = report(vec![
            ("handlers", HealthCheck::healthy("1 active")),
            ("bulkhead", HealthCheck::healthy("2% utilized")),
        ]);
        assert_eq!(r.status, HealthStatus::Healthy);
    }

    #[test]
    fn any_degraded_makes_overall_degraded() {
        let r = report(vec![
            ("handlers", HealthCheck::healthy("ok")),
            ("bulkhead", HealthCheck::degraded("93% utilized")),
        ]);
        assert_eq!(r.status, HealthStatus::Degraded);
    }

    #[test]
    fn critical_unhealthy_wins() {
        let r = report(vec![
            ("handlers", HealthCheck::unhealthy("none active")),
            ("cache", HealthCheck::degraded("l2 down")),
        ]);
        assert_eq!(r.status, HealthStatus::Unhealthy);
    }

    #[test]
    fn non_critical_unhealthy_caps_at_degraded() {
        let r = report(vec![
            ("handlers", HealthCheck::healthy("ok")),
            ("cache_l2", HealthCheck::unhealthy("store down").non_critical()),
        ]);
        assert_eq!(r.status, HealthStatus::Degraded);
    }
}
