//! Health reporting types.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Health of a driver or pattern. Ordered from best to worst so that
/// aggregation can take the maximum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    /// Worst status across constituents; an empty set is healthy
    pub fn worst_of(statuses: impl IntoIterator<Item = HealthStatus>) -> HealthStatus {
        statuses
            .into_iter()
            .max()
            .unwrap_or(HealthStatus::Healthy)
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
        };
        f.write_str(s)
    }
}

/// Health check result with per-component details
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub message: String,
    #[serde(default)]
    pub details: BTreeMap<String, String>,
}

impl HealthReport {
    pub fn healthy() -> Self {
        Self {
            status: HealthStatus::Healthy,
            message: "ok".to_string(),
            details: BTreeMap::new(),
        }
    }

    pub fn degraded(message: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Degraded,
            message: message.into(),
            details: BTreeMap::new(),
        }
    }

    pub fn unhealthy(message: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Unhealthy,
            message: message.into(),
            details: BTreeMap::new(),
        }
    }

    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }

    /// Merge a constituent report under `name`, keeping the worst status
    pub fn merge(&mut self, name: &str, other: &HealthReport) {
        self.status = self.status.max(other.status);
        if other.status > HealthStatus::Healthy {
            self.message = format!("{name}: {}", other.message);
        }
        self.details
            .insert(name.to_string(), other.status.to_string());
        for (k, v) in &other.details {
            self.details.insert(format!("{name}.{k}"), v.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worst_of_takes_maximum() {
        let worst = HealthStatus::worst_of([
            HealthStatus::Healthy,
            HealthStatus::Unhealthy,
            HealthStatus::Degraded,
        ]);
        assert_eq!(worst, HealthStatus::Unhealthy);
        assert_eq!(HealthStatus::worst_of([]), HealthStatus::Healthy);
    }

    #[test]
    fn merge_keeps_worst_and_prefixes_details() {
        let mut agg = HealthReport::healthy();
        agg.merge("registry", &HealthReport::healthy());
        agg.merge(
            "messaging",
            &HealthReport::degraded("reconnecting").with_detail("attempts", "3"),
        );
        assert_eq!(agg.status, HealthStatus::Degraded);
        assert_eq!(agg.details.get("messaging.attempts").unwrap(), "3");
    }
}
