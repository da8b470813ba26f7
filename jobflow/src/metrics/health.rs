//! Health check implementation.
//!
//! Provides per-component health checks and the overall system roll-up.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::database::repositories::JobStats;
use crate::pipeline::QueueDepthStatus;

/// Share of finished jobs that may fail before the engine reports degraded.
const FAILURE_RATE_THRESHOLD: f64 = 0.5;

/// Health status of a component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum HealthStatus {
    /// Component is healthy.
    Healthy,
    /// Component is degraded but functional.
    Degraded,
    /// Component is unhealthy.
    Unhealthy,
}

/// Health information for a single component.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    /// Component name.
    pub name: String,
    /// Health status.
    pub status: HealthStatus,
    /// Optional message.
    pub message: Option<String>,
    /// Last check time (ISO 8601).
    pub last_check: Option<String>,
    /// Check duration in milliseconds.
    pub check_duration_ms: Option<u64>,
}

impl ComponentHealth {
    fn with_status(name: impl Into<String>, status: HealthStatus, message: Option<String>) -> Self {
        Self {
            name: name.into(),
            status,
            message,
            last_check: Some(chrono::Utc::now().to_rfc3339()),
            check_duration_ms: None,
        }
    }

    /// Create a healthy component.
    pub fn healthy(name: impl Into<String>) -> Self {
        Self::with_status(name, HealthStatus::Healthy, None)
    }

    /// Create an unhealthy component.
    pub fn unhealthy(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(name, HealthStatus::Unhealthy, Some(message.into()))
    }

    /// Create a degraded component.
    pub fn degraded(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(name, HealthStatus::Degraded, Some(message.into()))
    }

    /// Attach an informational message.
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Set the check duration.
    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.check_duration_ms = Some(duration.as_millis() as u64);
        self
    }
}

/// Overall system health.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemHealth {
    /// Overall status: `healthy` only when every component is.
    pub status: HealthStatus,
    /// Component health details.
    pub components: BTreeMap<String, ComponentHealth>,
    /// System version.
    pub version: String,
    /// Uptime in seconds.
    pub uptime_secs: u64,
    /// Timestamp of the health check.
    pub timestamp: String,
}

impl SystemHealth {
    /// Check if the system is healthy.
    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }

    pub fn component(&self, name: &str) -> Option<&ComponentHealth> {
        self.components.get(name)
    }
}

/// Builds component checks and rolls them up.
pub struct HealthChecker {
    /// System start time.
    start_time: Instant,
    /// System version.
    version: String,
}

impl Default for HealthChecker {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthChecker {
    /// Create a new health checker.
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Storage is healthy when its statistics can be read.
    pub fn check_storage(
        &self,
        backend: &str,
        stats: &crate::Result<JobStats>,
        elapsed: Duration,
    ) -> ComponentHealth {
        match stats {
            Ok(_) => ComponentHealth::healthy("storage")
                .with_message(format!("{} backend reachable", backend))
                .with_duration(elapsed),
            Err(e) => {
                warn!("Storage health check failed: {}", e);
                ComponentHealth::unhealthy("storage", e.to_string()).with_duration(elapsed)
            }
        }
    }

    /// Queue depth: warning level is degraded, critical is unhealthy.
    pub fn check_queue(&self, depth: usize, status: QueueDepthStatus) -> ComponentHealth {
        match status {
            QueueDepthStatus::Normal => {
                ComponentHealth::healthy("queue").with_message(format!("{} jobs queued", depth))
            }
            QueueDepthStatus::Warning => {
                ComponentHealth::degraded("queue", format!("Queue depth warning: {} jobs", depth))
            }
            QueueDepthStatus::Critical => {
                ComponentHealth::unhealthy("queue", format!("Queue depth critical: {} jobs", depth))
            }
        }
    }

    /// A background loop component.
    pub fn check_running(&self, name: &str, enabled: bool, running: bool) -> ComponentHealth {
        match (enabled, running) {
            (false, _) => ComponentHealth::healthy(name).with_message("disabled"),
            (true, true) => ComponentHealth::healthy(name),
            (true, false) => ComponentHealth::unhealthy(name, format!("{} is not running", name)),
        }
    }

    /// Degraded when more than half of the finished jobs failed.
    pub fn check_failure_rate(&self, stats: Option<&JobStats>) -> ComponentHealth {
        let Some(stats) = stats else {
            return ComponentHealth::degraded("failure_rate", "statistics unavailable");
        };
        let rate = stats.failure_rate();
        if rate > FAILURE_RATE_THRESHOLD {
            ComponentHealth::degraded(
                "failure_rate",
                format!(
                    "{:.1}% of {} finished jobs failed",
                    rate * 100.0,
                    stats.finished()
                ),
            )
        } else {
            debug!("Failure rate OK: {:.1}%", rate * 100.0);
            ComponentHealth::healthy("failure_rate")
                .with_message(format!("{:.1}% failed", rate * 100.0))
        }
    }

    /// Roll component checks up into the system status.
    pub fn assemble(&self, checks: impl IntoIterator<Item = ComponentHealth>) -> SystemHealth {
        let mut components = BTreeMap::new();
        let mut overall_status = HealthStatus::Healthy;

        for health in checks {
            if health.status != HealthStatus::Healthy {
                overall_status = HealthStatus::Degraded;
            }
            components.insert(health.name.clone(), health);
        }

        SystemHealth {
            status: overall_status,
            components,
            version: self.version.clone(),
            uptime_secs: self.start_time.elapsed().as_secs(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::JobStatus;

    #[test]
    fn test_component_health_constructors() {
        let health = ComponentHealth::healthy("test");
        assert_eq!(health.status, HealthStatus::Healthy);
        assert!(health.message.is_none());

        let health = ComponentHealth::unhealthy("test", "Something went wrong");
        assert_eq!(health.status, HealthStatus::Unhealthy);
        assert_eq!(health.message, Some("Something went wrong".to_string()));
    }

    #[test]
    fn test_component_health_with_duration() {
        let health = ComponentHealth::healthy("test").with_duration(Duration::from_millis(100));
        assert_eq!(health.check_duration_ms, Some(100));
    }

    #[test]
    fn test_default_checker_reports_version() {
        let health = HealthChecker::default().assemble([ComponentHealth::healthy("storage")]);
        assert_eq!(health.version, env!("CARGO_PKG_VERSION"));
        assert!(health.is_healthy());
    }

    #[test]
    fn test_overall_status_is_degraded_unless_all_healthy() {
        let checker = HealthChecker::new();
        let health = checker.assemble([
            ComponentHealth::healthy("storage"),
            ComponentHealth::healthy("queue"),
        ]);
        assert!(health.is_healthy());

        let health = checker.assemble([
            ComponentHealth::healthy("storage"),
            ComponentHealth::unhealthy("queue", "full"),
        ]);
        assert_eq!(health.status, HealthStatus::Degraded);
        assert_eq!(
            health.component("queue").map(|c| c.status),
            Some(HealthStatus::Unhealthy)
        );
    }

    #[test]
    fn test_queue_depth_levels() {
        let checker = HealthChecker::new();
        assert_eq!(
            checker.check_queue(1, QueueDepthStatus::Normal).status,
            HealthStatus::Healthy
        );
        assert_eq!(
            checker.check_queue(150, QueueDepthStatus::Warning).status,
            HealthStatus::Degraded
        );
        assert_eq!(
            checker.check_queue(900, QueueDepthStatus::Critical).status,
            HealthStatus::Unhealthy
        );
    }

    #[test]
    fn test_failure_rate_threshold() {
        let checker = HealthChecker::new();
        let mut stats = JobStats::default();
        stats.record(JobStatus::Completed, false, 1);
        stats.record(JobStatus::Failed, false, 1);
        assert_eq!(
            checker.check_failure_rate(Some(&stats)).status,
            HealthStatus::Healthy
        );

        stats.record(JobStatus::Failed, false, 1);
        assert_eq!(
            checker.check_failure_rate(Some(&stats)).status,
            HealthStatus::Degraded
        );
    }

    #[test]
    fn test_disabled_loop_is_healthy() {
        let checker = HealthChecker::new();
        assert_eq!(
            checker.check_running("scheduler", false, false).status,
            HealthStatus::Healthy
        );
        assert_eq!(
            checker.check_running("scheduler", true, false).status,
            HealthStatus::Unhealthy
        );
    }
}
