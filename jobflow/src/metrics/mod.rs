//! Health and monitoring module.
//!
//! Component health checks rolled up into a single `SystemHealth` report:
//! storage reachability, queue depth, background loops and the failure rate
//! of finished jobs.

mod health;

pub use health::{ComponentHealth, HealthChecker, HealthStatus, SystemHealth};
