//! Scheduler module for time-based job activation.
//!
//! The Scheduler is responsible for:
//! - Promoting delayed jobs to PENDING once their `scheduled_at` passes
//! - Materialising instances of cron recurrence templates
//! - Staging both in the job queue

mod service;

pub use service::{Scheduler, SchedulerConfig, TickReport};
