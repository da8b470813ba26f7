//! jobflow library crate.
//!
//! A durable job automation engine. Jobs are shell commands, registered
//! functions or HTTP requests; they run on a bounded worker pool in priority
//! order, retry with backoff, and may be scheduled for a later time or on a
//! cron recurrence. Every job and status change is persisted to SQLite or to
//! a directory of JSON files, so a restarted engine picks up where it left off.
//!
//! [`AutomationSystem`] is the entry point.

pub mod config;
pub mod database;
pub mod domain;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod pipeline;
pub mod scheduler;
pub mod services;

pub use config::{EngineConfig, ExecutorConfig, StorageConfig};
pub use domain::{
    Backoff, Command, CronSchedule, Job, JobFilter, JobKind, JobSpec, JobStatus, KindFilter,
    Priority, RetryPolicy, StatusTransition,
};
pub use error::{Error, ExecutionKind, Result};
pub use services::{AutomationSystem, SystemBuilder};
