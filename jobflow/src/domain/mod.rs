//! Domain layer for jobflow.
//!
//! Plain data types describing jobs and the rules that govern them. Nothing in
//! here touches storage or the runtime.

pub mod command;
pub mod cron;
pub mod filter;
pub mod job;
pub mod retry;

pub use command::{Command, FunctionCall, HttpBody, HttpRequest, ShellCommand};
pub use cron::CronSchedule;
pub use filter::{JobFilter, KindFilter, ListCursor};
pub use job::{
    Job, JobKind, JobSpec, JobStatus, Priority, RecurrenceTemplate, StatusTransition,
    DEFAULT_TIMEZONE,
};
pub use retry::{Backoff, RetryPolicy};

/// Serde helpers that store a `Duration` as integer milliseconds.
pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis().min(u64::MAX as u128) as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
