//! The job record, its status machine and the creation request.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;

use super::command::Command;
use super::cron::CronSchedule;
use super::retry::RetryPolicy;
use crate::{Error, Result};

/// Zone used for cron evaluation when none is given.
pub const DEFAULT_TIMEZONE: &str = "UTC";

/// Job status values.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    /// Waiting for `scheduled_at`. Active recurrence templates stay here.
    PendingAtTime,
    /// Ready to run; staged in the queue.
    Pending,
    /// Checked out by a worker.
    Running,
    /// Failed an attempt and waiting out its backoff.
    RetryPending,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PendingAtTime => "PENDING_AT_TIME",
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::RetryPending => "RETRY_PENDING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING_AT_TIME" => Some(Self::PendingAtTime),
            "PENDING" => Some(Self::Pending),
            "RUNNING" => Some(Self::Running),
            "RETRY_PENDING" => Some(Self::RetryPending),
            "COMPLETED" => Some(Self::Completed),
            "FAILED" => Some(Self::Failed),
            "CANCELLED" => Some(Self::Cancelled),
            _ => None,
        }
    }

    /// Check if this is a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether the status machine has an edge from `self` to `to`.
    ///
    /// `RUNNING -> PENDING` only happens when restart recovery reclaims a job
    /// whose worker died mid-attempt.
    pub fn can_transition_to(&self, to: JobStatus) -> bool {
        use JobStatus::*;
        match (self, to) {
            (PendingAtTime, Pending | Cancelled) => true,
            (Pending, Running | Cancelled) => true,
            (Running, Completed | RetryPending | Failed | Cancelled | Pending) => true,
            (RetryPending, Pending | Cancelled) => true,
            _ => false,
        }
    }
}

/// Priority bands, ordered `Low < Normal < High < Urgent`.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Priority {
    Low = 1,
    #[default]
    Normal = 2,
    High = 3,
    Urgent = 4,
}

impl Priority {
    pub fn as_i64(&self) -> i64 {
        *self as i64
    }

    pub fn from_i64(value: i64) -> Option<Self> {
        match value {
            1 => Some(Self::Low),
            2 => Some(Self::Normal),
            3 => Some(Self::High),
            4 => Some(Self::Urgent),
            _ => None,
        }
    }
}

/// Recurrence data carried by a template record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecurrenceTemplate {
    pub cron: String,
    pub timezone: String,
    /// Latest fire time already materialised.
    pub last_fired_at: Option<DateTime<Utc>>,
}

impl RecurrenceTemplate {
    pub fn schedule(&self) -> Result<CronSchedule> {
        CronSchedule::parse(&self.cron, &self.timezone)
    }
}

/// The two record kinds sharing the job table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum JobKind {
    /// Something that runs. `parent_id` links instances spawned by a template.
    Instance { parent_id: Option<String> },
    /// A cron template. Never runs itself.
    Template(RecurrenceTemplate),
}

impl Default for JobKind {
    fn default() -> Self {
        Self::Instance { parent_id: None }
    }
}

/// One unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub name: String,
    pub command: Command,
    pub priority: Priority,
    pub status: JobStatus,
    pub kind: JobKind,
    pub created_at: DateTime<Utc>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub retry_policy: RetryPolicy,
    pub attempt_count: u32,
    #[serde(with = "super::duration_ms", rename = "timeout_ms")]
    pub timeout: Duration,
    pub result: Option<Value>,
    pub error: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default)]
    pub cancel_requested: bool,
    /// When a `RETRY_PENDING` job becomes eligible again.
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    /// Storage revision; 0 until first stored.
    #[serde(default)]
    pub revision: u64,
}

impl Job {
    pub fn is_template(&self) -> bool {
        matches!(self.kind, JobKind::Template(_))
    }

    pub fn template(&self) -> Option<&RecurrenceTemplate> {
        match &self.kind {
            JobKind::Template(t) => Some(t),
            JobKind::Instance { .. } => None,
        }
    }

    pub fn parent_id(&self) -> Option<&str> {
        match &self.kind {
            JobKind::Instance { parent_id } => parent_id.as_deref(),
            JobKind::Template(_) => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Timestamps never move backwards within a record.
    fn clamp(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now.max(self.updated_at)
    }

    fn transition(&mut self, to: JobStatus, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
        if !self.status.can_transition_to(to) {
            return Err(Error::InvalidStateTransition {
                from: self.status.to_string(),
                to: to.to_string(),
            });
        }
        if self.is_template() && to != JobStatus::Cancelled {
            return Err(Error::invalid_state(format!(
                "recurrence template {} cannot become {}",
                self.id, to
            )));
        }
        let now = self.clamp(now);
        self.status = to;
        self.updated_at = now;
        Ok(now)
    }

    /// Make the job ready to run.
    pub fn mark_pending(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.transition(JobStatus::Pending, now)?;
        self.next_attempt_at = None;
        Ok(())
    }

    /// Check the job out for a new attempt.
    pub fn mark_running(&mut self, now: DateTime<Utc>) -> Result<()> {
        let now = self.transition(JobStatus::Running, now)?;
        self.attempt_count += 1;
        self.started_at = Some(now);
        Ok(())
    }

    pub fn mark_completed(&mut self, result: Value, now: DateTime<Utc>) -> Result<()> {
        let now = self.transition(JobStatus::Completed, now)?;
        self.result = Some(result);
        self.error = None;
        self.finished_at = Some(now);
        Ok(())
    }

    pub fn mark_retry_pending(
        &mut self,
        error: impl Into<String>,
        next_attempt_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let now = self.transition(JobStatus::RetryPending, now)?;
        self.error = Some(error.into());
        self.next_attempt_at = Some(next_attempt_at.max(now));
        Ok(())
    }

    pub fn mark_failed(&mut self, error: impl Into<String>, now: DateTime<Utc>) -> Result<()> {
        let now = self.transition(JobStatus::Failed, now)?;
        self.error = Some(error.into());
        self.next_attempt_at = None;
        self.finished_at = Some(now);
        Ok(())
    }

    /// Terminal cancellation. `result`/`error` carry the outcome of an attempt
    /// that finished after cancellation was requested.
    pub fn mark_cancelled(
        &mut self,
        result: Option<Value>,
        error: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let now = self.transition(JobStatus::Cancelled, now)?;
        self.cancel_requested = true;
        if result.is_some() {
            self.result = result;
        }
        if error.is_some() {
            self.error = error;
        }
        self.next_attempt_at = None;
        self.finished_at = Some(now);
        Ok(())
    }

    /// Flag an in-flight job so its current attempt is the last one.
    ///
    /// Returns `false` if the flag was already set.
    pub fn request_cancel(&mut self, now: DateTime<Utc>) -> Result<bool> {
        if self.is_terminal() {
            return Err(Error::invalid_state(format!(
                "job {} is already {}",
                self.id, self.status
            )));
        }
        if self.cancel_requested {
            return Ok(false);
        }
        self.cancel_requested = true;
        self.updated_at = self.clamp(now);
        Ok(true)
    }

    /// Record that a template materialised the fire at `fired_at`.
    pub fn record_fire(&mut self, fired_at: DateTime<Utc>, now: DateTime<Utc>) -> Result<()> {
        let now = self.clamp(now);
        match &mut self.kind {
            JobKind::Template(t) => {
                t.last_fired_at = Some(t.last_fired_at.map_or(fired_at, |l| l.max(fired_at)));
            }
            JobKind::Instance { .. } => {
                return Err(Error::invalid_state(format!(
                    "job {} is not a recurrence template",
                    self.id
                )));
            }
        }
        self.updated_at = now;
        Ok(())
    }

    /// A fresh PENDING instance spawned by this template.
    pub fn spawn_instance(&self, now: DateTime<Utc>) -> Job {
        Job {
            id: uuid::Uuid::new_v4().to_string(),
            name: self.name.clone(),
            command: self.command.clone(),
            priority: self.priority,
            status: JobStatus::Pending,
            kind: JobKind::Instance {
                parent_id: Some(self.id.clone()),
            },
            created_at: now,
            scheduled_at: Some(now),
            started_at: None,
            finished_at: None,
            retry_policy: self.retry_policy,
            attempt_count: 0,
            timeout: self.timeout,
            result: None,
            error: None,
            tags: self.tags.clone(),
            metadata: self.metadata.clone(),
            cancel_requested: false,
            next_attempt_at: None,
            updated_at: now,
            revision: 0,
        }
    }
}

/// One entry of a job's append-only status log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusTransition {
    pub job_id: String,
    pub at: DateTime<Utc>,
    /// `None` for the insert.
    pub from: Option<JobStatus>,
    pub to: JobStatus,
    pub error: Option<String>,
}

impl StatusTransition {
    /// The entry a `put` of `job` appends, if its status moved away from `previous`.
    pub fn between(previous: Option<JobStatus>, job: &Job) -> Option<Self> {
        if previous == Some(job.status) {
            return None;
        }
        Some(Self {
            job_id: job.id.clone(),
            at: job.updated_at,
            from: previous,
            to: job.status,
            error: match job.status {
                JobStatus::RetryPending | JobStatus::Failed => job.error.clone(),
                _ => None,
            },
        })
    }
}

/// A job creation request, validated before anything is stored.
#[derive(Debug, Clone)]
pub struct JobSpec {
    pub id: Option<String>,
    pub name: String,
    pub command: Command,
    pub priority: Priority,
    /// `None` uses the engine default.
    pub timeout: Option<Duration>,
    pub retry_policy: RetryPolicy,
    pub tags: Vec<String>,
    pub metadata: Map<String, Value>,
    /// Zone for recurrence evaluation.
    pub timezone: String,
}

impl JobSpec {
    pub fn new(name: impl Into<String>, command: impl Into<Command>) -> Self {
        Self {
            id: None,
            name: name.into(),
            command: command.into(),
            priority: Priority::default(),
            timeout: None,
            retry_policy: RetryPolicy::default(),
            tags: Vec::new(),
            metadata: Map::new(),
            timezone: DEFAULT_TIMEZONE.to_string(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_timezone(mut self, timezone: impl Into<String>) -> Self {
        self.timezone = timezone.into();
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::invalid_argument("job name must not be empty"));
        }
        if self.id.as_deref().is_some_and(|id| id.trim().is_empty()) {
            return Err(Error::invalid_argument("job id must not be empty"));
        }
        if self.timeout == Some(Duration::ZERO) {
            return Err(Error::invalid_argument("timeout must be positive"));
        }
        self.command.validate()
    }

    /// Build the stored record. The caller has validated the spec.
    pub fn into_job(
        self,
        status: JobStatus,
        kind: JobKind,
        scheduled_at: Option<DateTime<Utc>>,
        default_timeout: Duration,
        now: DateTime<Utc>,
    ) -> Job {
        Job {
            id: self.id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            name: self.name,
            command: self.command,
            priority: self.priority,
            status,
            kind,
            created_at: now,
            scheduled_at,
            started_at: None,
            finished_at: None,
            retry_policy: self.retry_policy,
            attempt_count: 0,
            timeout: self.timeout.unwrap_or(default_timeout),
            result: None,
            error: None,
            tags: self.tags,
            metadata: self.metadata,
            cancel_requested: false,
            next_attempt_at: None,
            updated_at: now,
            revision: 0,
        }
    }
}
