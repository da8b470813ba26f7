//! Job row models.

use sqlx::FromRow;

use crate::database::time::{datetime_to_ms, ms_to_datetime, opt_from_ms, opt_to_ms};
use crate::domain::{Job, JobKind, JobStatus, Priority, RecurrenceTemplate, StatusTransition};
use crate::{Error, Result};
use std::time::Duration;

pub const KIND_INSTANCE: &str = "instance";
pub const KIND_TEMPLATE: &str = "template";

/// One row of the `job` table.
#[derive(Debug, Clone, FromRow)]
pub struct JobDbModel {
    pub id: String,
    pub name: String,
    /// `instance` or `template`
    pub kind: String,
    pub parent_id: Option<String>,
    pub cron: Option<String>,
    pub timezone: Option<String>,
    pub last_fired_at: Option<i64>,
    /// JSON blob of the command descriptor
    pub command: String,
    pub priority: i64,
    pub status: String,
    pub created_at: i64,
    pub scheduled_at: Option<i64>,
    pub started_at: Option<i64>,
    pub finished_at: Option<i64>,
    /// JSON blob of the retry policy
    pub retry_policy: String,
    pub attempt_count: i64,
    pub timeout_ms: i64,
    pub result: Option<String>,
    pub error: Option<String>,
    pub tags: String,
    pub metadata: String,
    pub cancel_requested: bool,
    pub next_attempt_at: Option<i64>,
    pub updated_at: i64,
    pub revision: i64,
}

fn corrupt(id: &str, what: impl std::fmt::Display) -> Error {
    Error::invalid_state(format!("corrupt job record {}: {}", id, what))
}

impl JobDbModel {
    pub fn from_job(job: &Job) -> Result<Self> {
        let (kind, parent_id, cron, timezone, last_fired_at) = match &job.kind {
            JobKind::Instance { parent_id } => (KIND_INSTANCE, parent_id.clone(), None, None, None),
            JobKind::Template(t) => (
                KIND_TEMPLATE,
                None,
                Some(t.cron.clone()),
                Some(t.timezone.clone()),
                opt_to_ms(t.last_fired_at),
            ),
        };

        Ok(Self {
            id: job.id.clone(),
            name: job.name.clone(),
            kind: kind.to_string(),
            parent_id,
            cron,
            timezone,
            last_fired_at,
            command: serde_json::to_string(&job.command)?,
            priority: job.priority.as_i64(),
            status: job.status.as_str().to_string(),
            created_at: datetime_to_ms(job.created_at),
            scheduled_at: opt_to_ms(job.scheduled_at),
            started_at: opt_to_ms(job.started_at),
            finished_at: opt_to_ms(job.finished_at),
            retry_policy: serde_json::to_string(&job.retry_policy)?,
            attempt_count: i64::from(job.attempt_count),
            timeout_ms: job.timeout.as_millis().min(i64::MAX as u128) as i64,
            result: job.result.as_ref().map(serde_json::to_string).transpose()?,
            error: job.error.clone(),
            tags: serde_json::to_string(&job.tags)?,
            metadata: serde_json::to_string(&job.metadata)?,
            cancel_requested: job.cancel_requested,
            next_attempt_at: opt_to_ms(job.next_attempt_at),
            updated_at: datetime_to_ms(job.updated_at),
            revision: job.revision.min(i64::MAX as u64) as i64,
        })
    }

    pub fn into_job(self) -> Result<Job> {
        let status = JobStatus::parse(&self.status)
            .ok_or_else(|| corrupt(&self.id, format!("unknown status '{}'", self.status)))?;
        let priority = Priority::from_i64(self.priority)
            .ok_or_else(|| corrupt(&self.id, format!("unknown priority {}", self.priority)))?;

        let kind = match self.kind.as_str() {
            KIND_INSTANCE => JobKind::Instance {
                parent_id: self.parent_id,
            },
            KIND_TEMPLATE => JobKind::Template(RecurrenceTemplate {
                cron: self
                    .cron
                    .ok_or_else(|| corrupt(&self.id, "template without cron"))?,
                timezone: self
                    .timezone
                    .unwrap_or_else(|| crate::domain::DEFAULT_TIMEZONE.to_string()),
                last_fired_at: opt_from_ms(self.last_fired_at),
            }),
            other => return Err(corrupt(&self.id, format!("unknown kind '{}'", other))),
        };

        Ok(Job {
            command: serde_json::from_str(&self.command)?,
            retry_policy: serde_json::from_str(&self.retry_policy)?,
            result: self.result.as_deref().map(serde_json::from_str).transpose()?,
            tags: serde_json::from_str(&self.tags)?,
            metadata: serde_json::from_str(&self.metadata)?,
            id: self.id,
            name: self.name,
            priority,
            status,
            kind,
            created_at: ms_to_datetime(self.created_at),
            scheduled_at: opt_from_ms(self.scheduled_at),
            started_at: opt_from_ms(self.started_at),
            finished_at: opt_from_ms(self.finished_at),
            attempt_count: self.attempt_count.clamp(0, i64::from(u32::MAX)) as u32,
            timeout: Duration::from_millis(self.timeout_ms.max(0) as u64),
            error: self.error,
            cancel_requested: self.cancel_requested,
            next_attempt_at: opt_from_ms(self.next_attempt_at),
            updated_at: ms_to_datetime(self.updated_at),
            revision: self.revision.max(0) as u64,
        })
    }
}

/// One row of the `job_history` table.
#[derive(Debug, Clone, FromRow)]
pub struct JobHistoryDbModel {
    pub job_id: String,
    pub at: i64,
    pub from_status: Option<String>,
    pub to_status: String,
    pub error: Option<String>,
}

impl From<&StatusTransition> for JobHistoryDbModel {
    fn from(value: &StatusTransition) -> Self {
        Self {
            job_id: value.job_id.clone(),
            at: datetime_to_ms(value.at),
            from_status: value.from.map(|s| s.as_str().to_string()),
            to_status: value.to.as_str().to_string(),
            error: value.error.clone(),
        }
    }
}

impl JobHistoryDbModel {
    pub fn into_transition(self) -> Result<StatusTransition> {
        let parse = |s: &str| {
            JobStatus::parse(s).ok_or_else(|| corrupt(&self.job_id, format!("unknown status '{}'", s)))
        };
        Ok(StatusTransition {
            from: self.from_status.as_deref().map(parse).transpose()?,
            to: parse(&self.to_status)?,
            at: ms_to_datetime(self.at),
            error: self.error.clone(),
            job_id: self.job_id.clone(),
        })
    }
}
