//! Predicates for listing jobs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::job::{Job, JobStatus};

/// Restrict a listing to one record kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KindFilter {
    Instance,
    Template,
}

/// Filter criteria for job listings. Empty criteria match everything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobFilter {
    /// Match any of these statuses.
    pub statuses: Vec<JobStatus>,
    pub kind: Option<KindFilter>,
    /// Match jobs carrying every one of these tags.
    pub tags: Vec<String>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    /// Jobs whose `scheduled_at` is set and not later than this.
    pub scheduled_before: Option<DateTime<Utc>>,
    /// Jobs whose `finished_at` is set and earlier than this.
    pub finished_before: Option<DateTime<Utc>>,
    pub parent_id: Option<String>,
}

impl JobFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_status(mut self, status: JobStatus) -> Self {
        self.statuses.push(status);
        self
    }

    pub fn with_statuses(mut self, statuses: impl IntoIterator<Item = JobStatus>) -> Self {
        self.statuses.extend(statuses);
        self
    }

    pub fn with_kind(mut self, kind: KindFilter) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn created_between(
        mut self,
        after: Option<DateTime<Utc>>,
        before: Option<DateTime<Utc>>,
    ) -> Self {
        self.created_after = after;
        self.created_before = before;
        self
    }

    pub fn scheduled_before(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_before = Some(at);
        self
    }

    pub fn finished_before(mut self, at: DateTime<Utc>) -> Self {
        self.finished_before = Some(at);
        self
    }

    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    /// Evaluate the filter against one record.
    pub fn matches(&self, job: &Job) -> bool {
        if !self.statuses.is_empty() && !self.statuses.contains(&job.status) {
            return false;
        }
        match self.kind {
            Some(KindFilter::Instance) if job.is_template() => return false,
            Some(KindFilter::Template) if !job.is_template() => return false,
            _ => {}
        }
        if !self.tags.iter().all(|tag| job.tags.contains(tag)) {
            return false;
        }
        if self.created_after.is_some_and(|t| job.created_at <= t) {
            return false;
        }
        if self.created_before.is_some_and(|t| job.created_at >= t) {
            return false;
        }
        if let Some(before) = self.scheduled_before {
            match job.scheduled_at {
                Some(at) if at <= before => {}
                _ => return false,
            }
        }
        if let Some(before) = self.finished_before {
            match job.finished_at {
                Some(at) if at < before => {}
                _ => return false,
            }
        }
        if let Some(parent) = &self.parent_id
            && job.parent_id() != Some(parent.as_str())
        {
            return false;
        }
        true
    }
}

/// Keyset position in a `(created_at, id)` ordered listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListCursor {
    pub created_at: DateTime<Utc>,
    pub id: String,
}

impl ListCursor {
    pub fn after(job: &Job) -> Self {
        Self {
            created_at: job.created_at,
            id: job.id.clone(),
        }
    }

    /// Whether `job` sorts strictly after this position.
    pub fn precedes(&self, job: &Job) -> bool {
        (job.created_at, job.id.as_str()) > (self.created_at, self.id.as_str())
    }
}
