//! Repository layer.
//!
//! [`JobRepository`] is the storage contract the rest of the engine codes
//! against. Both implementations keep the same guarantees: a successful `put`
//! is visible to every later read, updates are compare-and-swap on
//! `Job::revision`, and each status change is appended to the job's history in
//! the same commit as the record itself.

pub mod file;
pub mod job;

pub use file::FileJobRepository;
pub use job::SqlxJobRepository;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::Result;
use crate::domain::{Job, JobFilter, JobStatus, ListCursor, StatusTransition};

/// Page size used by [`list_stream`].
pub const DEFAULT_PAGE_SIZE: usize = 200;

/// Job counts per status. Templates are counted separately.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStats {
    pub pending_at_time: u64,
    pub pending: u64,
    pub running: u64,
    pub retry_pending: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub templates: u64,
}

impl JobStats {
    pub fn record(&mut self, status: JobStatus, is_template: bool, count: u64) {
        if is_template {
            self.templates += count;
            return;
        }
        let slot = match status {
            JobStatus::PendingAtTime => &mut self.pending_at_time,
            JobStatus::Pending => &mut self.pending,
            JobStatus::Running => &mut self.running,
            JobStatus::RetryPending => &mut self.retry_pending,
            JobStatus::Completed => &mut self.completed,
            JobStatus::Failed => &mut self.failed,
            JobStatus::Cancelled => &mut self.cancelled,
        };
        *slot += count;
    }

    pub fn count(&self, status: JobStatus) -> u64 {
        match status {
            JobStatus::PendingAtTime => self.pending_at_time,
            JobStatus::Pending => self.pending,
            JobStatus::Running => self.running,
            JobStatus::RetryPending => self.retry_pending,
            JobStatus::Completed => self.completed,
            JobStatus::Failed => self.failed,
            JobStatus::Cancelled => self.cancelled,
        }
    }

    /// Job instances in any status.
    pub fn total(&self) -> u64 {
        self.pending_at_time
            + self.pending
            + self.running
            + self.retry_pending
            + self.completed
            + self.failed
            + self.cancelled
    }

    pub fn finished(&self) -> u64 {
        self.completed + self.failed + self.cancelled
    }

    /// Share of finished jobs that failed, 0 when nothing has finished.
    pub fn failure_rate(&self) -> f64 {
        match self.finished() {
            0 => 0.0,
            n => self.failed as f64 / n as f64,
        }
    }
}

/// Durable job storage.
#[async_trait]
pub trait JobRepository: Send + Sync {
    /// Short backend name for logs and health output.
    fn backend(&self) -> &'static str;

    /// Insert (`revision == 0`) or compare-and-swap update the record.
    ///
    /// Inserting an existing id, updating a missing id, or updating with a stale
    /// revision fails with `Conflict`. On success `job.revision` is advanced and
    /// its timestamps carry the stored precision.
    async fn put(&self, job: &mut Job) -> Result<()>;

    /// Fails with `NotFound` for an unknown id.
    async fn get(&self, id: &str) -> Result<Job>;

    /// Up to `limit` matching jobs ordered by `(created_at, id)`, strictly after `after`.
    async fn list_page(
        &self,
        filter: &JobFilter,
        after: Option<&ListCursor>,
        limit: usize,
    ) -> Result<Vec<Job>>;

    /// Every matching job ordered by `(created_at, id)`.
    ///
    /// Pages through `list_page` by default; backends that cannot seek override it.
    async fn list_matching(&self, filter: &JobFilter) -> Result<Vec<Job>> {
        let mut jobs = Vec::new();
        let mut cursor: Option<ListCursor> = None;
        loop {
            let page = self
                .list_page(filter, cursor.as_ref(), DEFAULT_PAGE_SIZE)
                .await?;
            let exhausted = page.len() < DEFAULT_PAGE_SIZE;
            cursor = page.last().map(ListCursor::after);
            jobs.extend(page);
            if exhausted {
                return Ok(jobs);
            }
        }
    }

    /// Remove a terminal job and its history.
    async fn delete(&self, id: &str) -> Result<()>;

    async fn statistics(&self) -> Result<JobStats>;

    /// Status transitions of a job, oldest first.
    async fn history(&self, id: &str) -> Result<Vec<StatusTransition>>;

    /// Release backend resources.
    async fn close(&self) {}
}

/// Lazily page through every job matching `filter`.
///
/// Each call starts a fresh sequence from the beginning.
pub fn list_stream(
    repo: Arc<dyn JobRepository>,
    filter: JobFilter,
    page_size: usize,
) -> BoxStream<'static, Result<Job>> {
    let page_size = page_size.max(1);
    stream::try_unfold(
        (repo, filter, None::<ListCursor>, false),
        move |(repo, filter, cursor, exhausted)| async move {
            if exhausted {
                return Ok(None);
            }
            let page = repo.list_page(&filter, cursor.as_ref(), page_size).await?;
            let exhausted = page.len() < page_size;
            let next = page.last().map(ListCursor::after).or(cursor);
            let items = stream::iter(page.into_iter().map(Ok));
            Ok::<_, crate::Error>(Some((items, (repo, filter, next, exhausted))))
        },
    )
    .try_flatten()
    .boxed()
}

/// Collect every job matching `filter`.
pub async fn list_all(repo: &Arc<dyn JobRepository>, filter: JobFilter) -> Result<Vec<Job>> {
    repo.list_matching(&filter).await
}
