//! Retention for finished jobs.
//!
//! A background task periodically deletes terminal jobs whose `finished_at`
//! is older than the retention period, optionally only inside a daily
//! maintenance window.

use chrono::{DateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use tokio::time::{Duration, MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::database::repositories::JobRepository;
use crate::domain::{JobFilter, JobStatus, ListCursor};
use crate::{Error, Result};

/// Retention settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PurgeConfig {
    /// Days a finished job is kept. 0 keeps jobs forever.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,

    /// Daily UTC window such as `"02:00-05:00"` outside which nothing is purged.
    #[serde(default)]
    pub window: Option<String>,

    /// Jobs deleted per page.
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,

    #[serde(default = "default_check_interval_secs")]
    pub check_interval_secs: u64,
}

fn default_retention_days() -> u32 {
    30
}

fn default_batch_size() -> u32 {
    100
}

fn default_check_interval_secs() -> u64 {
    3600
}

impl Default for PurgeConfig {
    fn default() -> Self {
        Self {
            retention_days: default_retention_days(),
            window: None,
            batch_size: default_batch_size(),
            check_interval_secs: default_check_interval_secs(),
        }
    }
}

impl PurgeConfig {
    pub fn with_retention_days(mut self, days: u32) -> Self {
        self.retention_days = days;
        self
    }

    pub fn with_window(mut self, window: impl Into<String>) -> Self {
        self.window = Some(window.into());
        self
    }

    pub fn with_batch_size(mut self, size: u32) -> Self {
        self.batch_size = size;
        self
    }

    /// The parsed maintenance window, if one is configured.
    pub fn parsed_window(&self) -> Result<Option<PurgeWindow>> {
        self.window.as_deref().map(str::parse).transpose()
    }
}

/// A daily time range. A range whose end precedes its start wraps past midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PurgeWindow {
    start: NaiveTime,
    end: NaiveTime,
}

impl PurgeWindow {
    pub fn contains(&self, time: NaiveTime) -> bool {
        if self.start <= self.end {
            time >= self.start && time < self.end
        } else {
            time >= self.start || time < self.end
        }
    }
}

impl FromStr for PurgeWindow {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::config(format!("purge window '{}' is not HH:MM-HH:MM", s));
        let (start, end) = s.split_once('-').ok_or_else(invalid)?;
        let start = NaiveTime::parse_from_str(start.trim(), "%H:%M").map_err(|_| invalid())?;
        let end = NaiveTime::parse_from_str(end.trim(), "%H:%M").map_err(|_| invalid())?;
        Ok(Self { start, end })
    }
}

/// Deletes finished jobs through the storage contract.
#[derive(Clone)]
pub struct JobPurgeService {
    config: PurgeConfig,
    window: Option<PurgeWindow>,
    job_repository: Arc<dyn JobRepository>,
}

impl JobPurgeService {
    pub fn new(config: PurgeConfig, job_repository: Arc<dyn JobRepository>) -> Self {
        let window = config.parsed_window().unwrap_or_else(|e| {
            warn!("Ignoring purge window: {}", e);
            None
        });
        Self {
            config,
            window,
            job_repository,
        }
    }

    pub fn config(&self) -> &PurgeConfig {
        &self.config
    }

    /// One retention pass as of `now`. Returns the number of jobs deleted.
    pub async fn run_purge_at(&self, now: DateTime<Utc>) -> Result<u64> {
        if self.config.retention_days == 0 {
            debug!("Job purging disabled (retention_days = 0)");
            return Ok(0);
        }
        if let Some(window) = &self.window
            && !window.contains(now.time())
        {
            debug!("Outside purge window, skipping");
            return Ok(0);
        }

        let cutoff = now - chrono::Duration::days(i64::from(self.config.retention_days));
        let deleted = self.purge_finished_before(cutoff).await?;
        if deleted > 0 {
            info!(
                "Purged {} finished jobs (retention: {} days)",
                deleted, self.config.retention_days
            );
        }
        Ok(deleted)
    }

    /// Delete every terminal job that finished before `cutoff`, a page at a time.
    pub async fn purge_finished_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let filter = JobFilter::new()
            .with_statuses([JobStatus::Completed, JobStatus::Failed, JobStatus::Cancelled])
            .finished_before(cutoff);
        let page_size = self.config.batch_size.max(1) as usize;

        let mut deleted: u64 = 0;
        let mut cursor: Option<ListCursor> = None;
        loop {
            let page = self
                .job_repository
                .list_page(&filter, cursor.as_ref(), page_size)
                .await?;

            for job in &page {
                match self.job_repository.delete(&job.id).await {
                    Ok(()) => deleted += 1,
                    // Removed concurrently.
                    Err(e) if e.is_not_found() => {}
                    Err(e) if e.is_storage_unavailable() => return Err(e),
                    Err(e) => warn!(job_id = %job.id, "Skipping purge of job: {}", e),
                }
            }

            if page.len() < page_size {
                break;
            }
            cursor = page.last().map(ListCursor::after);
            // Yield the write lock between pages.
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        Ok(deleted)
    }

    /// Run retention passes every `check_interval_secs` until cancelled.
    pub fn start_background_task(&self, cancellation_token: CancellationToken) {
        let service = self.clone();
        tokio::spawn(async move {
            let period = Duration::from_secs(service.config.check_interval_secs.max(1));
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(
                "Job purge service started (retention: {} days, interval: {:?})",
                service.config.retention_days, period
            );

            loop {
                tokio::select! {
                    _ = cancellation_token.cancelled() => {
                        info!("Job purge service shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = service.run_purge_at(Utc::now()).await {
                            error!("Purge cycle failed: {}", e);
                        }
                    }
                }
            }
        });
    }
}
