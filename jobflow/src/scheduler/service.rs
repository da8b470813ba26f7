//! Scheduler service implementation.
//!
//! A fixed-interval tick loop that moves time-based work into the job queue:
//! delayed instances whose `scheduled_at` has passed, and new instances for
//! every cron fire of an active recurrence template.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::Result;
use crate::database::repositories::{JobRepository, list_all};
use crate::database::retry::update_job_with_retry;
use crate::domain::{Job, JobFilter, JobStatus, KindFilter};
use crate::pipeline::JobQueue;

/// Default tick interval (1 second).
const DEFAULT_CHECK_INTERVAL_MS: u64 = 1_000;

/// Default cap on instances materialised per template per tick.
const DEFAULT_MAX_CATCH_UP_FIRES: usize = 10;

/// Scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Whether the tick loop runs at all.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Tick interval in milliseconds.
    #[serde(default = "default_check_interval_ms")]
    pub check_interval_ms: u64,
    /// Most recent fires materialised per template per tick; older missed
    /// fires are skipped.
    #[serde(default = "default_max_catch_up_fires")]
    pub max_catch_up_fires: usize,
    /// Re-reads allowed when a status write loses a revision race.
    #[serde(default = "default_persist_retry_attempts")]
    pub persist_retry_attempts: usize,
}

fn default_enabled() -> bool {
    true
}

fn default_check_interval_ms() -> u64 {
    DEFAULT_CHECK_INTERVAL_MS
}

fn default_max_catch_up_fires() -> usize {
    DEFAULT_MAX_CATCH_UP_FIRES
}

fn default_persist_retry_attempts() -> usize {
    5
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            check_interval_ms: default_check_interval_ms(),
            max_catch_up_fires: default_max_catch_up_fires(),
            persist_retry_attempts: default_persist_retry_attempts(),
        }
    }
}

impl SchedulerConfig {
    pub fn with_check_interval(mut self, interval: Duration) -> Self {
        self.check_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_max_catch_up_fires(mut self, fires: usize) -> Self {
        self.max_catch_up_fires = fires;
        self
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms.max(1))
    }
}

/// What one tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Delayed instances moved to PENDING.
    pub promoted: usize,
    /// Instances spawned from templates.
    pub spawned: usize,
    /// Missed fires dropped by the catch-up cap.
    pub skipped_fires: usize,
}

/// Id of the instance a template spawns for the fire at `fired_at`.
///
/// Deterministic, so a fire replayed after a failed template update is
/// rejected by storage instead of running twice.
fn fire_instance_id(template_id: &str, fired_at: DateTime<Utc>) -> String {
    format!("{}-{}", template_id, fired_at.timestamp_millis())
}

/// The Scheduler decides when jobs become eligible and stages them.
pub struct Scheduler {
    repo: Arc<dyn JobRepository>,
    queue: Arc<JobQueue>,
    config: SchedulerConfig,
    /// Cancellation token for graceful shutdown.
    cancellation_token: CancellationToken,
    running: AtomicBool,
    ticks: AtomicU64,
}

impl Scheduler {
    pub fn new(
        repo: Arc<dyn JobRepository>,
        queue: Arc<JobQueue>,
        config: SchedulerConfig,
        cancellation_token: CancellationToken,
    ) -> Self {
        Self {
            repo,
            queue,
            config,
            cancellation_token,
            running: AtomicBool::new(false),
            ticks: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Whether the tick loop is currently running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Ticks completed since start.
    pub fn tick_count(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    /// Spawn the tick loop.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        // Report as running before the task is first polled.
        self.running.store(true, Ordering::SeqCst);
        let scheduler = Arc::clone(self);
        tokio::spawn(async move { scheduler.run().await })
    }

    /// Run the tick loop until the cancellation token fires.
    pub async fn run(&self) {
        self.running.store(true, Ordering::SeqCst);
        info!(
            "Scheduler started (interval: {}ms, catch-up cap: {})",
            self.config.check_interval_ms, self.config.max_catch_up_fires
        );

        let mut interval = tokio::time::interval(self.config.check_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.cancellation_token.cancelled() => {
                    info!("Scheduler shutting down");
                    break;
                }
                _ = interval.tick() => {
                    match self.tick().await {
                        Ok(report) => trace!(?report, "Scheduler tick completed"),
                        Err(e) => error!("Scheduler tick failed, retrying next tick: {}", e),
                    }
                }
            }
        }

        self.running.store(false, Ordering::SeqCst);
    }

    pub async fn tick(&self) -> Result<TickReport> {
        self.tick_at(Utc::now()).await
    }

    /// One scheduling pass as of `now`.
    pub async fn tick_at(&self, now: DateTime<Utc>) -> Result<TickReport> {
        let mut report = TickReport::default();
        self.promote_due(now, &mut report).await?;
        self.fire_templates(now, &mut report).await?;
        self.ticks.fetch_add(1, Ordering::Relaxed);

        if report.promoted > 0 || report.spawned > 0 {
            debug!(
                "Tick at {}: {} promoted, {} spawned, {} fires skipped",
                now, report.promoted, report.spawned, report.skipped_fires
            );
        }
        Ok(report)
    }

    /// Move delayed instances whose time has come to PENDING and stage them.
    async fn promote_due(&self, now: DateTime<Utc>, report: &mut TickReport) -> Result<()> {
        let due = list_all(
            &self.repo,
            JobFilter::new()
                .with_status(JobStatus::PendingAtTime)
                .with_kind(KindFilter::Instance)
                .scheduled_before(now),
        )
        .await?;

        for job in due {
            let promoted = update_job_with_retry(
                self.repo.as_ref(),
                &job.id,
                self.config.persist_retry_attempts,
                |job| {
                    if job.status != JobStatus::PendingAtTime
                        || job.scheduled_at.is_some_and(|at| at > now)
                    {
                        return Ok(false);
                    }
                    job.mark_pending(now)?;
                    Ok(true)
                },
            )
            .await;

            match promoted {
                Ok(Some(job)) => {
                    report.promoted += 1;
                    self.stage(&job);
                }
                Ok(None) => {}
                Err(e) if e.is_storage_unavailable() => return Err(e),
                Err(e) => warn!(job_id = %job.id, "Failed to promote delayed job: {}", e),
            }
        }
        Ok(())
    }

    /// Spawn instances for every active template with fires in `(last fire, now]`.
    ///
    /// Templates are visited in creation order.
    async fn fire_templates(&self, now: DateTime<Utc>, report: &mut TickReport) -> Result<()> {
        let templates = list_all(
            &self.repo,
            JobFilter::new()
                .with_status(JobStatus::PendingAtTime)
                .with_kind(KindFilter::Template),
        )
        .await?;

        for template in templates {
            if let Err(e) = self.fire_template(&template, now, report).await {
                if e.is_storage_unavailable() {
                    return Err(e);
                }
                warn!(job_id = %template.id, "Failed to fire recurrence template: {}", e);
            }
        }
        Ok(())
    }

    async fn fire_template(
        &self,
        template: &Job,
        now: DateTime<Utc>,
        report: &mut TickReport,
    ) -> Result<()> {
        let Some(recurrence) = template.template() else {
            return Ok(());
        };
        let schedule = recurrence.schedule()?;
        let since = recurrence.last_fired_at.unwrap_or(template.created_at);

        let cap = self.config.max_catch_up_fires.max(1);
        let mut fires = VecDeque::with_capacity(cap);
        let mut latest = None;
        let mut skipped = 0;
        for fired_at in schedule.fires_between(since, now) {
            if fires.len() == cap {
                fires.pop_front();
                skipped += 1;
            }
            fires.push_back(fired_at);
            latest = Some(fired_at);
        }
        let Some(latest) = latest else {
            return Ok(());
        };
        if skipped > 0 {
            report.skipped_fires += skipped;
            warn!(
                job_id = %template.id,
                "Template missed {} fires beyond the catch-up cap of {}, skipping them",
                skipped,
                cap
            );
        }

        for fired_at in fires {
            let mut instance = template.spawn_instance(now);
            instance.id = fire_instance_id(&template.id, fired_at);
            match self.repo.put(&mut instance).await {
                Ok(()) => {
                    report.spawned += 1;
                    debug!(
                        job_id = %instance.id,
                        parent_id = %template.id,
                        "Spawned instance for fire at {}",
                        fired_at
                    );
                    self.stage(&instance);
                }
                Err(e) if e.is_conflict() => {
                    debug!(job_id = %instance.id, "Fire already materialised");
                }
                Err(e) => return Err(e),
            }
        }

        update_job_with_retry(
            self.repo.as_ref(),
            &template.id,
            self.config.persist_retry_attempts,
            |job| {
                if job.status != JobStatus::PendingAtTime {
                    return Ok(false);
                }
                job.record_fire(latest, now)?;
                Ok(true)
            },
        )
        .await?;
        Ok(())
    }

    /// Push a persisted PENDING job. It stays PENDING in storage if the queue is
    /// closed and is picked up by the next recovery.
    fn stage(&self, job: &Job) {
        if let Err(e) = self.queue.push(job) {
            debug!(job_id = %job.id, "Job not queued: {}", e);
        }
    }
}
