//! Executor: a fixed pool of workers draining the job queue.
//!
//! Each worker pops a job, checks it out (PENDING -> RUNNING), runs one attempt
//! under the job's deadline and writes the outcome back. Failed attempts with
//! retries left go to RETRY_PENDING and re-enter the queue from a timer task
//! once their backoff has elapsed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::job_queue::JobQueue;
use super::processors::{Processor, ProcessorInput};
use crate::database::repositories::{JobRepository, list_all};
use crate::database::retry::update_job_with_retry;
use crate::domain::{Job, JobFilter, JobStatus, KindFilter};
use crate::{Error, Result};

/// Delay before a job whose checkout could not be persisted is looked at again.
const REENTRY_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Delay before an attempt outcome that could not be persisted is written again.
const SETTLE_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Configuration for the worker pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerPoolConfig {
    /// Maximum concurrent workers.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    /// Ceiling for retry backoff delays.
    #[serde(default = "default_max_backoff_secs")]
    pub max_backoff_secs: u64,
    /// Re-reads allowed when a status write loses a revision race.
    #[serde(default = "default_persist_retry_attempts")]
    pub persist_retry_attempts: usize,
}

fn default_max_workers() -> usize {
    4
}

fn default_max_backoff_secs() -> u64 {
    3600
}

fn default_persist_retry_attempts() -> usize {
    5
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            max_backoff_secs: default_max_backoff_secs(),
            persist_retry_attempts: default_persist_retry_attempts(),
        }
    }
}

impl WorkerPoolConfig {
    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers;
        self
    }

    pub fn with_max_backoff(mut self, max_backoff: Duration) -> Self {
        self.max_backoff_secs = max_backoff.as_secs();
        self
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_secs(self.max_backoff_secs)
    }
}

/// Snapshot of executor counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ExecutorStats {
    /// Jobs that reached COMPLETED.
    pub completed: u64,
    /// Jobs that reached FAILED.
    pub failed: u64,
    /// Jobs the executor moved to CANCELLED.
    pub cancelled: u64,
    /// Failed attempts that were scheduled for another try.
    pub retried: u64,
    /// Attempts started.
    pub attempts: u64,
    pub active_workers: usize,
    /// Cumulative attempt run time.
    pub total_execution_secs: f64,
}

impl ExecutorStats {
    pub fn average_execution_secs(&self) -> f64 {
        if self.attempts == 0 {
            0.0
        } else {
            self.total_execution_secs / self.attempts as f64
        }
    }
}

/// What restart recovery did with the jobs it found.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Jobs staged in the queue.
    pub requeued: usize,
    /// RUNNING jobs whose attempt was interrupted and which will run again.
    pub reclaimed: usize,
    /// RUNNING jobs with no attempts left, now FAILED.
    pub failed: usize,
    /// Jobs with a pending cancel request, now CANCELLED.
    pub cancelled: usize,
    /// RETRY_PENDING jobs whose backoff timer was re-armed.
    pub rearmed: usize,
}

#[derive(Default)]
struct Counters {
    completed: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
    retried: AtomicU64,
    attempts: AtomicU64,
    execution_micros: AtomicU64,
    active_workers: AtomicUsize,
}

/// Decrements the active worker count when an attempt ends, however it ends.
struct ActiveGuard<'a>(&'a AtomicUsize);

impl<'a> ActiveGuard<'a> {
    fn new(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// State shared by workers and re-entry timers.
struct PoolShared {
    repo: Arc<dyn JobRepository>,
    queue: Arc<JobQueue>,
    processors: Vec<Arc<dyn Processor>>,
    config: WorkerPoolConfig,
    counters: Counters,
    cancellation_token: CancellationToken,
}

/// A fixed pool of workers executing queued jobs.
pub struct WorkerPool {
    shared: Arc<PoolShared>,
    started: AtomicBool,
    /// Task set for workers.
    tasks: parking_lot::Mutex<Option<JoinSet<()>>>,
}

fn after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

impl PoolShared {
    fn processor_for(&self, job: &Job) -> Option<&Arc<dyn Processor>> {
        let kind = job.command.kind();
        self.processors.iter().find(|p| p.can_process(kind))
    }

    async fn worker_loop(self: Arc<Self>, worker: usize) {
        debug!(worker, "Worker started");
        loop {
            let item = tokio::select! {
                biased;
                _ = self.cancellation_token.cancelled() => break,
                item = self.queue.pop() => item,
            };
            let Some(item) = item else {
                break;
            };

            let _active = ActiveGuard::new(&self.counters.active_workers);
            self.run_job(&item.job_id, worker).await;
        }
        debug!(worker, "Worker stopped");
    }

    /// Check out, run and settle one job.
    async fn run_job(self: &Arc<Self>, job_id: &str, worker: usize) {
        let checkout = update_job_with_retry(
            self.repo.as_ref(),
            job_id,
            self.config.persist_retry_attempts,
            |job| {
                if job.status != JobStatus::Pending {
                    return Ok(false);
                }
                if job.cancel_requested {
                    job.mark_cancelled(None, None, Utc::now())?;
                } else {
                    job.mark_running(Utc::now())?;
                }
                Ok(true)
            },
        )
        .await;

        let job = match checkout {
            Ok(Some(job)) if job.status == JobStatus::Running => job,
            Ok(Some(_)) => {
                info!(job_id = %job_id, "Job cancelled before its attempt started");
                self.counters.cancelled.fetch_add(1, Ordering::Relaxed);
                return;
            }
            Ok(None) => {
                debug!(job_id = %job_id, "Job is no longer pending, skipping");
                return;
            }
            Err(e) if e.is_not_found() => {
                debug!(job_id = %job_id, "Job was deleted before it ran");
                return;
            }
            Err(e) => {
                warn!(job_id = %job_id, "Failed to check out job: {}", e);
                self.schedule_reentry(job_id.to_string(), REENTRY_RETRY_DELAY);
                return;
            }
        };

        let attempt = job.attempt_count;
        let kind = job.command.kind();
        debug!(
            job_id = %job.id,
            worker,
            attempt,
            "Worker {} running job '{}' ({})",
            worker,
            job.name,
            kind
        );

        let started = Instant::now();
        let outcome: std::result::Result<Value, String> = match self.processor_for(&job) {
            Some(processor) => {
                let input = ProcessorInput {
                    job_id: job.id.clone(),
                    attempt,
                    command: job.command.clone(),
                };
                match tokio::time::timeout(job.timeout, processor.process(&input)).await {
                    Ok(Ok(output)) => Ok(output.result),
                    Ok(Err(e)) => Err(e.to_string()),
                    Err(_) => Err(Error::Timeout {
                        kind,
                        timeout: job.timeout,
                    }
                    .to_string()),
                }
            }
            None => {
                warn!(
                    job_id = %job.id,
                    "No processor for {} commands. Available processors: {:?}",
                    kind,
                    self.processors.iter().map(|p| p.name()).collect::<Vec<_>>()
                );
                Err(Error::execution(kind, format!("no processor for {} commands", kind)).to_string())
            }
        };
        self.record_attempt(started.elapsed());

        if let Err(message) = &outcome {
            warn!(job_id = %job.id, attempt, "Attempt failed: {}", message);
        }

        self.settle(&job.id, attempt, outcome).await;
    }

    /// Write the outcome of attempt number `attempt`.
    async fn settle(
        self: &Arc<Self>,
        job_id: &str,
        attempt: u32,
        outcome: std::result::Result<Value, String>,
    ) {
        let max_backoff = self.config.max_backoff();
        let written = update_job_with_retry(
            self.repo.as_ref(),
            job_id,
            self.config.persist_retry_attempts,
            |job| {
                if job.status != JobStatus::Running || job.attempt_count != attempt {
                    return Ok(false);
                }
                let now = Utc::now();
                match &outcome {
                    Ok(result) if job.cancel_requested => {
                        job.mark_cancelled(Some(result.clone()), None, now)?
                    }
                    Err(message) if job.cancel_requested => {
                        job.mark_cancelled(None, Some(message.clone()), now)?
                    }
                    Ok(result) => job.mark_completed(result.clone(), now)?,
                    Err(message) if job.retry_policy.allows_retry(job.attempt_count) => {
                        let delay = job
                            .retry_policy
                            .backoff
                            .delay_for(job.attempt_count, max_backoff);
                        job.mark_retry_pending(message.clone(), after(now, delay), now)?
                    }
                    Err(message) => job.mark_failed(message.clone(), now)?,
                }
                Ok(true)
            },
        )
        .await;

        match written {
            Ok(Some(job)) => match job.status {
                JobStatus::Completed => {
                    self.counters.completed.fetch_add(1, Ordering::Relaxed);
                    info!(job_id = %job.id, attempt, status = %job.status, "Job completed");
                }
                JobStatus::RetryPending => {
                    self.counters.retried.fetch_add(1, Ordering::Relaxed);
                    let delay = job
                        .next_attempt_at
                        .and_then(|at| (at - Utc::now()).to_std().ok())
                        .unwrap_or(Duration::ZERO);
                    info!(
                        job_id = %job.id,
                        attempt,
                        status = %job.status,
                        "Retrying job in {:?} ({}/{} retries used)",
                        delay,
                        job.attempt_count,
                        job.retry_policy.max_attempts
                    );
                    self.schedule_reentry(job.id, delay);
                }
                JobStatus::Failed => {
                    self.counters.failed.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        job_id = %job.id,
                        attempt,
                        status = %job.status,
                        "Job failed after {} attempts",
                        job.attempt_count
                    );
                }
                JobStatus::Cancelled => {
                    self.counters.cancelled.fetch_add(1, Ordering::Relaxed);
                    info!(job_id = %job.id, attempt, status = %job.status, "Job cancelled during its attempt");
                }
                other => debug!(job_id = %job.id, status = %other, "Unexpected status after settle"),
            },
            Ok(None) => {
                debug!(job_id = %job_id, attempt, "Job changed while running, outcome discarded");
            }
            Err(e) if e.is_not_found() => {
                debug!(job_id = %job_id, "Job was deleted while running");
            }
            Err(e) if e.is_storage_unavailable() || e.is_conflict() => {
                warn!(
                    job_id = %job_id,
                    attempt,
                    "Failed to persist attempt outcome, retrying in {:?}: {}",
                    SETTLE_RETRY_DELAY,
                    e
                );
                self.schedule_settle(job_id.to_string(), attempt, outcome, SETTLE_RETRY_DELAY);
            }
            Err(e) => {
                // Stays RUNNING until restart recovery reclaims it.
                error!(job_id = %job_id, attempt, "Failed to persist attempt outcome: {}", e);
            }
        }
    }

    /// Write the outcome of `attempt` again after `delay`.
    ///
    /// The write is a no-op once the job has left RUNNING for that attempt.
    fn schedule_settle(
        self: &Arc<Self>,
        job_id: String,
        attempt: u32,
        outcome: std::result::Result<Value, String>,
        delay: Duration,
    ) {
        let shared = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = shared.cancellation_token.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            shared.settle(&job_id, attempt, outcome).await;
        });
    }

    fn record_attempt(&self, elapsed: Duration) {
        self.counters.attempts.fetch_add(1, Ordering::Relaxed);
        self.counters
            .execution_micros
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
    }

    /// Re-check `job_id` after `delay` and stage it if it is ready.
    fn schedule_reentry(self: &Arc<Self>, job_id: String, delay: Duration) {
        let shared = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = shared.cancellation_token.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            shared.reenter(&job_id).await;
        });
    }

    async fn reenter(self: &Arc<Self>, job_id: &str) {
        let updated = update_job_with_retry(
            self.repo.as_ref(),
            job_id,
            self.config.persist_retry_attempts,
            |job| {
                if job.status != JobStatus::RetryPending {
                    return Ok(false);
                }
                if job.cancel_requested {
                    job.mark_cancelled(None, None, Utc::now())?;
                } else {
                    job.mark_pending(Utc::now())?;
                }
                Ok(true)
            },
        )
        .await;

        let job = match updated {
            Ok(Some(job)) => {
                if job.status == JobStatus::Cancelled {
                    self.counters.cancelled.fetch_add(1, Ordering::Relaxed);
                    info!(job_id = %job.id, "Cancelled job will not be retried");
                    return;
                }
                job
            }
            // Not waiting on a backoff: stage it only if it is already PENDING.
            Ok(None) => match self.repo.get(job_id).await {
                Ok(job) => job,
                Err(e) => {
                    debug!(job_id = %job_id, "Skipping re-entry: {}", e);
                    return;
                }
            },
            Err(e) if e.is_not_found() => return,
            Err(e) => {
                warn!(job_id = %job_id, "Failed to re-enter job, retrying: {}", e);
                self.schedule_reentry(job_id.to_string(), REENTRY_RETRY_DELAY);
                return;
            }
        };

        if job.status != JobStatus::Pending {
            return;
        }
        match self.queue.push(&job) {
            Ok(_) => debug!(job_id = %job.id, "Job re-entered the queue"),
            Err(e) => debug!(job_id = %job.id, "Job not re-queued: {}", e),
        }
    }

    async fn recover_running(&self, job: Job, report: &mut RecoveryReport) -> Result<()> {
        let updated = update_job_with_retry(
            self.repo.as_ref(),
            &job.id,
            self.config.persist_retry_attempts,
            |job| {
                if job.status != JobStatus::Running {
                    return Ok(false);
                }
                let now = Utc::now();
                if job.cancel_requested {
                    job.mark_cancelled(None, None, now)?;
                } else if job.retry_policy.allows_retry(job.attempt_count) {
                    job.mark_pending(now)?;
                } else {
                    job.mark_failed("attempt interrupted by engine restart", now)?;
                }
                Ok(true)
            },
        )
        .await;

        match updated {
            Ok(Some(job)) => match job.status {
                JobStatus::Pending => {
                    report.reclaimed += 1;
                    if self.queue.push(&job)? {
                        report.requeued += 1;
                    }
                }
                JobStatus::Cancelled => report.cancelled += 1,
                JobStatus::Failed => report.failed += 1,
                _ => {}
            },
            Ok(None) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
        Ok(())
    }

    async fn recover_retry_pending(
        self: &Arc<Self>,
        job: Job,
        report: &mut RecoveryReport,
    ) -> Result<()> {
        let now = Utc::now();
        let due = job.next_attempt_at.is_none_or(|at| at <= now);
        if !job.cancel_requested && !due {
            let delay = job
                .next_attempt_at
                .and_then(|at| (at - now).to_std().ok())
                .unwrap_or(Duration::ZERO);
            self.schedule_reentry(job.id, delay);
            report.rearmed += 1;
            return Ok(());
        }

        let updated = update_job_with_retry(
            self.repo.as_ref(),
            &job.id,
            self.config.persist_retry_attempts,
            |job| {
                if job.status != JobStatus::RetryPending {
                    return Ok(false);
                }
                if job.cancel_requested {
                    job.mark_cancelled(None, None, Utc::now())?;
                } else {
                    job.mark_pending(Utc::now())?;
                }
                Ok(true)
            },
        )
        .await;

        match updated {
            Ok(Some(job)) if job.status == JobStatus::Pending => {
                if self.queue.push(&job)? {
                    report.requeued += 1;
                }
            }
            Ok(Some(_)) => report.cancelled += 1,
            Ok(None) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
        Ok(())
    }
}

impl WorkerPool {
    pub fn new(
        repo: Arc<dyn JobRepository>,
        queue: Arc<JobQueue>,
        processors: Vec<Arc<dyn Processor>>,
        config: WorkerPoolConfig,
    ) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                repo,
                queue,
                processors,
                config,
                counters: Counters::default(),
                cancellation_token: CancellationToken::new(),
            }),
            started: AtomicBool::new(false),
            tasks: parking_lot::Mutex::new(Some(JoinSet::new())),
        }
    }

    /// Bring storage back to a runnable state after a restart.
    ///
    /// Interrupted RUNNING jobs are reclaimed (or failed when they have no
    /// attempts left), due RETRY_PENDING jobs become PENDING, future ones get
    /// their timer re-armed, and every PENDING instance is staged. A storage
    /// error here is returned to the caller.
    pub async fn recover(&self) -> Result<RecoveryReport> {
        let shared = &self.shared;
        let mut report = RecoveryReport::default();

        let running = list_all(
            &shared.repo,
            JobFilter::new()
                .with_status(JobStatus::Running)
                .with_kind(KindFilter::Instance),
        )
        .await?;
        for job in running {
            shared.recover_running(job, &mut report).await?;
        }

        let waiting = list_all(
            &shared.repo,
            JobFilter::new()
                .with_status(JobStatus::RetryPending)
                .with_kind(KindFilter::Instance),
        )
        .await?;
        for job in waiting {
            shared.recover_retry_pending(job, &mut report).await?;
        }

        let pending = list_all(
            &shared.repo,
            JobFilter::new()
                .with_status(JobStatus::Pending)
                .with_kind(KindFilter::Instance),
        )
        .await?;
        for job in pending {
            if shared.queue.push(&job)? {
                report.requeued += 1;
            }
        }

        info!(
            "Recovery finished: {} queued, {} reclaimed, {} failed, {} cancelled, {} timers re-armed",
            report.requeued, report.reclaimed, report.failed, report.cancelled, report.rearmed
        );
        Ok(report)
    }

    /// Spawn the workers. Calling it again is a no-op.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            warn!("Worker pool already started");
            return;
        }

        let max_workers = self.shared.config.max_workers.max(1);
        info!("Starting worker pool with {} workers", max_workers);

        let mut tasks = self.tasks.lock();
        if let Some(ref mut join_set) = *tasks {
            for i in 0..max_workers {
                join_set.spawn(Arc::clone(&self.shared).worker_loop(i));
            }
        }
    }

    /// Stop taking jobs and wait up to `grace` for in-flight attempts.
    ///
    /// Workers still busy after `grace` are aborted; their jobs stay RUNNING
    /// and are reclaimed by the next recovery. Returns `true` if every worker
    /// finished on its own.
    pub async fn stop(&self, grace: Duration) -> bool {
        info!("Stopping worker pool");
        self.shared.cancellation_token.cancel();

        // Take the join set out of the mutex before awaiting
        let join_set = {
            let mut tasks = self.tasks.lock();
            tasks.take()
        };
        let Some(mut join_set) = join_set else {
            return true;
        };

        let drained = tokio::time::timeout(grace, async {
            while join_set.join_next().await.is_some() {}
        })
        .await
        .is_ok();

        if !drained {
            warn!(
                "Worker pool did not drain within {:?}, aborting {} workers",
                grace,
                join_set.len()
            );
            join_set.abort_all();
            while join_set.join_next().await.is_some() {}
        }

        info!("Worker pool stopped");
        drained
    }

    pub fn stats(&self) -> ExecutorStats {
        let counters = &self.shared.counters;
        ExecutorStats {
            completed: counters.completed.load(Ordering::Relaxed),
            failed: counters.failed.load(Ordering::Relaxed),
            cancelled: counters.cancelled.load(Ordering::Relaxed),
            retried: counters.retried.load(Ordering::Relaxed),
            attempts: counters.attempts.load(Ordering::Relaxed),
            active_workers: counters.active_workers.load(Ordering::SeqCst),
            total_execution_secs: counters.execution_micros.load(Ordering::Relaxed) as f64
                / 1_000_000.0,
        }
    }

    /// Get the number of workers currently running an attempt.
    pub fn active_count(&self) -> usize {
        self.shared.counters.active_workers.load(Ordering::SeqCst)
    }

    /// Check if the pool is running.
    pub fn is_running(&self) -> bool {
        self.started.load(Ordering::SeqCst) && !self.shared.cancellation_token.is_cancelled()
    }
}
