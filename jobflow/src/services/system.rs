//! The automation system façade.
//!
//! `SystemBuilder::start` wires storage, queue recovery, the scheduler loop,
//! the worker pool and the purge service together. `AutomationSystem` is the
//! only entry point callers use afterwards.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde_json::{Map, Value};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{EngineConfig, StorageConfig};
use crate::database::repositories::{
    DEFAULT_PAGE_SIZE, FileJobRepository, JobRepository, JobStats, SqlxJobRepository, list_all,
    list_stream,
};
use crate::database::retry::update_job_with_retry;
use crate::domain::{
    CronSchedule, Job, JobFilter, JobKind, JobSpec, JobStatus, RecurrenceTemplate,
    StatusTransition,
};
use crate::metrics::{HealthChecker, SystemHealth};
use crate::pipeline::{
    ExecutorStats, FunctionRegistry, JobPurgeService, JobQueue, Processor, QueueStats,
    WorkerPool, default_processors,
};
use crate::scheduler::{Scheduler, TickReport};
use crate::{Error, Result};

/// Assembles and starts an [`AutomationSystem`].
pub struct SystemBuilder {
    config: EngineConfig,
    repository: Option<Arc<dyn JobRepository>>,
    functions: FunctionRegistry,
    processors: Vec<Arc<dyn Processor>>,
}

impl SystemBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            repository: None,
            functions: FunctionRegistry::new(),
            processors: Vec::new(),
        }
    }

    /// Use an existing repository instead of opening the configured one.
    ///
    /// The caller keeps ownership: shutdown does not close it.
    pub fn with_repository(mut self, repository: Arc<dyn JobRepository>) -> Self {
        self.repository = Some(repository);
        self
    }

    /// Share an existing function registry.
    pub fn with_functions(mut self, functions: FunctionRegistry) -> Self {
        self.functions = functions;
        self
    }

    /// Register a function callable by `function` jobs.
    pub fn register_function<F, Fut>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Map<String, Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        self.functions.register(name, f);
        self
    }

    /// Add a processor consulted before the built-in ones.
    pub fn with_processor(mut self, processor: Arc<dyn Processor>) -> Self {
        self.processors.push(processor);
        self
    }

    async fn open_repository(config: &StorageConfig) -> Result<Arc<dyn JobRepository>> {
        let repository: Arc<dyn JobRepository> = match config {
            StorageConfig::Sqlite { database_url } => {
                Arc::new(SqlxJobRepository::connect(database_url).await?)
            }
            StorageConfig::File { directory } => {
                Arc::new(FileJobRepository::open(directory.clone()).await?)
            }
        };
        Ok(repository)
    }

    /// Open storage, restore the queue and start the background loops.
    ///
    /// Fails if storage cannot be opened or the queue cannot be repopulated.
    pub async fn start(self) -> Result<AutomationSystem> {
        self.config.validate()?;
        info!("Starting automation system");

        let owns_repository = self.repository.is_none();
        let repo = match self.repository {
            Some(repo) => repo,
            None => Self::open_repository(&self.config.storage).await?,
        };
        info!("Using {} storage", repo.backend());

        let queue = Arc::new(JobQueue::with_config(self.config.queue.clone()));
        let mut processors = self.processors;
        processors.extend(default_processors(self.functions.clone()));

        let pool = WorkerPool::new(
            repo.clone(),
            queue.clone(),
            processors,
            self.config.executor.pool.clone(),
        );
        if let Err(e) = pool.recover().await {
            warn!("Failed to restore queue from storage: {}", e);
            if owns_repository {
                repo.close().await;
            }
            return Err(e);
        }

        let cancellation_token = CancellationToken::new();
        let scheduler = Arc::new(Scheduler::new(
            repo.clone(),
            queue.clone(),
            self.config.scheduler.clone(),
            cancellation_token.child_token(),
        ));
        let scheduler_handle = if self.config.scheduler.enabled {
            Some(scheduler.start())
        } else {
            info!("Scheduler disabled");
            None
        };

        let purge = JobPurgeService::new(self.config.purge.clone(), repo.clone());
        if self.config.purge.retention_days > 0 {
            purge.start_background_task(cancellation_token.child_token());
        }

        pool.start();
        info!("Automation system started");

        Ok(AutomationSystem {
            config: self.config,
            repo,
            owns_repository,
            queue,
            pool,
            scheduler,
            scheduler_handle: parking_lot::Mutex::new(scheduler_handle),
            purge,
            functions: self.functions,
            health: HealthChecker::new(),
            cancellation_token,
            shut_down: AtomicBool::new(false),
        })
    }
}

/// A running engine.
pub struct AutomationSystem {
    config: EngineConfig,
    repo: Arc<dyn JobRepository>,
    owns_repository: bool,
    queue: Arc<JobQueue>,
    pool: WorkerPool,
    scheduler: Arc<Scheduler>,
    scheduler_handle: parking_lot::Mutex<Option<JoinHandle<()>>>,
    purge: JobPurgeService,
    functions: FunctionRegistry,
    health: HealthChecker,
    /// Cancellation token for graceful shutdown.
    cancellation_token: CancellationToken,
    shut_down: AtomicBool,
}

impl AutomationSystem {
    /// Start with the given config and no registered functions.
    pub async fn start(config: EngineConfig) -> Result<Self> {
        SystemBuilder::new(config).start().await
    }

    pub fn builder(config: EngineConfig) -> SystemBuilder {
        SystemBuilder::new(config)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Registry for `function` jobs; functions may be added while running.
    pub fn functions(&self) -> &FunctionRegistry {
        &self.functions
    }

    pub fn is_running(&self) -> bool {
        !self.shut_down.load(Ordering::SeqCst)
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_running() {
            Ok(())
        } else {
            Err(Error::invalid_state("automation system has been shut down"))
        }
    }

    fn build(
        &self,
        spec: JobSpec,
        status: JobStatus,
        kind: JobKind,
        at: Option<DateTime<Utc>>,
    ) -> Result<Job> {
        spec.validate()?;
        Ok(spec.into_job(
            status,
            kind,
            at,
            self.config.executor.default_timeout(),
            Utc::now(),
        ))
    }

    /// Persist a job and stage it for immediate execution.
    pub async fn submit(&self, spec: JobSpec) -> Result<Job> {
        self.ensure_running()?;
        let mut job = self.build(spec, JobStatus::Pending, JobKind::default(), None)?;
        self.repo.put(&mut job).await?;

        if let Err(e) = self.queue.push(&job) {
            // Persisted as PENDING; the next recovery stages it.
            warn!(job_id = %job.id, "Submitted job not queued: {}", e);
        }
        info!(job_id = %job.id, priority = %job.priority, "Submitted job '{}'", job.name);
        Ok(job)
    }

    /// Persist a job that the scheduler releases at `at`.
    pub async fn schedule(&self, spec: JobSpec, at: DateTime<Utc>) -> Result<Job> {
        self.ensure_running()?;
        let mut job = self.build(spec, JobStatus::PendingAtTime, JobKind::default(), Some(at))?;
        self.repo.put(&mut job).await?;
        info!(job_id = %job.id, "Scheduled job '{}' for {}", job.name, at);
        Ok(job)
    }

    /// Persist a job that the scheduler releases after `delay`.
    pub async fn schedule_delayed(&self, spec: JobSpec, delay: Duration) -> Result<Job> {
        let delay = chrono::Duration::from_std(delay)
            .map_err(|_| Error::invalid_argument(format!("delay {:?} is too large", delay)))?;
        let at = Utc::now()
            .checked_add_signed(delay)
            .ok_or_else(|| Error::invalid_argument("delay is out of range"))?;
        self.schedule(spec, at).await
    }

    /// Persist a recurrence template that spawns an instance per cron fire.
    ///
    /// The cron expression is evaluated in the spec's time zone.
    pub async fn schedule_recurring(&self, spec: JobSpec, cron: &str) -> Result<Job> {
        self.ensure_running()?;
        let schedule = CronSchedule::parse(cron, &spec.timezone)?;
        let kind = JobKind::Template(RecurrenceTemplate {
            cron: schedule.expression().to_string(),
            timezone: spec.timezone.clone(),
            last_fired_at: None,
        });
        let mut job = self.build(spec, JobStatus::PendingAtTime, kind, None)?;
        self.repo.put(&mut job).await?;
        info!(
            job_id = %job.id,
            "Scheduled recurring job '{}' ({}, next fire {:?})",
            job.name,
            cron,
            schedule.next_after(Utc::now())
        );
        Ok(job)
    }

    /// Cancel a job.
    ///
    /// Waiting jobs become CANCELLED immediately. A RUNNING job finishes its
    /// current attempt and then becomes CANCELLED instead of being retried.
    /// Cancelling a finished job fails with `InvalidState`.
    pub async fn cancel(&self, id: &str) -> Result<Job> {
        self.ensure_running()?;
        let updated = update_job_with_retry(
            self.repo.as_ref(),
            id,
            self.config.executor.pool.persist_retry_attempts,
            |job| {
                let now = Utc::now();
                match job.status {
                    JobStatus::PendingAtTime | JobStatus::Pending | JobStatus::RetryPending => {
                        job.mark_cancelled(None, None, now)?;
                        Ok(true)
                    }
                    JobStatus::Running => job.request_cancel(now),
                    status => Err(Error::invalid_state(format!(
                        "job {} is already {}",
                        job.id, status
                    ))),
                }
            },
        )
        .await?;

        let job = match updated {
            Some(job) => job,
            None => self.repo.get(id).await?,
        };
        if job.status == JobStatus::Cancelled {
            self.queue.remove(&job.id);
            info!(job_id = %job.id, "Job cancelled");
        } else {
            info!(job_id = %job.id, status = %job.status, "Cancellation requested");
        }
        Ok(job)
    }

    /// Remove a finished job and its history.
    pub async fn delete_job(&self, id: &str) -> Result<()> {
        self.ensure_running()?;
        self.repo.delete(id).await?;
        debug!(job_id = %id, "Job deleted");
        Ok(())
    }

    pub async fn get_job(&self, id: &str) -> Result<Job> {
        self.repo.get(id).await
    }

    /// Every job matching `filter`, ordered by creation time.
    pub async fn list_jobs(&self, filter: JobFilter) -> Result<Vec<Job>> {
        list_all(&self.repo, filter).await
    }

    /// Lazily page through jobs matching `filter`.
    pub fn list_jobs_stream(&self, filter: JobFilter) -> BoxStream<'static, Result<Job>> {
        list_stream(self.repo.clone(), filter, DEFAULT_PAGE_SIZE)
    }

    /// Status transitions of a job, oldest first.
    pub async fn history(&self, id: &str) -> Result<Vec<StatusTransition>> {
        self.repo.history(id).await
    }

    pub async fn statistics(&self) -> Result<JobStats> {
        self.repo.statistics().await
    }

    pub fn executor_stats(&self) -> ExecutorStats {
        self.pool.stats()
    }

    /// Number of jobs staged for execution.
    pub fn queue_depth(&self) -> usize {
        self.queue.len()
    }

    pub fn queue_stats(&self) -> QueueStats {
        self.queue.stats()
    }

    /// Run one scheduler pass now instead of waiting for the next tick.
    pub async fn tick(&self) -> Result<TickReport> {
        self.ensure_running()?;
        self.scheduler.tick().await
    }

    /// Delete finished jobs older than `older_than`. Returns how many were removed.
    pub async fn purge_finished(&self, older_than: Duration) -> Result<u64> {
        self.ensure_running()?;
        let older_than = chrono::Duration::from_std(older_than)
            .map_err(|_| Error::invalid_argument("retention period is too large"))?;
        let cutoff = Utc::now()
            .checked_sub_signed(older_than)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let deleted = self.purge.purge_finished_before(cutoff).await?;
        info!("Purged {} finished jobs older than {}", deleted, cutoff);
        Ok(deleted)
    }

    pub async fn health(&self) -> SystemHealth {
        let started = Instant::now();
        let stats = self.repo.statistics().await;
        let storage = self
            .health
            .check_storage(self.repo.backend(), &stats, started.elapsed());

        self.health.assemble([
            storage,
            self.health
                .check_queue(self.queue.len(), self.queue.depth_status()),
            self.health.check_running(
                "scheduler",
                self.config.scheduler.enabled,
                self.scheduler.is_running(),
            ),
            self.health
                .check_running("executor", true, self.pool.is_running()),
            self.health.check_failure_rate(stats.as_ref().ok()),
        ])
    }

    /// Stop the scheduler, let in-flight attempts finish for up to the
    /// configured grace period, and release storage.
    ///
    /// Calling it again is a no-op.
    pub async fn shutdown(&self) -> Result<()> {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let grace = self.config.shutdown_grace();
        info!("Shutting down automation system (grace: {:?})", grace);

        // Signal all background tasks to stop
        self.cancellation_token.cancel();
        let scheduler_handle = self.scheduler_handle.lock().take();
        if let Some(handle) = scheduler_handle
            && let Err(e) = handle.await
        {
            warn!("Scheduler task ended abnormally: {}", e);
        }

        self.queue.close();
        if !self.pool.stop(grace).await {
            warn!("Shutdown grace period elapsed, interrupted jobs will be reclaimed on restart");
        }

        if self.owns_repository {
            info!("Closing {} storage...", self.repo.backend());
            self.repo.close().await;
        }

        info!("Automation system shut down");
        Ok(())
    }
}
