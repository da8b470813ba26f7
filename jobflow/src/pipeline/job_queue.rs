//! In-memory priority queue of jobs that are ready to run.
//!
//! The queue only stages ids; the authoritative record is always in storage.
//! It is rebuilt from storage on startup, so losing it in a crash loses nothing.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::domain::{Job, JobStatus, Priority};
use crate::{Error, Result};

/// Configuration for the job queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobQueueConfig {
    /// Warning threshold for queue depth.
    #[serde(default = "default_warning_threshold")]
    pub warning_threshold: usize,
    /// Critical threshold for queue depth.
    #[serde(default = "default_critical_threshold")]
    pub critical_threshold: usize,
}

fn default_warning_threshold() -> usize {
    100
}

fn default_critical_threshold() -> usize {
    500
}

impl Default for JobQueueConfig {
    fn default() -> Self {
        Self {
            warning_threshold: default_warning_threshold(),
            critical_threshold: default_critical_threshold(),
        }
    }
}

/// Status of queue depth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueueDepthStatus {
    /// Queue depth is normal.
    Normal,
    /// Queue depth is at warning level.
    Warning,
    /// Queue depth is at critical level.
    Critical,
}

/// A staged job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedJob {
    pub job_id: String,
    pub priority: Priority,
    pub enqueued_at: DateTime<Utc>,
    /// Push order; breaks ties between equal priorities and equal timestamps.
    sequence: u64,
}

impl Ord for QueuedJob {
    /// Max-heap order: higher priority first, then earlier push.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

impl PartialOrd for QueuedJob {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

/// Snapshot of queue counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub depth: usize,
    pub low: usize,
    pub normal: usize,
    pub high: usize,
    pub urgent: usize,
    pub total_pushed: u64,
    pub total_popped: u64,
}

#[derive(Default)]
struct QueueState {
    heap: BinaryHeap<QueuedJob>,
    staged: HashSet<String>,
}

/// Priority-ordered, FIFO-within-priority staging area.
///
/// `push` never blocks. `pop` suspends until an item is available or the queue
/// is closed.
pub struct JobQueue {
    config: JobQueueConfig,
    state: Mutex<QueueState>,
    notify: Notify,
    closed: AtomicBool,
    sequence: AtomicU64,
    total_pushed: AtomicU64,
    total_popped: AtomicU64,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::with_config(JobQueueConfig::default())
    }

    pub fn with_config(config: JobQueueConfig) -> Self {
        Self {
            config,
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            sequence: AtomicU64::new(0),
            total_pushed: AtomicU64::new(0),
            total_popped: AtomicU64::new(0),
        }
    }

    /// Stage a PENDING job.
    ///
    /// Returns `false` when the job is already staged.
    pub fn push(&self, job: &Job) -> Result<bool> {
        if job.status != JobStatus::Pending || job.is_template() {
            return Err(Error::invalid_state(format!(
                "job {} is {} and cannot be queued",
                job.id, job.status
            )));
        }
        if self.is_closed() {
            return Err(Error::invalid_state("job queue is closed"));
        }

        {
            let mut state = self.state.lock();
            if !state.staged.insert(job.id.clone()) {
                debug!(job_id = %job.id, "Job already queued");
                return Ok(false);
            }
            state.heap.push(QueuedJob {
                job_id: job.id.clone(),
                priority: job.priority,
                enqueued_at: Utc::now(),
                sequence: self.sequence.fetch_add(1, Ordering::Relaxed),
            });

            let depth = state.heap.len();
            if depth == self.config.critical_threshold {
                warn!("Job queue depth reached critical level: {}", depth);
            } else if depth == self.config.warning_threshold {
                warn!("Job queue depth reached warning level: {}", depth);
            }
        }

        self.total_pushed.fetch_add(1, Ordering::Relaxed);
        self.notify.notify_one();
        Ok(true)
    }

    /// Take the highest-ordered job without waiting.
    pub fn try_pop(&self) -> Option<QueuedJob> {
        let mut state = self.state.lock();
        let item = state.heap.pop()?;
        state.staged.remove(&item.job_id);
        drop(state);
        self.total_popped.fetch_add(1, Ordering::Relaxed);
        Some(item)
    }

    /// Wait for the highest-ordered job. Returns `None` once the queue is closed.
    pub async fn pop(&self) -> Option<QueuedJob> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before checking so a push between the check and the
            // await is not missed.
            notified.as_mut().enable();

            if self.is_closed() {
                return None;
            }
            if let Some(item) = self.try_pop() {
                return Some(item);
            }

            notified.await;
        }
    }

    /// Withdraw a staged job. Returns `true` if it was staged.
    pub fn remove(&self, job_id: &str) -> bool {
        let mut state = self.state.lock();
        if !state.staged.remove(job_id) {
            return false;
        }
        state.heap.retain(|item| item.job_id != job_id);
        true
    }

    pub fn contains(&self, job_id: &str) -> bool {
        self.state.lock().staged.contains(job_id)
    }

    /// Wake every waiter and refuse further pushes.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.state.lock().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn depth_status(&self) -> QueueDepthStatus {
        let depth = self.len();
        if depth >= self.config.critical_threshold {
            QueueDepthStatus::Critical
        } else if depth >= self.config.warning_threshold {
            QueueDepthStatus::Warning
        } else {
            QueueDepthStatus::Normal
        }
    }

    pub fn stats(&self) -> QueueStats {
        let state = self.state.lock();
        let mut stats = QueueStats {
            depth: state.heap.len(),
            total_pushed: self.total_pushed.load(Ordering::Relaxed),
            total_popped: self.total_popped.load(Ordering::Relaxed),
            ..Default::default()
        };
        for item in state.heap.iter() {
            match item.priority {
                Priority::Low => stats.low += 1,
                Priority::Normal => stats.normal += 1,
                Priority::High => stats.high += 1,
                Priority::Urgent => stats.urgent += 1,
            }
        }
        stats
    }
}

impl Default for JobQueue {
    fn default() -> Self {
        Self::new()
    }
}
