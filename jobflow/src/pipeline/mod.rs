//! Execution pipeline.
//!
//! The pipeline is responsible for:
//! - Staging ready jobs in a priority queue
//! - Running a fixed worker pool against the queue
//! - Dispatching attempts to the shell, function and HTTP processors
//! - Automatic purging of old finished jobs

mod job_queue;
mod processors;
mod purge;
mod worker_pool;

pub use job_queue::{JobQueue, JobQueueConfig, QueueDepthStatus, QueueStats, QueuedJob};
pub use processors::{
    FunctionProcessor, FunctionRegistry, HttpProcessor, JobFunction, Processor, ProcessorInput,
    ProcessorOutput, ShellProcessor, default_processors, install_rustls_provider,
};
pub use purge::{JobPurgeService, PurgeConfig, PurgeWindow};
pub use worker_pool::{ExecutorStats, RecoveryReport, WorkerPool, WorkerPoolConfig};
