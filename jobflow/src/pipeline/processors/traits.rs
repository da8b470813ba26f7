//! Processor trait and related types.

use async_trait::async_trait;
use serde_json::Value;

use crate::Result;
use crate::domain::Command;
use crate::error::ExecutionKind;

/// Input for one attempt.
#[derive(Debug, Clone)]
pub struct ProcessorInput {
    pub job_id: String,
    /// 1-based attempt number.
    pub attempt: u32,
    pub command: Command,
}

/// Output of a successful attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessorOutput {
    /// Stored as the job's `result`.
    pub result: Value,
    /// Processing duration in seconds.
    pub duration_secs: f64,
}

/// An execution backend.
#[async_trait]
pub trait Processor: Send + Sync {
    /// The command kind this processor runs.
    fn kind(&self) -> ExecutionKind;

    /// Check if this processor can run a command kind.
    fn can_process(&self, kind: ExecutionKind) -> bool {
        self.kind() == kind
    }

    /// Run one attempt.
    ///
    /// # Cancel Safety
    ///
    /// The executor drops this future when the attempt's deadline passes.
    /// Implementations must release whatever they started when dropped (kill
    /// the child process, abort the spawned task).
    async fn process(&self, input: &ProcessorInput) -> Result<ProcessorOutput>;

    /// Get the processor name.
    fn name(&self) -> &'static str;
}
