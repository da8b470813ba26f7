//! Execution backends.
//!
//! One processor per command kind; the executor picks the first whose
//! `can_process` accepts the job's command.

mod function;
mod http;
mod shell;
mod traits;

pub use function::{FunctionProcessor, FunctionRegistry, JobFunction};
pub use http::{HttpProcessor, install_rustls_provider};
pub use shell::ShellProcessor;
pub use traits::{Processor, ProcessorInput, ProcessorOutput};

use std::sync::Arc;

/// The standard processor set.
pub fn default_processors(functions: FunctionRegistry) -> Vec<Arc<dyn Processor>> {
    vec![
        Arc::new(ShellProcessor::new()),
        Arc::new(FunctionProcessor::new(functions)),
        Arc::new(HttpProcessor::new()),
    ]
}
