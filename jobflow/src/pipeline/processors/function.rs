//! In-process function processor.

use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::BoxFuture;
use serde_json::{Map, Value};
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::AbortHandle;
use tracing::debug;

use super::traits::{Processor, ProcessorInput, ProcessorOutput};
use crate::domain::Command;
use crate::error::ExecutionKind;
use crate::{Error, Result};

/// A registered callable: JSON object of parameters in, JSON value out.
pub type JobFunction =
    Arc<dyn Fn(Map<String, Value>) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync>;

/// Named functions that `function` jobs can call.
///
/// Cloning shares the underlying table, so functions registered after the
/// engine has started are visible to it.
#[derive(Clone, Default)]
pub struct FunctionRegistry {
    functions: Arc<DashMap<String, JobFunction>>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `f` under `name`, replacing any previous registration.
    pub fn register<F, Fut>(&self, name: impl Into<String>, f: F)
    where
        F: Fn(Map<String, Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        let name = name.into();
        debug!("Registering job function '{}'", name);
        let function: JobFunction = Arc::new(move |params| Box::pin(f(params)));
        self.functions.insert(name, function);
    }

    pub fn unregister(&self, name: &str) -> bool {
        self.functions.remove(name).is_some()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.functions.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    fn get(&self, name: &str) -> Option<JobFunction> {
        self.functions.get(name).map(|entry| Arc::clone(entry.value()))
    }
}

impl std::fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionRegistry")
            .field("functions", &self.names())
            .finish()
    }
}

/// Aborts the spawned call if the attempt is dropped at its deadline.
struct AbortOnDrop(AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Calls a registered function by name.
///
/// The call runs on its own task, so a panicking function fails the attempt
/// instead of taking the worker down.
pub struct FunctionProcessor {
    registry: FunctionRegistry,
}

impl FunctionProcessor {
    pub fn new(registry: FunctionRegistry) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl Processor for FunctionProcessor {
    fn kind(&self) -> ExecutionKind {
        ExecutionKind::Function
    }

    fn name(&self) -> &'static str {
        "FunctionProcessor"
    }

    async fn process(&self, input: &ProcessorInput) -> Result<ProcessorOutput> {
        let Command::Function(call) = &input.command else {
            return Err(Error::invalid_argument(
                "FunctionProcessor only runs function calls",
            ));
        };

        let function = self.registry.get(&call.name).ok_or_else(|| {
            Error::execution(
                ExecutionKind::Function,
                format!("no function registered under '{}'", call.name),
            )
        })?;

        let start = Instant::now();
        let handle = tokio::spawn(function(call.parameters.clone()));
        let _guard = AbortOnDrop(handle.abort_handle());

        let value = match handle.await {
            Ok(Ok(value)) => value,
            Ok(Err(e)) => {
                return Err(Error::execution(ExecutionKind::Function, format!("{:#}", e)));
            }
            Err(e) if e.is_panic() => {
                return Err(Error::execution(
                    ExecutionKind::Function,
                    format!("function '{}' panicked", call.name),
                ));
            }
            Err(e) => {
                return Err(Error::execution(ExecutionKind::Function, e.to_string()));
            }
        };

        Ok(ProcessorOutput {
            result: value,
            duration_secs: start.elapsed().as_secs_f64(),
        })
    }
}
