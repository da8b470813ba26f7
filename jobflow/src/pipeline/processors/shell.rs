//! Shell command processor.

use async_trait::async_trait;
use process_utils::{decode_output, shell_command};
use serde_json::Value;
use std::process::Stdio;
use std::time::Instant;
use tracing::{debug, info};

use super::traits::{Processor, ProcessorInput, ProcessorOutput};
use crate::domain::Command;
use crate::error::ExecutionKind;
use crate::{Error, Result};

/// Runs a command string through the platform shell.
///
/// `{name}` placeholders are substituted from the command's parameters. The
/// result is the captured stdout; a non-zero exit fails the attempt with the
/// captured stderr (or the exit code when stderr is empty).
pub struct ShellProcessor;

impl ShellProcessor {
    pub fn new() -> Self {
        Self
    }
}

impl Default for ShellProcessor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Processor for ShellProcessor {
    fn kind(&self) -> ExecutionKind {
        ExecutionKind::Shell
    }

    fn name(&self) -> &'static str {
        "ShellProcessor"
    }

    async fn process(&self, input: &ProcessorInput) -> Result<ProcessorOutput> {
        let Command::Shell(shell) = &input.command else {
            return Err(Error::invalid_argument("ShellProcessor only runs shell commands"));
        };

        let start = Instant::now();
        let script = shell.rendered();
        info!(job_id = %input.job_id, attempt = input.attempt, "Executing command: {}", script);

        let mut cmd = shell_command(&script);
        cmd.envs(&shell.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let output = cmd.output().await.map_err(|e| {
            Error::execution(ExecutionKind::Shell, format!("failed to spawn command: {}", e))
        })?;

        let stdout = decode_output(&output.stdout);
        let stderr = decode_output(&output.stderr);
        if !stderr.is_empty() {
            debug!(job_id = %input.job_id, "stderr: {}", stderr);
        }

        if !output.status.success() {
            let message = if stderr.trim().is_empty() {
                match output.status.code() {
                    Some(code) => format!("command exited with code {}", code),
                    None => "command terminated by signal".to_string(),
                }
            } else {
                stderr
            };
            return Err(Error::execution(ExecutionKind::Shell, message));
        }

        let duration_secs = start.elapsed().as_secs_f64();
        debug!(job_id = %input.job_id, "Command completed in {:.2}s", duration_secs);

        Ok(ProcessorOutput {
            result: Value::String(stdout),
            duration_secs,
        })
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::domain::ShellCommand;
    use std::time::Duration;

    fn input(command: Command) -> ProcessorInput {
        ProcessorInput {
            job_id: "job-1".into(),
            attempt: 1,
            command,
        }
    }

    #[tokio::test]
    async fn test_captures_stdout() {
        let output = ShellProcessor::new()
            .process(&input(Command::shell("echo hello")))
            .await
            .unwrap();
        assert_eq!(output.result, Value::String("hello".into()));
    }

    #[tokio::test]
    async fn test_non_zero_exit_fails() {
        let err = ShellProcessor::new()
            .process(&input(Command::shell("echo broken >&2; exit 3")))
            .await
            .unwrap_err();
        assert!(err.is_execution_failure());
        assert!(err.to_string().contains("broken"));

        let err = ShellProcessor::new()
            .process(&input(Command::shell("false")))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("exit"));
    }

    #[tokio::test]
    async fn test_parameters_and_env() {
        let command = ShellCommand {
            script: "echo {who} $GREETING".into(),
            parameters: Default::default(),
            env: Default::default(),
        }
        .with_parameter("who", "world")
        .with_env("GREETING", "hi");

        let output = ShellProcessor::new()
            .process(&input(command.into()))
            .await
            .unwrap();
        assert_eq!(output.result, Value::String("world hi".into()));
    }

    #[tokio::test]
    async fn test_dropped_attempt_kills_child() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("marker");
        let script = format!("sleep 1 && touch {}", marker.display());

        let processor = ShellProcessor::new();
        let job = input(Command::shell(script));
        let attempt = tokio::time::timeout(Duration::from_millis(100), processor.process(&job));
        assert!(attempt.await.is_err());

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!marker.exists());
    }
}
