//! The unit of work a re-check task performs

use std::future::Future;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use super::task::ScheduledTask;

/// Performs the actual re-check (download, sync) for a task.
///
/// Returns a short human-readable message on success.
#[async_trait]
pub trait TaskRunner: Send + Sync {
    async fn run(&self, task: &ScheduledTask) -> Result<String>;
}

/// Runs an external command with the model name appended as the last argument
#[derive(Debug, Clone, Default)]
pub struct CommandRunner {
    command: Option<String>,
}

impl CommandRunner {
    /// `command` is split on whitespace; `None` or blank makes the runner log only
    pub fn new(command: Option<String>) -> Self {
        Self {
            command: command.filter(|c| !c.trim().is_empty()),
        }
    }

    pub fn command(&self) -> Option<&str> {
        self.command.as_deref()
    }
}

#[async_trait]
impl TaskRunner for CommandRunner {
    async fn run(&self, task: &ScheduledTask) -> Result<String> {
        let Some(command) = &self.command else {
            info!(task_id = %task.task_id, model = %task.model_name, "No sync command configured, skipping");
            return Ok("no sync command configured".to_string());
        };

        let mut parts = command.split_whitespace();
        let program = parts.next().context("Sync command is empty")?;

        debug!(task_id = %task.task_id, program = %program, model = %task.model_name, "Running sync command");

        let output = Command::new(program)
            .args(parts)
            .arg(&task.model_name)
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("Failed to launch sync command '{}'", program))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("Sync command exited with {}: {}", output.status, stderr.trim());
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(stdout
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .map(|l| l.trim().to_string())
            .unwrap_or_else(|| "sync finished".to_string()))
    }
}

/// Adapts an async closure into a runner
pub struct FnRunner<F> {
    f: F,
}

impl<F, Fut> FnRunner<F>
where
    F: Fn(ScheduledTask) -> Fut + Send + Sync,
    Fut: Future<Output = Result<String>> + Send,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut> TaskRunner for FnRunner<F>
where
    F: Fn(ScheduledTask) -> Fut + Send + Sync,
    Fut: Future<Output = Result<String>> + Send,
{
    async fn run(&self, task: &ScheduledTask) -> Result<String> {
        (self.f)(task.clone()).await
    }
}
