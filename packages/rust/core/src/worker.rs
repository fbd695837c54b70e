//! Concrete worker launchers and processing triggers.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use changewatch_shared::{ChangeWatchError, ProcessingConfig, Result, WorkerConfig};

use crate::trigger::{ExtractionJob, ProcessingTrigger, WorkerFuture, WorkerLauncher};

/// Environment variable carrying the JSON-encoded [`ExtractionJob`].
pub const JOB_ENV: &str = "CHANGEWATCH_JOB";

/// Timeout for a processing webhook call.
const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(30);

/// Program, leading args, and working directory of an external command.
#[derive(Debug, Clone)]
struct CommandLine {
    program: String,
    args: Vec<String>,
    working_dir: Option<String>,
}

impl CommandLine {
    fn from_argv(argv: &[String], working_dir: Option<String>) -> Result<Self> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| ChangeWatchError::config("command must not be empty"))?;
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
            working_dir,
        })
    }

    /// `<program> <args..> --source-id <id> --run-id <uuid> [--url <u>]..`
    /// with the job as JSON in [`JOB_ENV`]. The child dies with its handle.
    fn build(&self, job: &ExtractionJob) -> Result<Command> {
        let payload = serde_json::to_string(job)
            .map_err(|e| ChangeWatchError::TriggerLaunch(format!("failed to encode job: {e}")))?;

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .arg("--source-id")
            .arg(&job.source_id)
            .arg("--run-id")
            .arg(job.run_id.to_string());
        for item in &job.items {
            cmd.arg("--url").arg(&item.url);
        }
        cmd.env(JOB_ENV, payload)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }
        Ok(cmd)
    }
}

/// Runs the configured extraction worker as a child process.
#[derive(Debug, Clone)]
pub struct CommandLauncher {
    cmdline: CommandLine,
}

impl CommandLauncher {
    pub fn new(config: &WorkerConfig) -> Result<Self> {
        Ok(Self {
            cmdline: CommandLine::from_argv(&config.command, config.working_dir.clone())?,
        })
    }
}

impl WorkerLauncher for CommandLauncher {
    fn launch(&self, job: &ExtractionJob) -> Result<WorkerFuture> {
        let mut child = self.cmdline.build(job)?.spawn().map_err(|e| {
            ChangeWatchError::TriggerLaunch(format!(
                "failed to spawn worker `{}`: {e}",
                self.cmdline.program
            ))
        })?;
        debug!(pid = child.id(), program = %self.cmdline.program, "worker spawned");

        let program = self.cmdline.program.clone();
        Ok(Box::pin(async move {
            let status = child.wait().await.map_err(|e| {
                ChangeWatchError::WorkerRuntime(format!("failed to wait for `{program}`: {e}"))
            })?;
            if status.success() {
                Ok(())
            } else {
                Err(ChangeWatchError::WorkerRuntime(format!(
                    "`{program}` exited with {status}"
                )))
            }
        }))
    }
}

/// Runs the configured processing command after a successful worker.
#[derive(Debug, Clone)]
pub struct CommandProcessingTrigger {
    cmdline: CommandLine,
}

impl CommandProcessingTrigger {
    pub fn new(command: &[String]) -> Result<Self> {
        Ok(Self {
            cmdline: CommandLine::from_argv(command, None)?,
        })
    }
}

#[async_trait]
impl ProcessingTrigger for CommandProcessingTrigger {
    async fn fire(&self, job: &ExtractionJob) -> Result<()> {
        let status = self
            .cmdline
            .build(job)?
            .status()
            .await
            .map_err(|e| {
                ChangeWatchError::TriggerLaunch(format!(
                    "failed to spawn processing command `{}`: {e}",
                    self.cmdline.program
                ))
            })?;
        if !status.success() {
            return Err(ChangeWatchError::WorkerRuntime(format!(
                "processing command `{}` exited with {status}",
                self.cmdline.program
            )));
        }
        info!(source_id = %job.source_id, run_id = %job.run_id, "processing command finished");
        Ok(())
    }
}

/// POSTs the job as JSON to a webhook after a successful worker.
#[derive(Debug, Clone)]
pub struct WebhookProcessingTrigger {
    client: reqwest::Client,
    url: url::Url,
}

impl WebhookProcessingTrigger {
    pub fn new(url: url::Url) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(WEBHOOK_TIMEOUT)
            .build()
            .map_err(|e| ChangeWatchError::config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client, url })
    }
}

#[async_trait]
impl ProcessingTrigger for WebhookProcessingTrigger {
    async fn fire(&self, job: &ExtractionJob) -> Result<()> {
        let response = self
            .client
            .post(self.url.clone())
            .json(job)
            .send()
            .await
            .map_err(|e| ChangeWatchError::WorkerRuntime(format!("webhook {}: {e}", self.url)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ChangeWatchError::WorkerRuntime(format!(
                "webhook {} returned HTTP {status}",
                self.url
            )));
        }
        info!(source_id = %job.source_id, run_id = %job.run_id, %status, "processing webhook delivered");
        Ok(())
    }
}

/// Build the processing trigger named by the config, if any.
pub fn processing_trigger(config: &ProcessingConfig) -> Result<Option<Arc<dyn ProcessingTrigger>>> {
    if let Some(raw) = &config.webhook_url {
        let url = url::Url::parse(raw)
            .map_err(|e| ChangeWatchError::config(format!("invalid processing.webhook_url: {e}")))?;
        return Ok(Some(Arc::new(WebhookProcessingTrigger::new(url)?)));
    }
    if !config.command.is_empty() {
        return Ok(Some(Arc::new(CommandProcessingTrigger::new(&config.command)?)));
    }
    Ok(None)
}
