//! Agents backed by external commands, one command per role.
//!
//! Protocol, per invocation:
//!
//! - stdin: the session state as JSON
//! - env: `DOMI_ROLE`, `DOMI_PHASE`, `DOMI_TASK_ID`, `DOMI_TASK_FILE`,
//!   `DOMI_OUTPUTS_DIR`, `DOMI_STATUS_PATH`, `DOMI_ATTEMPT`
//! - the command may write `{"validation_status", "execution_status",
//!   "next_phase", "error_details"}` (all optional) to `DOMI_STATUS_PATH`
//! - stdout is appended to `<outputs>/logs/<phase>.log`; workflow error
//!   markers in stdout or stderr turn into a critical execution error
//!
//! A non-zero exit or a timeout fails the attempt; attempts are retried as
//! one micro-checkpointed step.

use std::fs;
use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use chrono::Utc;
use futures::future::BoxFuture;
use serde::Deserialize;
use tracing::{debug, info, instrument, warn};

use super::config::AgentCommandConfig;
use super::files::file_timestamp;
use super::init::TaskPaths;
use super::process::run_command_with_timeout;
use crate::core::markers::{detect_workflow_errors, first_blocking_error};
use crate::core::operation::{Step, StepTimeoutError};
use crate::core::phase::Phase;
use crate::core::session::{ExecutionStatus, SessionState, ValidationStatus};
use crate::driver::Agent;
use crate::executor::{OperationBuilder, OperationExecutor, OperationReport, StepContext, StepResult};

const INVOKE_STEP: &str = "invoke";
/// Grace on top of the command timeout before the step itself times out.
const STEP_TIMEOUT_GRACE_SECS: u64 = 30;

/// Status file written by an agent command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct AgentStatus {
    pub validation_status: Option<String>,
    pub execution_status: Option<String>,
    pub next_phase: Option<String>,
    pub error_details: Option<String>,
}

/// What one successful invocation reported.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InvocationResult {
    pub status: AgentStatus,
    /// First blocking marker found in the output.
    pub blocking_error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CommandAgent {
    role: String,
    command: AgentCommandConfig,
    paths: TaskPaths,
    executor: OperationExecutor,
    max_retries: u32,
}

impl CommandAgent {
    pub fn new(
        role: impl Into<String>,
        command: AgentCommandConfig,
        paths: TaskPaths,
        executor: OperationExecutor,
        max_retries: u32,
    ) -> Self {
        Self {
            role: role.into(),
            command,
            paths,
            executor,
            max_retries,
        }
    }

    fn status_dir(&self) -> PathBuf {
        self.paths.checkpoints_dir.join("agent_status")
    }

    #[instrument(skip_all, fields(role = %self.role, phase = %state.current_phase))]
    async fn invoke(&self, state: &mut SessionState) -> Result<()> {
        let phase = state.current_phase;
        let input = serde_json::to_vec(&*state).context("serialize session state")?;
        let body = |ctx: StepContext| self.attempt(phase, input.clone(), ctx);

        let resumed = match state.active_operation.take() {
            Some(operation_id) => {
                let owned = self
                    .executor
                    .store()
                    .restore_operation(&operation_id)
                    .is_some_and(|record| record.operation.agent_name == self.role);
                if owned {
                    info!(operation_id = %operation_id, "resuming interrupted invocation");
                    self.executor.resume(&operation_id, &body).await
                } else {
                    state.active_operation = Some(operation_id);
                    None
                }
            }
            None => None,
        };
        let report = match resumed {
            Some(report) => report,
            None => {
                let operation_id = format!(
                    "{}_{}_{}",
                    self.role,
                    phase.as_str(),
                    file_timestamp(Utc::now())
                );
                let plan = OperationBuilder::new(operation_id, self.role.clone())
                    .add_step(
                        Step::new(INVOKE_STEP, "agent_invocation", format!("{} in {phase}", self.role))
                            .with_timeout(self.command.timeout_secs + STEP_TIMEOUT_GRACE_SECS)
                            .with_max_retries(self.max_retries),
                    )
                    .set_state("phase", phase.as_str())
                    .set_state("role", self.role.clone())
                    .build();
                self.executor.execute(plan, &body).await?
            }
        };
        apply_report(state, &self.role, &report)
    }

    async fn attempt(
        &self,
        phase: Phase,
        input: Vec<u8>,
        ctx: StepContext,
    ) -> Result<InvocationResult> {
        let status_path = self
            .status_dir()
            .join(format!("{}_{}.json", ctx.operation_id, ctx.attempt));
        let cmd = self.build_command(phase, &status_path, ctx.attempt)?;
        let log_path = self.paths.outputs_dir.join("logs").join(format!("{phase}.log"));
        let timeout = Duration::from_secs(self.command.timeout_secs);
        let limit = self.command.output_limit_bytes;
        let step_id = ctx.step.step_id.clone();

        let output = tokio::task::spawn_blocking(move || {
            run_command_with_timeout(cmd, Some(&input), timeout, limit, Some(&log_path))
        })
        .await
        .context("join agent command")??;

        if output.timed_out {
            return Err(anyhow::Error::new(StepTimeoutError { step_id, timeout }))
                .with_context(|| format!("agent {}", self.role));
        }
        let stdout = output.stdout_lossy();
        let stderr = output.stderr_lossy();
        for (level, message) in detect_workflow_errors(&stderr) {
            debug!(?level, message = %message, "agent stderr marker");
        }
        if !output.status.success() {
            bail!(
                "agent {} failed ({}): {}",
                self.role,
                output.describe_status(),
                stderr.trim()
            );
        }

        let status = read_status(&status_path)?;
        let blocking_error = first_blocking_error(&stdout)
            .or_else(|| first_blocking_error(&stderr))
            .map(|(level, message)| {
                warn!(?level, message = %message, "agent reported a workflow error");
                message
            });
        Ok(InvocationResult {
            status,
            blocking_error,
        })
    }

    fn build_command(&self, phase: Phase, status_path: &std::path::Path, attempt: u32) -> Result<Command> {
        let (program, args) = self
            .command
            .command
            .split_first()
            .ok_or_else(|| anyhow!("agent {} has an empty command", self.role))?;
        if let Some(parent) = status_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create directory {}", parent.display()))?;
        }
        fs::create_dir_all(&self.paths.outputs_dir)
            .with_context(|| format!("create directory {}", self.paths.outputs_dir.display()))?;
        let mut cmd = Command::new(program);
        cmd.args(args)
            .env("DOMI_ROLE", &self.role)
            .env("DOMI_PHASE", phase.as_str())
            .env("DOMI_TASK_ID", &self.paths.task_id)
            .env("DOMI_TASK_FILE", &self.paths.task_file)
            .env("DOMI_OUTPUTS_DIR", &self.paths.outputs_dir)
            .env("DOMI_STATUS_PATH", status_path)
            .env("DOMI_ATTEMPT", attempt.to_string());
        Ok(cmd)
    }
}

impl Agent for CommandAgent {
    fn run<'a>(&'a self, state: &'a mut SessionState) -> BoxFuture<'a, Result<()>> {
        Box::pin(self.invoke(state))
    }
}

fn read_status(path: &std::path::Path) -> Result<AgentStatus> {
    match fs::read_to_string(path) {
        Ok(contents) => {
            let status = serde_json::from_str(&contents)
                .with_context(|| format!("parse agent status {}", path.display()))?;
            if let Err(err) = fs::remove_file(path) {
                debug!(err = %err, "failed to remove agent status file");
            }
            Ok(status)
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(AgentStatus::default()),
        Err(err) => Err(err).with_context(|| format!("read agent status {}", path.display())),
    }
}

/// Fold an invocation report into the session signals.
fn apply_report(
    state: &mut SessionState,
    role: &str,
    report: &OperationReport<InvocationResult>,
) -> Result<()> {
    let result = match report.result(INVOKE_STEP) {
        Some(StepResult::Completed(result)) => result,
        Some(StepResult::Failed(info)) => {
            bail!("agent {role} failed after {} attempts: {}", info.retry_count + 1, info.error_message);
        }
        Some(StepResult::Skipped) => {
            debug!(operation_id = %report.operation_id, "invocation already settled");
            return Ok(());
        }
        None => bail!("operation {} has no {INVOKE_STEP} step", report.operation_id),
    };
    apply_status(state, result)
}

fn apply_status(state: &mut SessionState, result: &InvocationResult) -> Result<()> {
    let status = &result.status;
    if let Some(raw) = status.validation_status.as_deref() {
        state.validation.status = ValidationStatus::parse(raw)
            .ok_or_else(|| anyhow!("unknown validation_status '{raw}'"))?;
    }
    if let Some(raw) = status.execution_status.as_deref() {
        state.execution.status = ExecutionStatus::parse(raw)
            .ok_or_else(|| anyhow!("unknown execution_status '{raw}'"))?;
    }
    if let Some(raw) = status.next_phase.as_deref() {
        state.requested_next_phase =
            Some(Phase::parse(raw).ok_or_else(|| anyhow!("unknown next_phase '{raw}'"))?);
    }
    if let Some(details) = &status.error_details {
        state.execution.error_details = Some(details.clone());
    }
    if let Some(message) = &result.blocking_error {
        state.execution.status = ExecutionStatus::CriticalError;
        state.execution.error_type = Some("workflow_error".to_string());
        state.execution.error_details = Some(message.clone());
    }
    Ok(())
}
