//! Workflow configuration stored under `.domi/config.toml`.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::files::write_atomic;
use crate::core::operation::ResumePolicy;
use crate::core::phase::Phase;

/// Workflow configuration (TOML).
///
/// Edited by humans; missing fields fall back to defaults. A handful of
/// values can be overridden from the environment, see [`DomiConfig::apply_env`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DomiConfig {
    /// Research task to run when none is given on the command line.
    pub task_id: String,

    /// Directory holding `<task_id>.md` task descriptions.
    pub tasks_dir: String,

    /// Per-task output directories live under `<outputs_root>/<task_id>`.
    pub outputs_root: String,

    /// Per-task checkpoints live under `<checkpoints_root>/<task_id>`.
    pub checkpoints_root: String,

    pub checkpoint: CheckpointConfig,
    pub micro: MicroConfig,
    pub workflow: WorkflowConfig,

    /// Command-backed agents keyed by role name (`Chief_Researcher`, ...).
    pub agents: BTreeMap<String, AgentCommandConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CheckpointConfig {
    /// When false, checkpoint creation and loading are no-ops.
    pub enabled: bool,
    /// Checkpoint every Nth agent execution.
    pub interval: u32,
    /// Checkpoints kept by `domi cleanup` when `--keep` is not given.
    pub keep_count: usize,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: 1,
            keep_count: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct MicroConfig {
    /// When false, operation progress is tracked in memory only.
    pub enabled: bool,
    /// Step timeout when a step does not set its own.
    pub default_timeout_secs: u64,
    /// Retry budget for steps built without an explicit one.
    pub max_retries: u32,
    /// Completed operations older than this are removed by cleanup.
    pub cleanup_days: u32,
    pub resume_policy: ResumePolicy,
}

impl Default for MicroConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_timeout_secs: 300,
            max_retries: 3,
            cleanup_days: 7,
            resume_policy: ResumePolicy::SettleFailed,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WorkflowConfig {
    /// Resume recoverable operations without asking.
    pub auto_resume: bool,
    /// Upper bound on phase transitions per run.
    pub max_transitions: u32,
    pub start_phase: Phase,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            auto_resume: false,
            max_transitions: 200,
            start_phase: Phase::ResearchPlanning,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AgentCommandConfig {
    /// Argv of the agent command (e.g. `["./agents/chief.sh"]`).
    pub command: Vec<String>,
    pub timeout_secs: u64,
    /// Truncate captured stdout/stderr beyond this many bytes.
    pub output_limit_bytes: usize,
}

impl Default for AgentCommandConfig {
    fn default() -> Self {
        Self {
            command: Vec::new(),
            timeout_secs: 30 * 60,
            output_limit_bytes: 100_000,
        }
    }
}

impl Default for DomiConfig {
    fn default() -> Self {
        Self {
            task_id: "sample_research_task".to_string(),
            tasks_dir: "tasks".to_string(),
            outputs_root: "outputs".to_string(),
            checkpoints_root: "checkpoints".to_string(),
            checkpoint: CheckpointConfig::default(),
            micro: MicroConfig::default(),
            workflow: WorkflowConfig::default(),
            agents: BTreeMap::new(),
        }
    }
}

impl DomiConfig {
    pub fn validate(&self) -> Result<()> {
        if self.task_id.trim().is_empty() {
            return Err(anyhow!("task_id must be non-empty"));
        }
        if self.task_id.contains(['/', '\\']) {
            return Err(anyhow!("task_id must not contain path separators"));
        }
        for (name, value) in [
            ("tasks_dir", &self.tasks_dir),
            ("outputs_root", &self.outputs_root),
            ("checkpoints_root", &self.checkpoints_root),
        ] {
            if value.trim().is_empty() {
                return Err(anyhow!("{name} must be non-empty"));
            }
        }
        if self.checkpoint.interval == 0 {
            return Err(anyhow!("checkpoint.interval must be > 0"));
        }
        if self.micro.default_timeout_secs == 0 {
            return Err(anyhow!("micro.default_timeout_secs must be > 0"));
        }
        if self.workflow.max_transitions == 0 {
            return Err(anyhow!("workflow.max_transitions must be > 0"));
        }
        for (role, agent) in &self.agents {
            if agent.command.is_empty() || agent.command[0].trim().is_empty() {
                return Err(anyhow!("agents.{role}.command must be a non-empty array"));
            }
            if agent.timeout_secs == 0 {
                return Err(anyhow!("agents.{role}.timeout_secs must be > 0"));
            }
            if agent.output_limit_bytes == 0 {
                return Err(anyhow!("agents.{role}.output_limit_bytes must be > 0"));
            }
        }
        Ok(())
    }

    /// Apply `DOMI_TASK_ID`, `DOMI_ENABLE_CHECKPOINTING`,
    /// `DOMI_CHECKPOINT_INTERVAL` and `DOMI_AUTO_RESUME` from `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(task_id) = lookup("DOMI_TASK_ID") {
            self.task_id = task_id;
        }
        if let Some(raw) = lookup("DOMI_ENABLE_CHECKPOINTING") {
            self.checkpoint.enabled = parse_bool("DOMI_ENABLE_CHECKPOINTING", &raw)?;
        }
        if let Some(raw) = lookup("DOMI_CHECKPOINT_INTERVAL") {
            self.checkpoint.interval = raw
                .trim()
                .parse()
                .with_context(|| format!("parse DOMI_CHECKPOINT_INTERVAL={raw}"))?;
        }
        if let Some(raw) = lookup("DOMI_AUTO_RESUME") {
            self.workflow.auto_resume = parse_bool("DOMI_AUTO_RESUME", &raw)?;
        }
        self.validate()
    }
}

fn parse_bool(name: &str, raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(anyhow!("{name}: expected a boolean, got '{other}'")),
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `DomiConfig::default()`.
pub fn load_config(path: &Path) -> Result<DomiConfig> {
    if !path.exists() {
        debug!(path = %path.display(), "config missing, using defaults");
        let cfg = DomiConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: DomiConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &DomiConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = render_config(cfg)?;
    buf.push('\n');
    write_atomic(path, &buf)
}

/// Render config as TOML, as `domi config` prints it.
pub fn render_config(cfg: &DomiConfig) -> Result<String> {
    toml::to_string_pretty(cfg).context("serialize config toml")
}
