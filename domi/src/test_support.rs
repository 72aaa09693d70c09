//! Test-only helpers: a throwaway project root and scripted agents.

use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result, anyhow};
use futures::future::BoxFuture;
use tempfile::TempDir;

use crate::core::operation::ResumePolicy;
use crate::core::phase::Phase;
use crate::core::session::{ExecutionStatus, SessionState, ValidationStatus};
use crate::driver::Agent;
use crate::io::checkpoint_store::CheckpointStore;
use crate::io::config::{DomiConfig, load_config};
use crate::io::init::{DomiPaths, InitOptions, TaskPaths, init_project};
use crate::io::micro_store::MicroCheckpointStore;

/// Initialised project in a temp directory, removed on drop.
pub struct TestProject {
    pub temp: TempDir,
    pub paths: DomiPaths,
    pub config: DomiConfig,
    pub task: TaskPaths,
}

impl TestProject {
    pub fn new() -> Result<Self> {
        let temp = tempfile::tempdir().context("create tempdir")?;
        let paths = init_project(temp.path(), &InitOptions { force: false })?;
        let config = load_config(&paths.config_path)?;
        let task = paths.task(&config, &config.task_id);
        Ok(Self {
            temp,
            paths,
            config,
            task,
        })
    }

    pub fn root(&self) -> &Path {
        self.temp.path()
    }

    pub fn checkpoint_store(&self, enabled: bool) -> CheckpointStore {
        CheckpointStore::new(&self.task, enabled)
    }

    pub fn micro_store(&self) -> MicroCheckpointStore {
        MicroCheckpointStore::new(&self.task.micro_dir, true, ResumePolicy::SettleFailed)
    }

    /// Write `contents` to `rel` inside the task's output directory.
    pub fn write_output(&self, rel: &str, contents: &str) -> Result<()> {
        write_output_file(&self.task.outputs_dir, rel, contents)
    }

    pub fn read_output(&self, rel: &str) -> Option<String> {
        fs::read_to_string(self.task.outputs_dir.join(rel)).ok()
    }

    /// Save `config` as the project's config file.
    pub fn save_config(&mut self, config: DomiConfig) -> Result<()> {
        crate::io::config::write_config(&self.paths.config_path, &config)?;
        self.task = self.paths.task(&config, &config.task_id);
        self.config = config;
        Ok(())
    }
}

fn write_output_file(outputs_dir: &Path, rel: &str, contents: &str) -> Result<()> {
    let path = outputs_dir.join(rel);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    fs::write(&path, contents).with_context(|| format!("write {}", path.display()))
}

/// One scripted agent reaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scripted {
    /// Report execution success.
    Succeed,
    /// Report a validation verdict.
    Validate(ValidationStatus),
    /// Return an error from `run`.
    Fail(String),
    /// Report a critical execution error through the state.
    Critical(String),
    /// Succeed and ask for a specific next phase.
    Request(Phase),
}

/// Agent that replays a script; the last entry repeats once the script is
/// exhausted.
pub struct ScriptedAgent {
    script: Mutex<(VecDeque<Scripted>, Scripted)>,
    seen: Mutex<Vec<Phase>>,
    output: Option<(PathBuf, String, String)>,
}

impl ScriptedAgent {
    pub fn new(script: impl IntoIterator<Item = Scripted>) -> Self {
        let queue: VecDeque<Scripted> = script.into_iter().collect();
        let last = queue.back().cloned().unwrap_or(Scripted::Succeed);
        Self {
            script: Mutex::new((queue, last)),
            seen: Mutex::new(Vec::new()),
            output: None,
        }
    }

    pub fn succeeding() -> Self {
        Self::new([Scripted::Succeed])
    }

    pub fn failing(message: &str) -> Self {
        Self::new([Scripted::Fail(message.to_string())])
    }

    pub fn validations(statuses: impl IntoIterator<Item = ValidationStatus>) -> Self {
        Self::new(statuses.into_iter().map(Scripted::Validate))
    }

    /// Also write `rel` under `outputs_dir` on every run, with the phase name
    /// appended to `contents`.
    pub fn writing(mut self, outputs_dir: &Path, rel: &str, contents: &str) -> Self {
        self.output = Some((outputs_dir.to_path_buf(), rel.to_string(), contents.to_string()));
        self
    }

    /// Phases this agent ran in, in order.
    pub fn phases(&self) -> Vec<Phase> {
        self.seen.lock().map(|seen| seen.clone()).unwrap_or_default()
    }

    fn next(&self) -> Scripted {
        match self.script.lock() {
            Ok(mut guard) => {
                let (queue, last) = &mut *guard;
                queue.pop_front().unwrap_or_else(|| last.clone())
            }
            Err(_) => Scripted::Fail("script lock poisoned".to_string()),
        }
    }
}

impl Agent for ScriptedAgent {
    fn run<'a>(&'a self, state: &'a mut SessionState) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            if let Ok(mut seen) = self.seen.lock() {
                seen.push(state.current_phase);
            }
            if let Some((outputs_dir, rel, contents)) = &self.output {
                write_output_file(outputs_dir, rel, &format!("{contents}{}", state.current_phase))?;
            }
            match self.next() {
                Scripted::Succeed => state.execution.status = ExecutionStatus::Success,
                Scripted::Validate(status) => state.validation.status = status,
                Scripted::Fail(message) => return Err(anyhow!(message)),
                Scripted::Critical(details) => {
                    state.execution.status = ExecutionStatus::CriticalError;
                    state.execution.error_details = Some(details);
                }
                Scripted::Request(phase) => {
                    state.execution.status = ExecutionStatus::Success;
                    state.requested_next_phase = Some(phase);
                }
            }
            Ok(())
        })
    }
}
