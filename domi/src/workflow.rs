//! Project wiring for `domi run` and the checkpoint commands.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, bail};
use tracing::{debug, instrument};

use crate::core::phase_machine::PhaseMachine;
use crate::core::session::SessionState;
use crate::driver::{AgentRegistry, DriverOutcome, DriverSettings, WorkflowDriver};
use crate::executor::OperationExecutor;
use crate::io::checkpoint_store::CheckpointStore;
use crate::io::command_agent::CommandAgent;
use crate::io::config::{DomiConfig, load_config};
use crate::io::init::{DomiPaths, TaskPaths};
use crate::io::micro_store::MicroCheckpointStore;

/// Effective configuration and task directories of one project root.
#[derive(Debug)]
pub struct Workspace {
    pub paths: DomiPaths,
    pub config: DomiConfig,
    pub task: TaskPaths,
    micro: Arc<MicroCheckpointStore>,
}

impl Workspace {
    /// Load `.domi/config.toml` under `root`, apply `DOMI_*` environment
    /// overrides, then the explicit `task_id` if given.
    pub fn open(root: &Path, task_id: Option<&str>) -> Result<Self> {
        Self::open_with_env(root, task_id, |key| std::env::var(key).ok())
    }

    pub fn open_with_env<F>(root: &Path, task_id: Option<&str>, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let paths = DomiPaths::new(root);
        let mut config = load_config(&paths.config_path)?;
        config.apply_env(lookup)?;
        if let Some(task_id) = task_id {
            config.task_id = task_id.to_string();
            config.validate()?;
        }
        let task = paths.task(&config, &config.task_id);
        let micro = Arc::new(MicroCheckpointStore::for_task(&task, &config.micro));
        debug!(task_id = %task.task_id, root = %root.display(), "workspace opened");
        Ok(Self {
            paths,
            config,
            task,
            micro,
        })
    }

    pub fn checkpoint_store(&self) -> CheckpointStore {
        CheckpointStore::new(&self.task, self.config.checkpoint.enabled)
    }

    pub fn micro_store(&self) -> &Arc<MicroCheckpointStore> {
        &self.micro
    }

    pub fn executor(&self) -> OperationExecutor {
        OperationExecutor::new(
            Arc::clone(&self.micro),
            Duration::from_secs(self.config.micro.default_timeout_secs),
        )
    }

    /// One [`CommandAgent`] per configured role.
    pub fn command_agents(&self) -> AgentRegistry {
        let executor = self.executor();
        let mut agents = AgentRegistry::new();
        for (role, command) in &self.config.agents {
            agents.register(
                role.clone(),
                Arc::new(CommandAgent::new(
                    role.clone(),
                    command.clone(),
                    self.task.clone(),
                    executor.clone(),
                    self.config.micro.max_retries,
                )),
            );
        }
        agents
    }

    pub fn driver(&self, agents: AgentRegistry) -> WorkflowDriver {
        WorkflowDriver::new(
            PhaseMachine::standard(),
            self.checkpoint_store(),
            Arc::clone(&self.micro),
            agents,
            DriverSettings::from_config(&self.config),
        )
    }

    /// Fresh session state at the configured start phase.
    pub fn initial_state(&self) -> SessionState {
        let mut state = SessionState::new(self.task.task_id.clone());
        state.task_file = Some(self.task.task_file.display().to_string());
        state.current_phase = self.config.workflow.start_phase;
        state
    }
}

/// Where `run_task` starts from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartFrom {
    Fresh,
    LatestCheckpoint,
    Checkpoint(String),
}

#[derive(Debug)]
pub enum RunOutcome {
    Finished(Box<DriverOutcome>),
    MissingTask(PathBuf),
    /// The checkpoint could not be loaded (`None`: the latest).
    MissingCheckpoint(Option<String>),
}

/// Run the task of `workspace` with `agents`.
#[instrument(skip_all, fields(task_id = %workspace.task.task_id, start = ?start))]
pub async fn run_task(
    workspace: &Workspace,
    agents: AgentRegistry,
    start: StartFrom,
) -> Result<RunOutcome> {
    if !workspace.task.task_file.is_file() {
        return Ok(RunOutcome::MissingTask(workspace.task.task_file.clone()));
    }
    let phases = PhaseMachine::standard();
    let problems = phases.check_graph();
    if !problems.is_empty() {
        bail!("phase graph is inconsistent:\n- {}", problems.join("\n- "));
    }

    let mut driver = workspace.driver(agents);
    let outcome = match start {
        StartFrom::Fresh => Some(driver.run(workspace.initial_state()).await),
        StartFrom::LatestCheckpoint => driver.resume(None).await,
        StartFrom::Checkpoint(ref id) => driver.resume(Some(id.as_str())).await,
    };
    Ok(match outcome {
        Some(outcome) => RunOutcome::Finished(Box::new(outcome)),
        None => RunOutcome::MissingCheckpoint(match start {
            StartFrom::Checkpoint(id) => Some(id),
            StartFrom::Fresh | StartFrom::LatestCheckpoint => None,
        }),
    })
}
