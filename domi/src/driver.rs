//! Root workflow loop: run the agent of the current phase, decide the
//! transition, checkpoint, repeat.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use futures::future::BoxFuture;
use serde_json::{Map, Value, json};
use tracing::{info, instrument, warn};

use crate::core::phase::Phase;
use crate::core::phase_machine::PhaseMachine;
use crate::core::session::{ExecutionStatus, SessionState};
use crate::core::transition::{Transition, decide};
use crate::io::checkpoint_store::CheckpointStore;
use crate::io::config::DomiConfig;
use crate::io::micro_store::MicroCheckpointStore;

/// One role in the workflow.
///
/// Agents report through the state: `validation.status` for validators,
/// `execution.status` for executors, optionally `requested_next_phase`.
/// Returning `Err` is treated as a critical execution error.
pub trait Agent: Send + Sync {
    fn run<'a>(&'a self, state: &'a mut SessionState) -> BoxFuture<'a, Result<()>>;
}

/// Agents keyed by role name.
#[derive(Default, Clone)]
pub struct AgentRegistry {
    agents: HashMap<String, Arc<dyn Agent>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, role: impl Into<String>, agent: Arc<dyn Agent>) {
        self.agents.insert(role.into(), agent);
    }

    pub fn get(&self, role: &str) -> Option<Arc<dyn Agent>> {
        self.agents.get(role).cloned()
    }

    pub fn roles(&self) -> Vec<&str> {
        let mut roles: Vec<&str> = self.agents.keys().map(String::as_str).collect();
        roles.sort_unstable();
        roles
    }
}

impl fmt::Debug for AgentRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentRegistry")
            .field("roles", &self.roles())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriverSettings {
    /// Checkpoint after every Nth agent execution.
    pub checkpoint_interval: u32,
    pub max_transitions: u32,
    pub auto_resume: bool,
}

impl DriverSettings {
    pub fn from_config(cfg: &DomiConfig) -> Self {
        Self {
            checkpoint_interval: cfg.checkpoint.interval.max(1),
            max_transitions: cfg.workflow.max_transitions,
            auto_resume: cfg.workflow.auto_resume,
        }
    }
}

impl Default for DriverSettings {
    fn default() -> Self {
        Self::from_config(&DomiConfig::default())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// A terminal phase finished.
    Complete,
    Halted { phase: Phase, reason: String },
    BudgetExhausted,
}

#[derive(Debug, Clone)]
pub struct DriverOutcome {
    pub stop: StopReason,
    pub final_phase: Phase,
    pub transitions: u32,
    pub last_checkpoint: Option<String>,
    pub state: SessionState,
}

impl DriverOutcome {
    pub fn is_complete(&self) -> bool {
        self.stop == StopReason::Complete
    }
}

#[derive(Debug)]
pub struct WorkflowDriver {
    machine: PhaseMachine,
    checkpoints: CheckpointStore,
    micro: Arc<MicroCheckpointStore>,
    agents: AgentRegistry,
    settings: DriverSettings,
}

impl WorkflowDriver {
    pub fn new(
        machine: PhaseMachine,
        checkpoints: CheckpointStore,
        micro: Arc<MicroCheckpointStore>,
        agents: AgentRegistry,
        settings: DriverSettings,
    ) -> Self {
        Self {
            machine,
            checkpoints,
            micro,
            agents,
            settings,
        }
    }

    pub fn checkpoints(&self) -> &CheckpointStore {
        &self.checkpoints
    }

    /// Restore a checkpoint (the latest when `checkpoint_id` is `None`) and
    /// return its session state, ready for [`WorkflowDriver::run`].
    ///
    /// A checkpoint taken after a rollback into ERROR resumes at the restart
    /// point RECOVERY chooses for the failed phase.
    ///
    /// Outputs are restored from the snapshot, so this must run before any
    /// agent work starts. Recoverable micro operations are reported; with
    /// `auto_resume` the newest one becomes the state's active operation.
    #[instrument(skip_all, fields(task_id = %self.checkpoints.task_id(), checkpoint_id = ?checkpoint_id))]
    pub fn restore(&mut self, checkpoint_id: Option<&str>) -> Option<SessionState> {
        let record = self.checkpoints.load_checkpoint(checkpoint_id)?;
        let mut state = match record.session() {
            Ok(state) => state,
            Err(err) => {
                warn!(checkpoint_id = %record.checkpoint_id, err = %format!("{err:#}"), "checkpoint session state is unusable");
                return None;
            }
        };
        info!(
            checkpoint_id = %record.checkpoint_id,
            phase = %state.current_phase,
            "resuming from checkpoint"
        );
        if state.current_phase == Phase::Error {
            self.route_through_recovery(&mut state, Phase::parse(&record.phase));
        }

        let recoverable = self.micro.list_recoverable_operations();
        for operation in &recoverable {
            info!(
                operation_id = %operation.operation_id,
                agent = %operation.agent_name,
                progress = %operation.progress,
                failed = operation.failed_steps_count,
                "recoverable operation"
            );
        }
        if let Some(newest) = recoverable.first() {
            if self.settings.auto_resume {
                state.active_operation = Some(newest.operation_id.clone());
            } else {
                info!(
                    count = recoverable.len(),
                    "recoverable operations left untouched (auto_resume is off)"
                );
            }
        }
        Some(state)
    }

    /// [`restore`](Self::restore) then [`run`](Self::run). `None` when the
    /// checkpoint could not be loaded.
    pub async fn resume(&mut self, checkpoint_id: Option<&str>) -> Option<DriverOutcome> {
        let state = self.restore(checkpoint_id)?;
        Some(self.run(state).await)
    }

    /// Drive the workflow from `state.current_phase` until a terminal phase
    /// completes, the run halts, or the transition budget is spent.
    #[instrument(skip_all, fields(task_id = %state.task_id, start = %state.current_phase))]
    pub async fn run(&mut self, mut state: SessionState) -> DriverOutcome {
        let mut phase = state.current_phase;
        let mut transitions = 0u32;
        let mut last_checkpoint = None;

        let stop = loop {
            if transitions >= self.settings.max_transitions {
                warn!(transitions, next = %phase, "transition budget exhausted");
                state.current_phase = phase;
                last_checkpoint = self.checkpoint(phase, "budget", &state).or(last_checkpoint);
                break StopReason::BudgetExhausted;
            }
            if phase == Phase::Error {
                break StopReason::Halted {
                    phase,
                    reason: "workflow entered the error phase".to_string(),
                };
            }
            let Some(role) = self.machine.get_config(phase).map(|config| config.primary_role)
            else {
                break self.halt(&mut state, phase, format!("no configuration for phase {phase}"));
            };
            let Some(agent) = self.agents.get(role) else {
                break StopReason::Halted {
                    phase,
                    reason: format!("no agent registered for role {role}"),
                };
            };

            state.current_phase = phase;
            state.reset_signals();
            state.execution.status = ExecutionStatus::Running;
            info!(phase = %phase, role, "running agent");
            if let Err(err) = agent.run(&mut state).await {
                warn!(phase = %phase, role, err = %format!("{err:#}"), "agent failed");
                state.execution.status = ExecutionStatus::CriticalError;
                state.execution.error_type = Some("agent_error".to_string());
                state.execution.error_details = Some(format!("{err:#}"));
            } else if state.execution.status == ExecutionStatus::Running {
                state.execution.status = ExecutionStatus::Success;
            }
            let executions = self.checkpoints.note_agent_execution();

            let transition = decide(&self.machine, phase, &mut state);
            transitions += 1;
            match &transition {
                Transition::Rollback { to, kind } => {
                    warn!(from = %phase, to = %to, kind = kind.as_str(), "rolling back");
                }
                Transition::InvalidRequest { requested } => {
                    warn!(from = %phase, requested = %requested, "agent requested an invalid transition");
                }
                Transition::Advance(next) | Transition::Revise(next) => {
                    info!(from = %phase, to = %next, kind = transition.label(), "transition");
                }
                Transition::Complete | Transition::Halt { .. } => {}
            }

            match transition.target() {
                Some(next) if next != Phase::Error => {
                    state.current_phase = next;
                    if executions % u64::from(self.settings.checkpoint_interval) == 0 {
                        last_checkpoint = self
                            .checkpoint(phase, transition.label(), &state)
                            .or(last_checkpoint);
                    }
                    phase = next;
                }
                Some(_) => {
                    state.current_phase = Phase::Error;
                    last_checkpoint = self
                        .checkpoint(phase, transition.label(), &state)
                        .or(last_checkpoint);
                    break StopReason::Halted {
                        phase,
                        reason: format!("{} from {phase}", transition.label()),
                    };
                }
                None => {
                    last_checkpoint = self
                        .checkpoint(phase, transition.label(), &state)
                        .or(last_checkpoint);
                    break match transition {
                        Transition::Halt { reason } => StopReason::Halted { phase, reason },
                        _ => StopReason::Complete,
                    };
                }
            }
        };

        info!(stop = ?stop, phase = %state.current_phase, transitions, "workflow stopped");
        DriverOutcome {
            final_phase: state.current_phase,
            stop,
            transitions,
            last_checkpoint,
            state,
        }
    }

    /// Move a state that stopped in ERROR to the restart point RECOVERY
    /// picks for the phase that failed. The error it carried is kept under
    /// `metadata.recovered_from`.
    fn route_through_recovery(&self, state: &mut SessionState, failed: Option<Phase>) {
        let Some(restart) = self.machine.recovery_target(failed) else {
            warn!("checkpoint stopped in the error phase and no recovery phase is configured");
            return;
        };
        info!(failed = ?failed, restart = %restart, "recovering through the recovery phase");
        state.metadata.insert(
            "recovered_from".to_string(),
            json!({
                "phase": failed.map(Phase::as_str),
                "error_type": state.execution.error_type.take(),
                "error_details": state.execution.error_details.take(),
            }),
        );
        state.reset_signals();
        state.current_phase = restart;
    }

    fn halt(&mut self, state: &mut SessionState, phase: Phase, reason: String) -> StopReason {
        warn!(phase = %phase, reason = %reason, "halting");
        state.current_phase = Phase::Error;
        self.checkpoint(phase, "halt", state);
        StopReason::Halted { phase, reason }
    }

    fn checkpoint(&mut self, phase: Phase, step: &str, state: &SessionState) -> Option<String> {
        let mut metadata = Map::new();
        metadata.insert("next_phase".to_string(), Value::from(state.current_phase.as_str()));
        metadata.insert(
            "execution_status".to_string(),
            serde_json::to_value(state.execution.status).unwrap_or(Value::Null),
        );
        metadata.insert(
            "validation_status".to_string(),
            serde_json::to_value(state.validation.status).unwrap_or(Value::Null),
        );
        self.checkpoints
            .create_checkpoint(phase.as_str(), step, state, Some(metadata))
    }
}
