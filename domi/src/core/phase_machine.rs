//! Pure lookups and validation over the phase graph.
//!
//! The machine never fails: unknown phases resolve to `None`, `false` or the
//! [`Phase::Error`] fallback, and callers route those to the ERROR phase.

use std::collections::{BTreeSet, HashSet};

use serde::{Deserialize, Serialize};

use super::phase::{Phase, PhaseConfig, ValidationCriteria};
use super::phase_table::standard_phase_configs;

/// Why the workflow is leaving a phase on the failure path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// A validator rejected the phase output and the loop budget is spent.
    ValidationFailure,
    /// An agent reported `critical_error`.
    CriticalError,
    /// The agent itself failed to run.
    ExecutionFailure,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::ValidationFailure => "validation_failure",
            ErrorKind::CriticalError => "critical_error",
            ErrorKind::ExecutionFailure => "execution_failure",
        }
    }
}

/// Validation loops grouped by family.
const VALIDATION_LOOPS: &[(&str, &[Phase])] = &[
    (
        "research",
        &[
            Phase::ResearchPlanning,
            Phase::ResearchValidation,
            Phase::ResearchRefinement,
            Phase::ResearchParallelValidation,
        ],
    ),
    (
        "orchestration",
        &[
            Phase::OrchestrationPlanning,
            Phase::OrchestrationValidation,
            Phase::OrchestrationRefinement,
        ],
    ),
    (
        "coding",
        &[Phase::CodingImplementation, Phase::CodingValidation],
    ),
    (
        "experiment",
        &[Phase::ExperimentExecution, Phase::ExperimentValidation],
    ),
    ("results", &[Phase::ResultsExtraction, Phase::ResultsValidation]),
];

/// Static registry of phase configurations.
#[derive(Debug, Clone)]
pub struct PhaseMachine {
    configs: Vec<PhaseConfig>,
}

impl Default for PhaseMachine {
    fn default() -> Self {
        Self::standard()
    }
}

impl PhaseMachine {
    /// The standard research workflow.
    pub fn standard() -> Self {
        Self::from_configs(standard_phase_configs())
    }

    /// Build a machine over an explicit set of configs. The first config is
    /// treated as the initial phase.
    pub fn from_configs(configs: Vec<PhaseConfig>) -> Self {
        Self { configs }
    }

    pub fn configs(&self) -> &[PhaseConfig] {
        &self.configs
    }

    /// Phase the workflow starts in, if the registry is non-empty.
    pub fn initial_phase(&self) -> Option<Phase> {
        self.configs.first().map(|config| config.phase)
    }

    pub fn get_config(&self, phase: Phase) -> Option<&PhaseConfig> {
        self.configs.iter().find(|config| config.phase == phase)
    }

    /// Lookup by name; accepts anything [`Phase::parse`] does.
    pub fn config_by_name(&self, name: &str) -> Option<&PhaseConfig> {
        Phase::parse(name).and_then(|phase| self.get_config(phase))
    }

    /// True iff `to` is a next or rollback phase of `from`.
    pub fn can_transition(&self, from: Phase, to: Phase) -> bool {
        self.get_config(from).is_some_and(|config| {
            config.next_phases.contains(&to) || config.rollback_phases.contains(&to)
        })
    }

    /// Pick where to go when `current` fails.
    ///
    /// A rejected validation returns to the planning phase of its own loop
    /// family when the registry has one; otherwise the first configured
    /// rollback phase wins, and a phase without rollbacks falls to ERROR.
    pub fn resolve_rollback(&self, current: Phase, kind: ErrorKind) -> Phase {
        let Some(config) = self.get_config(current) else {
            return Phase::Error;
        };
        if kind == ErrorKind::ValidationFailure
            && current.is_validation()
            && let Some(planning) = Phase::parse(&format!("{}_planning", current.family()))
            && self.get_config(planning).is_some()
        {
            return planning;
        }
        config
            .rollback_phases
            .first()
            .copied()
            .unwrap_or(Phase::Error)
    }

    /// Restart point after a failure in `failed`: the latest next phase of
    /// RECOVERY at or before it in workflow order, else RECOVERY's first next
    /// phase. `None` when RECOVERY is not configured.
    pub fn recovery_target(&self, failed: Option<Phase>) -> Option<Phase> {
        let targets = self.get_config(Phase::Recovery)?.next_phases;
        failed
            .and_then(|failed| targets.iter().copied().filter(|target| *target <= failed).max())
            .or_else(|| targets.first().copied())
    }

    /// True iff the phase is known and has no next phases.
    pub fn is_terminal(&self, phase: Phase) -> bool {
        self.get_config(phase)
            .is_some_and(|config| config.next_phases.is_empty())
    }

    /// `(max_iterations, parallel_samples)`; `(1, 0)` for unknown phases.
    pub fn iteration_budget(&self, phase: Phase) -> (u32, u32) {
        self.get_config(phase)
            .map_or((1, 0), |config| (config.max_iterations, config.parallel_samples))
    }

    /// Phases where `role` is the primary or a supporting role.
    pub fn phases_for_role(&self, role: &str) -> Vec<Phase> {
        self.configs
            .iter()
            .filter(|config| config.primary_role == role || config.supporting_roles.contains(&role))
            .map(|config| config.phase)
            .collect()
    }

    /// First phase that lists `task` among its valid tasks.
    pub fn phase_for_task(&self, task: &str) -> Option<Phase> {
        self.configs
            .iter()
            .find(|config| config.valid_tasks.contains(&task))
            .map(|config| config.phase)
    }

    /// Phases of the validation loop for `family` (`research`, `coding`, ...).
    pub fn validation_loop(&self, family: &str) -> Vec<Phase> {
        VALIDATION_LOOPS
            .iter()
            .find(|(name, _)| *name == family)
            .map(|(_, phases)| {
                phases
                    .iter()
                    .copied()
                    .filter(|phase| self.get_config(*phase).is_some())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Criteria the phase output must meet; none for unknown phases.
    pub fn required_validations(&self, phase: Phase) -> ValidationCriteria {
        self.get_config(phase)
            .map_or(ValidationCriteria::NONE, |config| config.criteria)
    }

    /// Check structural invariants of the graph:
    /// - no duplicate phases, every referenced phase is configured
    /// - `max_iterations > 0`, no phase lists itself as a rollback
    /// - a revision phase is one of the phase's next phases
    /// - at least one terminal phase exists
    /// - every phase except the initial one and ERROR is reachable from
    ///   another phase's next or rollback lists
    pub fn check_graph(&self) -> Vec<String> {
        let mut errors = Vec::new();
        let mut seen = HashSet::new();
        for config in &self.configs {
            if !seen.insert(config.phase) {
                errors.push(format!("duplicate config for {}", config.phase));
            }
        }

        let mut referenced = BTreeSet::new();
        for config in &self.configs {
            let phase = config.phase;
            if config.max_iterations == 0 {
                errors.push(format!("{phase}: max_iterations must be > 0"));
            }
            if config.rollback_phases.contains(&phase) {
                errors.push(format!("{phase}: rolls back to itself"));
            }
            if let Some(revision) = config.revision_phase
                && !config.next_phases.contains(&revision)
            {
                errors.push(format!(
                    "{phase}: revision phase {revision} is not a next phase"
                ));
            }
            for target in config.next_phases.iter().chain(config.rollback_phases) {
                if self.get_config(*target).is_none() {
                    errors.push(format!("{phase}: references unknown phase {target}"));
                }
                if *target != phase {
                    referenced.insert(*target);
                }
            }
        }

        if !self.configs.iter().any(|config| config.next_phases.is_empty()) {
            errors.push("no terminal phase".to_string());
        }

        let initial = self.initial_phase();
        for config in &self.configs {
            let phase = config.phase;
            if Some(phase) == initial || phase == Phase::Error {
                continue;
            }
            if !referenced.contains(&phase) {
                errors.push(format!("{phase}: unreachable"));
            }
        }
        errors
    }
}
