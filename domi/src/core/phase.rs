//! Workflow phases and the static configuration attached to each of them.

use std::fmt;
use std::str::FromStr;

use anyhow::anyhow;
use serde::{Deserialize, Serialize};

/// One named stage of the research workflow.
///
/// Serialized as lower snake case (`research_planning`), which is also the
/// prefix used in checkpoint ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    ResearchPlanning,
    ResearchValidation,
    ResearchRefinement,
    ResearchParallelValidation,
    OrchestrationPlanning,
    OrchestrationValidation,
    OrchestrationRefinement,
    CodingAssignment,
    CodingImplementation,
    CodingValidation,
    CodingIntegration,
    ExperimentSetup,
    ExperimentExecution,
    ExperimentValidation,
    ExperimentJournal,
    ResultsPlanning,
    ResultsExtraction,
    ResultsValidation,
    FinalAnalysis,
    FinalReport,
    Error,
    Recovery,
}

impl Phase {
    /// Every phase in workflow order.
    pub const ALL: [Phase; 22] = [
        Phase::ResearchPlanning,
        Phase::ResearchValidation,
        Phase::ResearchRefinement,
        Phase::ResearchParallelValidation,
        Phase::OrchestrationPlanning,
        Phase::OrchestrationValidation,
        Phase::OrchestrationRefinement,
        Phase::CodingAssignment,
        Phase::CodingImplementation,
        Phase::CodingValidation,
        Phase::CodingIntegration,
        Phase::ExperimentSetup,
        Phase::ExperimentExecution,
        Phase::ExperimentValidation,
        Phase::ExperimentJournal,
        Phase::ResultsPlanning,
        Phase::ResultsExtraction,
        Phase::ResultsValidation,
        Phase::FinalAnalysis,
        Phase::FinalReport,
        Phase::Error,
        Phase::Recovery,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::ResearchPlanning => "research_planning",
            Phase::ResearchValidation => "research_validation",
            Phase::ResearchRefinement => "research_refinement",
            Phase::ResearchParallelValidation => "research_parallel_validation",
            Phase::OrchestrationPlanning => "orchestration_planning",
            Phase::OrchestrationValidation => "orchestration_validation",
            Phase::OrchestrationRefinement => "orchestration_refinement",
            Phase::CodingAssignment => "coding_assignment",
            Phase::CodingImplementation => "coding_implementation",
            Phase::CodingValidation => "coding_validation",
            Phase::CodingIntegration => "coding_integration",
            Phase::ExperimentSetup => "experiment_setup",
            Phase::ExperimentExecution => "experiment_execution",
            Phase::ExperimentValidation => "experiment_validation",
            Phase::ExperimentJournal => "experiment_journal",
            Phase::ResultsPlanning => "results_planning",
            Phase::ResultsExtraction => "results_extraction",
            Phase::ResultsValidation => "results_validation",
            Phase::FinalAnalysis => "final_analysis",
            Phase::FinalReport => "final_report",
            Phase::Error => "error",
            Phase::Recovery => "recovery",
        }
    }

    /// Parse a phase name.
    ///
    /// Accepts the canonical snake case form, the upper case form
    /// (`RESEARCH_PLANNING`) and the coarse names older snapshots used
    /// (`planning`, `implementation`, `execution`, ...). Returns `None` for
    /// anything else.
    pub fn parse(name: &str) -> Option<Phase> {
        let normalized = name.trim().to_ascii_lowercase();
        if let Some(phase) = Phase::ALL
            .iter()
            .copied()
            .find(|phase| phase.as_str() == normalized)
        {
            return Some(phase);
        }
        match normalized.as_str() {
            "planning" => Some(Phase::ResearchPlanning),
            "implementation" | "implementation_planning" => Some(Phase::OrchestrationPlanning),
            "implementation_coding" => Some(Phase::CodingImplementation),
            "execution" => Some(Phase::ExperimentExecution),
            _ => None,
        }
    }

    /// Loop family: the name segment before the first underscore
    /// (`research`, `orchestration`, `coding`, `experiment`, `results`, `final`).
    pub fn family(self) -> &'static str {
        let name = self.as_str();
        name.split_once('_').map_or(name, |(family, _)| family)
    }

    /// True for the validator-driven stages (`*_validation`).
    pub fn is_validation(self) -> bool {
        self.as_str().ends_with("_validation")
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Phase {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Phase::parse(s).ok_or_else(|| anyhow!("unknown phase '{s}'"))
    }
}

/// Quality bars a phase's output is judged against.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ValidationCriteria {
    pub statistical_rigor: bool,
    pub data_hygiene: bool,
    pub novel_insights: bool,
    pub parallelization_efficiency: bool,
    pub surgical_alignment: bool,
    pub success_criteria_clarity: bool,
    pub code_correctness: bool,
    pub execution_completeness: bool,
    pub result_significance: bool,
}

impl ValidationCriteria {
    pub const NONE: ValidationCriteria = ValidationCriteria {
        statistical_rigor: false,
        data_hygiene: false,
        novel_insights: false,
        parallelization_efficiency: false,
        surgical_alignment: false,
        success_criteria_clarity: false,
        code_correctness: false,
        execution_completeness: false,
        result_significance: false,
    };

    /// Names of the enabled criteria, in declaration order.
    pub fn enabled(&self) -> Vec<&'static str> {
        [
            ("statistical_rigor", self.statistical_rigor),
            ("data_hygiene", self.data_hygiene),
            ("novel_insights", self.novel_insights),
            ("parallelization_efficiency", self.parallelization_efficiency),
            ("surgical_alignment", self.surgical_alignment),
            ("success_criteria_clarity", self.success_criteria_clarity),
            ("code_correctness", self.code_correctness),
            ("execution_completeness", self.execution_completeness),
            ("result_significance", self.result_significance),
        ]
        .into_iter()
        .filter_map(|(name, on)| on.then_some(name))
        .collect()
    }
}

/// Static description of one phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PhaseConfig {
    pub phase: Phase,
    /// Role name of the agent that runs this phase.
    pub primary_role: &'static str,
    pub supporting_roles: &'static [&'static str],
    pub valid_tasks: &'static [&'static str],
    /// Artifact path patterns; documentation only.
    pub input_artifacts: &'static [&'static str],
    pub output_artifacts: &'static [&'static str],
    /// Forward transitions in preference order.
    pub next_phases: &'static [Phase],
    /// Transitions taken on failure, in preference order.
    pub rollback_phases: &'static [Phase],
    /// Where a validation loop goes when the validator rejects.
    pub revision_phase: Option<Phase>,
    pub criteria: ValidationCriteria,
    pub max_iterations: u32,
    /// Fan-out width; 0 means no parallel samples.
    pub parallel_samples: u32,
    pub description: &'static str,
}
