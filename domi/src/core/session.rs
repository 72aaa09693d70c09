//! Typed, versioned workflow session state.
//!
//! Agents communicate with the driver only through this structure: the
//! validation and execution status fields are the control signals the phase
//! machine reacts to. Large artifacts are referenced by path, never embedded.
//!
//! Checkpoints written before the state was typed hold a flat mapping with
//! ad-hoc keys; [`migrate_session_value`] reads both shapes.

use std::collections::BTreeMap;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::phase::Phase;

/// Current schema version written by [`SessionState`].
pub const SESSION_SCHEMA_VERSION: u32 = 2;

/// Prefix older snapshots put on every key.
const LEGACY_KEY_PREFIX: &str = "domi_";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationStatus {
    #[default]
    Pending,
    Approved,
    ApprovedWithFallback,
    Rejected,
    NeedsRevision,
    CriticalError,
}

impl ValidationStatus {
    pub fn is_approved(self) -> bool {
        matches!(
            self,
            ValidationStatus::Approved | ValidationStatus::ApprovedWithFallback
        )
    }

    pub fn is_rejected(self) -> bool {
        matches!(
            self,
            ValidationStatus::Rejected | ValidationStatus::NeedsRevision
        )
    }

    /// Parse a status string, folding the older revision variants
    /// (`needs_revision_after_*`) into [`ValidationStatus::NeedsRevision`].
    pub fn parse(value: &str) -> Option<ValidationStatus> {
        match value.trim() {
            "pending" => Some(ValidationStatus::Pending),
            "approved" => Some(ValidationStatus::Approved),
            "approved_with_fallback" => Some(ValidationStatus::ApprovedWithFallback),
            "rejected" => Some(ValidationStatus::Rejected),
            "critical_error" => Some(ValidationStatus::CriticalError),
            other if other.starts_with("needs_revision") => Some(ValidationStatus::NeedsRevision),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    #[default]
    Pending,
    Running,
    Success,
    CriticalError,
}

impl ExecutionStatus {
    pub fn parse(value: &str) -> Option<ExecutionStatus> {
        match value.trim() {
            "pending" => Some(ExecutionStatus::Pending),
            "running" => Some(ExecutionStatus::Running),
            "success" => Some(ExecutionStatus::Success),
            "critical_error" => Some(ExecutionStatus::CriticalError),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationInfo {
    pub version: u32,
    pub status: ValidationStatus,
    pub revision_reason: Option<String>,
    pub junior_critique_artifact: Option<String>,
    pub senior_critique_artifact: Option<String>,
    pub critical_issues: Vec<String>,
    pub consolidated_issues: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionInfo {
    pub status: ExecutionStatus,
    pub error_type: Option<String>,
    pub error_details: Option<String>,
    pub suggested_fix: Option<String>,
    pub execution_log_artifact: Option<String>,
}

/// Full workflow state captured in every checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionState {
    pub schema_version: u32,
    pub task_id: String,
    /// Task description file the run was started from.
    pub task_file: Option<String>,
    pub current_phase: Phase,
    pub current_task: Option<String>,
    pub plan_artifact: Option<String>,
    pub plan_version: u32,
    pub implementation_manifest_artifact: Option<String>,
    pub results_extraction_script_artifact: Option<String>,
    pub artifact_to_validate: Option<String>,
    pub final_report_artifact: Option<String>,
    pub final_results_artifact: Option<String>,
    pub validation: ValidationInfo,
    pub execution: ExecutionInfo,
    /// Next phase an agent asks for; honoured only if the transition is valid.
    pub requested_next_phase: Option<Phase>,
    /// In-flight micro-checkpointed operation, by id.
    pub active_operation: Option<String>,
    /// Rejections seen per validation phase in the current loop.
    pub phase_iterations: BTreeMap<Phase, u32>,
    pub metadata: Map<String, Value>,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            schema_version: SESSION_SCHEMA_VERSION,
            task_id: String::new(),
            task_file: None,
            current_phase: Phase::ResearchPlanning,
            current_task: None,
            plan_artifact: None,
            plan_version: 0,
            implementation_manifest_artifact: None,
            results_extraction_script_artifact: None,
            artifact_to_validate: None,
            final_report_artifact: None,
            final_results_artifact: None,
            validation: ValidationInfo::default(),
            execution: ExecutionInfo::default(),
            requested_next_phase: None,
            active_operation: None,
            phase_iterations: BTreeMap::new(),
            metadata: Map::new(),
        }
    }
}

impl SessionState {
    pub fn new(task_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            ..Self::default()
        }
    }

    /// Clear the per-phase signals before the next agent runs.
    pub fn reset_signals(&mut self) {
        self.validation.status = ValidationStatus::Pending;
        self.execution.status = ExecutionStatus::Pending;
        self.requested_next_phase = None;
    }

    /// Serialize into the JSON object stored in checkpoint records.
    pub fn to_value(&self) -> Result<Value> {
        serde_json::to_value(self).context("serialize session state")
    }
}

/// Read a checkpointed session state of either shape.
///
/// Objects carrying `schema_version` deserialize directly. Anything else is
/// treated as a flat legacy mapping: known keys (with or without the
/// `domi_` prefix) map onto typed fields, the phase is taken from
/// `current_phase` or inferred from which artifacts exist, and remaining
/// scalar keys are kept in `metadata`.
pub fn migrate_session_value(value: &Value) -> Result<SessionState> {
    let object = value
        .as_object()
        .ok_or_else(|| anyhow!("session state must be a JSON object"))?;
    if object.contains_key("schema_version") {
        let state: SessionState =
            serde_json::from_value(value.clone()).context("parse session state")?;
        if state.schema_version > SESSION_SCHEMA_VERSION {
            return Err(anyhow!(
                "session state schema_version {} is newer than supported {}",
                state.schema_version,
                SESSION_SCHEMA_VERSION
            ));
        }
        return Ok(state);
    }
    Ok(migrate_legacy(object))
}

fn migrate_legacy(object: &Map<String, Value>) -> SessionState {
    let legacy: BTreeMap<&str, &Value> = object
        .iter()
        .map(|(key, value)| {
            (
                key.strip_prefix(LEGACY_KEY_PREFIX).unwrap_or(key.as_str()),
                value,
            )
        })
        .collect();
    let text = |key: &str| {
        legacy
            .get(key)
            .and_then(|value| value.as_str())
            .filter(|value| !value.is_empty())
            .map(str::to_string)
    };
    let number = |key: &str| {
        legacy
            .get(key)
            .and_then(|value| value.as_u64())
            .and_then(|value| u32::try_from(value).ok())
    };
    let strings = |key: &str| -> Vec<String> {
        legacy
            .get(key)
            .and_then(|value| value.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| item.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    };

    let mut state = SessionState::new(text("task_id").unwrap_or_default());
    state.task_file = text("task_file_path");
    state.current_task = text("current_task");
    state.plan_artifact = text("plan_artifact_name");
    state.plan_version = number("plan_version").unwrap_or(0);
    state.implementation_manifest_artifact = text("implementation_manifest_artifact");
    state.results_extraction_script_artifact = text("results_extraction_script_artifact");
    state.artifact_to_validate = text("artifact_to_validate");
    state.final_report_artifact = text("final_report_artifact");
    state.final_results_artifact = text("final_results_artifact");

    state.validation.version = number("validation_version").unwrap_or(0);
    state.validation.status = text("validation_status")
        .and_then(|status| ValidationStatus::parse(&status))
        .unwrap_or_default();
    state.validation.revision_reason = text("revision_reason");
    state.validation.junior_critique_artifact = text("junior_critique_artifact");
    state.validation.senior_critique_artifact = text("senior_critique_artifact");
    state.validation.critical_issues = strings("parallel_validation_critical_issues");
    state.validation.consolidated_issues = strings("consolidated_validation_issues");

    let execution_status = text("execution_status");
    state.execution.status = execution_status
        .as_deref()
        .and_then(ExecutionStatus::parse)
        .unwrap_or_default();
    state.execution.error_type = text("error_type");
    state.execution.error_details = text("error_details");
    state.execution.suggested_fix = text("suggested_fix");
    state.execution.execution_log_artifact = text("execution_log_artifact");

    state.current_phase = text("current_phase")
        .and_then(|name| Phase::parse(&name))
        .unwrap_or_else(|| {
            if state.final_report_artifact.is_some() {
                Phase::FinalReport
            } else if state.results_extraction_script_artifact.is_some() {
                Phase::ResultsExtraction
            } else if execution_status.is_some() {
                Phase::ExperimentExecution
            } else if state.implementation_manifest_artifact.is_some() {
                Phase::OrchestrationPlanning
            } else {
                Phase::ResearchPlanning
            }
        });

    for (key, value) in &legacy {
        if MAPPED_LEGACY_KEYS.contains(key) {
            continue;
        }
        if value.is_string() || value.is_number() || value.is_boolean() || value.is_null() {
            state.metadata.insert((*key).to_string(), (*value).clone());
        }
    }
    state
}

const MAPPED_LEGACY_KEYS: &[&str] = &[
    "task_id",
    "task_file_path",
    "current_phase",
    "current_task",
    "plan_artifact_name",
    "plan_version",
    "implementation_manifest_artifact",
    "results_extraction_script_artifact",
    "artifact_to_validate",
    "final_report_artifact",
    "final_results_artifact",
    "validation_version",
    "validation_status",
    "revision_reason",
    "junior_critique_artifact",
    "senior_critique_artifact",
    "parallel_validation_critical_issues",
    "consolidated_validation_issues",
    "execution_status",
    "error_type",
    "error_details",
    "suggested_fix",
    "execution_log_artifact",
];
