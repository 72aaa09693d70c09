//! Operations, steps and step-level progress.
//!
//! Pure data: persistence lives in [`crate::io::micro_store`], execution in
//! [`crate::executor`].

use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Structured record of why a step attempt failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// Failure classification (`timeout`, `io`, `json`, `error`).
    pub error_type: String,
    pub error_message: String,
    pub timestamp: DateTime<Utc>,
    /// Retry count of the attempt that failed.
    pub retry_count: u32,
}

impl ErrorInfo {
    /// Capture `err` as raised by attempt `retry_count` of a step.
    pub fn from_error(err: &anyhow::Error, retry_count: u32) -> Self {
        Self {
            error_type: classify_error(err).to_string(),
            error_message: format!("{err:#}"),
            timestamp: Utc::now(),
            retry_count,
        }
    }
}

/// Failure class of the first recognised cause in the error chain.
pub fn classify_error(err: &anyhow::Error) -> &'static str {
    for cause in err.chain() {
        if cause.is::<StepTimeoutError>() {
            return "timeout";
        }
        if cause.is::<std::io::Error>() {
            return "io";
        }
        if cause.is::<serde_json::Error>() {
            return "json";
        }
    }
    "error"
}

/// A step attempt ran past its deadline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepTimeoutError {
    pub step_id: String,
    pub timeout: Duration,
}

impl fmt::Display for StepTimeoutError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "step {} timed out after {}s",
            self.step_id,
            self.timeout.as_secs_f64()
        )
    }
}

impl std::error::Error for StepTimeoutError {}

/// One unit of an operation, individually retried and checkpointed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub step_id: String,
    pub operation_type: String,
    pub step_name: String,
    #[serde(default)]
    pub input_state: Map<String, Value>,
    /// Artifacts the step should produce. Not checked automatically.
    #[serde(default)]
    pub expected_outputs: Vec<String>,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
    #[serde(default)]
    pub retry_count: u32,
    pub max_retries: u32,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error_info: Option<ErrorInfo>,
}

impl Step {
    pub const DEFAULT_MAX_RETRIES: u32 = 3;

    pub fn new(
        step_id: impl Into<String>,
        operation_type: impl Into<String>,
        step_name: impl Into<String>,
    ) -> Self {
        Self {
            step_id: step_id.into(),
            operation_type: operation_type.into(),
            step_name: step_name.into(),
            input_state: Map::new(),
            expected_outputs: Vec::new(),
            timeout_seconds: None,
            retry_count: 0,
            max_retries: Self::DEFAULT_MAX_RETRIES,
            started_at: None,
            completed_at: None,
            error_info: None,
        }
    }

    pub fn with_input(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.input_state.insert(key.into(), value.into());
        self
    }

    pub fn with_expected_outputs<I, S>(mut self, outputs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.expected_outputs = outputs.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_timeout(mut self, seconds: u64) -> Self {
        self.timeout_seconds = Some(seconds);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// True while another attempt is allowed after the current one.
    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// True when the attempt at `retry_count` ran to a failure. False for an
    /// attempt that started but never finished.
    pub fn last_attempt_failed(&self) -> bool {
        self.error_info
            .as_ref()
            .is_some_and(|info| info.retry_count == self.retry_count)
    }

    /// Failed on its final allowed attempt.
    pub fn is_exhausted(&self) -> bool {
        self.last_attempt_failed() && !self.can_retry()
    }
}

/// Operation identity and shared context; the step list lives next to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub operation_id: String,
    pub agent_name: String,
    pub total_steps: usize,
    #[serde(default)]
    pub operation_state: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Per-step terminal status of one operation.
///
/// `completed_steps` and `failed_steps` are disjoint; a step in neither is
/// pending.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationProgress {
    pub operation_id: String,
    pub total_steps: usize,
    pub completed_steps: BTreeSet<String>,
    pub failed_steps: BTreeSet<String>,
    pub current_step: Option<String>,
}

impl OperationProgress {
    pub fn new(operation_id: impl Into<String>, total_steps: usize) -> Self {
        Self {
            operation_id: operation_id.into(),
            total_steps,
            ..Self::default()
        }
    }

    pub fn mark_started(&mut self, step_id: &str) {
        self.current_step = Some(step_id.to_string());
    }

    /// Record success. A step that failed earlier and now succeeded leaves
    /// the failed set.
    pub fn mark_completed(&mut self, step_id: &str) {
        self.failed_steps.remove(step_id);
        self.completed_steps.insert(step_id.to_string());
        self.clear_current(step_id);
    }

    pub fn mark_failed(&mut self, step_id: &str) {
        self.completed_steps.remove(step_id);
        self.failed_steps.insert(step_id.to_string());
        self.clear_current(step_id);
    }

    fn clear_current(&mut self, step_id: &str) {
        if self.current_step.as_deref() == Some(step_id) {
            self.current_step = None;
        }
    }

    pub fn is_complete(&self) -> bool {
        self.completed_steps.len() == self.total_steps
    }

    /// `completed/total`, as shown to operators.
    pub fn progress_label(&self) -> String {
        format!("{}/{}", self.completed_steps.len(), self.total_steps)
    }

    /// Whether the step no longer runs on resume under `policy`.
    ///
    /// Completed steps are always settled. Under
    /// [`ResumePolicy::SettleFailed`] a failed step is settled only once it is
    /// exhausted; a step interrupted mid-attempt or with retries left is not.
    pub fn is_settled(&self, step: &Step, policy: ResumePolicy) -> bool {
        if self.completed_steps.contains(&step.step_id) {
            return true;
        }
        policy == ResumePolicy::SettleFailed
            && self.failed_steps.contains(&step.step_id)
            && step.is_exhausted()
    }

    /// Whether any of `steps` still has work under `policy`.
    pub fn is_recoverable(&self, steps: &[Step], policy: ResumePolicy) -> bool {
        steps.iter().any(|step| !self.is_settled(step, policy))
    }

    /// Steps to execute on resume, in declaration order.
    pub fn remaining<'a>(&self, steps: &'a [Step], policy: ResumePolicy) -> Vec<&'a Step> {
        steps
            .iter()
            .filter(|step| !self.is_settled(step, policy))
            .collect()
    }
}

/// What resume does with steps that exhausted their retries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResumePolicy {
    /// Failed steps are final; resume runs only never-settled steps.
    #[default]
    SettleFailed,
    /// Failed steps are offered again, with a fresh retry budget.
    RetryFailed,
}
