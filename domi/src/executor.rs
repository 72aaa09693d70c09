//! Declarative multi-step operations with per-step retries.
//!
//! An [`OperationBuilder`] describes the steps; [`OperationExecutor`] runs a
//! caller-supplied body once per step inside the micro-checkpoint step
//! context, retrying failed attempts up to the step's budget. A step that
//! fails permanently does not stop the remaining steps.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures::future::join_all;
use serde_json::{Map, Value};
use tracing::{debug, info, instrument, warn};

use crate::core::operation::{
    ErrorInfo, OperationProgress, ResumePolicy, Step, StepTimeoutError,
};
use crate::io::micro_store::MicroCheckpointStore;

/// What a step body receives for one attempt.
#[derive(Debug, Clone)]
pub struct StepContext {
    pub operation_id: String,
    pub step: Step,
    /// 1 for the first attempt.
    pub attempt: u32,
    pub operation_state: Map<String, Value>,
}

impl StepContext {
    /// Value of `key` in the step's input state.
    pub fn input(&self, key: &str) -> Option<&Value> {
        self.step.input_state.get(key)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StepResult<T> {
    Completed(T),
    Failed(ErrorInfo),
    /// Already settled before a resume.
    Skipped,
}

impl<T> StepResult<T> {
    pub fn value(&self) -> Option<&T> {
        match self {
            StepResult::Completed(value) => Some(value),
            StepResult::Failed(_) | StepResult::Skipped => None,
        }
    }
}

/// Per-step results in declaration order plus the final progress.
#[derive(Debug, Clone)]
pub struct OperationReport<T> {
    pub operation_id: String,
    pub results: Vec<(String, StepResult<T>)>,
    pub progress: OperationProgress,
}

impl<T> OperationReport<T> {
    pub fn result(&self, step_id: &str) -> Option<&StepResult<T>> {
        self.results
            .iter()
            .find(|(id, _)| id == step_id)
            .map(|(_, result)| result)
    }

    /// Steps that failed permanently in this run.
    pub fn failed(&self) -> Vec<(&str, &ErrorInfo)> {
        self.results
            .iter()
            .filter_map(|(id, result)| match result {
                StepResult::Failed(info) => Some((id.as_str(), info)),
                StepResult::Completed(_) | StepResult::Skipped => None,
            })
            .collect()
    }

    pub fn is_success(&self) -> bool {
        self.progress.is_complete()
    }
}

/// Built operation, ready for [`OperationExecutor::execute`].
#[derive(Debug, Clone, PartialEq)]
pub struct OperationPlan {
    pub operation_id: String,
    pub agent_name: String,
    pub steps: Vec<Step>,
    pub operation_state: Map<String, Value>,
}

#[derive(Debug, Clone)]
pub struct OperationBuilder {
    plan: OperationPlan,
}

impl OperationBuilder {
    pub fn new(operation_id: impl Into<String>, agent_name: impl Into<String>) -> Self {
        Self {
            plan: OperationPlan {
                operation_id: operation_id.into(),
                agent_name: agent_name.into(),
                steps: Vec::new(),
                operation_state: Map::new(),
            },
        }
    }

    pub fn add_step(mut self, step: Step) -> Self {
        self.plan.steps.push(step);
        self
    }

    /// Shared value visible to every step.
    pub fn set_state(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.plan.operation_state.insert(key.into(), value.into());
        self
    }

    pub fn steps(&self) -> &[Step] {
        &self.plan.steps
    }

    pub fn build(self) -> OperationPlan {
        self.plan
    }

    /// One `file_generation` step per file. Each entry needs a `filename`;
    /// `timeout` (180) and `max_retries` (2) override the defaults.
    pub fn file_generation(
        operation_id: impl Into<String>,
        agent_name: impl Into<String>,
        files: Vec<Map<String, Value>>,
    ) -> Self {
        files
            .into_iter()
            .enumerate()
            .fold(Self::new(operation_id, agent_name), |builder, (i, file)| {
                let filename = str_field(&file, "filename")
                    .unwrap_or("unnamed")
                    .to_string();
                builder.add_step(preset_step(
                    format!("generate_file_{i}"),
                    "file_generation",
                    format!("Generate {filename}"),
                    vec![filename],
                    file,
                    180,
                    2,
                ))
            })
    }

    /// One `experiment_execution` step per experiment config. Defaults:
    /// 600 s timeout, 1 retry.
    pub fn experiment_execution(
        operation_id: impl Into<String>,
        agent_name: impl Into<String>,
        experiments: Vec<Map<String, Value>>,
    ) -> Self {
        experiments
            .into_iter()
            .enumerate()
            .fold(Self::new(operation_id, agent_name), |builder, (i, config)| {
                let name = str_field(&config, "name")
                    .map_or_else(|| format!("Experiment {i}"), str::to_string);
                let outputs = listed_outputs(&config);
                builder.add_step(preset_step(
                    format!("experiment_{i}"),
                    "experiment_execution",
                    format!("Run {name}"),
                    outputs,
                    config,
                    600,
                    1,
                ))
            })
    }

    /// One `data_processing` step per stage. Defaults: 300 s timeout,
    /// 2 retries.
    pub fn data_processing(
        operation_id: impl Into<String>,
        agent_name: impl Into<String>,
        stages: Vec<Map<String, Value>>,
    ) -> Self {
        stages
            .into_iter()
            .enumerate()
            .fold(Self::new(operation_id, agent_name), |builder, (i, config)| {
                let name = str_field(&config, "name")
                    .map_or_else(|| format!("Processing Step {i}"), str::to_string);
                let outputs = listed_outputs(&config);
                builder.add_step(preset_step(
                    format!("process_step_{i}"),
                    "data_processing",
                    name,
                    outputs,
                    config,
                    300,
                    2,
                ))
            })
    }
}

fn str_field<'a>(map: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    map.get(key).and_then(Value::as_str)
}

fn listed_outputs(map: &Map<String, Value>) -> Vec<String> {
    map.get("expected_outputs")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn preset_step(
    step_id: String,
    operation_type: &str,
    step_name: String,
    expected_outputs: Vec<String>,
    input_state: Map<String, Value>,
    default_timeout: u64,
    default_retries: u32,
) -> Step {
    let timeout = input_state
        .get("timeout")
        .and_then(Value::as_u64)
        .unwrap_or(default_timeout);
    let retries = input_state
        .get("max_retries")
        .and_then(Value::as_u64)
        .and_then(|n| u32::try_from(n).ok())
        .unwrap_or(default_retries);
    let mut step = Step::new(step_id, operation_type, step_name)
        .with_expected_outputs(expected_outputs)
        .with_timeout(timeout)
        .with_max_retries(retries);
    step.input_state = input_state;
    step
}

/// Runs operations against a shared micro-checkpoint store.
#[derive(Debug, Clone)]
pub struct OperationExecutor {
    store: Arc<MicroCheckpointStore>,
    default_timeout: Duration,
}

impl OperationExecutor {
    pub fn new(store: Arc<MicroCheckpointStore>, default_timeout: Duration) -> Self {
        Self {
            store,
            default_timeout,
        }
    }

    pub fn store(&self) -> &Arc<MicroCheckpointStore> {
        &self.store
    }

    /// Run every step in order.
    ///
    /// Fails without running anything if the plan repeats a step id.
    #[instrument(skip_all, fields(operation_id = %plan.operation_id, agent = %plan.agent_name))]
    pub async fn execute<T, F, Fut>(
        &self,
        plan: OperationPlan,
        body: F,
    ) -> Result<OperationReport<T>>
    where
        F: Fn(StepContext) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let OperationPlan {
            operation_id,
            agent_name,
            steps,
            operation_state,
        } = plan;
        self.store.start_operation(
            &operation_id,
            &agent_name,
            steps.clone(),
            Some(operation_state.clone()),
        )?;
        let total = steps.len();
        let mut results = Vec::with_capacity(total);
        for step in steps {
            results.push(
                self.run_step(&operation_id, &operation_state, step, &body)
                    .await,
            );
        }
        Ok(self.finish(operation_id, total, results))
    }

    /// Run every step concurrently on the current task and gather the
    /// results in declaration order.
    #[instrument(skip_all, fields(operation_id = %plan.operation_id, agent = %plan.agent_name))]
    pub async fn execute_concurrent<T, F, Fut>(
        &self,
        plan: OperationPlan,
        body: F,
    ) -> Result<OperationReport<T>>
    where
        F: Fn(StepContext) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let OperationPlan {
            operation_id,
            agent_name,
            steps,
            operation_state,
        } = plan;
        self.store.start_operation(
            &operation_id,
            &agent_name,
            steps.clone(),
            Some(operation_state.clone()),
        )?;
        let total = steps.len();
        let results = join_all(
            steps
                .into_iter()
                .map(|step| self.run_step(&operation_id, &operation_state, step, &body)),
        )
        .await;
        Ok(self.finish(operation_id, total, results))
    }

    /// Continue a persisted operation, running only the steps the resume
    /// policy leaves open. Settled steps report [`StepResult::Skipped`].
    ///
    /// Retry counts carry over: an interrupted attempt is repeated with its
    /// own count, a finished failed attempt moves on to the next one.
    ///
    /// Returns `None` if the operation is unknown or unreadable.
    #[instrument(skip_all, fields(operation_id))]
    pub async fn resume<T, F, Fut>(&self, operation_id: &str, body: F) -> Option<OperationReport<T>>
    where
        F: Fn(StepContext) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let record = self.store.restore_operation(operation_id)?;
        let policy = self.store.policy();
        let remaining: BTreeSet<String> = record
            .progress
            .remaining(&record.steps, policy)
            .into_iter()
            .map(|step| step.step_id.clone())
            .collect();
        info!(
            progress = %record.progress.progress_label(),
            remaining = remaining.len(),
            "resuming operation"
        );

        let operation_state = record.operation.operation_state;
        let total = record.steps.len();
        let mut results = Vec::with_capacity(total);
        for mut step in record.steps {
            if !remaining.contains(&step.step_id) {
                results.push((step.step_id, StepResult::Skipped));
                continue;
            }
            if policy == ResumePolicy::RetryFailed
                && record.progress.failed_steps.contains(&step.step_id)
            {
                step.retry_count = 0;
                step.error_info = None;
            } else if step.last_attempt_failed() {
                // The failed attempt was recorded but its retry never started.
                step.retry_count += 1;
            }
            results.push(
                self.run_step(operation_id, &operation_state, step, &body)
                    .await,
            );
        }
        Some(self.finish(operation_id.to_string(), total, results))
    }

    async fn run_step<T, F, Fut>(
        &self,
        operation_id: &str,
        operation_state: &Map<String, Value>,
        mut step: Step,
        body: &F,
    ) -> (String, StepResult<T>)
    where
        F: Fn(StepContext) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let timeout = step
            .timeout_seconds
            .map_or(self.default_timeout, Duration::from_secs);
        loop {
            let context = StepContext {
                operation_id: operation_id.to_string(),
                step: step.clone(),
                attempt: step.retry_count + 1,
                operation_state: operation_state.clone(),
            };
            let step_id = step.step_id.clone();
            let attempt = self
                .store
                .step_context(operation_id, &mut step, || async move {
                    match tokio::time::timeout(timeout, body(context)).await {
                        Ok(result) => result,
                        Err(_) => Err(anyhow::Error::new(StepTimeoutError { step_id, timeout })),
                    }
                })
                .await;

            match attempt {
                Ok(value) => return (step.step_id, StepResult::Completed(value)),
                Err(err) if step.can_retry() => {
                    debug!(
                        step_id = %step.step_id,
                        retry_count = step.retry_count,
                        max_retries = step.max_retries,
                        err = %format!("{err:#}"),
                        "retrying step"
                    );
                    step.retry_count += 1;
                }
                Err(err) => {
                    let info = step
                        .error_info
                        .clone()
                        .unwrap_or_else(|| ErrorInfo::from_error(&err, step.retry_count));
                    warn!(
                        step_id = %step.step_id,
                        error_type = %info.error_type,
                        error_message = %info.error_message,
                        attempts = step.retry_count + 1,
                        "step failed permanently"
                    );
                    return (step.step_id, StepResult::Failed(info));
                }
            }
        }
    }

    fn finish<T>(
        &self,
        operation_id: String,
        total: usize,
        results: Vec<(String, StepResult<T>)>,
    ) -> OperationReport<T> {
        let progress = self
            .store
            .finish_operation(&operation_id)
            .unwrap_or_else(|| OperationProgress::new(operation_id.as_str(), total));
        info!(
            operation_id = %operation_id,
            completed = progress.completed_steps.len(),
            failed = progress.failed_steps.len(),
            total = progress.total_steps,
            "operation finished"
        );
        OperationReport {
            operation_id,
            results,
            progress,
        }
    }
}
