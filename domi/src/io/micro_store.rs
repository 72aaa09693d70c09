//! Step-level checkpoints inside long multi-step operations.
//!
//! Files under `checkpoints/<task_id>/micro_checkpoints/`:
//!
//! - `operation_<operation_id>.json`: operation, steps and progress, rewritten
//!   after every step transition.
//! - `step_<operation_id>_<step_id>_<phase>_<timestamp>.json`: one record per
//!   step transition (`pre_execution`, `completed`, `failed`). Together they
//!   form the retry history of a step.
//!
//! Write failures are logged and never fail the step.

use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::future::Future;
use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::{Result, bail};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use super::config::MicroConfig;
use super::files::{file_timestamp, read_json, write_json_atomic};
use super::init::TaskPaths;
use crate::core::operation::{ErrorInfo, Operation, OperationProgress, ResumePolicy, Step};

const OPERATION_PREFIX: &str = "operation_";
const STEP_PREFIX: &str = "step_";

/// Persisted state of one operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationRecord {
    pub operation: Operation,
    pub steps: Vec<Step>,
    pub progress: OperationProgress,
}

impl OperationRecord {
    fn step_mut(&mut self, step_id: &str) -> Option<&mut Step> {
        self.steps.iter_mut().find(|step| step.step_id == step_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepPhase {
    PreExecution,
    Completed,
    Failed,
}

impl StepPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            StepPhase::PreExecution => "pre_execution",
            StepPhase::Completed => "completed",
            StepPhase::Failed => "failed",
        }
    }
}

/// One step transition, written once and never modified.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepCheckpoint {
    pub checkpoint_id: String,
    pub operation_id: String,
    pub step_id: String,
    pub phase: StepPhase,
    pub timestamp: DateTime<Utc>,
    pub step: Step,
    #[serde(default)]
    pub operation_state: Map<String, Value>,
}

/// Only the owner of a step checkpoint, for cleanup scans.
#[derive(Deserialize)]
struct StepOwner {
    operation_id: String,
}

/// Summary row of `list_recoverable_operations`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecoverableOperation {
    pub operation_id: String,
    pub agent_name: String,
    /// `completed/total`.
    pub progress: String,
    pub failed_steps_count: usize,
    pub created_at: DateTime<Utc>,
    pub current_step: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OperationAdvice {
    #[serde(flatten)]
    pub operation: RecoverableOperation,
    pub recommendation: String,
}

/// Micro-checkpoint persistence for one task.
///
/// Shared between concurrently running steps (`Arc<MicroCheckpointStore>`);
/// the registry lock is held across each record write but never across an
/// await.
#[derive(Debug)]
pub struct MicroCheckpointStore {
    dir: PathBuf,
    enabled: bool,
    policy: ResumePolicy,
    operations: Mutex<HashMap<String, OperationRecord>>,
}

impl MicroCheckpointStore {
    pub fn new(dir: impl Into<PathBuf>, enabled: bool, policy: ResumePolicy) -> Self {
        Self {
            dir: dir.into(),
            enabled,
            policy,
            operations: Mutex::new(HashMap::new()),
        }
    }

    pub fn for_task(paths: &TaskPaths, cfg: &MicroConfig) -> Self {
        Self::new(&paths.micro_dir, cfg.enabled, cfg.resume_policy)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn policy(&self) -> ResumePolicy {
        self.policy
    }

    fn registry(&self) -> MutexGuard<'_, HashMap<String, OperationRecord>> {
        self.operations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn operation_path(&self, operation_id: &str) -> PathBuf {
        self.dir.join(format!("{OPERATION_PREFIX}{operation_id}.json"))
    }

    /// Register an operation with zeroed progress and persist it.
    ///
    /// Step ids must be unique within the operation; duplicates are rejected
    /// before anything is tracked or written.
    pub fn start_operation(
        &self,
        operation_id: &str,
        agent_name: &str,
        steps: Vec<Step>,
        operation_state: Option<Map<String, Value>>,
    ) -> Result<String> {
        let mut seen = BTreeSet::new();
        if let Some(duplicate) = steps.iter().find(|step| !seen.insert(step.step_id.as_str())) {
            warn!(operation_id, step_id = %duplicate.step_id, "duplicate step id, operation not started");
            bail!(
                "operation {operation_id} declares step {} more than once",
                duplicate.step_id
            );
        }
        let now = Utc::now();
        let total_steps = steps.len();
        let record = OperationRecord {
            operation: Operation {
                operation_id: operation_id.to_string(),
                agent_name: agent_name.to_string(),
                total_steps,
                operation_state: operation_state.unwrap_or_default(),
                created_at: now,
                updated_at: now,
            },
            progress: OperationProgress::new(operation_id, total_steps),
            steps,
        };
        let mut registry = self.registry();
        if registry.contains_key(operation_id) {
            warn!(operation_id, "operation id already tracked, replacing it");
        }
        self.persist_record(&record);
        registry.insert(operation_id.to_string(), record);
        info!(operation_id, agent_name, total_steps, "operation started");
        Ok(operation_id.to_string())
    }

    /// Run `body` as one attempt of `step`.
    ///
    /// A `pre_execution` record is written before the body runs. Success marks
    /// the step completed; an error is captured into `step.error_info`, the
    /// step is marked failed and the error is returned for the caller to retry.
    pub async fn step_context<T, F, Fut>(
        &self,
        operation_id: &str,
        step: &mut Step,
        body: F,
    ) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        step.started_at = Some(Utc::now());
        step.completed_at = None;
        self.record_transition(operation_id, step, StepPhase::PreExecution)?;
        debug!(operation_id, step_id = %step.step_id, retry_count = step.retry_count, "step started");

        match body().await {
            Ok(value) => {
                step.completed_at = Some(Utc::now());
                step.error_info = None;
                self.record_transition(operation_id, step, StepPhase::Completed)?;
                debug!(operation_id, step_id = %step.step_id, "step completed");
                Ok(value)
            }
            Err(err) => {
                step.error_info = Some(ErrorInfo::from_error(&err, step.retry_count));
                self.record_transition(operation_id, step, StepPhase::Failed)?;
                debug!(operation_id, step_id = %step.step_id, err = %format!("{err:#}"), "step attempt failed");
                Err(err)
            }
        }
    }

    /// Update progress and write the step record. Errors only when the
    /// operation or step is not tracked.
    fn record_transition(&self, operation_id: &str, step: &Step, phase: StepPhase) -> Result<()> {
        let mut registry = self.registry();
        let Some(record) = registry.get_mut(operation_id) else {
            bail!("operation {operation_id} was not started");
        };
        let Some(tracked) = record.step_mut(&step.step_id) else {
            bail!("operation {operation_id} has no step {}", step.step_id);
        };
        *tracked = step.clone();
        match phase {
            StepPhase::PreExecution => record.progress.mark_started(&step.step_id),
            StepPhase::Completed => record.progress.mark_completed(&step.step_id),
            StepPhase::Failed => record.progress.mark_failed(&step.step_id),
        }
        let now = Utc::now();
        record.operation.updated_at = now;

        if self.enabled {
            let checkpoint = StepCheckpoint {
                checkpoint_id: String::new(),
                operation_id: operation_id.to_string(),
                step_id: step.step_id.clone(),
                phase,
                timestamp: now,
                step: step.clone(),
                operation_state: record.operation.operation_state.clone(),
            };
            self.write_step_checkpoint(checkpoint);
            self.persist_record(record);
        }
        Ok(())
    }

    fn write_step_checkpoint(&self, mut checkpoint: StepCheckpoint) {
        let base = format!(
            "{STEP_PREFIX}{}_{}_{}_{}",
            checkpoint.operation_id,
            checkpoint.step_id,
            checkpoint.phase.as_str(),
            file_timestamp(checkpoint.timestamp)
        );
        let mut checkpoint_id = base.clone();
        let mut suffix = 0u32;
        while self.dir.join(format!("{checkpoint_id}.json")).exists() {
            suffix += 1;
            checkpoint_id = format!("{base}-{suffix}");
        }
        let path = self.dir.join(format!("{checkpoint_id}.json"));
        checkpoint.checkpoint_id = checkpoint_id;
        if let Err(err) = write_json_atomic(&path, &checkpoint) {
            warn!(path = %path.display(), err = %format!("{err:#}"), "failed to write step checkpoint");
        }
    }

    fn persist_record(&self, record: &OperationRecord) {
        if !self.enabled {
            return;
        }
        let path = self.operation_path(&record.operation.operation_id);
        if let Err(err) = write_json_atomic(&path, record) {
            warn!(path = %path.display(), err = %format!("{err:#}"), "failed to persist operation");
        }
    }

    /// Load a persisted operation and track it again so its steps can be
    /// re-entered. Falls back to the in-memory record when micro
    /// checkpointing is disabled.
    pub fn restore_operation(&self, operation_id: &str) -> Option<OperationRecord> {
        let mut registry = self.registry();
        if !self.enabled {
            return registry.get(operation_id).cloned();
        }
        let path = self.operation_path(operation_id);
        let record = match read_json::<OperationRecord>(&path) {
            Ok(record) => record,
            Err(err) => {
                if path.exists() {
                    warn!(operation_id, err = %format!("{err:#}"), "unreadable operation record");
                } else {
                    debug!(operation_id, "no operation record");
                }
                return None;
            }
        };
        registry.insert(operation_id.to_string(), record.clone());
        Some(record)
    }

    /// Persisted progress of `operation_id`, or `None` if unknown or unreadable.
    pub fn resume_operation(&self, operation_id: &str) -> Option<OperationProgress> {
        let record = self.restore_operation(operation_id)?;
        info!(
            operation_id,
            progress = %record.progress.progress_label(),
            failed = record.progress.failed_steps.len(),
            "operation restored"
        );
        Some(record.progress)
    }

    /// Stop tracking `operation_id` in memory. Its files stay on disk.
    pub fn finish_operation(&self, operation_id: &str) -> Option<OperationProgress> {
        self.registry()
            .remove(operation_id)
            .map(|record| record.progress)
    }

    /// Current progress of a tracked operation.
    pub fn progress(&self, operation_id: &str) -> Option<OperationProgress> {
        self.registry()
            .get(operation_id)
            .map(|record| record.progress.clone())
    }

    fn all_records(&self) -> Vec<OperationRecord> {
        if !self.enabled {
            return self.registry().values().cloned().collect();
        }
        self.files_with_prefix(OPERATION_PREFIX)
            .into_iter()
            .filter_map(|path| match read_json::<OperationRecord>(&path) {
                Ok(record) => Some(record),
                Err(err) => {
                    warn!(path = %path.display(), err = %format!("{err:#}"), "skipping unreadable operation record");
                    None
                }
            })
            .collect()
    }

    fn files_with_prefix(&self, prefix: &str) -> Vec<PathBuf> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) => {
                if err.kind() != IoErrorKind::NotFound {
                    warn!(dir = %self.dir.display(), err = %err, "failed to list micro checkpoints");
                }
                return Vec::new();
            }
        };
        let mut paths: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| {
                path.extension().is_some_and(|extension| extension == "json")
                    && path
                        .file_name()
                        .and_then(|name| name.to_str())
                        .is_some_and(|name| name.starts_with(prefix))
            })
            .collect();
        paths.sort();
        paths
    }

    /// Operations that still have work under the resume policy, newest first.
    pub fn list_recoverable_operations(&self) -> Vec<RecoverableOperation> {
        let mut records: Vec<OperationRecord> = self
            .all_records()
            .into_iter()
            .filter(|record| record.progress.is_recoverable(&record.steps, self.policy))
            .collect();
        records.sort_by(|a, b| {
            b.operation
                .created_at
                .cmp(&a.operation.created_at)
                .then_with(|| b.operation.operation_id.cmp(&a.operation.operation_id))
        });
        records
            .into_iter()
            .map(|record| RecoverableOperation {
                progress: record.progress.progress_label(),
                failed_steps_count: record.progress.failed_steps.len(),
                current_step: record.progress.current_step,
                operation_id: record.operation.operation_id,
                agent_name: record.operation.agent_name,
                created_at: record.operation.created_at,
            })
            .collect()
    }

    /// Recoverable operations with a suggested next action.
    pub fn operation_recovery_report(&self) -> Vec<OperationAdvice> {
        self.list_recoverable_operations()
            .into_iter()
            .map(|operation| {
                let recommendation = if operation.failed_steps_count > 0 {
                    "review error logs and retry failed steps"
                } else {
                    "resume from last checkpoint"
                };
                OperationAdvice {
                    operation,
                    recommendation: recommendation.to_string(),
                }
            })
            .collect()
    }

    /// Step records of one step, oldest first.
    pub fn get_step_checkpoints(&self, operation_id: &str, step_id: &str) -> Vec<StepCheckpoint> {
        let mut checkpoints: Vec<StepCheckpoint> = self
            .files_with_prefix(STEP_PREFIX)
            .into_iter()
            .filter_map(|path| read_json::<StepCheckpoint>(&path).ok())
            .filter(|checkpoint| {
                checkpoint.operation_id == operation_id && checkpoint.step_id == step_id
            })
            .collect();
        checkpoints.sort_by(|a, b| {
            a.timestamp
                .cmp(&b.timestamp)
                .then_with(|| a.phase.cmp(&b.phase))
                .then_with(|| a.checkpoint_id.cmp(&b.checkpoint_id))
        });
        checkpoints
    }

    /// Delete fully completed operations last updated more than `keep_days`
    /// ago, with their step records. Returns how many operations were removed.
    pub fn cleanup_completed_operations(&self, keep_days: u32) -> usize {
        if !self.enabled {
            return 0;
        }
        let cutoff = Utc::now() - ChronoDuration::days(i64::from(keep_days));
        let mut removed = BTreeSet::new();
        for path in self.files_with_prefix(OPERATION_PREFIX) {
            let Ok(record) = read_json::<OperationRecord>(&path) else {
                continue;
            };
            if !record.progress.is_complete() || record.operation.updated_at >= cutoff {
                continue;
            }
            match fs::remove_file(&path) {
                Ok(()) => {
                    removed.insert(record.operation.operation_id);
                }
                Err(err) => warn!(path = %path.display(), err = %err, "failed to remove operation record"),
            }
        }
        if removed.is_empty() {
            return 0;
        }

        for path in self.files_with_prefix(STEP_PREFIX) {
            let Ok(owner) = read_json::<StepOwner>(&path) else {
                continue;
            };
            if removed.contains(&owner.operation_id)
                && let Err(err) = fs::remove_file(&path)
            {
                warn!(path = %path.display(), err = %err, "failed to remove step checkpoint");
            }
        }
        let mut registry = self.registry();
        for operation_id in &removed {
            registry.remove(operation_id);
        }
        info!(removed = removed.len(), keep_days, "completed operations cleaned up");
        removed.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    fn steps(ids: &[&str]) -> Vec<Step> {
        ids.iter()
            .map(|id| Step::new(*id, "test", format!("step {id}")))
            .collect()
    }

    fn store(dir: &Path) -> MicroCheckpointStore {
        MicroCheckpointStore::new(dir.join("micro"), true, ResumePolicy::SettleFailed)
    }

    /// Verifies a successful attempt leaves a pre_execution and a completed
    /// record and persists progress.
    #[tokio::test]
    async fn step_context_records_success() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store(temp.path());
        store
            .start_operation("op", "Coder_Agent", steps(&["a", "b"]), None)
            .expect("start");

        let mut step = Step::new("a", "test", "step a");
        let value = store
            .step_context("op", &mut step, || async { Ok(7) })
            .await
            .expect("step");
        assert_eq!(value, 7);
        assert!(step.completed_at.is_some());

        let history = store.get_step_checkpoints("op", "a");
        let phases: Vec<StepPhase> = history.iter().map(|c| c.phase).collect();
        assert_eq!(phases, vec![StepPhase::PreExecution, StepPhase::Completed]);
        assert!(history[0].checkpoint_id.starts_with("step_op_a_pre_execution_"));

        let progress = store.resume_operation("op").expect("progress");
        assert!(progress.completed_steps.contains("a"));
        assert_eq!(progress.total_steps, 2);
    }

    #[tokio::test]
    async fn step_context_records_failure_and_propagates() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store(temp.path());
        store
            .start_operation("op", "agent", steps(&["a"]), None)
            .expect("start");

        let mut step = Step::new("a", "test", "step a");
        step.retry_count = 1;
        let err = store
            .step_context("op", &mut step, || async { Err::<(), _>(anyhow!("boom")) })
            .await
            .expect_err("failure propagates");
        assert_eq!(err.to_string(), "boom");

        let info = step.error_info.clone().expect("error info");
        assert_eq!(info.error_type, "error");
        assert_eq!(info.retry_count, 1);
        let progress = store.progress("op").expect("progress");
        assert!(progress.failed_steps.contains("a"));
        assert_eq!(
            store.get_step_checkpoints("op", "a").last().map(|c| c.phase),
            Some(StepPhase::Failed)
        );
    }

    #[test]
    fn duplicate_step_ids_are_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store(temp.path());
        let err = store
            .start_operation("op", "agent", steps(&["s", "t", "s"]), None)
            .expect_err("duplicate");
        assert_eq!(err.to_string(), "operation op declares step s more than once");
        assert_eq!(store.progress("op"), None);
        assert!(!store.dir().join("operation_op.json").exists());
        assert!(store.list_recoverable_operations().is_empty());
    }

    #[tokio::test]
    async fn unknown_operation_is_rejected_before_the_body_runs() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store(temp.path());
        let mut step = Step::new("a", "test", "step a");
        let mut ran = false;
        let result = store
            .step_context("missing", &mut step, || {
                ran = true;
                async { Ok(()) }
            })
            .await;
        assert!(result.is_err());
        assert!(!ran);
    }

    #[tokio::test]
    async fn disabled_store_tracks_in_memory_only() {
        let temp = tempfile::tempdir().expect("tempdir");
        let dir = temp.path().join("micro");
        let store = MicroCheckpointStore::new(&dir, false, ResumePolicy::SettleFailed);
        store
            .start_operation("op", "agent", steps(&["a", "b"]), None)
            .expect("start");
        let mut step = Step::new("a", "test", "step a");
        store
            .step_context("op", &mut step, || async { Ok(()) })
            .await
            .expect("step");

        assert!(!dir.exists());
        assert_eq!(store.progress("op").map(|p| p.progress_label()), Some("1/2".to_string()));
        assert_eq!(store.list_recoverable_operations().len(), 1);
        assert_eq!(store.cleanup_completed_operations(0), 0);
    }

    #[test]
    fn corrupt_operation_record_resumes_as_none() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store(temp.path());
        fs::create_dir_all(store.dir()).expect("mkdir");
        fs::write(store.dir().join("operation_bad.json"), "{").expect("write");
        assert_eq!(store.resume_operation("bad"), None);
        assert_eq!(store.resume_operation("never_started"), None);
        assert!(store.list_recoverable_operations().is_empty());
    }

    #[tokio::test]
    async fn recovery_report_recommends_by_failures() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store(temp.path());
        store
            .start_operation("clean", "agent", steps(&["a", "b"]), None)
            .expect("start");
        store
            .start_operation("broken", "agent", steps(&["a", "b"]), None)
            .expect("start");
        let mut step = Step::new("a", "test", "step a");
        let _ = store
            .step_context("broken", &mut step, || async { Err::<(), _>(anyhow!("no")) })
            .await;

        let report = store.operation_recovery_report();
        let by_id: HashMap<&str, &str> = report
            .iter()
            .map(|advice| (advice.operation.operation_id.as_str(), advice.recommendation.as_str()))
            .collect();
        assert_eq!(by_id["clean"], "resume from last checkpoint");
        assert_eq!(by_id["broken"], "review error logs and retry failed steps");
    }

    /// Verifies cleanup matches step records by their owner field, so an
    /// operation whose id prefixes another's keeps its records.
    #[tokio::test]
    async fn cleanup_removes_only_completed_operations() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store(temp.path());
        store
            .start_operation("op", "agent", steps(&["a"]), None)
            .expect("start");
        store
            .start_operation("op_2", "agent", steps(&["a", "b"]), None)
            .expect("start");
        for operation_id in ["op", "op_2"] {
            let mut step = Step::new("a", "test", "step a");
            store
                .step_context(operation_id, &mut step, || async { Ok(()) })
                .await
                .expect("step");
        }

        assert_eq!(store.cleanup_completed_operations(7), 0);
        assert_eq!(store.cleanup_completed_operations(0), 1);
        assert!(!store.dir().join("operation_op.json").exists());
        assert!(store.dir().join("operation_op_2.json").exists());
        assert!(store.get_step_checkpoints("op", "a").is_empty());
        assert_eq!(store.get_step_checkpoints("op_2", "a").len(), 2);
    }
}
