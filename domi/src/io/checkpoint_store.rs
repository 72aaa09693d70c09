//! Coarse-grained checkpoints of the whole workflow.
//!
//! A checkpoint is a JSON record (session state, metadata, counters) plus a
//! full copy of the task's output directory taken at the same moment. Layout
//! under `checkpoints/<task_id>/`:
//!
//! - `<checkpoint_id>.json`: the record
//! - `outputs_snapshot_<checkpoint_id>/`: the output snapshot
//! - `latest_checkpoint.txt`: id of the default resume target
//!
//! The snapshot is written first, the record second and the latest pointer
//! last, each through a fresh name or an atomic rename, so readers never see
//! a pointer to a half-written checkpoint.
//!
//! Store boundaries never return errors: I/O and parse failures are logged and
//! surface as `None`/`false`, so a broken checkpoint cannot stop the workflow.

use std::fs;
use std::io::ErrorKind as IoErrorKind;
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info, instrument, warn};

use super::files::{
    copy_dir_recursive, file_timestamp, read_json, remove_dir_if_exists, replace_dir,
    write_atomic, write_json_atomic,
};
use super::init::TaskPaths;
use crate::core::session::{SessionState, migrate_session_value};

pub const LATEST_POINTER_FILE: &str = "latest_checkpoint.txt";
const SNAPSHOT_PREFIX: &str = "outputs_snapshot_";

/// Persisted checkpoint record. Immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub checkpoint_id: String,
    pub task_id: String,
    pub timestamp: DateTime<Utc>,
    pub phase: String,
    pub step: String,
    pub session_state: Map<String, Value>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    pub agent_execution_count: u64,
}

impl CheckpointRecord {
    /// Typed view of the captured session state (older flat snapshots are
    /// migrated).
    pub fn session(&self) -> Result<SessionState> {
        migrate_session_value(&Value::Object(self.session_state.clone()))
            .with_context(|| format!("session state of checkpoint {}", self.checkpoint_id))
    }
}

/// One line of `list_checkpoints`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckpointSummary {
    pub checkpoint_id: String,
    pub timestamp: DateTime<Utc>,
    pub phase: String,
    pub step: String,
    pub agent_execution_count: u64,
}

/// Read-only summary for operator tooling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecoveryInfo {
    pub task_id: String,
    pub checkpoints_available: usize,
    pub latest_checkpoint: Option<String>,
    pub can_resume: bool,
    pub checkpoints_dir: PathBuf,
    pub outputs_dir: PathBuf,
}

/// Checkpoint persistence for one task.
///
/// `load_checkpoint` replaces the live output directory wholesale. It must
/// not run while agents may be writing outputs; the workflow driver only
/// loads before any agent work starts.
#[derive(Debug)]
pub struct CheckpointStore {
    task_id: String,
    checkpoints_dir: PathBuf,
    outputs_dir: PathBuf,
    enabled: bool,
    agent_execution_count: u64,
}

impl CheckpointStore {
    /// Open the store for `paths`. The agent execution counter continues from
    /// the latest checkpoint, if one is readable.
    pub fn new(paths: &TaskPaths, enabled: bool) -> Self {
        let mut store = Self {
            task_id: paths.task_id.clone(),
            checkpoints_dir: paths.checkpoints_dir.clone(),
            outputs_dir: paths.outputs_dir.clone(),
            enabled,
            agent_execution_count: 0,
        };
        if enabled
            && let Some(id) = store.latest_checkpoint_id()
            && let Ok(record) = read_json::<CheckpointRecord>(&store.record_path(&id))
        {
            store.agent_execution_count = record.agent_execution_count;
        }
        store
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn outputs_dir(&self) -> &std::path::Path {
        &self.outputs_dir
    }

    pub fn agent_execution_count(&self) -> u64 {
        self.agent_execution_count
    }

    /// Count one more agent execution; returns the new count.
    pub fn note_agent_execution(&mut self) -> u64 {
        self.agent_execution_count += 1;
        self.agent_execution_count
    }

    pub fn record_path(&self, checkpoint_id: &str) -> PathBuf {
        self.checkpoints_dir.join(format!("{checkpoint_id}.json"))
    }

    pub fn snapshot_dir(&self, checkpoint_id: &str) -> PathBuf {
        self.checkpoints_dir
            .join(format!("{SNAPSHOT_PREFIX}{checkpoint_id}"))
    }

    fn latest_path(&self) -> PathBuf {
        self.checkpoints_dir.join(LATEST_POINTER_FILE)
    }

    /// Capture session state and the output directory.
    ///
    /// Returns the new checkpoint id, or `None` when checkpointing is disabled
    /// or the checkpoint could not be written (nothing partial is left behind).
    #[instrument(skip_all, fields(task_id = %self.task_id, phase, step))]
    pub fn create_checkpoint<S: Serialize>(
        &mut self,
        phase: &str,
        step: &str,
        session_state: &S,
        metadata: Option<Map<String, Value>>,
    ) -> Option<String> {
        if !self.enabled {
            debug!("checkpointing disabled, skipping");
            return None;
        }
        match self.try_create(phase, step, session_state, metadata.unwrap_or_default()) {
            Ok(checkpoint_id) => {
                info!(
                    checkpoint_id = %checkpoint_id,
                    agent_execution_count = self.agent_execution_count,
                    "checkpoint created"
                );
                Some(checkpoint_id)
            }
            Err(err) => {
                warn!(err = %format!("{err:#}"), "failed to create checkpoint");
                None
            }
        }
    }

    fn try_create<S: Serialize>(
        &self,
        phase: &str,
        step: &str,
        session_state: &S,
        metadata: Map<String, Value>,
    ) -> Result<String> {
        let session_state = match serde_json::to_value(session_state)
            .context("serialize session state")?
        {
            Value::Object(map) => map,
            other => bail!(
                "session state must serialize to a JSON object, got {}",
                json_kind(&other)
            ),
        };
        fs::create_dir_all(&self.checkpoints_dir)
            .with_context(|| format!("create directory {}", self.checkpoints_dir.display()))?;

        let timestamp = Utc::now();
        let checkpoint_id = self.unique_id(phase, step, timestamp);
        let snapshot = self.snapshot_dir(&checkpoint_id);
        let record_path = self.record_path(&checkpoint_id);

        let record = CheckpointRecord {
            checkpoint_id: checkpoint_id.clone(),
            task_id: self.task_id.clone(),
            timestamp,
            phase: phase.to_string(),
            step: step.to_string(),
            session_state,
            metadata,
            agent_execution_count: self.agent_execution_count,
        };

        let written = self
            .capture_snapshot(&snapshot)
            .and_then(|()| write_json_atomic(&record_path, &record))
            .and_then(|()| write_atomic(&self.latest_path(), &format!("{checkpoint_id}\n")));
        if let Err(err) = written {
            if let Err(cleanup) = remove_dir_if_exists(&snapshot) {
                warn!(err = %format!("{cleanup:#}"), "failed to remove partial snapshot");
            }
            if record_path.exists()
                && let Err(cleanup) = fs::remove_file(&record_path)
            {
                warn!(err = %cleanup, "failed to remove partial record");
            }
            return Err(err);
        }
        Ok(checkpoint_id)
    }

    fn unique_id(&self, phase: &str, step: &str, timestamp: DateTime<Utc>) -> String {
        let base = format!(
            "{}_{}_{}",
            sanitize_component(phase),
            sanitize_component(step),
            file_timestamp(timestamp)
        );
        let mut candidate = base.clone();
        let mut suffix = 0u32;
        while self.record_path(&candidate).exists() || self.snapshot_dir(&candidate).exists() {
            suffix += 1;
            candidate = format!("{base}-{suffix}");
        }
        candidate
    }

    fn capture_snapshot(&self, snapshot: &std::path::Path) -> Result<()> {
        if self.outputs_dir.is_dir() {
            copy_dir_recursive(&self.outputs_dir, snapshot)
        } else {
            debug!(outputs_dir = %self.outputs_dir.display(), "no outputs yet, empty snapshot");
            fs::create_dir_all(snapshot)
                .with_context(|| format!("create directory {}", snapshot.display()))
        }
    }

    /// Load a checkpoint (the latest when `checkpoint_id` is `None`) and
    /// restore its output snapshot over the live output directory.
    ///
    /// Returns `None` when checkpointing is disabled, nothing exists, or the
    /// record or snapshot is missing or unreadable.
    #[instrument(skip_all, fields(task_id = %self.task_id, checkpoint_id = ?checkpoint_id))]
    pub fn load_checkpoint(&self, checkpoint_id: Option<&str>) -> Option<CheckpointRecord> {
        if !self.enabled {
            debug!("checkpointing disabled, nothing to load");
            return None;
        }
        let checkpoint_id = match checkpoint_id {
            Some(id) => id.to_string(),
            None => self.latest_checkpoint_id()?,
        };
        if !is_valid_checkpoint_id(&checkpoint_id) {
            warn!(checkpoint_id = %checkpoint_id, "invalid checkpoint id");
            return None;
        }
        match self.try_load(&checkpoint_id) {
            Ok(record) => {
                info!(
                    checkpoint_id = %record.checkpoint_id,
                    phase = %record.phase,
                    step = %record.step,
                    "checkpoint restored"
                );
                Some(record)
            }
            Err(err) => {
                warn!(checkpoint_id = %checkpoint_id, err = %format!("{err:#}"), "failed to load checkpoint");
                None
            }
        }
    }

    fn try_load(&self, checkpoint_id: &str) -> Result<CheckpointRecord> {
        let record_path = self.record_path(checkpoint_id);
        if !record_path.is_file() {
            bail!("checkpoint {checkpoint_id} not found");
        }
        let record: CheckpointRecord = read_json(&record_path)?;
        if record.checkpoint_id != checkpoint_id {
            bail!(
                "record {} names checkpoint {}",
                record_path.display(),
                record.checkpoint_id
            );
        }
        let snapshot = self.snapshot_dir(checkpoint_id);
        if !snapshot.is_dir() {
            bail!("missing output snapshot {}", snapshot.display());
        }
        replace_dir(&snapshot, &self.outputs_dir)
            .with_context(|| format!("restore outputs from {}", snapshot.display()))?;
        Ok(record)
    }

    /// Id in the latest pointer, or the newest listed checkpoint when the
    /// pointer is missing or stale.
    pub fn latest_checkpoint_id(&self) -> Option<String> {
        match fs::read_to_string(self.latest_path()) {
            Ok(contents) => {
                let id = contents.trim();
                if is_valid_checkpoint_id(id) && self.record_path(id).is_file() {
                    return Some(id.to_string());
                }
                debug!(pointer = %id, "latest pointer is stale");
            }
            Err(err) if err.kind() == IoErrorKind::NotFound => {}
            Err(err) => warn!(err = %err, "failed to read latest pointer"),
        }
        self.list_checkpoints()
            .into_iter()
            .next()
            .map(|summary| summary.checkpoint_id)
    }

    /// Checkpoints of this task, newest first. Unreadable records are skipped.
    pub fn list_checkpoints(&self) -> Vec<CheckpointSummary> {
        let entries = match fs::read_dir(&self.checkpoints_dir) {
            Ok(entries) => entries,
            Err(err) => {
                if err.kind() != IoErrorKind::NotFound {
                    warn!(dir = %self.checkpoints_dir.display(), err = %err, "failed to list checkpoints");
                }
                return Vec::new();
            }
        };
        let mut summaries: Vec<CheckpointSummary> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| {
                path.is_file() && path.extension().is_some_and(|extension| extension == "json")
            })
            .filter_map(|path| match read_json::<CheckpointRecord>(&path) {
                Ok(record) => Some(CheckpointSummary {
                    checkpoint_id: record.checkpoint_id,
                    timestamp: record.timestamp,
                    phase: record.phase,
                    step: record.step,
                    agent_execution_count: record.agent_execution_count,
                }),
                Err(err) => {
                    warn!(path = %path.display(), err = %format!("{err:#}"), "skipping unreadable checkpoint");
                    None
                }
            })
            .collect();
        summaries.sort_by(|a, b| {
            b.timestamp
                .cmp(&a.timestamp)
                .then_with(|| b.checkpoint_id.cmp(&a.checkpoint_id))
        });
        summaries
    }

    /// Remove a checkpoint record and its snapshot.
    ///
    /// Returns false if the record is missing or either removal fails. When
    /// the deleted checkpoint was the latest, the pointer moves to the newest
    /// remaining checkpoint.
    #[instrument(skip_all, fields(task_id = %self.task_id, checkpoint_id = %checkpoint_id))]
    pub fn delete_checkpoint(&self, checkpoint_id: &str) -> bool {
        if !is_valid_checkpoint_id(checkpoint_id) {
            warn!("invalid checkpoint id, nothing deleted");
            return false;
        }
        let mut ok = true;
        if let Err(err) = fs::remove_file(self.record_path(checkpoint_id)) {
            warn!(err = %err, "failed to remove checkpoint record");
            ok = false;
        }
        if let Err(err) = remove_dir_if_exists(&self.snapshot_dir(checkpoint_id)) {
            warn!(err = %format!("{err:#}"), "failed to remove output snapshot");
            ok = false;
        }
        if let Err(err) = self.repoint_latest_after_delete(checkpoint_id) {
            warn!(err = %format!("{err:#}"), "failed to update latest pointer");
            ok = false;
        }
        if ok {
            info!("checkpoint deleted");
        }
        ok
    }

    fn repoint_latest_after_delete(&self, deleted: &str) -> Result<()> {
        let pointer = self.latest_path();
        let current = match fs::read_to_string(&pointer) {
            Ok(contents) => contents.trim().to_string(),
            Err(err) if err.kind() == IoErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err).with_context(|| format!("read {}", pointer.display())),
        };
        if current != deleted {
            return Ok(());
        }
        match self.list_checkpoints().into_iter().next() {
            Some(newest) => write_atomic(&pointer, &format!("{}\n", newest.checkpoint_id)),
            None => fs::remove_file(&pointer).with_context(|| format!("remove {}", pointer.display())),
        }
    }

    /// Keep the `keep_count` newest checkpoints and delete the rest.
    /// Returns how many were deleted.
    #[instrument(skip_all, fields(task_id = %self.task_id, keep_count))]
    pub fn cleanup_old_checkpoints(&self, keep_count: usize) -> usize {
        let stale: Vec<CheckpointSummary> = self
            .list_checkpoints()
            .into_iter()
            .skip(keep_count)
            .collect();
        let deleted = stale
            .iter()
            .filter(|summary| self.delete_checkpoint(&summary.checkpoint_id))
            .count();
        info!(deleted, kept = keep_count, "checkpoint cleanup finished");
        deleted
    }

    pub fn get_recovery_info(&self) -> RecoveryInfo {
        let checkpoints = self.list_checkpoints();
        let latest_checkpoint = self.latest_checkpoint_id();
        RecoveryInfo {
            task_id: self.task_id.clone(),
            checkpoints_available: checkpoints.len(),
            can_resume: self.enabled && latest_checkpoint.is_some(),
            latest_checkpoint,
            checkpoints_dir: self.checkpoints_dir.clone(),
            outputs_dir: self.outputs_dir.clone(),
        }
    }
}

/// Keep ids usable as file names.
/// True when `id` can name a checkpoint: non-empty and only ASCII letters,
/// digits, `-` and `_`. Anything else could resolve outside the checkpoints
/// directory once joined into a path.
pub fn is_valid_checkpoint_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

fn sanitize_component(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "unnamed".to_string()
    } else {
        cleaned
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
