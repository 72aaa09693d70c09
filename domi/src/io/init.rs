//! Canonical project paths and `domi init` scaffolding.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};

use super::config::{DomiConfig, write_config};

/// Fixed paths of a project root. The config file location never depends on
/// the config itself.
#[derive(Debug, Clone)]
pub struct DomiPaths {
    pub root: PathBuf,
    pub domi_dir: PathBuf,
    pub config_path: PathBuf,
    pub gitignore_path: PathBuf,
}

impl DomiPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let domi_dir = root.join(".domi");
        Self {
            root: root.clone(),
            domi_dir: domi_dir.clone(),
            config_path: domi_dir.join("config.toml"),
            gitignore_path: root.join(".gitignore"),
        }
    }

    /// Task-specific directories for `task_id` under the configured roots.
    pub fn task(&self, cfg: &DomiConfig, task_id: &str) -> TaskPaths {
        let checkpoints_dir = self.root.join(&cfg.checkpoints_root).join(task_id);
        TaskPaths {
            task_id: task_id.to_string(),
            task_file: self
                .root
                .join(&cfg.tasks_dir)
                .join(format!("{task_id}.md")),
            outputs_dir: self.root.join(&cfg.outputs_root).join(task_id),
            micro_dir: checkpoints_dir.join("micro_checkpoints"),
            checkpoints_dir,
        }
    }
}

/// Directories owned by one research task.
#[derive(Debug, Clone)]
pub struct TaskPaths {
    pub task_id: String,
    /// Task description (`<tasks_dir>/<task_id>.md`).
    pub task_file: PathBuf,
    /// Live output tree, snapshotted by every checkpoint.
    pub outputs_dir: PathBuf,
    pub checkpoints_dir: PathBuf,
    pub micro_dir: PathBuf,
}

/// Options for `init_project`.
#[derive(Debug, Clone)]
pub struct InitOptions {
    /// If true, overwrite existing domi-owned files.
    pub force: bool,
}

/// Create `.domi/config.toml`, the tasks directory and a placeholder task
/// for the default task id.
///
/// Fails if `.domi/` already exists unless `options.force` is set.
pub fn init_project(root: &Path, options: &InitOptions) -> Result<DomiPaths> {
    let paths = DomiPaths::new(root);
    if paths.domi_dir.exists() && !options.force {
        return Err(anyhow!("domi init: .domi already exists (use --force to overwrite)"));
    }
    if paths.domi_dir.exists() && !paths.domi_dir.is_dir() {
        return Err(anyhow!("domi init: .domi exists but is not a directory"));
    }

    let cfg = DomiConfig::default();
    create_dir(&paths.domi_dir)?;
    write_config(&paths.config_path, &cfg)?;

    let task = paths.task(&cfg, &cfg.task_id);
    if let Some(tasks_dir) = task.task_file.parent() {
        create_dir(tasks_dir)?;
    }
    if options.force || !task.task_file.exists() {
        write_file(&task.task_file, TASK_PLACEHOLDER)?;
    }
    if !paths.gitignore_path.exists() {
        write_file(&paths.gitignore_path, PROJECT_GITIGNORE)?;
    }
    Ok(paths)
}

fn create_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).with_context(|| format!("create directory {}", path.display()))
}

fn write_file(path: &Path, contents: &str) -> Result<()> {
    fs::write(path, contents).with_context(|| format!("write file {}", path.display()))
}

const TASK_PLACEHOLDER: &str = "# Research Task\n\nDescribe the research question, data sources and success criteria here.\n";
const PROJECT_GITIGNORE: &str = "checkpoints/\noutputs/\n";
