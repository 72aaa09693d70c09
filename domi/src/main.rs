//! Checkpointed research workflow runner.
//!
//! Drives a research task through its phases with one command-backed agent
//! per role, and gives operators tooling over the task's checkpoints
//! (`checkpoints/<task_id>/`) and interrupted operations.

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};

use domi::driver::StopReason;
use domi::exit_codes;
use domi::io::checkpoint_store::is_valid_checkpoint_id;
use domi::io::config::render_config;
use domi::io::init::{InitOptions, init_project};
use domi::logging;
use domi::workflow::{RunOutcome, StartFrom, Workspace, run_task};

#[derive(Parser)]
#[command(
    name = "domi",
    version,
    about = "Checkpointed research workflow runner"
)]
struct Cli {
    /// Project root containing `.domi/config.toml`.
    #[arg(long, global = true, default_value = ".")]
    root: PathBuf,

    /// Task to operate on (defaults to `task_id` from the config).
    #[arg(long, global = true)]
    task_id: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create `.domi/config.toml` and a placeholder task.
    Init {
        /// Overwrite existing files.
        #[arg(short, long)]
        force: bool,
    },
    /// List checkpoints of the task, newest first.
    List,
    /// Show what a resume would start from.
    Info,
    /// Run the workflow, optionally resuming from a checkpoint.
    Run {
        /// Resume from the latest checkpoint.
        #[arg(long, conflicts_with = "resume_from")]
        resume: bool,
        /// Resume from a specific checkpoint id.
        #[arg(long, value_name = "CHECKPOINT_ID")]
        resume_from: Option<String>,
    },
    /// Delete one checkpoint and its output snapshot.
    Delete { checkpoint_id: String },
    /// Keep only the most recent checkpoints.
    Cleanup {
        /// Number of checkpoints to keep (default: `checkpoint.keep_count`).
        #[arg(long)]
        keep: Option<usize>,
    },
    /// List interrupted operations with a suggested next action.
    Operations {
        /// Also delete completed operations older than this many days.
        #[arg(long, value_name = "DAYS")]
        cleanup_days: Option<u32>,
    },
    /// Print the effective configuration.
    Config,
}

fn main() {
    logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let task_id = cli.task_id.as_deref();
    match cli.command {
        Command::Init { force } => cmd_init(&cli.root, force),
        Command::List => cmd_list(&Workspace::open(&cli.root, task_id)?),
        Command::Info => cmd_info(&Workspace::open(&cli.root, task_id)?),
        Command::Run {
            resume,
            resume_from,
        } => {
            let start = match (resume, resume_from) {
                (_, Some(id)) if !is_valid_checkpoint_id(&id) => {
                    eprintln!("invalid checkpoint id: {id}");
                    return Ok(exit_codes::INVALID);
                }
                (_, Some(id)) => StartFrom::Checkpoint(id),
                (true, None) => StartFrom::LatestCheckpoint,
                (false, None) => StartFrom::Fresh,
            };
            cmd_run(&Workspace::open(&cli.root, task_id)?, start)
        }
        Command::Delete { checkpoint_id } => {
            cmd_delete(&Workspace::open(&cli.root, task_id)?, &checkpoint_id)
        }
        Command::Cleanup { keep } => cmd_cleanup(&Workspace::open(&cli.root, task_id)?, keep),
        Command::Operations { cleanup_days } => {
            cmd_operations(&Workspace::open(&cli.root, task_id)?, cleanup_days)
        }
        Command::Config => {
            let ws = Workspace::open(&cli.root, task_id)?;
            print!("{}", render_config(&ws.config)?);
            Ok(exit_codes::OK)
        }
    }
}

fn cmd_init(root: &std::path::Path, force: bool) -> Result<i32> {
    let paths = init_project(root, &InitOptions { force })?;
    println!("initialized {}", paths.config_path.display());
    Ok(exit_codes::OK)
}

fn cmd_list(ws: &Workspace) -> Result<i32> {
    let checkpoints = ws.checkpoint_store().list_checkpoints();
    if checkpoints.is_empty() {
        println!("no checkpoints for task {}", ws.task.task_id);
        return Ok(exit_codes::OK);
    }
    for summary in checkpoints {
        println!(
            "{}\t{}\t{}\t{}\tagents={}",
            summary.checkpoint_id,
            summary.timestamp.to_rfc3339(),
            summary.phase,
            summary.step,
            summary.agent_execution_count
        );
    }
    Ok(exit_codes::OK)
}

fn cmd_info(ws: &Workspace) -> Result<i32> {
    let info = ws.checkpoint_store().get_recovery_info();
    println!("task_id: {}", info.task_id);
    println!("checkpoints_available: {}", info.checkpoints_available);
    println!(
        "latest_checkpoint: {}",
        info.latest_checkpoint.as_deref().unwrap_or("none")
    );
    println!("can_resume: {}", info.can_resume);
    println!("checkpoints_dir: {}", info.checkpoints_dir.display());
    println!("outputs_dir: {}", info.outputs_dir.display());
    println!(
        "recoverable_operations: {}",
        ws.micro_store().list_recoverable_operations().len()
    );
    Ok(exit_codes::OK)
}

fn cmd_run(ws: &Workspace, start: StartFrom) -> Result<i32> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("start async runtime")?;
    let outcome = runtime.block_on(run_task(ws, ws.command_agents(), start))?;
    match outcome {
        RunOutcome::MissingTask(path) => {
            eprintln!("task file not found: {}", path.display());
            Ok(exit_codes::NOT_FOUND)
        }
        RunOutcome::MissingCheckpoint(id) => {
            match id {
                Some(id) => eprintln!("checkpoint not found or unreadable: {id}"),
                None => eprintln!("no checkpoint to resume for task {}", ws.task.task_id),
            }
            Ok(exit_codes::NOT_FOUND)
        }
        RunOutcome::Finished(outcome) => {
            let checkpoint = outcome.last_checkpoint.as_deref().unwrap_or("none");
            match &outcome.stop {
                StopReason::Complete => {
                    println!(
                        "completed in {} after {} transitions (checkpoint {checkpoint})",
                        outcome.final_phase, outcome.transitions
                    );
                    Ok(exit_codes::OK)
                }
                StopReason::Halted { phase, reason } => {
                    eprintln!("halted in {phase}: {reason} (checkpoint {checkpoint})");
                    Ok(exit_codes::HALTED)
                }
                StopReason::BudgetExhausted => {
                    eprintln!(
                        "stopped after {} transitions in {} (checkpoint {checkpoint})",
                        outcome.transitions, outcome.final_phase
                    );
                    Ok(exit_codes::HALTED)
                }
            }
        }
    }
}

fn cmd_delete(ws: &Workspace, checkpoint_id: &str) -> Result<i32> {
    if !is_valid_checkpoint_id(checkpoint_id) {
        eprintln!("invalid checkpoint id: {checkpoint_id}");
        return Ok(exit_codes::INVALID);
    }
    let store = ws.checkpoint_store();
    if !store.record_path(checkpoint_id).is_file() {
        eprintln!("checkpoint not found: {checkpoint_id}");
        return Ok(exit_codes::NOT_FOUND);
    }
    if !store.delete_checkpoint(checkpoint_id) {
        bail!("failed to delete checkpoint {checkpoint_id}");
    }
    println!("deleted {checkpoint_id}");
    Ok(exit_codes::OK)
}

fn cmd_cleanup(ws: &Workspace, keep: Option<usize>) -> Result<i32> {
    let keep = keep.unwrap_or(ws.config.checkpoint.keep_count);
    let deleted = ws.checkpoint_store().cleanup_old_checkpoints(keep);
    println!("deleted {deleted} checkpoints, kept up to {keep}");
    Ok(exit_codes::OK)
}

fn cmd_operations(ws: &Workspace, cleanup_days: Option<u32>) -> Result<i32> {
    let micro = ws.micro_store();
    if let Some(days) = cleanup_days {
        let removed = micro.cleanup_completed_operations(days);
        println!("removed {removed} completed operations older than {days} days");
    }
    let report = micro.operation_recovery_report();
    if report.is_empty() {
        println!("no recoverable operations");
        return Ok(exit_codes::OK);
    }
    for advice in report {
        let operation = &advice.operation;
        println!(
            "{}\t{}\t{}\tfailed={}\tcurrent={}\t{}",
            operation.operation_id,
            operation.agent_name,
            operation.progress,
            operation.failed_steps_count,
            operation.current_step.as_deref().unwrap_or("-"),
            advice.recommendation
        );
    }
    Ok(exit_codes::OK)
}
