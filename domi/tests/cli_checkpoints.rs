//! CLI tests for the checkpoint commands and `domi run`.
//!
//! Spawns the domi binary against a temp project and checks exit codes and
//! the files left behind.

use std::path::Path;
use std::process::{Command, Output};

use domi::core::operation::Step;
use domi::exit_codes;
use domi::io::config::AgentCommandConfig;
use domi::test_support::TestProject;
use serde_json::json;

fn domi(root: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_domi"))
        .arg("--root")
        .arg(root)
        .args(args)
        .env_remove("DOMI_TASK_ID")
        .env_remove("DOMI_ENABLE_CHECKPOINTING")
        .env_remove("DOMI_CHECKPOINT_INTERVAL")
        .env_remove("DOMI_AUTO_RESUME")
        .output()
        .expect("spawn domi")
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

#[test]
fn init_then_list_reports_no_checkpoints() {
    let temp = tempfile::tempdir().expect("tempdir");
    let init = domi(temp.path(), &["init"]);
    assert_eq!(init.status.code(), Some(exit_codes::OK));
    assert!(temp.path().join(".domi/config.toml").is_file());
    assert!(temp.path().join("tasks/sample_research_task.md").is_file());

    let again = domi(temp.path(), &["init"]);
    assert_eq!(again.status.code(), Some(exit_codes::INVALID));

    let list = domi(temp.path(), &["list"]);
    assert_eq!(list.status.code(), Some(exit_codes::OK));
    assert!(stdout(&list).contains("no checkpoints for task sample_research_task"));
}

#[test]
fn delete_of_unknown_checkpoint_is_not_found() {
    let project = TestProject::new().expect("project");
    let output = domi(project.root(), &["delete", "research_planning_complete_20240101_000000"]);
    assert_eq!(output.status.code(), Some(exit_codes::NOT_FOUND));
}

/// Verifies ids that look like paths are refused before touching the disk.
#[test]
fn path_like_checkpoint_ids_are_invalid() {
    let project = TestProject::new().expect("project");
    let outside = project.root().join("x.json");
    std::fs::write(&outside, "{}").expect("write");

    let deleted = domi(project.root(), &["delete", "../../x"]);
    assert_eq!(deleted.status.code(), Some(exit_codes::INVALID));
    assert!(String::from_utf8_lossy(&deleted.stderr).contains("invalid checkpoint id: ../../x"));
    assert!(outside.is_file());

    let resumed = domi(project.root(), &["run", "--resume-from", "../../x"]);
    assert_eq!(resumed.status.code(), Some(exit_codes::INVALID));
}

#[test]
fn delete_and_cleanup_remove_checkpoints() {
    let project = TestProject::new().expect("project");
    let mut store = project.checkpoint_store(true);
    let ids: Vec<String> = (0..4)
        .map(|i| {
            store
                .create_checkpoint("research_planning", &format!("s{i}"), &json!({}), None)
                .expect("checkpoint")
        })
        .collect();

    let deleted = domi(project.root(), &["delete", &ids[0]]);
    assert_eq!(deleted.status.code(), Some(exit_codes::OK));
    assert!(!store.record_path(&ids[0]).exists());

    let cleanup = domi(project.root(), &["cleanup", "--keep", "1"]);
    assert_eq!(cleanup.status.code(), Some(exit_codes::OK));
    assert!(stdout(&cleanup).contains("deleted 2 checkpoints"));
    let remaining: Vec<String> = store
        .list_checkpoints()
        .into_iter()
        .map(|summary| summary.checkpoint_id)
        .collect();
    assert_eq!(remaining, vec![ids[3].clone()]);
}

#[test]
fn run_with_missing_task_is_not_found() {
    let project = TestProject::new().expect("project");
    let output = domi(project.root(), &["--task-id", "nope", "run"]);
    assert_eq!(output.status.code(), Some(exit_codes::NOT_FOUND));
}

#[test]
fn resume_without_checkpoints_is_not_found() {
    let project = TestProject::new().expect("project");
    let output = domi(project.root(), &["run", "--resume"]);
    assert_eq!(output.status.code(), Some(exit_codes::NOT_FOUND));
    let output = domi(project.root(), &["run", "--resume-from", "nothing_here"]);
    assert_eq!(output.status.code(), Some(exit_codes::NOT_FOUND));
}

#[test]
fn run_without_agents_halts() {
    let project = TestProject::new().expect("project");
    let output = domi(project.root(), &["run"]);
    assert_eq!(output.status.code(), Some(exit_codes::HALTED));
    assert!(String::from_utf8_lossy(&output.stderr).contains("no agent registered for role Chief_Researcher"));
}

#[test]
fn config_prints_effective_toml() {
    let project = TestProject::new().expect("project");
    let output = Command::new(env!("CARGO_BIN_EXE_domi"))
        .arg("--root")
        .arg(project.root())
        .arg("config")
        .env("DOMI_CHECKPOINT_INTERVAL", "4")
        .output()
        .expect("spawn domi");
    assert_eq!(output.status.code(), Some(exit_codes::OK));
    let printed: domi::io::config::DomiConfig =
        toml::from_str(&stdout(&output)).expect("valid toml");
    assert_eq!(printed.checkpoint.interval, 4);
    assert_eq!(printed.task_id, "sample_research_task");
}

#[test]
fn invalid_env_override_is_invalid() {
    let project = TestProject::new().expect("project");
    let output = Command::new(env!("CARGO_BIN_EXE_domi"))
        .arg("--root")
        .arg(project.root())
        .arg("info")
        .env("DOMI_ENABLE_CHECKPOINTING", "sometimes")
        .output()
        .expect("spawn domi");
    assert_eq!(output.status.code(), Some(exit_codes::INVALID));
}

#[test]
fn operations_lists_interrupted_work() {
    let project = TestProject::new().expect("project");
    project
        .micro_store()
        .start_operation(
            "Coder_Agent_coding_implementation_1",
            "Coder_Agent",
            vec![Step::new("invoke", "agent_invocation", "Coder_Agent in coding_implementation")],
            None,
        )
        .expect("start");

    let output = domi(project.root(), &["operations", "--cleanup-days", "7"]);
    assert_eq!(output.status.code(), Some(exit_codes::OK));
    let printed = stdout(&output);
    assert!(printed.contains("removed 0 completed operations older than 7 days"));
    assert!(printed.contains("Coder_Agent_coding_implementation_1\tCoder_Agent\t0/1"));
    assert!(printed.contains("resume from last checkpoint"));
}

/// Verifies a full run with shell agents, then resume from a mid-run
/// checkpoint, through the binary.
#[cfg(unix)]
#[test]
fn shell_agents_complete_and_resume() {
    let mut project = TestProject::new().expect("project");
    let worker = "cat > /dev/null; echo \"$DOMI_ROLE $DOMI_PHASE\" >> \"$DOMI_OUTPUTS_DIR/journal.txt\"";
    let validator = "cat > /dev/null; printf '{\"validation_status\":\"approved\"}' > \"$DOMI_STATUS_PATH\"";
    let mut config = project.config.clone();
    for (role, script) in [
        ("Chief_Researcher", worker),
        ("Orchestrator", worker),
        ("Coder_Agent", worker),
        ("Experiment_Executor", worker),
        ("Junior_Validator", validator),
        ("Senior_Validator", validator),
        ("Meta_Validator", validator),
    ] {
        config.agents.insert(
            role.to_string(),
            AgentCommandConfig {
                command: vec!["sh".to_string(), "-c".to_string(), script.to_string()],
                timeout_secs: 30,
                ..AgentCommandConfig::default()
            },
        );
    }
    project.save_config(config).expect("save config");

    let run = domi(project.root(), &["run"]);
    assert_eq!(
        run.status.code(),
        Some(exit_codes::OK),
        "stderr: {}",
        String::from_utf8_lossy(&run.stderr)
    );
    assert!(stdout(&run).contains("completed in final_report after 18 transitions"));
    let journal = project.read_output("journal.txt").expect("journal");
    assert_eq!(journal.lines().count(), 12);
    assert!(journal.starts_with("Chief_Researcher research_planning\n"));
    assert!(journal.ends_with("Chief_Researcher final_report\n"));
    assert!(project.task.outputs_dir.join("logs/research_planning.log").is_file());

    let store = project.checkpoint_store(true);
    let checkpoints = store.list_checkpoints();
    assert_eq!(checkpoints.len(), 18);
    let planning = checkpoints
        .iter()
        .find(|summary| summary.phase == "research_planning")
        .expect("planning checkpoint");

    let resumed = domi(project.root(), &["run", "--resume-from", &planning.checkpoint_id]);
    assert_eq!(resumed.status.code(), Some(exit_codes::OK));
    assert!(stdout(&resumed).contains("after 17 transitions"));
    let journal = project.read_output("journal.txt").expect("journal");
    assert_eq!(journal.lines().count(), 12);
    assert!(journal.starts_with("Chief_Researcher research_planning\nOrchestrator orchestration_planning\n"));

    let info = domi(project.root(), &["info"]);
    assert_eq!(info.status.code(), Some(exit_codes::OK));
    assert!(stdout(&info).contains("can_resume: true"));
    assert!(stdout(&info).contains("recoverable_operations: 0"));
}
