//! End-to-end driver runs with scripted agents.

use std::sync::Arc;

use domi::core::operation::Step;
use domi::core::phase::Phase;
use domi::core::phase_machine::PhaseMachine;
use domi::core::session::{ExecutionStatus, SessionState, ValidationStatus};
use domi::driver::{AgentRegistry, DriverSettings, StopReason, WorkflowDriver};
use domi::test_support::{ScriptedAgent, TestProject};
use serde_json::json;

const WORKERS: [&str; 4] = [
    "Chief_Researcher",
    "Orchestrator",
    "Coder_Agent",
    "Experiment_Executor",
];
const VALIDATORS: [&str; 3] = ["Junior_Validator", "Senior_Validator", "Meta_Validator"];

fn approving_team() -> AgentRegistry {
    let mut agents = AgentRegistry::new();
    for role in WORKERS {
        agents.register(role, Arc::new(ScriptedAgent::succeeding()));
    }
    for role in VALIDATORS {
        agents.register(
            role,
            Arc::new(ScriptedAgent::validations([ValidationStatus::Approved])),
        );
    }
    agents
}

fn settings(checkpoint_interval: u32, auto_resume: bool) -> DriverSettings {
    DriverSettings {
        checkpoint_interval,
        max_transitions: 200,
        auto_resume,
    }
}

fn driver(project: &TestProject, agents: AgentRegistry, settings: DriverSettings) -> WorkflowDriver {
    WorkflowDriver::new(
        PhaseMachine::standard(),
        project.checkpoint_store(true),
        Arc::new(project.micro_store()),
        agents,
        settings,
    )
}

/// Verifies an approving team walks every phase once and ends in the final
/// report with a `final` checkpoint.
#[tokio::test]
async fn approving_team_completes_the_workflow() {
    let project = TestProject::new().expect("project");
    let mut driver = driver(&project, approving_team(), settings(1, false));

    let outcome = driver.run(SessionState::new("sample_research_task")).await;

    assert!(outcome.is_complete(), "stopped with {:?}", outcome.stop);
    assert_eq!(outcome.final_phase, Phase::FinalReport);
    assert_eq!(outcome.transitions, 18);

    let checkpoints = driver.checkpoints().list_checkpoints();
    assert_eq!(checkpoints.len(), 18);
    let newest = &checkpoints[0];
    assert_eq!(newest.phase, "final_report");
    assert_eq!(newest.step, "final");
    assert_eq!(outcome.last_checkpoint.as_deref(), Some(newest.checkpoint_id.as_str()));
    assert_eq!(newest.agent_execution_count, 18);
}

#[tokio::test]
async fn checkpoint_interval_counts_agent_executions() {
    let project = TestProject::new().expect("project");
    let mut driver = driver(&project, approving_team(), settings(3, false));

    let outcome = driver.run(SessionState::new("sample_research_task")).await;

    assert!(outcome.is_complete());
    let counts: Vec<u64> = driver
        .checkpoints()
        .list_checkpoints()
        .iter()
        .map(|summary| summary.agent_execution_count)
        .collect();
    assert_eq!(counts, vec![18, 15, 12, 9, 6, 3]);
}

/// Verifies repeated rejection revises within the iteration budget and then
/// rolls back to planning, after which an approval moves on.
#[tokio::test]
async fn rejections_revise_then_roll_back() {
    let project = TestProject::new().expect("project");
    let chief = Arc::new(ScriptedAgent::succeeding());
    let junior = Arc::new(ScriptedAgent::validations([
        ValidationStatus::Rejected,
        ValidationStatus::Rejected,
        ValidationStatus::Rejected,
        ValidationStatus::Approved,
    ]));
    let mut agents = AgentRegistry::new();
    agents.register("Chief_Researcher", chief.clone());
    agents.register("Junior_Validator", junior.clone());
    agents.register(
        "Meta_Validator",
        Arc::new(ScriptedAgent::validations([ValidationStatus::Pending])),
    );
    let mut driver = driver(&project, agents, settings(1, false));

    let outcome = driver.run(SessionState::new("sample_research_task")).await;

    assert_eq!(
        chief.phases(),
        vec![
            Phase::ResearchPlanning,
            Phase::ResearchRefinement,
            Phase::ResearchRefinement,
            Phase::ResearchPlanning,
        ]
    );
    assert_eq!(junior.phases().len(), 4);
    assert!(matches!(
        outcome.stop,
        StopReason::Halted { phase: Phase::ResearchParallelValidation, .. }
    ));
    assert_eq!(outcome.transitions, 9);
    assert!(outcome.state.phase_iterations.is_empty());

    let checkpoints = driver.checkpoints().list_checkpoints();
    let rollbacks: Vec<_> = checkpoints
        .iter()
        .filter(|summary| summary.step == "rollback")
        .collect();
    assert_eq!(rollbacks.len(), 1);
    assert_eq!(rollbacks[0].phase, "research_validation");
    let revisions = checkpoints
        .iter()
        .filter(|summary| summary.step == "revise")
        .count();
    assert_eq!(revisions, 2);
}

/// Verifies resuming from a mid-run checkpoint restores the outputs it
/// captured and continues at the phase recorded in its session state.
#[tokio::test]
async fn resume_restores_outputs_and_continues() {
    let project = TestProject::new().expect("project");
    let chief = Arc::new(ScriptedAgent::succeeding().writing(
        &project.task.outputs_dir,
        "research_plan.md",
        "plan from ",
    ));
    let mut agents = AgentRegistry::new();
    agents.register("Chief_Researcher", chief.clone());
    agents.register(
        "Junior_Validator",
        Arc::new(ScriptedAgent::validations([ValidationStatus::Pending])),
    );
    let mut first = driver(&project, agents, settings(1, false));
    let halted = first.run(SessionState::new("sample_research_task")).await;
    assert!(matches!(halted.stop, StopReason::Halted { .. }));

    let after_planning = first
        .checkpoints()
        .list_checkpoints()
        .into_iter()
        .find(|summary| summary.phase == "research_planning" && summary.step == "complete")
        .expect("planning checkpoint");
    project
        .write_output("research_plan.md", "tampered")
        .expect("tamper");

    let resumed_chief = Arc::new(ScriptedAgent::succeeding());
    let junior = Arc::new(ScriptedAgent::validations([ValidationStatus::Approved]));
    let mut agents = AgentRegistry::new();
    agents.register("Chief_Researcher", resumed_chief.clone());
    agents.register("Junior_Validator", junior.clone());
    agents.register(
        "Meta_Validator",
        Arc::new(ScriptedAgent::validations([ValidationStatus::Pending])),
    );
    let mut second = driver(&project, agents, settings(1, false));
    let outcome = second
        .resume(Some(&after_planning.checkpoint_id))
        .await
        .expect("checkpoint loads");

    assert_eq!(
        project.read_output("research_plan.md").as_deref(),
        Some("plan from research_planning")
    );
    assert!(resumed_chief.phases().is_empty());
    assert_eq!(junior.phases(), vec![Phase::ResearchValidation]);
    assert!(matches!(
        outcome.stop,
        StopReason::Halted { phase: Phase::ResearchParallelValidation, .. }
    ));
    assert!(
        second
            .checkpoints()
            .agent_execution_count()
            > after_planning.agent_execution_count
    );
}

/// Verifies a run that rolled back into ERROR resumes from its latest
/// checkpoint at the restart point for the failed phase instead of halting.
#[tokio::test]
async fn resume_after_error_restarts_through_recovery() {
    let project = TestProject::new().expect("project");
    let mut agents = AgentRegistry::new();
    agents.register(
        "Chief_Researcher",
        Arc::new(ScriptedAgent::failing("model unavailable")),
    );
    let mut first = driver(&project, agents, settings(1, false));
    let failed = first.run(SessionState::new("sample_research_task")).await;
    assert_eq!(failed.final_phase, Phase::Error);

    let chief = Arc::new(ScriptedAgent::succeeding());
    let mut agents = AgentRegistry::new();
    agents.register("Chief_Researcher", chief.clone());
    agents.register(
        "Junior_Validator",
        Arc::new(ScriptedAgent::validations([ValidationStatus::Pending])),
    );
    let mut second = driver(&project, agents, settings(1, false));
    let restored = second.restore(None).expect("latest checkpoint");
    assert_eq!(restored.current_phase, Phase::ResearchPlanning);
    assert_eq!(restored.execution.status, ExecutionStatus::Pending);
    assert_eq!(restored.execution.error_details, None);
    let recovered = &restored.metadata["recovered_from"];
    assert_eq!(recovered["phase"], json!("research_planning"));
    assert!(
        recovered["error_details"]
            .as_str()
            .is_some_and(|details| details.contains("model unavailable"))
    );

    let outcome = second.run(restored).await;
    assert_eq!(chief.phases(), vec![Phase::ResearchPlanning]);
    assert!(matches!(
        outcome.stop,
        StopReason::Halted { phase: Phase::ResearchValidation, .. }
    ));
}

#[tokio::test]
async fn resume_of_unknown_checkpoint_is_none() {
    let project = TestProject::new().expect("project");
    let mut driver = driver(&project, approving_team(), settings(1, false));
    assert!(driver.resume(Some("missing_checkpoint")).await.is_none());
    assert!(driver.resume(None).await.is_none());
}

/// Verifies restore with auto-resume hands the newest interrupted operation
/// to the next agent through the session state.
#[tokio::test]
async fn auto_resume_marks_the_interrupted_operation() {
    let project = TestProject::new().expect("project");
    let mut store = project.checkpoint_store(true);
    let mut state = SessionState::new("sample_research_task");
    state.current_phase = Phase::ResearchValidation;
    let checkpoint_id = store
        .create_checkpoint("research_planning", "complete", &state, None)
        .expect("checkpoint");

    let micro = project.micro_store();
    micro
        .start_operation(
            "Junior_Validator_research_validation_20240102_030405",
            "Junior_Validator",
            vec![Step::new("invoke", "agent_invocation", "Junior_Validator in research_validation")],
            None,
        )
        .expect("start");

    let mut with_resume = driver(&project, AgentRegistry::new(), settings(1, true));
    let restored = with_resume.restore(Some(&checkpoint_id)).expect("restore");
    assert_eq!(restored.current_phase, Phase::ResearchValidation);
    assert_eq!(
        restored.active_operation.as_deref(),
        Some("Junior_Validator_research_validation_20240102_030405")
    );

    let mut without_resume = driver(&project, AgentRegistry::new(), settings(1, false));
    let restored = without_resume
        .restore(Some(&checkpoint_id))
        .expect("restore");
    assert_eq!(restored.active_operation, None);
}
