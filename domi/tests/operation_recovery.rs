//! Micro-checkpointed operations: retries, partial failure and resume.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Result, anyhow, bail};
use domi::core::operation::{ResumePolicy, Step};
use domi::executor::{OperationBuilder, OperationExecutor, StepContext, StepResult};
use domi::io::micro_store::{MicroCheckpointStore, StepPhase};
use domi::test_support::TestProject;
use serde_json::{Map, Value, json};

fn executor(store: MicroCheckpointStore) -> OperationExecutor {
    OperationExecutor::new(Arc::new(store), Duration::from_secs(30))
}

fn config(entries: &[(&str, Value)]) -> Map<String, Value> {
    entries
        .iter()
        .map(|(key, value)| (key.to_string(), value.clone()))
        .collect()
}

fn set(ids: &[&str]) -> BTreeSet<String> {
    ids.iter().map(|id| id.to_string()).collect()
}

/// Verifies a permanently failing experiment is attempted exactly
/// `max_retries + 1` times while its siblings still complete.
#[tokio::test]
async fn experiment_failure_is_isolated() {
    let project = TestProject::new().expect("project");
    let executor = executor(project.micro_store());
    let plan = OperationBuilder::experiment_execution(
        "execute_experiments_42",
        "Experiment_Executor",
        vec![
            config(&[("name", json!("e1"))]),
            config(&[("name", json!("e2")), ("max_retries", json!(1))]),
            config(&[("name", json!("e3"))]),
        ],
    )
    .build();
    let e2_attempts = AtomicU32::new(0);

    let report = executor
        .execute(plan, |ctx: StepContext| {
            let e2_attempts = &e2_attempts;
            async move {
                if ctx.input("name") == Some(&json!("e2")) {
                    e2_attempts.fetch_add(1, Ordering::SeqCst);
                    bail!("backtest diverged");
                }
                Ok(ctx.step.step_id)
            }
        })
        .await
        .expect("execute");

    assert_eq!(e2_attempts.load(Ordering::SeqCst), 2);
    assert_eq!(
        report.progress.completed_steps,
        set(&["experiment_0", "experiment_2"])
    );
    assert_eq!(report.progress.failed_steps, set(&["experiment_1"]));
    assert!(!report.is_success());
    let failed = report.failed();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].0, "experiment_1");
    assert_eq!(failed[0].1.retry_count, 1);
    assert!(failed[0].1.error_message.contains("backtest diverged"));

    let store = executor.store();
    assert!(store.list_recoverable_operations().is_empty());
    let persisted = store
        .resume_operation("execute_experiments_42")
        .expect("persisted");
    assert_eq!(persisted, report.progress);
}

#[tokio::test]
async fn partial_failure_reports_three_of_four() {
    let project = TestProject::new().expect("project");
    let executor = executor(project.micro_store());
    let plan = OperationBuilder::data_processing(
        "process_prices",
        "Data_Engineer",
        (0..4)
            .map(|i| config(&[("name", json!(format!("stage {i}")))]))
            .collect(),
    )
    .build();

    let report = executor
        .execute(plan, |ctx: StepContext| async move {
            if ctx.step.step_id == "process_step_1" {
                return Err(anyhow!("missing column 'close'"));
            }
            Ok(())
        })
        .await
        .expect("execute");

    assert_eq!(report.progress.progress_label(), "3/4");
    assert_eq!(report.progress.failed_steps, set(&["process_step_1"]));
    match report.result("process_step_1") {
        Some(StepResult::Failed(info)) => assert_eq!(info.retry_count, 2),
        other => panic!("unexpected result {other:?}"),
    }
}

/// Verifies resume after an interruption runs only the step that never
/// started, leaving the completed and failed ones alone.
#[tokio::test]
async fn resume_runs_only_unstarted_steps() {
    let project = TestProject::new().expect("project");
    let steps = vec![
        Step::new("A", "data_processing", "load"),
        Step::new("B", "data_processing", "clean").with_max_retries(0),
        Step::new("C", "data_processing", "aggregate"),
    ];

    {
        let interrupted = project.micro_store();
        interrupted
            .start_operation("pipeline_7", "Data_Engineer", steps.clone(), None)
            .expect("start");
        let mut a = steps[0].clone();
        interrupted
            .step_context("pipeline_7", &mut a, || async { Ok(()) })
            .await
            .expect("A");
        let mut b = steps[1].clone();
        let failed: Result<()> = interrupted
            .step_context("pipeline_7", &mut b, || async { Err(anyhow!("bad rows")) })
            .await;
        assert!(failed.is_err());
    }

    let executor = executor(project.micro_store());
    let store = executor.store();
    let recoverable = store.list_recoverable_operations();
    assert_eq!(recoverable.len(), 1);
    assert_eq!(recoverable[0].operation_id, "pipeline_7");
    assert_eq!(recoverable[0].progress, "1/3");
    assert_eq!(recoverable[0].failed_steps_count, 1);
    let advice = store.operation_recovery_report();
    assert_eq!(advice[0].recommendation, "review error logs and retry failed steps");

    let ran = Mutex::new(Vec::new());
    let report = executor
        .resume("pipeline_7", |ctx: StepContext| {
            let ran = &ran;
            async move {
                ran.lock().expect("lock").push(ctx.step.step_id.clone());
                Ok(ctx.attempt)
            }
        })
        .await
        .expect("resumable");

    assert_eq!(*ran.lock().expect("lock"), vec!["C".to_string()]);
    assert_eq!(report.result("A"), Some(&StepResult::Skipped));
    assert_eq!(report.result("B"), Some(&StepResult::Skipped));
    assert_eq!(report.result("C"), Some(&StepResult::Completed(1)));
    assert_eq!(report.progress.completed_steps, set(&["A", "C"]));
    assert_eq!(report.progress.failed_steps, set(&["B"]));
    assert!(store.list_recoverable_operations().is_empty());
}

/// Verifies a step whose retry was cut off after its pre_execution record is
/// still open on reopen and resumes at the attempt that was interrupted.
#[tokio::test(start_paused = true)]
async fn interrupted_retry_keeps_the_operation_recoverable() {
    let project = TestProject::new().expect("project");
    let steps = vec![Step::new("s", "data_processing", "load").with_max_retries(2)];

    {
        let interrupted = project.micro_store();
        interrupted
            .start_operation("load_9", "Data_Engineer", steps.clone(), None)
            .expect("start");
        let mut s = steps[0].clone();
        let failed: Result<()> = interrupted
            .step_context("load_9", &mut s, || async { Err(anyhow!("connection reset")) })
            .await;
        assert!(failed.is_err());

        s.retry_count += 1;
        let cut_off = tokio::time::timeout(
            Duration::from_secs(1),
            interrupted.step_context("load_9", &mut s, std::future::pending::<Result<()>>),
        )
        .await;
        assert!(cut_off.is_err());
    }

    let executor = executor(project.micro_store());
    let recoverable = executor.store().list_recoverable_operations();
    assert_eq!(recoverable.len(), 1);
    assert_eq!(recoverable[0].progress, "0/1");

    let report = executor
        .resume("load_9", |ctx: StepContext| async move { Ok(ctx.attempt) })
        .await
        .expect("resumable");
    assert_eq!(report.result("s"), Some(&StepResult::Completed(2)));
    assert_eq!(report.progress.progress_label(), "1/1");
    assert!(report.progress.failed_steps.is_empty());
    assert!(executor.store().list_recoverable_operations().is_empty());
}

/// Verifies a failed attempt with retries left is not settled and resume
/// moves on to the next attempt instead of repeating the failed one.
#[tokio::test]
async fn failed_step_with_retries_left_resumes_at_next_attempt() {
    let project = TestProject::new().expect("project");
    let steps = vec![Step::new("s", "data_processing", "load").with_max_retries(1)];

    {
        let interrupted = project.micro_store();
        interrupted
            .start_operation("load_10", "Data_Engineer", steps.clone(), None)
            .expect("start");
        let mut s = steps[0].clone();
        let failed: Result<()> = interrupted
            .step_context("load_10", &mut s, || async { Err(anyhow!("connection reset")) })
            .await;
        assert!(failed.is_err());
    }

    let executor = executor(project.micro_store());
    assert_eq!(executor.store().list_recoverable_operations().len(), 1);

    let attempts = Mutex::new(Vec::new());
    let report = executor
        .resume("load_10", |ctx: StepContext| {
            let attempts = &attempts;
            async move {
                attempts.lock().expect("lock").push(ctx.attempt);
                Err::<u32, _>(anyhow!("still down"))
            }
        })
        .await
        .expect("resumable");
    assert_eq!(*attempts.lock().expect("lock"), vec![2]);
    match report.result("s") {
        Some(StepResult::Failed(info)) => assert_eq!(info.retry_count, 1),
        other => panic!("unexpected result {other:?}"),
    }
    assert!(executor.store().list_recoverable_operations().is_empty());
}

#[tokio::test]
async fn retry_failed_policy_reruns_failed_steps_with_fresh_budget() {
    let project = TestProject::new().expect("project");
    let executor = executor(MicroCheckpointStore::new(
        &project.task.micro_dir,
        true,
        ResumePolicy::RetryFailed,
    ));
    let plan = OperationBuilder::new("fetch_quotes", "Data_Engineer")
        .add_step(Step::new("fetch", "data_processing", "fetch quotes").with_max_retries(0))
        .build();
    let report = executor
        .execute(plan, |_ctx: StepContext| async { Err::<u32, _>(anyhow!("rate limited")) })
        .await
        .expect("execute");
    assert_eq!(report.progress.failed_steps, set(&["fetch"]));

    let store = executor.store();
    let recoverable = store.list_recoverable_operations();
    assert_eq!(recoverable.len(), 1);

    let report = executor
        .resume("fetch_quotes", |ctx: StepContext| async move { Ok(ctx.attempt) })
        .await
        .expect("resumable");
    assert_eq!(report.result("fetch"), Some(&StepResult::Completed(1)));
    assert!(report.is_success());
    assert!(store.list_recoverable_operations().is_empty());
}

/// Verifies the step record history of a step that failed once and then
/// succeeded on retry.
#[tokio::test]
async fn step_history_records_every_attempt() {
    let project = TestProject::new().expect("project");
    let executor = executor(project.micro_store());
    let plan = OperationBuilder::file_generation(
        "write_reports",
        "Coder_Agent",
        vec![config(&[("filename", json!("report.md"))])],
    )
    .build();

    let report = executor
        .execute(plan, |ctx: StepContext| async move {
            if ctx.attempt == 1 {
                bail!("disk busy");
            }
            Ok(ctx.attempt)
        })
        .await
        .expect("execute");
    assert_eq!(report.result("generate_file_0"), Some(&StepResult::Completed(2)));

    let history = executor
        .store()
        .get_step_checkpoints("write_reports", "generate_file_0");
    let phases: Vec<StepPhase> = history.iter().map(|checkpoint| checkpoint.phase).collect();
    assert_eq!(
        phases,
        vec![
            StepPhase::PreExecution,
            StepPhase::Failed,
            StepPhase::PreExecution,
            StepPhase::Completed,
        ]
    );
    let failed = &history[1];
    assert_eq!(failed.step.retry_count, 0);
    let error = failed.step.error_info.as_ref().expect("error info");
    assert!(error.error_message.contains("disk busy"));
    assert_eq!(history[3].step.retry_count, 1);
    assert!(history[3].step.error_info.is_none());
    assert_eq!(history[3].step.expected_outputs, vec!["report.md".to_string()]);
}

#[tokio::test]
async fn concurrent_steps_all_settle() {
    let project = TestProject::new().expect("project");
    let executor = executor(project.micro_store());
    let mut builder = OperationBuilder::new("parallel_features", "Coder_Agent");
    for i in 0..8 {
        builder = builder.add_step(
            Step::new(format!("feature_{i}"), "file_generation", format!("feature {i}"))
                .with_input("index", i)
                .with_max_retries(1),
        );
    }

    let report = executor
        .execute_concurrent(builder.build(), |ctx: StepContext| async move {
            tokio::task::yield_now().await;
            let index = ctx.input("index").and_then(Value::as_u64).unwrap_or_default();
            if index % 3 == 0 && ctx.attempt == 1 {
                bail!("transient failure on feature {index}");
            }
            Ok(index)
        })
        .await
        .expect("execute");

    assert!(report.is_success());
    let ids: Vec<&str> = report.results.iter().map(|(id, _)| id.as_str()).collect();
    assert_eq!(ids, (0..8).map(|i| format!("feature_{i}")).collect::<Vec<_>>());
    assert_eq!(report.result("feature_3").and_then(StepResult::value), Some(&3));

    let persisted = executor
        .store()
        .resume_operation("parallel_features")
        .expect("persisted");
    assert_eq!(persisted.completed_steps.len(), 8);
    assert!(persisted.failed_steps.is_empty());
}

#[tokio::test]
async fn disabled_micro_store_still_runs_steps() {
    let project = TestProject::new().expect("project");
    let executor = executor(MicroCheckpointStore::new(
        &project.task.micro_dir,
        false,
        ResumePolicy::SettleFailed,
    ));
    let plan = OperationBuilder::new("quick", "Coder_Agent")
        .add_step(Step::new("only", "file_generation", "only step"))
        .build();
    let report = executor
        .execute(plan, |_ctx: StepContext| async { Ok("done") })
        .await
        .expect("execute");

    assert!(report.is_success());
    assert!(!project.task.micro_dir.exists());
    assert!(executor.store().list_recoverable_operations().is_empty());
}
