//! The standard research workflow graph.

use super::phase::{Phase, PhaseConfig, ValidationCriteria};

const VALIDATORS: &[&str] = &["Senior_Validator"];

/// Phase configurations for the standard workflow, in workflow order.
pub fn standard_phase_configs() -> Vec<PhaseConfig> {
    vec![
        // Research loop
        PhaseConfig {
            phase: Phase::ResearchPlanning,
            primary_role: "Chief_Researcher",
            supporting_roles: &[],
            valid_tasks: &[
                "load_research_task",
                "generate_initial_research_plan",
                "define_statistical_tests",
                "identify_novel_inquiries",
                "specify_data_requirements",
            ],
            input_artifacts: &["task.md"],
            output_artifacts: &["research_plan_v*.md", "statistical_design.json"],
            next_phases: &[Phase::ResearchValidation],
            rollback_phases: &[],
            revision_phase: None,
            criteria: ValidationCriteria {
                statistical_rigor: true,
                data_hygiene: true,
                novel_insights: true,
                ..ValidationCriteria::NONE
            },
            max_iterations: 1,
            parallel_samples: 0,
            description: "Chief Researcher creates the research plan and statistical design",
        },
        PhaseConfig {
            phase: Phase::ResearchValidation,
            primary_role: "Junior_Validator",
            supporting_roles: VALIDATORS,
            valid_tasks: &[
                "critique_edge_cases",
                "validate_statistical_approach",
                "check_data_hygiene",
                "synthesize_validation_feedback",
            ],
            input_artifacts: &["research_plan_v*.md"],
            output_artifacts: &[
                "junior_critique_v*.md",
                "senior_critique_v*.md",
                "validation_synthesis.json",
            ],
            next_phases: &[Phase::ResearchRefinement, Phase::ResearchParallelValidation],
            rollback_phases: &[Phase::ResearchPlanning],
            revision_phase: Some(Phase::ResearchRefinement),
            criteria: ValidationCriteria {
                statistical_rigor: true,
                data_hygiene: true,
                ..ValidationCriteria::NONE
            },
            max_iterations: 3,
            parallel_samples: 0,
            description: "Junior and Senior validators critique the research plan",
        },
        PhaseConfig {
            phase: Phase::ResearchRefinement,
            primary_role: "Chief_Researcher",
            supporting_roles: &[],
            valid_tasks: &[
                "review_validation_feedback",
                "refine_research_plan",
                "update_statistical_design",
                "enhance_novel_inquiries",
            ],
            input_artifacts: &["validation_synthesis.json", "research_plan_v*.md"],
            output_artifacts: &["research_plan_v*.md", "refinement_log.json"],
            next_phases: &[Phase::ResearchValidation],
            rollback_phases: &[Phase::ResearchPlanning],
            revision_phase: None,
            criteria: ValidationCriteria {
                statistical_rigor: true,
                novel_insights: true,
                ..ValidationCriteria::NONE
            },
            max_iterations: 5,
            parallel_samples: 0,
            description: "Chief Researcher refines the plan from validation feedback",
        },
        PhaseConfig {
            phase: Phase::ResearchParallelValidation,
            primary_role: "Meta_Validator",
            supporting_roles: &["Junior_Validator", "Senior_Validator"],
            valid_tasks: &[
                "parallel_validation_sample",
                "consolidate_parallel_feedback",
                "final_approval_check",
            ],
            input_artifacts: &["research_plan_v*.md"],
            output_artifacts: &["parallel_validation_*.md", "final_approval.json"],
            next_phases: &[Phase::OrchestrationPlanning],
            rollback_phases: &[Phase::ResearchRefinement],
            revision_phase: None,
            criteria: ValidationCriteria {
                statistical_rigor: true,
                data_hygiene: true,
                novel_insights: true,
                ..ValidationCriteria::NONE
            },
            max_iterations: 1,
            parallel_samples: 4,
            description: "Parallel validation samples look for issues before implementation",
        },
        // Orchestration loop
        PhaseConfig {
            phase: Phase::OrchestrationPlanning,
            primary_role: "Orchestrator",
            supporting_roles: &[],
            valid_tasks: &[
                "decompose_research_plan",
                "define_parallel_subtasks",
                "specify_integration_points",
                "create_success_criteria",
                "design_experiment_logging",
            ],
            input_artifacts: &["research_plan_v*.md", "final_approval.json"],
            output_artifacts: &[
                "orchestration_plan.json",
                "subtask_definitions/*.md",
                "integration_spec.json",
            ],
            next_phases: &[Phase::OrchestrationValidation],
            rollback_phases: &[Phase::ResearchParallelValidation],
            revision_phase: None,
            criteria: ValidationCriteria {
                parallelization_efficiency: true,
                surgical_alignment: true,
                success_criteria_clarity: true,
                ..ValidationCriteria::NONE
            },
            max_iterations: 1,
            parallel_samples: 0,
            description: "Orchestrator turns the plan into parallelizable subtasks",
        },
        PhaseConfig {
            phase: Phase::OrchestrationValidation,
            primary_role: "Junior_Validator",
            supporting_roles: VALIDATORS,
            valid_tasks: &[
                "validate_task_decomposition",
                "check_surgical_alignment",
                "verify_success_criteria",
                "assess_parallelization",
            ],
            input_artifacts: &["orchestration_plan.json"],
            output_artifacts: &["orchestration_critique_v*.md", "alignment_validation.json"],
            next_phases: &[Phase::OrchestrationRefinement, Phase::CodingAssignment],
            rollback_phases: &[Phase::OrchestrationPlanning],
            revision_phase: Some(Phase::OrchestrationRefinement),
            criteria: ValidationCriteria {
                parallelization_efficiency: true,
                surgical_alignment: true,
                ..ValidationCriteria::NONE
            },
            max_iterations: 3,
            parallel_samples: 0,
            description: "Validators check the orchestration plan for efficiency and alignment",
        },
        PhaseConfig {
            phase: Phase::OrchestrationRefinement,
            primary_role: "Orchestrator",
            supporting_roles: &[],
            valid_tasks: &[
                "review_orchestration_feedback",
                "refine_task_decomposition",
                "improve_integration_spec",
                "clarify_success_criteria",
            ],
            input_artifacts: &["orchestration_critique_v*.md", "orchestration_plan.json"],
            output_artifacts: &["orchestration_plan.json", "refinement_log.json"],
            next_phases: &[Phase::OrchestrationValidation],
            rollback_phases: &[Phase::OrchestrationPlanning],
            revision_phase: None,
            criteria: ValidationCriteria {
                surgical_alignment: true,
                success_criteria_clarity: true,
                ..ValidationCriteria::NONE
            },
            max_iterations: 5,
            parallel_samples: 0,
            description: "Orchestrator refines the plan from validation feedback",
        },
        // Coding loop
        PhaseConfig {
            phase: Phase::CodingAssignment,
            primary_role: "Orchestrator",
            supporting_roles: &["Coder_Agent_1", "Coder_Agent_2", "Coder_Agent_3"],
            valid_tasks: &[
                "distribute_coding_tasks",
                "assign_coder_agents",
                "setup_integration_tests",
            ],
            input_artifacts: &["orchestration_plan.json", "subtask_definitions/*.md"],
            output_artifacts: &["task_assignments.json", "integration_tests/*.py"],
            next_phases: &[Phase::CodingImplementation],
            rollback_phases: &[Phase::OrchestrationRefinement],
            revision_phase: None,
            criteria: ValidationCriteria {
                success_criteria_clarity: true,
                ..ValidationCriteria::NONE
            },
            max_iterations: 1,
            parallel_samples: 0,
            description: "Assign coding subtasks to parallel coders",
        },
        PhaseConfig {
            phase: Phase::CodingImplementation,
            primary_role: "Coder_Agent",
            supporting_roles: &[],
            valid_tasks: &[
                "implement_subtask",
                "write_unit_tests",
                "document_code",
                "run_local_tests",
            ],
            input_artifacts: &["task_assignments.json", "subtask_definitions/*.md"],
            output_artifacts: &["src/*.py", "tests/*.py", "docs/*.md"],
            next_phases: &[Phase::CodingValidation],
            rollback_phases: &[Phase::CodingAssignment],
            revision_phase: None,
            criteria: ValidationCriteria {
                code_correctness: true,
                ..ValidationCriteria::NONE
            },
            max_iterations: 1,
            parallel_samples: 0,
            description: "Coders implement their assigned subtasks",
        },
        PhaseConfig {
            phase: Phase::CodingValidation,
            primary_role: "Junior_Validator",
            supporting_roles: VALIDATORS,
            valid_tasks: &[
                "validate_code_correctness",
                "check_success_criteria",
                "verify_integration_readiness",
                "assess_code_quality",
            ],
            input_artifacts: &["src/*.py", "tests/*.py", "task_assignments.json"],
            output_artifacts: &["code_validation_*.json", "validation_report.md"],
            next_phases: &[Phase::CodingIntegration, Phase::CodingImplementation],
            rollback_phases: &[Phase::CodingImplementation],
            revision_phase: Some(Phase::CodingImplementation),
            criteria: ValidationCriteria {
                code_correctness: true,
                success_criteria_clarity: true,
                ..ValidationCriteria::NONE
            },
            max_iterations: 3,
            parallel_samples: 0,
            description: "Validate each coder's submission against its success criteria",
        },
        PhaseConfig {
            phase: Phase::CodingIntegration,
            primary_role: "Orchestrator",
            supporting_roles: VALIDATORS,
            valid_tasks: &[
                "run_integration_tests",
                "verify_surgical_alignment",
                "consolidate_codebase",
                "final_code_review",
            ],
            input_artifacts: &[
                "src/*.py",
                "integration_tests/*.py",
                "integration_spec.json",
            ],
            output_artifacts: &["integrated_codebase/", "integration_report.json"],
            next_phases: &[Phase::ExperimentSetup],
            rollback_phases: &[Phase::CodingImplementation],
            revision_phase: None,
            criteria: ValidationCriteria {
                surgical_alignment: true,
                code_correctness: true,
                ..ValidationCriteria::NONE
            },
            max_iterations: 2,
            parallel_samples: 0,
            description: "Integrate the parallel components and check their alignment",
        },
        // Experiment loop
        PhaseConfig {
            phase: Phase::ExperimentSetup,
            primary_role: "Experiment_Executor",
            supporting_roles: &[],
            valid_tasks: &[
                "prepare_experiment_environment",
                "validate_data_sources",
                "setup_logging_infrastructure",
                "create_experiment_manifest",
            ],
            input_artifacts: &["integrated_codebase/", "research_plan_v*.md"],
            output_artifacts: &["experiment_manifest.json", "logging_config.json"],
            next_phases: &[Phase::ExperimentExecution],
            rollback_phases: &[Phase::CodingIntegration],
            revision_phase: None,
            criteria: ValidationCriteria {
                data_hygiene: true,
                execution_completeness: true,
                ..ValidationCriteria::NONE
            },
            max_iterations: 1,
            parallel_samples: 0,
            description: "Prepare the experiment environment and manifest",
        },
        PhaseConfig {
            phase: Phase::ExperimentExecution,
            primary_role: "Experiment_Executor",
            supporting_roles: &[],
            valid_tasks: &[
                "execute_experiments",
                "log_experiment_details",
                "capture_raw_results",
                "monitor_execution_health",
            ],
            input_artifacts: &["experiment_manifest.json", "integrated_codebase/"],
            output_artifacts: &[
                "experiment_logs/*.log",
                "raw_results/*.csv",
                "execution_metrics.json",
            ],
            next_phases: &[Phase::ExperimentValidation],
            rollback_phases: &[Phase::ExperimentSetup, Phase::CodingIntegration],
            revision_phase: None,
            criteria: ValidationCriteria {
                data_hygiene: true,
                execution_completeness: true,
                ..ValidationCriteria::NONE
            },
            max_iterations: 1,
            parallel_samples: 0,
            description: "Execute experiments with detailed logging",
        },
        PhaseConfig {
            phase: Phase::ExperimentValidation,
            primary_role: "Junior_Validator",
            supporting_roles: VALIDATORS,
            valid_tasks: &[
                "validate_execution_completeness",
                "check_data_integrity",
                "verify_logging_quality",
                "assess_result_quality",
            ],
            input_artifacts: &[
                "experiment_logs/*.log",
                "raw_results/*.csv",
                "execution_metrics.json",
            ],
            output_artifacts: &["execution_validation.json", "data_quality_report.md"],
            next_phases: &[Phase::ExperimentJournal, Phase::ExperimentExecution],
            rollback_phases: &[Phase::ExperimentExecution],
            revision_phase: Some(Phase::ExperimentExecution),
            criteria: ValidationCriteria {
                data_hygiene: true,
                execution_completeness: true,
                ..ValidationCriteria::NONE
            },
            max_iterations: 2,
            parallel_samples: 0,
            description: "Validate that experiment execution was complete and clean",
        },
        PhaseConfig {
            phase: Phase::ExperimentJournal,
            primary_role: "Experiment_Executor",
            supporting_roles: &[],
            valid_tasks: &[
                "compile_execution_journal",
                "document_observations",
                "note_anomalies",
                "finalize_raw_results",
            ],
            input_artifacts: &["experiment_logs/*.log", "execution_validation.json"],
            output_artifacts: &["execution_journal.md", "observations.json"],
            next_phases: &[Phase::ResultsPlanning],
            rollback_phases: &[Phase::ExperimentExecution],
            revision_phase: None,
            criteria: ValidationCriteria {
                execution_completeness: true,
                ..ValidationCriteria::NONE
            },
            max_iterations: 1,
            parallel_samples: 0,
            description: "Write the experiment execution journal",
        },
        // Results loop
        PhaseConfig {
            phase: Phase::ResultsPlanning,
            primary_role: "Orchestrator",
            supporting_roles: &[],
            valid_tasks: &[
                "plan_results_extraction",
                "define_statistical_analyses",
                "specify_visualization_needs",
                "identify_key_insights",
            ],
            input_artifacts: &[
                "raw_results/*.csv",
                "research_plan_v*.md",
                "execution_journal.md",
            ],
            output_artifacts: &["extraction_plan.json", "analysis_spec.json"],
            next_phases: &[Phase::ResultsExtraction],
            rollback_phases: &[Phase::ExperimentJournal],
            revision_phase: None,
            criteria: ValidationCriteria {
                statistical_rigor: true,
                result_significance: true,
                ..ValidationCriteria::NONE
            },
            max_iterations: 1,
            parallel_samples: 0,
            description: "Plan the extraction of key results",
        },
        PhaseConfig {
            phase: Phase::ResultsExtraction,
            primary_role: "Coder_Agent",
            supporting_roles: &["Orchestrator"],
            valid_tasks: &[
                "implement_extraction_code",
                "run_statistical_tests",
                "generate_visualizations",
                "extract_key_metrics",
            ],
            input_artifacts: &["extraction_plan.json", "raw_results/*.csv"],
            output_artifacts: &[
                "processed_results/*.json",
                "visualizations/*.png",
                "statistical_tests.json",
            ],
            next_phases: &[Phase::ResultsValidation],
            rollback_phases: &[Phase::ResultsPlanning],
            revision_phase: None,
            criteria: ValidationCriteria {
                statistical_rigor: true,
                code_correctness: true,
                ..ValidationCriteria::NONE
            },
            max_iterations: 1,
            parallel_samples: 0,
            description: "Extract and process results per the extraction plan",
        },
        PhaseConfig {
            phase: Phase::ResultsValidation,
            primary_role: "Senior_Validator",
            supporting_roles: &["Junior_Validator"],
            valid_tasks: &[
                "validate_statistical_correctness",
                "verify_result_significance",
                "check_extraction_completeness",
                "assess_insight_quality",
            ],
            input_artifacts: &[
                "processed_results/*.json",
                "statistical_tests.json",
                "extraction_plan.json",
            ],
            output_artifacts: &["results_validation.json", "significance_report.md"],
            next_phases: &[Phase::FinalAnalysis, Phase::ResultsExtraction],
            rollback_phases: &[Phase::ResultsExtraction],
            revision_phase: Some(Phase::ResultsExtraction),
            criteria: ValidationCriteria {
                statistical_rigor: true,
                result_significance: true,
                ..ValidationCriteria::NONE
            },
            max_iterations: 2,
            parallel_samples: 0,
            description: "Validate extracted results for correctness and significance",
        },
        // Final stages
        PhaseConfig {
            phase: Phase::FinalAnalysis,
            primary_role: "Chief_Researcher",
            supporting_roles: &[],
            valid_tasks: &[
                "synthesize_findings",
                "identify_novel_insights",
                "assess_statistical_significance",
                "draw_conclusions",
            ],
            input_artifacts: &[
                "processed_results/*.json",
                "execution_journal.md",
                "research_plan_v*.md",
            ],
            output_artifacts: &["analysis_synthesis.md", "key_findings.json"],
            next_phases: &[Phase::FinalReport],
            rollback_phases: &[Phase::ResultsValidation],
            revision_phase: None,
            criteria: ValidationCriteria {
                statistical_rigor: true,
                novel_insights: true,
                result_significance: true,
                ..ValidationCriteria::NONE
            },
            max_iterations: 1,
            parallel_samples: 0,
            description: "Chief Researcher synthesizes all findings",
        },
        PhaseConfig {
            phase: Phase::FinalReport,
            primary_role: "Chief_Researcher",
            supporting_roles: &[],
            valid_tasks: &[
                "generate_final_report",
                "create_executive_summary",
                "compile_appendices",
                "prepare_deliverables",
            ],
            input_artifacts: &[
                "analysis_synthesis.md",
                "key_findings.json",
                "visualizations/*.png",
            ],
            output_artifacts: &["final_report.md", "executive_summary.md", "deliverables/"],
            next_phases: &[],
            rollback_phases: &[Phase::FinalAnalysis],
            revision_phase: None,
            criteria: ValidationCriteria {
                novel_insights: true,
                result_significance: true,
                ..ValidationCriteria::NONE
            },
            max_iterations: 1,
            parallel_samples: 0,
            description: "Generate the final report and deliverables",
        },
        // Error handling
        PhaseConfig {
            phase: Phase::Error,
            primary_role: "System",
            supporting_roles: &[],
            valid_tasks: &["log_error", "capture_state", "determine_recovery"],
            input_artifacts: &["error_context.json"],
            output_artifacts: &["error_log.json", "recovery_plan.json"],
            next_phases: &[Phase::Recovery],
            rollback_phases: &[],
            revision_phase: None,
            criteria: ValidationCriteria::NONE,
            max_iterations: 1,
            parallel_samples: 0,
            description: "Capture the error and plan recovery",
        },
        PhaseConfig {
            phase: Phase::Recovery,
            primary_role: "System",
            supporting_roles: &["Orchestrator"],
            valid_tasks: &["restore_checkpoint", "rollback_phase", "reinitialize_agents"],
            input_artifacts: &["recovery_plan.json"],
            output_artifacts: &["recovery_log.json"],
            next_phases: &[
                Phase::ResearchPlanning,
                Phase::OrchestrationPlanning,
                Phase::CodingImplementation,
                Phase::ExperimentExecution,
            ],
            rollback_phases: &[],
            revision_phase: None,
            criteria: ValidationCriteria::NONE,
            max_iterations: 1,
            parallel_samples: 0,
            description: "Return the workflow to a safe restart point",
        },
    ]
}
