//! End-to-end scenarios for the fix workflow
//!
//! Deterministic mock LLM and tools drive the executor through the
//! canonical flows: happy-path fix, test-regression revert, identical
//! action loops, budget growth, crash recovery, and schema migration.

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use agentforge::llm::mock::MockProvider;
use agentforge::{
    ActionExecutor, ActionOutput, ActionResult, AdaptiveBudget, ExecutorConfig, FactCategory, FixWorkflow, FnExecutor,
    Params, Phase, TaskState, Violation, WorkflowTools, WorkingMemory,
};
use tempfile::TempDir;

/// Test runner whose scripted outputs are consumed one per call; the last
/// entry repeats once the script runs out.
struct ScriptedRunner {
    outputs: Vec<(bool, String)>,
    calls: AtomicUsize,
}

impl ScriptedRunner {
    fn new(outputs: Vec<(bool, &str)>) -> Arc<Self> {
        Arc::new(Self {
            outputs: outputs.into_iter().map(|(ok, s)| (ok, s.to_string())).collect(),
            calls: AtomicUsize::new(0),
        })
    }

    fn always(ok: bool, output: &str) -> Arc<Self> {
        Self::new(vec![(ok, output)])
    }
}

#[async_trait]
impl ActionExecutor for ScriptedRunner {
    async fn execute(&self, _action: &str, _params: &Params, _state: &TaskState) -> ActionOutput {
        let idx = self.calls.fetch_add(1, Ordering::SeqCst).min(self.outputs.len() - 1);
        let (ok, text) = &self.outputs[idx];
        if *ok {
            ActionOutput::success("tests ran").with_output(text.clone())
        } else {
            ActionOutput::failure("tests ran", "test failures").with_output(text.clone())
        }
    }
}

fn passing_checker() -> Arc<dyn ActionExecutor> {
    Arc::new(FnExecutor(|_: &str, _: &Params, _: &TaskState| {
        ActionOutput::success("Check PASSED").with_output("Check PASSED for complexity")
    }))
}

/// Extraction provider that rewrites the target file and reports the
/// extracted helper
fn extracting_tool(root: &Path) -> Arc<dyn ActionExecutor> {
    let root = root.to_path_buf();
    Arc::new(FnExecutor(move |_: &str, params: &Params, state: &TaskState| {
        let path = params
            .get("file_path")
            .and_then(|v| v.as_str())
            .or_else(|| state.context_str("file_path"))
            .unwrap();
        let new_name = params
            .get("new_function_name")
            .and_then(|v| v.as_str())
            .unwrap_or("helper");
        let full = root.join(path);
        let mut content = fs::read_to_string(&full).unwrap_or_default();
        content.push_str(&format!("\n\ndef {}():\n    pass\n", new_name));
        fs::write(&full, content).unwrap();
        ActionOutput::success(format!("Extracted function '{}' from lines 40-60", new_name))
    }))
}

fn quiet_config() -> ExecutorConfig {
    let _ = tracing_subscriber::fmt().with_env_filter("warn").try_init();
    ExecutorConfig {
        audit_enabled: false,
        ..ExecutorConfig::default()
    }
}

fn write_target(root: &Path, lines: usize) -> String {
    fs::create_dir_all(root.join("src")).unwrap();
    let content: String = (1..=lines).map(|i| format!("x{} = {}\n", i, i)).collect();
    fs::write(root.join("src/m.py"), &content).unwrap();
    content
}

fn action_block(body: &str) -> String {
    format!("```action\n{}\n```", body)
}

// =============================================================================
// Scenario 1: happy-path fix
// =============================================================================

#[tokio::test]
async fn test_happy_path_fix() {
    let temp = TempDir::new().unwrap();
    write_target(temp.path(), 60);

    let responses = vec![
        action_block("action: read_file\nparameters:\n  path: src/m.py"),
        action_block(
            "action: extract_function\nparameters:\n  file_path: src/m.py\n  source_function: foo\n  start_line: 40\n  end_line: 60\n  new_function_name: foo_helper",
        ),
        action_block("action: run_check\nparameters:\n  file_path: src/m.py\n  check_id: complexity"),
        action_block("action: complete"),
    ];

    let workflow = FixWorkflow::with_config(
        temp.path(),
        Arc::new(MockProvider::new(responses)),
        WorkflowTools {
            test_runner: ScriptedRunner::always(true, "5 passed"),
            check_runner: passing_checker(),
            extract_function: Some(extracting_tool(temp.path())),
            simplify_conditional: None,
        },
        quiet_config(),
    );

    let violation = Violation::new("V-001", "complexity", "src/m.py")
        .at_line(42)
        .with_message("Function 'foo' has complexity 14");
    let (status, outcomes) = workflow.fix_violation(&violation, 10).await.unwrap();

    assert_eq!(status, "completed");
    assert_eq!(outcomes.len(), 4);
    assert_eq!(outcomes[3].action_name, "complete");
    assert!(outcomes.iter().all(|o| o.success));

    let state = workflow.store().load("fix-V-001").unwrap().unwrap();
    assert_eq!(state.phase, Phase::Complete);
    assert_eq!(state.current_step, 4);
    assert_eq!(state.files_modified(), vec!["src/m.py"]);
    assert!(state.verification.ready_for_completion);

    // Phase trajectory: INIT -> IMPLEMENT -> VERIFY -> COMPLETE
    assert_eq!(
        state.phase_machine_state.phase_history,
        vec![Phase::Init, Phase::Implement, Phase::Verify]
    );

    // Understanding carries the check result
    let memory = WorkingMemory::new(workflow.store().task_dir("fix-V-001"));
    let facts = memory.facts(None).unwrap();
    assert!(
        facts
            .iter()
            .any(|f| f.category == FactCategory::Verification && f.statement == "Conformance check passed")
    );
}

// =============================================================================
// Scenario 2: test regression triggers revert
// =============================================================================

#[tokio::test]
async fn test_regression_reverts_modification() {
    let temp = TempDir::new().unwrap();
    let original = write_target(temp.path(), 50);

    let responses = vec![action_block(
        "action: replace_lines\nparameters:\n  file_path: src/m.py\n  start_line: 42\n  end_line: 42\n  new_content: pass",
    )];

    let workflow = FixWorkflow::with_config(
        temp.path(),
        Arc::new(MockProvider::new(responses)),
        WorkflowTools {
            // Baseline clean, post run broken
            test_runner: ScriptedRunner::new(vec![(true, "5 passed"), (false, "3 failed, 2 passed")]),
            check_runner: passing_checker(),
            extract_function: None,
            simplify_conditional: None,
        },
        quiet_config(),
    );

    let violation = Violation::new("V-002", "complexity", "src/m.py").at_line(42);
    let (_status, outcomes) = workflow.fix_violation(&violation, 1).await.unwrap();

    assert_eq!(outcomes.len(), 1);
    let outcome = &outcomes[0];
    assert_eq!(outcome.result, ActionResult::Failure);
    assert!(outcome.summary.contains("REVERTED"));

    // On-disk content equals the pre-action content
    assert_eq!(fs::read_to_string(temp.path().join("src/m.py")).unwrap(), original);

    let state = workflow.store().load("fix-V-002").unwrap().unwrap();
    assert_eq!(state.phase, Phase::Implement);
    assert!(state.files_modified().is_empty());

    // The action log recorded the failure
    let actions = workflow.store().all_actions("fix-V-002").unwrap();
    assert_eq!(actions.len(), 1);
    assert_eq!(actions[0].result, ActionResult::Failure);

    // An ERROR fact exists
    let memory = WorkingMemory::new(workflow.store().task_dir("fix-V-002"));
    let facts = memory.facts(None).unwrap();
    assert!(facts.iter().any(|f| f.category == FactCategory::Error));
}

// =============================================================================
// Scenario 3: identical-action loop
// =============================================================================

#[tokio::test]
async fn test_identical_action_loop_stops_run() {
    let temp = TempDir::new().unwrap();
    write_target(temp.path(), 20);

    let edit = action_block(
        "action: edit_file\nparameters:\n  path: src/m.py\n  old_text: X\n  new_text: Y",
    );
    let responses = vec![edit.clone(), edit.clone(), edit.clone(), edit.clone(), edit.clone(), edit];

    let workflow = FixWorkflow::with_config(
        temp.path(),
        Arc::new(MockProvider::new(responses)),
        WorkflowTools {
            test_runner: ScriptedRunner::always(true, "5 passed"),
            check_runner: passing_checker(),
            extract_function: None,
            simplify_conditional: None,
        },
        quiet_config(),
    );

    let violation = Violation::new("V-003", "complexity", "src/m.py");
    let (status, outcomes) = workflow.fix_violation(&violation, 10).await.unwrap();

    assert_eq!(status, "stopped");
    assert_eq!(outcomes.len(), 3);

    let last = outcomes.last().unwrap();
    assert!(!last.should_continue);
    let detection = last.loop_detected.as_ref().expect("detection attached to final outcome");
    assert!(detection.detected);
    assert_eq!(format!("{}", detection.loop_type.unwrap()), "IDENTICAL_ACTION");
    assert!(
        detection
            .suggestions
            .iter()
            .any(|s| s.contains("re-read the file") || s.contains("line numbers"))
    );
}

// =============================================================================
// Scenario 4: budget grows with progress, hard ceiling holds
// =============================================================================

#[tokio::test]
async fn test_budget_extension_with_progress() {
    let temp = TempDir::new().unwrap();
    write_target(temp.path(), 20);

    let write = action_block(
        "action: write_file\nparameters:\n  path: src/gen.py\n  new_text: ignored\n  content: \"y = 1\"",
    );
    let responses = vec![write; 12];

    let workflow = FixWorkflow::with_config(
        temp.path(),
        Arc::new(MockProvider::new(responses)),
        WorkflowTools {
            test_runner: ScriptedRunner::always(true, "5 passed"),
            check_runner: passing_checker(),
            extract_function: None,
            simplify_conditional: None,
        },
        ExecutorConfig {
            audit_enabled: false,
            base_budget: 5,
            ..ExecutorConfig::default()
        },
    );

    let violation = Violation::new("V-004", "complexity", "src/m.py");
    // max_iterations doubles as the hard budget ceiling
    let (status, outcomes) = workflow.fix_violation(&violation, 10).await.unwrap();

    // Progress extended the budget past the base of 5, the ceiling held
    assert_eq!(outcomes.len(), 10);
    assert_eq!(status, "stopped");
    assert!(outcomes.iter().all(|o| o.result == ActionResult::Success));
    assert!(outcomes.last().unwrap().loop_detected.is_none());

    let state = workflow.store().load("fix-V-004").unwrap().unwrap();
    assert_eq!(state.current_step, 10);
    assert!(state.files_modified().contains(&"src/gen.py".to_string()));
}

/// Same shape driven through an explicitly configured budget
#[tokio::test]
async fn test_budget_exhaustion_with_explicit_budget() {
    let temp = TempDir::new().unwrap();
    write_target(temp.path(), 20);

    let write = action_block("action: write_file\nparameters:\n  path: src/gen.py\n  content: \"y = 1\"");
    let workflow = FixWorkflow::with_config(
        temp.path(),
        Arc::new(MockProvider::new(vec![write; 12])),
        WorkflowTools {
            test_runner: ScriptedRunner::always(true, "5 passed"),
            check_runner: passing_checker(),
            extract_function: None,
            simplify_conditional: None,
        },
        quiet_config(),
    );

    let violation = Violation::new("V-004b", "complexity", "src/m.py");
    let (_status, first) = workflow.fix_violation(&violation, 0).await.unwrap();
    assert!(first.is_empty());

    let outcomes = workflow
        .executor()
        .run_with("fix-V-004b", 12, Some(AdaptiveBudget::new(5, 10)), |_| {})
        .await;
    assert_eq!(outcomes.len(), 10);
}

// =============================================================================
// Scenario 5: crash recovery
// =============================================================================

#[tokio::test]
async fn test_crash_recovery_resumes() {
    let temp = TempDir::new().unwrap();
    write_target(temp.path(), 60);

    let first_three = vec![
        action_block("action: read_file\nparameters:\n  path: src/m.py"),
        action_block(
            "action: extract_function\nparameters:\n  file_path: src/m.py\n  source_function: foo\n  start_line: 40\n  end_line: 60\n  new_function_name: foo_helper",
        ),
        action_block("action: run_check\nparameters:\n  file_path: src/m.py\n  check_id: complexity"),
    ];

    let tools = || WorkflowTools {
        test_runner: ScriptedRunner::always(true, "5 passed"),
        check_runner: passing_checker(),
        extract_function: Some(extracting_tool(temp.path())),
        simplify_conditional: None,
    };

    let workflow = FixWorkflow::with_config(
        temp.path(),
        Arc::new(MockProvider::new(first_three)),
        tools(),
        quiet_config(),
    );
    let violation = Violation::new("V-005", "complexity", "src/m.py").at_line(42);
    let (_status, outcomes) = workflow.fix_violation(&violation, 3).await.unwrap();
    assert_eq!(outcomes.len(), 3);
    drop(workflow); // process "terminates"

    // A fresh executor reconstructs everything from disk
    let resumed = FixWorkflow::with_config(
        temp.path(),
        Arc::new(MockProvider::new(vec![action_block("action: complete")])),
        tools(),
        quiet_config(),
    );

    let state = resumed.store().load("fix-V-005").unwrap().unwrap();
    assert_eq!(state.current_step, 3);
    assert_eq!(state.phase, Phase::Verify);
    assert_eq!(resumed.store().all_actions("fix-V-005").unwrap().len(), 3);

    let memory = WorkingMemory::new(resumed.store().task_dir("fix-V-005"));
    assert_eq!(memory.action_results(5, Some(3)).unwrap().len(), 3);

    let (status, outcomes) = resumed.resume_task("fix-V-005", 5).await.unwrap();
    assert_eq!(status, "completed");
    assert_eq!(outcomes.len(), 1);
    assert_eq!(resumed.store().load("fix-V-005").unwrap().unwrap().phase, Phase::Complete);
}

// =============================================================================
// Scenario 6: schema migration on load
// =============================================================================

#[tokio::test]
async fn test_legacy_state_migrated_on_load() {
    let temp = TempDir::new().unwrap();
    write_target(temp.path(), 20);

    let workflow = FixWorkflow::with_config(
        temp.path(),
        Arc::new(MockProvider::new(vec![])),
        WorkflowTools {
            test_runner: ScriptedRunner::always(true, "5 passed"),
            check_runner: passing_checker(),
            extract_function: None,
            simplify_conditional: None,
        },
        quiet_config(),
    );
    let violation = Violation::new("V-006", "complexity", "src/m.py");
    workflow.fix_violation(&violation, 0).await.unwrap();

    // Rewrite the state file as a legacy 1.0 document
    let state_file = workflow.store().task_dir("fix-V-006").join("state.yaml");
    let legacy = "schema_version: '1.0'\n\
                  phase: implement\n\
                  current_step: 2\n\
                  verification:\n  checks_passing: 0\n  checks_failing: 1\n  tests_passing: false\n\
                  last_updated: 2025-06-01T00:00:00Z\n\
                  context_data: {}\n";
    fs::write(&state_file, legacy).unwrap();

    let state = workflow.store().load("fix-V-006").unwrap().unwrap();
    assert_eq!(state.schema_version, "2.0");
    assert_eq!(state.phase, Phase::Implement);
    assert!(!state.verification.ready_for_completion);
    assert_eq!(state.phase_machine_state.phase_history, Vec::<Phase>::new());

    // The file was re-saved at the current version
    let raw = fs::read_to_string(&state_file).unwrap();
    assert!(raw.contains("schema_version: '2.0'"));
}

// =============================================================================
// Boundary: empty LLM response consumes a step as "unknown"
// =============================================================================

#[tokio::test]
async fn test_empty_response_degrades_to_unknown() {
    let temp = TempDir::new().unwrap();
    write_target(temp.path(), 20);

    let workflow = FixWorkflow::with_config(
        temp.path(),
        Arc::new(MockProvider::new(vec![String::new(), action_block("action: escalate")])),
        WorkflowTools {
            test_runner: ScriptedRunner::always(true, "5 passed"),
            check_runner: passing_checker(),
            extract_function: None,
            simplify_conditional: None,
        },
        quiet_config(),
    );

    let violation = Violation::new("V-007", "complexity", "src/m.py");
    let (status, outcomes) = workflow.fix_violation(&violation, 5).await.unwrap();

    assert_eq!(outcomes[0].action_name, "unknown");
    assert_eq!(outcomes[0].result, ActionResult::Failure);
    // The unparseable response consumed a step and the loop continued
    assert_eq!(outcomes.len(), 2);
    assert_eq!(outcomes[1].action_name, "escalate");
    assert_eq!(status, "escalated");
}
