//! Fix workflow - thin façade over the executor for violation fixes
//!
//! Pre-computes violation context, seeds a code-structure fact so the
//! phase machine can skip straight to IMPLEMENT, wires the standard
//! actions behind their safety wrappers, and runs the executor to
//! termination.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use eyre::Result;
use serde::{Deserialize, Serialize};
use statestore::{ArtifactKind, ContextData, TaskSpec, TaskStateStore};
use tracing::{debug, info};
use workmem::{Fact, FactCategory, WorkingMemory};

use crate::executor::{Executor, ExecutorConfig};
use crate::llm::LlmProvider;
use crate::outcome::{StepOutcome, determine_final_status};
use crate::tools::{
    ActionExecutor, CheckRecorded, ExtractionVerified, FileActions, SourceValidated, TestVerified, TestsRecorded,
    ToolDispatcher,
};

/// A conformance violation to fix
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Violation {
    pub violation_id: String,
    pub check_id: String,
    pub file_path: String,
    #[serde(default)]
    pub line_number: Option<u64>,
    #[serde(default = "default_severity")]
    pub severity: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub fix_hint: Option<String>,
    #[serde(default)]
    pub test_path: Option<String>,
}

fn default_severity() -> String {
    "warning".to_string()
}

impl Violation {
    pub fn new(violation_id: impl Into<String>, check_id: impl Into<String>, file_path: impl Into<String>) -> Self {
        Self {
            violation_id: violation_id.into(),
            check_id: check_id.into(),
            file_path: file_path.into(),
            line_number: None,
            severity: default_severity(),
            message: String::new(),
            fix_hint: None,
            test_path: None,
        }
    }

    pub fn at_line(mut self, line: u64) -> Self {
        self.line_number = Some(line);
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn with_test_path(mut self, test_path: impl Into<String>) -> Self {
        self.test_path = Some(test_path.into());
        self
    }
}

/// Host-supplied tool adapters for the workflow
pub struct WorkflowTools {
    pub test_runner: Arc<dyn ActionExecutor>,
    pub check_runner: Arc<dyn ActionExecutor>,
    /// Refactoring providers; omitted actions simply stay unregistered
    pub extract_function: Option<Arc<dyn ActionExecutor>>,
    pub simplify_conditional: Option<Arc<dyn ActionExecutor>>,
}

/// Runs fix-violation tasks end to end
pub struct FixWorkflow {
    project_root: PathBuf,
    store: Arc<TaskStateStore>,
    executor: Executor,
}

impl FixWorkflow {
    pub fn new(project_root: impl AsRef<Path>, provider: Arc<dyn LlmProvider>, tools: WorkflowTools) -> Self {
        Self::with_config(project_root, provider, tools, ExecutorConfig::default())
    }

    pub fn with_config(
        project_root: impl AsRef<Path>,
        provider: Arc<dyn LlmProvider>,
        tools: WorkflowTools,
        config: ExecutorConfig,
    ) -> Self {
        let project_root = project_root.as_ref().to_path_buf();
        let store = Arc::new(TaskStateStore::new(&project_root));
        let dispatcher = build_dispatcher(&project_root, &store, &tools);
        let executor = Executor::new(&project_root, store.clone(), provider, dispatcher).with_config(config);
        Self {
            project_root,
            store,
            executor,
        }
    }

    pub fn store(&self) -> &Arc<TaskStateStore> {
        &self.store
    }

    pub fn executor(&self) -> &Executor {
        &self.executor
    }

    /// Fix one violation. Returns the final status and every step outcome.
    pub async fn fix_violation(
        &self,
        violation: &Violation,
        max_iterations: usize,
    ) -> Result<(&'static str, Vec<StepOutcome>)> {
        let task_id = format!("fix-{}", violation.violation_id);

        if self.store.load(&task_id)?.is_none() {
            self.create_fix_task(&task_id, violation)?;
        }

        info!(%task_id, check_id = %violation.check_id, file = %violation.file_path, "fix workflow starting");
        let outcomes = self.executor.run_until_complete(&task_id, max_iterations).await;
        let status = determine_final_status(&outcomes);
        info!(%task_id, %status, steps = outcomes.len(), "fix workflow finished");
        Ok((status, outcomes))
    }

    /// Resume a previously created task (crash recovery)
    pub async fn resume_task(&self, task_id: &str, max_iterations: usize) -> Result<(&'static str, Vec<StepOutcome>)> {
        if self.store.load(task_id)?.is_none() {
            return Err(eyre::eyre!("Task not found: {}", task_id));
        }
        let outcomes = self.executor.run_until_complete(task_id, max_iterations).await;
        Ok((determine_final_status(&outcomes), outcomes))
    }

    fn create_fix_task(&self, task_id: &str, violation: &Violation) -> Result<()> {
        let spec = TaskSpec::with_id(
            task_id,
            "fix_violation",
            format!("Fix {} violation in {}", violation.check_id, violation.file_path),
            vec![
                "Conformance check passes".to_string(),
                "No new test failures".to_string(),
            ],
        );

        let mut context_data = ContextData::new();
        context_data.insert("file_path".into(), serde_json::json!(violation.file_path));
        context_data.insert("check_id".into(), serde_json::json!(violation.check_id));
        context_data.insert("files_modified".into(), serde_json::json!([]));
        context_data.insert("violation".into(), serde_json::to_value(violation)?);
        if let Some(line) = violation.line_number {
            context_data.insert("line_number".into(), serde_json::json!(line));
        }
        if let Some(test_path) = &violation.test_path {
            context_data.insert("test_path".into(), serde_json::json!(test_path));
        }
        if let Some(hint) = &violation.fix_hint {
            context_data.insert("action_hints".into(), serde_json::json!(hint));
        }

        // Precompute: snapshot the target source and surface it to the prompt
        let target = self.project_root.join(&violation.file_path);
        let source = fs::read_to_string(&target).ok();
        if let Some(source) = &source {
            context_data.insert("target_source".into(), serde_json::json!(source));
        }

        let state = self.store.create_task(spec, context_data)?;
        if let Some(source) = &source {
            self.store
                .save_artifact(task_id, ArtifactKind::Inputs, "target.before", source)?;
        }

        // Seed understanding so INIT can skip straight to IMPLEMENT
        let memory = WorkingMemory::new(self.store.task_dir(task_id));
        let line = violation.line_number.unwrap_or(0);
        memory.add_fact(Fact::new(
            FactCategory::CodeStructure,
            format!(
                "Violation '{}' in {} at line {}: {}",
                violation.check_id, violation.file_path, line, violation.message
            ),
            0.9,
            "analysis:seed",
            0,
        ))?;

        debug!(%task_id, step = state.current_step, "fix task created");
        Ok(())
    }
}

fn build_dispatcher(project_root: &Path, store: &Arc<TaskStateStore>, tools: &WorkflowTools) -> ToolDispatcher {
    let mut dispatcher = ToolDispatcher::new();

    let file_actions: Arc<dyn ActionExecutor> = Arc::new(FileActions::new(project_root, store.clone()));

    for action in ["read_file", "load_context", "plan_fix"] {
        dispatcher.register(action, file_actions.clone());
    }

    // Destructive actions go through test verification with auto-revert
    for action in ["edit_file", "insert_lines", "write_file"] {
        dispatcher.register(
            action,
            Arc::new(TestVerified::new(
                file_actions.clone(),
                tools.test_runner.clone(),
                store.clone(),
                project_root,
            )),
        );
    }

    // Line-level edits additionally get source validation before the
    // test-verification decision
    let validated: Arc<dyn ActionExecutor> = Arc::new(SourceValidated::new(file_actions.clone(), project_root));
    dispatcher.register(
        "replace_lines",
        Arc::new(TestVerified::new(
            validated,
            tools.test_runner.clone(),
            store.clone(),
            project_root,
        )),
    );

    dispatcher.register(
        "run_tests",
        Arc::new(TestsRecorded::new(tools.test_runner.clone(), store.clone())),
    );
    dispatcher.register(
        "run_check",
        Arc::new(CheckRecorded::new(tools.check_runner.clone(), store.clone())),
    );

    if let Some(extract) = &tools.extract_function {
        dispatcher.register(
            "extract_function",
            Arc::new(ExtractionVerified::new(
                extract.clone(),
                tools.test_runner.clone(),
                tools.check_runner.clone(),
                store.clone(),
                project_root,
            )),
        );
    }
    if let Some(simplify) = &tools.simplify_conditional {
        dispatcher.register(
            "simplify_conditional",
            Arc::new(TestVerified::new(
                simplify.clone(),
                tools.test_runner.clone(),
                store.clone(),
                project_root,
            )),
        );
    }

    dispatcher
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::mock::MockProvider;
    use crate::response::Params;
    use crate::tools::{ActionOutput, FnExecutor};
    use statestore::TaskState;
    use tempfile::tempdir;

    fn stub_tools() -> WorkflowTools {
        WorkflowTools {
            test_runner: Arc::new(FnExecutor(|_: &str, _: &Params, _: &TaskState| {
                ActionOutput::success("5 passed")
            })),
            check_runner: Arc::new(FnExecutor(|_: &str, _: &Params, _: &TaskState| {
                ActionOutput::success("Check PASSED")
            })),
            extract_function: None,
            simplify_conditional: None,
        }
    }

    #[tokio::test]
    async fn test_task_seeding() {
        let temp = tempdir().unwrap();
        fs::create_dir_all(temp.path().join("src")).unwrap();
        fs::write(temp.path().join("src/m.py"), "def foo():\n    pass\n").unwrap();

        let workflow = FixWorkflow::with_config(
            temp.path(),
            Arc::new(MockProvider::scripted(&["action: escalate"])),
            stub_tools(),
            ExecutorConfig {
                audit_enabled: false,
                ..ExecutorConfig::default()
            },
        );

        let violation = Violation::new("V-001", "complexity", "src/m.py")
            .at_line(1)
            .with_message("Function 'foo' has complexity 14")
            .with_test_path("tests/test_m.py");

        let (status, outcomes) = workflow.fix_violation(&violation, 5).await.unwrap();
        assert_eq!(status, "escalated");
        assert_eq!(outcomes.len(), 1);

        let state = workflow.store().load("fix-V-001").unwrap().unwrap();
        assert_eq!(state.spec.task_type, "fix_violation");
        assert_eq!(state.context_str("file_path"), Some("src/m.py"));
        assert_eq!(state.context_str("check_id"), Some("complexity"));
        assert_eq!(state.context_str("test_path"), Some("tests/test_m.py"));
        assert!(state.context_data.contains_key("target_source"));

        // Seed fact is in place
        let memory = WorkingMemory::new(workflow.store().task_dir("fix-V-001"));
        let facts = memory.facts(None).unwrap();
        assert!(facts.iter().any(|f| f.category == FactCategory::CodeStructure));

        // Target snapshot artifact saved
        let snapshot = workflow
            .store()
            .load_artifact("fix-V-001", ArtifactKind::Inputs, "target.before")
            .unwrap();
        assert!(snapshot.unwrap().contains("def foo()"));
    }

    #[tokio::test]
    async fn test_resume_unknown_task_errors() {
        let temp = tempdir().unwrap();
        let workflow = FixWorkflow::with_config(
            temp.path(),
            Arc::new(MockProvider::new(vec![])),
            stub_tools(),
            ExecutorConfig {
                audit_enabled: false,
                ..ExecutorConfig::default()
            },
        );
        assert!(workflow.resume_task("missing", 3).await.is_err());
    }
}
