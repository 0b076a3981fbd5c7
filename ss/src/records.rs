//! Record types persisted by the task state store

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::migrate::SCHEMA_VERSION;

/// Free-form task-type specific data (file_path, check_id, precomputed
/// analysis, modified-file list, ...)
pub type ContextData = serde_json::Map<String, serde_json::Value>;

/// Current UTC time
pub fn now() -> DateTime<Utc> {
    Utc::now()
}

/// Task execution phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    #[default]
    Init,
    Analyze,
    Plan,
    Implement,
    Verify,
    Complete,
    Failed,
    Escalated,
}

impl Phase {
    /// Terminal phases are absorbing: once entered, no further steps run.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Complete | Phase::Failed | Phase::Escalated)
    }

    /// Forward ordering of the canonical trajectory. Terminal failure
    /// phases have no position.
    pub fn order_index(&self) -> Option<usize> {
        match self {
            Phase::Init => Some(0),
            Phase::Analyze => Some(1),
            Phase::Plan => Some(2),
            Phase::Implement => Some(3),
            Phase::Verify => Some(4),
            Phase::Complete => Some(5),
            Phase::Failed | Phase::Escalated => None,
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Phase::Init => "init",
            Phase::Analyze => "analyze",
            Phase::Plan => "plan",
            Phase::Implement => "implement",
            Phase::Verify => "verify",
            Phase::Complete => "complete",
            Phase::Failed => "failed",
            Phase::Escalated => "escalated",
        };
        write!(f, "{}", s)
    }
}

/// Outcome of a dispatched action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ActionResult {
    #[default]
    Success,
    Failure,
    Partial,
    Skipped,
}

impl std::fmt::Display for ActionResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ActionResult::Success => "success",
            ActionResult::Failure => "failure",
            ActionResult::Partial => "partial",
            ActionResult::Skipped => "skipped",
        };
        write!(f, "{}", s)
    }
}

/// Immutable task specification - the "what" we're trying to do.
/// Written once at task creation, never modified.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub task_id: String,
    pub task_type: String,
    /// Single-sentence goal
    pub goal: String,
    pub success_criteria: Vec<String>,
    #[serde(default)]
    pub constraints: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl TaskSpec {
    /// Create a spec with a generated `task_<hex>` id
    pub fn new(task_type: impl Into<String>, goal: impl Into<String>, success_criteria: Vec<String>) -> Self {
        let task_id = format!("task_{}", &Uuid::now_v7().simple().to_string()[..8]);
        Self::with_id(task_id, task_type, goal, success_criteria)
    }

    /// Create a spec with a specific id (recovery, tests)
    pub fn with_id(
        task_id: impl Into<String>,
        task_type: impl Into<String>,
        goal: impl Into<String>,
        success_criteria: Vec<String>,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            task_type: task_type.into(),
            goal: goal.into(),
            success_criteria,
            constraints: Vec::new(),
            created_at: now(),
        }
    }

    /// Builder method to set constraints
    pub fn with_constraints(mut self, constraints: Vec<String>) -> Self {
        self.constraints = constraints;
        self
    }
}

/// Current verification status for a task
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VerificationStatus {
    #[serde(default)]
    pub checks_passing: u32,
    #[serde(default)]
    pub checks_failing: u32,
    #[serde(default)]
    pub tests_passing: bool,
    #[serde(default)]
    pub ready_for_completion: bool,
    #[serde(default)]
    pub last_check_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub details: serde_json::Map<String, serde_json::Value>,
}

impl VerificationStatus {
    /// Build a status with the derived ready flag.
    /// `ready_for_completion` holds iff no checks fail and tests pass.
    pub fn observed(
        checks_passing: u32,
        checks_failing: u32,
        tests_passing: bool,
        details: serde_json::Map<String, serde_json::Value>,
    ) -> Self {
        Self {
            checks_passing,
            checks_failing,
            tests_passing,
            ready_for_completion: checks_failing == 0 && tests_passing,
            last_check_time: Some(now()),
            details,
        }
    }
}

/// Record of one action taken during execution. Append-only per task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRecord {
    pub step: u64,
    pub action: String,
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default)]
    pub parameters: serde_json::Map<String, serde_json::Value>,
    pub result: ActionResult,
    /// One-line summary, kept short for prompt reuse
    pub summary: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub duration_ms: Option<u64>,
    #[serde(default)]
    pub error: Option<String>,
}

impl ActionRecord {
    pub fn new(step: u64, action: impl Into<String>, result: ActionResult, summary: impl Into<String>) -> Self {
        let mut summary = summary.into();
        if summary.len() > 200 {
            summary.truncate(200);
        }
        Self {
            step,
            action: action.into(),
            target: None,
            parameters: serde_json::Map::new(),
            result,
            summary,
            timestamp: now(),
            duration_ms: None,
            error: None,
        }
    }

    pub fn with_target(mut self, target: Option<String>) -> Self {
        self.target = target;
        self
    }

    pub fn with_parameters(mut self, parameters: serde_json::Map<String, serde_json::Value>) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    pub fn with_error(mut self, error: Option<String>) -> Self {
        self.error = error;
        self
    }
}

/// Serialized phase machine state. The transition table and per-phase
/// configs are rebuilt by factory; only this projection persists.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PhaseState {
    #[serde(default)]
    pub current_phase: Phase,
    #[serde(default)]
    pub steps_in_phase: u32,
    #[serde(default)]
    pub phase_history: Vec<Phase>,
}

/// Complete state for a task: the immutable spec plus the mutable
/// execution state persisted in state.yaml.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskState {
    pub spec: TaskSpec,
    pub phase: Phase,
    pub current_step: u64,
    pub verification: VerificationStatus,
    #[serde(default)]
    pub context_data: ContextData,
    #[serde(default)]
    pub phase_machine_state: PhaseState,
    pub last_updated: DateTime<Utc>,
    #[serde(default)]
    pub error: Option<String>,
    pub schema_version: String,
}

impl TaskState {
    /// Fresh state for a newly created task
    pub fn new(spec: TaskSpec, context_data: ContextData) -> Self {
        debug!(task_id = %spec.task_id, task_type = %spec.task_type, "TaskState::new");
        Self {
            spec,
            phase: Phase::Init,
            current_step: 0,
            verification: VerificationStatus::default(),
            context_data,
            phase_machine_state: PhaseState::default(),
            last_updated: now(),
            error: None,
            schema_version: SCHEMA_VERSION.to_string(),
        }
    }

    pub fn task_id(&self) -> &str {
        &self.spec.task_id
    }

    /// Files modified so far, tracked under `context_data["files_modified"]`
    pub fn files_modified(&self) -> Vec<String> {
        self.context_data
            .get("files_modified")
            .and_then(|v| v.as_array())
            .map(|a| a.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
            .unwrap_or_default()
    }

    /// Fetch a string value out of context_data
    pub fn context_str(&self, key: &str) -> Option<&str> {
        self.context_data.get(key).and_then(|v| v.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_terminal() {
        assert!(!Phase::Init.is_terminal());
        assert!(!Phase::Implement.is_terminal());
        assert!(Phase::Complete.is_terminal());
        assert!(Phase::Failed.is_terminal());
        assert!(Phase::Escalated.is_terminal());
    }

    #[test]
    fn test_phase_serde_snake_case() {
        let yaml = serde_yaml::to_string(&Phase::Implement).unwrap();
        assert_eq!(yaml.trim(), "implement");
        let back: Phase = serde_yaml::from_str("escalated").unwrap();
        assert_eq!(back, Phase::Escalated);
    }

    #[test]
    fn test_task_spec_generated_id() {
        let spec = TaskSpec::new("fix_violation", "Fix the thing", vec!["check passes".into()]);
        assert!(spec.task_id.starts_with("task_"));
        assert_eq!(spec.task_id.len(), "task_".len() + 8);
    }

    #[test]
    fn test_verification_ready_derivation() {
        let ok = VerificationStatus::observed(3, 0, true, serde_json::Map::new());
        assert!(ok.ready_for_completion);

        let failing = VerificationStatus::observed(2, 1, true, serde_json::Map::new());
        assert!(!failing.ready_for_completion);

        let no_tests = VerificationStatus::observed(3, 0, false, serde_json::Map::new());
        assert!(!no_tests.ready_for_completion);
    }

    #[test]
    fn test_action_record_summary_capped() {
        let long = "x".repeat(500);
        let record = ActionRecord::new(1, "read_file", ActionResult::Success, long);
        assert_eq!(record.summary.len(), 200);
    }

    #[test]
    fn test_task_state_round_trip() {
        let spec = TaskSpec::with_id("task_roundtrip", "fix_violation", "Goal", vec!["c1".into()]);
        let mut ctx = ContextData::new();
        ctx.insert("file_path".into(), serde_json::json!("src/m.py"));
        let state = TaskState::new(spec, ctx);

        let yaml = serde_yaml::to_string(&state).unwrap();
        let back: TaskState = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(state, back);
    }

    #[test]
    fn test_files_modified_accessor() {
        let spec = TaskSpec::with_id("t", "fix_violation", "Goal", vec![]);
        let mut ctx = ContextData::new();
        ctx.insert("files_modified".into(), serde_json::json!(["src/a.py", "src/b.py"]));
        let state = TaskState::new(spec, ctx);
        assert_eq!(state.files_modified(), vec!["src/a.py", "src/b.py"]);
    }
}
