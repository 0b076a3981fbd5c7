//! Step outcome - the result of one executor iteration

use statestore::ActionResult;

use crate::loopdetect::LoopDetection;
use crate::response::Params;

/// Result of executing a single agent step
#[derive(Debug, Clone)]
pub struct StepOutcome {
    /// Whether the step itself ran without an engine error (a failed
    /// action is still a successful step)
    pub success: bool,
    pub action_name: String,
    pub action_params: Params,
    pub result: ActionResult,
    pub summary: String,
    pub should_continue: bool,
    pub tokens_used: u64,
    pub duration_ms: u64,
    pub error: Option<String>,
    pub loop_detected: Option<LoopDetection>,
}

impl StepOutcome {
    pub fn is_terminal(&self) -> bool {
        matches!(self.action_name.as_str(), "complete" | "escalate" | "cannot_fix") || !self.should_continue
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some() || self.result == ActionResult::Failure
    }
}

/// Final task status derived from the last outcome:
/// completed / escalated / failed / stopped.
pub fn determine_final_status(outcomes: &[StepOutcome]) -> &'static str {
    let Some(last) = outcomes.last() else {
        return "no_outcomes";
    };
    match last.action_name.as_str() {
        "complete" => "completed",
        "escalate" | "cannot_fix" => "escalated",
        _ if last.error.is_some() => "failed",
        _ => "stopped",
    }
}
