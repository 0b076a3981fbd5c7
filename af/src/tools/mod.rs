//! Tool dispatch - registered actions behind one polymorphic seam
//!
//! Tools are polymorphic only over `execute(name, params, state) -> output`:
//! a registry of executors, not a class hierarchy. The dispatcher resolves
//! `complete`, `escalate`, and `cannot_fix` itself whenever no executor is
//! registered for them.

mod actions;
mod verify;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use statestore::{ActionResult, TaskState};
use tracing::debug;

use crate::response::Params;

pub use actions::FileActions;
pub use verify::{CheckRecorded, ExtractionVerified, SourceValidated, TestVerified, TestsRecorded, count_test_failures};

/// Result of one tool invocation
#[derive(Debug, Clone, Serialize)]
pub struct ActionOutput {
    pub status: ActionResult,
    pub summary: String,
    pub output: Option<String>,
    pub error: Option<String>,
    /// A fatal failure moves the task to FAILED and stops the loop
    pub fatal: bool,
    /// Action-specific extras (cannot_fix_reason, modified paths, ...)
    pub extras: serde_json::Map<String, serde_json::Value>,
}

impl ActionOutput {
    pub fn success(summary: impl Into<String>) -> Self {
        Self {
            status: ActionResult::Success,
            summary: summary.into(),
            output: None,
            error: None,
            fatal: false,
            extras: serde_json::Map::new(),
        }
    }

    pub fn failure(summary: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            status: ActionResult::Failure,
            summary: summary.into(),
            output: None,
            error: Some(error.into()),
            fatal: false,
            extras: serde_json::Map::new(),
        }
    }

    pub fn with_output(mut self, output: impl Into<String>) -> Self {
        self.output = Some(output.into());
        self
    }

    pub fn with_extra(mut self, key: &str, value: serde_json::Value) -> Self {
        self.extras.insert(key.to_string(), value);
        self
    }

    pub fn fatal(mut self) -> Self {
        self.fatal = true;
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == ActionResult::Success
    }

    /// Combined text the understanding extractor reads
    pub fn extraction_text(&self) -> String {
        let mut text = self.summary.clone();
        if let Some(error) = &self.error {
            text.push_str("\nError: ");
            text.push_str(error);
        }
        if let Some(output) = &self.output {
            text.push('\n');
            text.push_str(output);
        }
        text
    }
}

/// A registered action executor
#[async_trait]
pub trait ActionExecutor: Send + Sync {
    async fn execute(&self, action: &str, params: &Params, state: &TaskState) -> ActionOutput;
}

/// Adapter for plain functions, mostly used by tests and simple tools
pub struct FnExecutor<F>(pub F);

#[async_trait]
impl<F> ActionExecutor for FnExecutor<F>
where
    F: Fn(&str, &Params, &TaskState) -> ActionOutput + Send + Sync,
{
    async fn execute(&self, action: &str, params: &Params, state: &TaskState) -> ActionOutput {
        (self.0)(action, params, state)
    }
}

/// Registered-action table with dispatcher-level built-ins
#[derive(Default)]
pub struct ToolDispatcher {
    executors: HashMap<String, Arc<dyn ActionExecutor>>,
}

impl ToolDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, action_name: impl Into<String>, executor: Arc<dyn ActionExecutor>) {
        self.executors.insert(action_name.into(), executor);
    }

    pub fn has_action(&self, action_name: &str) -> bool {
        self.executors.contains_key(action_name)
    }

    pub fn action_names(&self) -> Vec<String> {
        self.executors.keys().cloned().collect()
    }

    /// Dispatch an action. Unregistered names fall back to the built-ins;
    /// anything else fails visibly so the loop detector can see it.
    pub async fn execute(&self, action_name: &str, params: &Params, state: &TaskState) -> ActionOutput {
        debug!(action = %action_name, "dispatch");
        if let Some(executor) = self.executors.get(action_name) {
            return executor.execute(action_name, params, state).await;
        }

        match action_name {
            "complete" => {
                if state.verification.ready_for_completion {
                    ActionOutput::success("Task marked complete")
                } else {
                    ActionOutput::failure("Cannot complete - verification not passing", "Verification not passing")
                }
            }
            "escalate" => ActionOutput::success("Escalated to human"),
            "cannot_fix" => {
                let reason = params
                    .get("reason")
                    .and_then(|v| v.as_str())
                    .unwrap_or("No reason provided")
                    .to_string();
                ActionOutput::success(format!("Cannot fix automatically: {}", reason))
                    .with_extra("cannot_fix_reason", serde_json::json!(reason))
            }
            other => ActionOutput::failure(
                format!("Unknown action: {}", other),
                format!("No executor registered for: {}", other),
            ),
        }
    }
}
