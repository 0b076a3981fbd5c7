//! Per-step audit snapshots
//!
//! Every step leaves a traceable record: action, parameters, token
//! breakdown, and a reproducibility hash of the context. A terminal
//! summary closes out each task.
//!
//! ```text
//! .agentforge/context_audit/{task_id}/
//! ├── summary.yaml
//! ├── step_1.yaml
//! ├── step_1_context.yaml
//! └── ...
//! ```

use std::collections::HashMap;
use std::fs;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};

use chrono::Utc;
use eyre::{Context, Result};
use serde::Serialize;
use statestore::{ActionResult, Phase};
use tracing::debug;

use crate::context::CompactionOutcome;
use crate::response::Params;

/// One step's audit entry
#[derive(Debug, Serialize)]
struct StepEntry<'a> {
    task_id: &'a str,
    step: u64,
    timestamp: String,
    phase: String,
    action: &'a str,
    parameters: &'a Params,
    result: ActionResult,
    token_breakdown: &'a HashMap<String, usize>,
    total_tokens: usize,
    context_hash: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_tokens: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    compaction: Option<&'a CompactionOutcome>,
}

/// Task completion summary
#[derive(Debug, Serialize)]
struct TaskSummary<'a> {
    task_id: &'a str,
    completed_at: String,
    total_steps: usize,
    final_status: &'a str,
    total_input_tokens: u64,
    cached_tokens: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    compaction_events: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    total_tokens_saved: Option<usize>,
}

/// Writes (and reads back) audit files for one task
pub struct AuditLogger {
    audit_dir: PathBuf,
    task_id: String,
}

impl AuditLogger {
    pub fn new(project_root: impl AsRef<Path>, task_id: impl Into<String>) -> Result<Self> {
        let task_id = task_id.into();
        let audit_dir = project_root
            .as_ref()
            .join(".agentforge")
            .join("context_audit")
            .join(&task_id);
        fs::create_dir_all(&audit_dir).context("Failed to create audit directory")?;
        Ok(Self { audit_dir, task_id })
    }

    /// Snapshot one step. The context string is stored whole beside the
    /// entry; the entry carries only its hash.
    #[allow(clippy::too_many_arguments)]
    pub fn log_step(
        &self,
        step: u64,
        phase: Phase,
        action: &str,
        parameters: &Params,
        result: ActionResult,
        token_breakdown: &HashMap<String, usize>,
        context: &str,
        response: Option<&str>,
        compaction: Option<&CompactionOutcome>,
    ) -> Result<()> {
        let entry = StepEntry {
            task_id: &self.task_id,
            step,
            timestamp: Utc::now().to_rfc3339(),
            phase: phase.to_string(),
            action,
            parameters,
            result,
            token_breakdown,
            total_tokens: token_breakdown.values().sum(),
            context_hash: hash_context(context),
            response_tokens: response.map(|r| r.len() / 4),
            compaction,
        };

        self.write_yaml(&format!("step_{}.yaml", step), &entry)?;
        fs::write(self.audit_dir.join(format!("step_{}_context.yaml", step)), context)?;
        debug!(task_id = %self.task_id, step, "audit step logged");
        Ok(())
    }

    pub fn log_task_summary(
        &self,
        total_steps: usize,
        final_status: &str,
        total_tokens: u64,
        cached_tokens: u64,
        compaction_events: u32,
        tokens_saved: usize,
    ) -> Result<()> {
        let summary = TaskSummary {
            task_id: &self.task_id,
            completed_at: Utc::now().to_rfc3339(),
            total_steps,
            final_status,
            total_input_tokens: total_tokens,
            cached_tokens,
            compaction_events: (compaction_events > 0).then_some(compaction_events),
            total_tokens_saved: (compaction_events > 0).then_some(tokens_saved),
        };
        self.write_yaml("summary.yaml", &summary)
    }

    fn write_yaml<T: Serialize>(&self, filename: &str, data: &T) -> Result<()> {
        let content = serde_yaml::to_string(data)?;
        fs::write(self.audit_dir.join(filename), content).context("Failed to write audit file")?;
        Ok(())
    }

    // === Readers ===

    pub fn step_audit(&self, step: u64) -> Option<serde_yaml::Value> {
        let raw = fs::read_to_string(self.audit_dir.join(format!("step_{}.yaml", step))).ok()?;
        serde_yaml::from_str(&raw).ok()
    }

    pub fn step_context(&self, step: u64) -> Option<String> {
        fs::read_to_string(self.audit_dir.join(format!("step_{}_context.yaml", step))).ok()
    }

    pub fn summary(&self) -> Option<serde_yaml::Value> {
        let raw = fs::read_to_string(self.audit_dir.join("summary.yaml")).ok()?;
        serde_yaml::from_str(&raw).ok()
    }

    pub fn list_steps(&self) -> Vec<u64> {
        let mut steps: Vec<u64> = fs::read_dir(&self.audit_dir)
            .into_iter()
            .flatten()
            .flatten()
            .filter_map(|entry| {
                let name = entry.file_name().to_string_lossy().to_string();
                name.strip_prefix("step_")?.strip_suffix("_context.yaml")?.parse().ok()
            })
            .collect();
        steps.sort_unstable();
        steps
    }

    /// Task ids with a completed audit under the given project root
    pub fn list_task_audits(project_root: impl AsRef<Path>) -> Vec<String> {
        let root = project_root.as_ref().join(".agentforge").join("context_audit");
        let mut ids: Vec<String> = fs::read_dir(root)
            .into_iter()
            .flatten()
            .flatten()
            .filter(|entry| entry.path().join("summary.yaml").exists())
            .map(|entry| entry.file_name().to_string_lossy().to_string())
            .collect();
        ids.sort();
        ids
    }
}

/// Short reproducibility hash over the context text
fn hash_context(context: &str) -> String {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    context.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}
