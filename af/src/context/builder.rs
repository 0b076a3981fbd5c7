//! Context builder - assembles the two-message prompt for a step
//!
//! The user message is a sequence of labeled blocks in strict order:
//! fingerprint, task, phase, phase-specific precomputed sections,
//! understanding, recent actions, available actions, directive. The system
//! message is phase-specific boilerplate. Over-budget prompts go through
//! progressive compaction; fingerprint, task, and phase always survive.

use std::collections::HashMap;
use std::sync::Arc;

use eyre::{Result, eyre};
use serde_yaml::Value;
use statestore::{Phase, TaskState, TaskStateStore};
use tracing::{debug, warn};
use workmem::WorkingMemory;

use crate::phase::PhaseMachine;

use super::compaction::{CompactionManager, CompactionOutcome, Section};
use super::fingerprint::FingerprintSource;
use super::prompts::PromptRegistry;

/// Default prompt token budget
pub const DEFAULT_MAX_TOKENS: usize = 4000;

/// Precomputed context_data keys surfaced as tier-2 sections, in order
const TIER2_KEYS: &[&str] = &[
    "violation",
    "check_definition",
    "target_source",
    "extraction_candidates",
    "similar_fixes",
    "similar_implementations",
    "action_hints",
    "related_patterns",
    "file_overview",
    "related_code",
    "additional",
];

/// A fully built step context
#[derive(Debug)]
pub struct BuiltContext {
    pub system_message: String,
    pub user_message: String,
    pub phase: Phase,
    pub total_tokens: usize,
    /// Section name -> token estimate
    pub token_breakdown: HashMap<String, usize>,
    pub warnings: Vec<String>,
    pub compaction: Option<CompactionOutcome>,
}

/// Builds bounded prompts from persisted state and working memory
pub struct ContextBuilder {
    store: Arc<TaskStateStore>,
    fingerprint: Box<dyn FingerprintSource>,
    prompts: PromptRegistry,
    max_tokens: usize,
}

impl ContextBuilder {
    pub fn new(store: Arc<TaskStateStore>, fingerprint: Box<dyn FingerprintSource>) -> Self {
        Self {
            store,
            fingerprint,
            prompts: PromptRegistry::new(),
            max_tokens: DEFAULT_MAX_TOKENS,
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    /// Build the (system, user) message pair for a step
    pub fn build_messages(&self, task_id: &str) -> Result<(String, String)> {
        let built = self.build(task_id)?;
        Ok((built.system_message, built.user_message))
    }

    /// Token breakdown diagnostic for the prompt a step would get
    pub fn token_breakdown(&self, task_id: &str) -> Result<HashMap<String, usize>> {
        Ok(self.build(task_id)?.token_breakdown)
    }

    pub fn build(&self, task_id: &str) -> Result<BuiltContext> {
        let state = self
            .store
            .load(task_id)?
            .ok_or_else(|| eyre!("Task not found: {}", task_id))?;

        let machine = PhaseMachine::from_state(&state.phase_machine_state);
        let phase = machine.current_phase();

        let system_message = self.prompts.system_prompt(
            phase,
            state.task_id(),
            &state.spec.goal,
            &state.spec.task_type,
        )?;

        let memory = WorkingMemory::new(self.store.task_dir(task_id));
        let mut sections = self.assemble_sections(&state, &machine, &memory)?;

        // Enforce the token budget over the user-message sections
        let system_tokens = system_message.len() / 4;
        let mut compaction_outcome = None;
        if system_tokens + CompactionManager::estimate_tokens(&sections) > self.max_tokens {
            let budget = self.max_tokens.saturating_sub(system_tokens);
            let manager = CompactionManager::new(budget);
            let outcome = manager.compact(&mut sections);
            debug!(
                original = outcome.original_tokens,
                final_tokens = outcome.final_tokens,
                rules = outcome.rules_applied.len(),
                "context compacted"
            );
            compaction_outcome = Some(outcome);
        }

        let token_breakdown: HashMap<String, usize> = {
            let mut breakdown: HashMap<String, usize> = sections
                .iter()
                .map(|s| (s.name.clone(), s.estimate_tokens()))
                .collect();
            breakdown.insert("system_prompt".to_string(), system_tokens);
            breakdown
        };
        let total_tokens = token_breakdown.values().sum();

        let user_message = render_sections(&sections);
        let warnings = self.validate(&state, total_tokens);
        for warning in &warnings {
            warn!(%task_id, %warning, "context validation");
        }

        Ok(BuiltContext {
            system_message,
            user_message,
            phase,
            total_tokens,
            token_breakdown,
            warnings,
            compaction: compaction_outcome,
        })
    }

    fn assemble_sections(
        &self,
        state: &TaskState,
        machine: &PhaseMachine,
        memory: &WorkingMemory,
    ) -> Result<Vec<Section>> {
        let mut sections = Vec::new();

        sections.push(Section::text("fingerprint", self.fingerprint.fingerprint()));

        let task_value: Value = serde_yaml::to_value(serde_json::json!({
            "id": state.task_id(),
            "type": state.spec.task_type,
            "goal": state.spec.goal,
            "step": state.current_step,
            "success_criteria": state.spec.success_criteria,
            "constraints": state.spec.constraints,
        }))?;
        sections.push(Section::new("task", task_value));

        let phase_value: Value = serde_yaml::to_value(serde_json::json!({
            "current": machine.current_phase().to_string(),
            "steps_in_phase": machine.steps_in_phase(),
            "max_steps": machine.max_steps(),
            "description": machine.phase_description(),
        }))?;
        sections.push(Section::new("phase", phase_value));

        // Tier 2: precomputed sections out of context_data, fixed order
        for key in TIER2_KEYS {
            if let Some(value) = state.context_data.get(*key) {
                sections.push(Section::new(*key, serde_yaml::to_value(value)?));
            }
        }

        // Loaded file content from working memory. The target file becomes
        // target_source unless precomputed already provided one; the rest
        // folds into the removable additional section.
        let target_key = state.context_str("file_path").map(|p| format!("full_file:{}", p));
        let mut additional_parts: Vec<String> = Vec::new();
        for (key, content) in memory.loaded_context(Some(state.current_step))? {
            let is_target = target_key.as_deref() == Some(key.as_str());
            if is_target && !sections.iter().any(|s| s.name == "target_source") {
                sections.push(Section::text("target_source", content));
            } else {
                additional_parts.push(format!("## {}\n{}", key, content));
            }
        }
        if !additional_parts.is_empty() {
            let merged = additional_parts.join("\n\n");
            match sections.iter_mut().find(|s| s.name == "additional") {
                Some(section) => {
                    if let Value::String(existing) = &section.value {
                        section.value = Value::String(format!("{}\n\n{}", existing, merged));
                    }
                }
                None => sections.push(Section::text("additional", merged)),
            }
        }

        // Understanding: confident facts, most valuable first
        let mut facts = memory.facts(Some(0.7))?;
        facts.sort_by(|a, b| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(b.step.cmp(&a.step))
        });
        if !facts.is_empty() {
            let fact_lines: Vec<Value> = facts
                .iter()
                .map(|f| Value::String(format!("{} (conf: {}, {})", f.statement, f.confidence, f.category)))
                .collect();
            sections.push(Section::new("understanding", Value::Sequence(fact_lines)));
        }

        // Recent actions, chronological
        let recent = memory.action_results(3, Some(state.current_step))?;
        if !recent.is_empty() {
            let entries: Vec<Value> = recent
                .iter()
                .map(|a| {
                    serde_yaml::to_value(serde_json::json!({
                        "step": a.step,
                        "action": a.action,
                        "result": a.result,
                        "summary": a.summary,
                    }))
                    .unwrap_or(Value::Null)
                })
                .collect();
            sections.push(Section::new("recent", Value::Sequence(entries)));
        }

        sections.push(Section::text("available_actions", available_actions(machine.current_phase())));
        sections.push(Section::text("directive", DIRECTIVE));

        Ok(sections)
    }

    /// Non-fatal checks on the built context
    fn validate(&self, state: &TaskState, total_tokens: usize) -> Vec<String> {
        let mut warnings = Vec::new();

        if state.spec.task_type == "fix_violation" && state.context_str("file_path").is_none() {
            warnings.push("fix_violation task without file_path in context_data".to_string());
        }

        if state.context_data.contains_key("extraction_candidates") && !state.context_data.contains_key("action_hints")
        {
            warnings.push("extraction_candidates present but extract_function has no value hints".to_string());
        }

        if total_tokens < 100 {
            warnings.push(format!("suspiciously small context ({} tokens)", total_tokens));
        }

        warnings
    }
}

const DIRECTIVE: &str = "Choose ONE action and respond with:\n```action\naction: action_name\nparameters:\n  key: value\nreasoning: brief explanation\n```";

/// Actions offered to the LLM in each phase
fn available_actions(phase: Phase) -> String {
    let mut actions: Vec<&str> = vec![
        "- read_file: Read file contents",
        "- escalate: Request human assistance",
        "- cannot_fix: Give up with a reason",
    ];

    match phase {
        Phase::Init | Phase::Analyze => {
            actions.push("- load_context: Load additional file context");
            actions.push("- run_check: Run conformance check");
            if phase == Phase::Analyze {
                actions.push("- extract_function: Extract code into new function");
                actions.push("- simplify_conditional: Convert to guard clause");
            }
        }
        Phase::Plan => {
            actions.push("- plan_fix: Record diagnosis and approach");
        }
        Phase::Implement => {
            actions.push("- extract_function: Extract code into new function");
            actions.push("- simplify_conditional: Convert to guard clause");
            actions.push("- edit_file: Replace old_text with new_text");
            actions.push("- replace_lines: Replace a line range");
            actions.push("- insert_lines: Insert lines at a position");
            actions.push("- write_file: Write full file content");
            actions.push("- run_check: Run conformance check");
        }
        Phase::Verify | Phase::Complete | Phase::Failed | Phase::Escalated => {
            actions.push("- run_check: Run conformance check");
            actions.push("- run_tests: Run test suite");
            actions.push("- complete: Mark task as complete");
        }
    }

    actions.join("\n")
}

fn section_title(name: &str) -> String {
    match name {
        "fingerprint" => "Project Fingerprint".to_string(),
        "recent" => "Recent Actions".to_string(),
        other => other
            .split('_')
            .map(|word| {
                let mut chars = word.chars();
                match chars.next() {
                    Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                    None => String::new(),
                }
            })
            .collect::<Vec<_>>()
            .join(" "),
    }
}

fn render_sections(sections: &[Section]) -> String {
    sections
        .iter()
        .map(|section| {
            let body = match &section.value {
                Value::String(s) => s.clone(),
                other => serde_yaml::to_string(other).unwrap_or_default(),
            };
            format!("# {}\n{}", section_title(&section.name), body.trim_end())
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}
