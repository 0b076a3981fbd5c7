//! Executor - the step loop
//!
//! One step: load state from disk, build a bounded two-message prompt,
//! elicit one action from the LLM, dispatch it, extract facts, advance the
//! phase machine, persist everything. No exception crosses this boundary;
//! anything that goes wrong inside a step becomes a failure outcome.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use eyre::Result;
use statestore::{ActionResult, Phase, TaskState, TaskStateStore};
use tracing::{debug, info, warn};
use workmem::WorkingMemory;

use crate::audit::AuditLogger;
use crate::budget::AdaptiveBudget;
use crate::context::{ContextBuilder, FingerprintSource, ProjectFingerprint};
use crate::llm::LlmProvider;
use crate::outcome::{StepOutcome, determine_final_status};
use crate::phase::{PhaseContext, PhaseMachine};
use crate::response::{Params, parse_action};
use crate::tools::{ActionExecutor, ActionOutput, ToolDispatcher};
use crate::understand::{FactStore, UnderstandingExtractor};

/// Executor tuning knobs, injected at construction
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Prompt token budget enforced by compaction
    pub prompt_max_tokens: usize,
    /// Response token ceiling passed to the provider
    pub response_max_tokens: u32,
    /// Hard bound on one LLM call
    pub llm_timeout: Duration,
    pub audit_enabled: bool,
    pub base_budget: u64,
    pub max_budget: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        // The single environment toggle; everything else is constructed
        let audit_enabled = std::env::var("AGENTFORGE_AUDIT_ENABLED")
            .map(|v| v.to_lowercase() != "false")
            .unwrap_or(true);
        Self {
            prompt_max_tokens: crate::context::DEFAULT_MAX_TOKENS,
            response_max_tokens: 1024,
            llm_timeout: Duration::from_secs(120),
            audit_enabled,
            base_budget: 15,
            max_budget: 50,
        }
    }
}

#[derive(Default)]
struct RunStats {
    compaction_events: u32,
    tokens_saved: usize,
}

/// Executes agent steps with minimal, stateless context
pub struct Executor {
    project_root: PathBuf,
    store: Arc<TaskStateStore>,
    provider: Arc<dyn LlmProvider>,
    dispatcher: ToolDispatcher,
    builder: ContextBuilder,
    extractor: UnderstandingExtractor,
    config: ExecutorConfig,
    stats: Mutex<RunStats>,
}

impl Executor {
    pub fn new(
        project_root: impl AsRef<Path>,
        store: Arc<TaskStateStore>,
        provider: Arc<dyn LlmProvider>,
        dispatcher: ToolDispatcher,
    ) -> Self {
        let project_root = project_root.as_ref().to_path_buf();
        let config = ExecutorConfig::default();
        let fingerprint: Box<dyn FingerprintSource> = Box::new(ProjectFingerprint::new(&project_root));
        let builder = ContextBuilder::new(store.clone(), fingerprint).with_max_tokens(config.prompt_max_tokens);
        Self {
            project_root,
            store,
            provider,
            dispatcher,
            builder,
            extractor: UnderstandingExtractor::new(),
            config,
            stats: Mutex::new(RunStats::default()),
        }
    }

    pub fn with_config(mut self, config: ExecutorConfig) -> Self {
        self.builder = self.builder.with_max_tokens(config.prompt_max_tokens);
        self.config = config;
        self
    }

    pub fn register_action(&mut self, name: impl Into<String>, executor: Arc<dyn ActionExecutor>) {
        self.dispatcher.register(name, executor);
    }

    pub fn store(&self) -> &Arc<TaskStateStore> {
        &self.store
    }

    fn memory(&self, task_id: &str) -> WorkingMemory {
        WorkingMemory::new(self.store.task_dir(task_id))
    }

    /// Execute one agent step. All context comes from disk; nothing
    /// propagates out of this call except the outcome.
    pub async fn execute_step(&self, task_id: &str) -> StepOutcome {
        let start = Instant::now();
        match self.try_execute_step(task_id, start).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(%task_id, error = %e, "step failed");
                failure_outcome("error", e.to_string(), start)
            }
        }
    }

    async fn try_execute_step(&self, task_id: &str, start: Instant) -> Result<StepOutcome> {
        // 1. Load and validate state
        let Some(mut state) = self.store.load(task_id)? else {
            return Ok(failure_outcome("error", format!("Task not found: {}", task_id), start));
        };
        if state.phase.is_terminal() {
            return Ok(StepOutcome {
                success: true,
                action_name: "already_complete".to_string(),
                action_params: Params::new(),
                result: ActionResult::Success,
                summary: format!("Task already in {} state", state.phase),
                should_continue: false,
                tokens_used: 0,
                duration_ms: start.elapsed().as_millis() as u64,
                error: None,
                loop_detected: None,
            });
        }

        // A crash between record_action and increment_step leaves the log
        // one record ahead of the counter; resync instead of re-recording.
        if let Some(last) = self.store.recent_actions(task_id, 1)?.last()
            && last.step > state.current_step
        {
            warn!(%task_id, log_step = last.step, counter = state.current_step, "step gap detected, resyncing counter");
            self.store.increment_step(task_id)?;
            state = self
                .store
                .load(task_id)?
                .ok_or_else(|| eyre::eyre!("Task vanished during resync: {}", task_id))?;
        }

        // 2. Build the two-message prompt
        let built = self.builder.build(task_id)?;
        if let Some(compaction) = &built.compaction
            && compaction.applied()
        {
            let mut stats = self.stats.lock().expect("stats lock");
            stats.compaction_events += 1;
            stats.tokens_saved += compaction.tokens_saved();
        }

        // 3. One fresh LLM conversation
        let prompt = format!(
            "<system>\n{}\n</system>\n\n<user>\n{}\n</user>",
            built.system_message, built.user_message
        );
        let completion = tokio::time::timeout(
            self.config.llm_timeout,
            self.provider.generate(&prompt, self.config.response_max_tokens),
        )
        .await
        .map_err(|_| eyre::eyre!("LLM call timed out after {:?}", self.config.llm_timeout))??;

        let tokens_used = completion
            .usage
            .map(|u| u.total())
            .unwrap_or_else(|| (self.provider.count_tokens(&prompt) + self.provider.count_tokens(&completion.text)) as u64);

        // 4. Parse the action (never fails; degrades to "unknown")
        let (action_name, action_params) = parse_action(&completion.text);
        debug!(%task_id, action = %action_name, "action parsed");

        // 5. Dispatch
        let output = self.dispatcher.execute(&action_name, &action_params, &state).await;

        // 6. Record: action log first, then the step counter
        let target = action_params
            .get("path")
            .or_else(|| action_params.get("file_path"))
            .and_then(|v| v.as_str())
            .map(str::to_string);
        self.store.record_action(
            task_id,
            &action_name,
            target.clone(),
            action_params.clone(),
            output.status,
            &output.summary,
            Some(start.elapsed().as_millis() as u64),
            output.error.clone(),
        )?;
        let step = self.store.increment_step(task_id)?;

        let memory = self.memory(task_id);
        memory.add_action_result(&action_name, &output.status.to_string(), &output.summary, step, target)?;

        // 7. Understanding
        let facts = self
            .extractor
            .extract(&action_name, &output.extraction_text(), output.status, step, false);
        let mut fact_store = FactStore::from_memory(&memory)?;
        fact_store.add_many(facts);
        fact_store.persist(&memory)?;

        // Side-channel results the dispatcher surfaced
        if action_name == "cannot_fix" {
            let reason = output
                .extras
                .get("cannot_fix_reason")
                .cloned()
                .unwrap_or_else(|| serde_json::json!("Unknown reason"));
            self.store.update_context_data(task_id, "cannot_fix_reason", reason)?;
        }
        if output.fatal && output.status == ActionResult::Failure {
            self.store
                .set_error(task_id, output.error.as_deref().unwrap_or("Unknown error"))?;
        }

        // 8-9. Phase machine
        self.handle_phase_transition(task_id, &action_name, &output)?;

        let final_phase = self.store.load(task_id)?.map(|s| s.phase).unwrap_or(state.phase);
        let should_continue = !matches!(action_name.as_str(), "complete" | "escalate" | "cannot_fix")
            && !output.fatal
            && !final_phase.is_terminal();

        Ok(StepOutcome {
            success: true,
            action_name,
            action_params,
            result: output.status,
            summary: output.summary,
            should_continue,
            tokens_used,
            duration_ms: start.elapsed().as_millis() as u64,
            error: output.error,
            loop_detected: None,
        })
    }

    fn handle_phase_transition(&self, task_id: &str, action_name: &str, output: &ActionOutput) -> Result<()> {
        let Some(state) = self.store.load(task_id)? else {
            return Ok(());
        };
        let mut machine = PhaseMachine::from_state(&state.phase_machine_state);
        let context = self.build_phase_context(
            &machine,
            &state,
            Some(action_name.to_string()),
            Some(if output.fatal {
                "fatal".to_string()
            } else {
                output.status.to_string()
            }),
        )?;
        machine.advance_step();

        for issue in machine.validate_state(&context) {
            debug!(%task_id, %issue, "phase machine diagnostic");
        }

        let target = if action_name == "complete" && output.is_success() {
            Some(Phase::Complete)
        } else if matches!(action_name, "escalate" | "cannot_fix") {
            Some(Phase::Escalated)
        } else if output.fatal && output.status == ActionResult::Failure {
            Some(Phase::Failed)
        } else {
            machine.should_auto_transition(&context)
        };

        if let Some(target) = target {
            if machine.transition(target, &context) {
                self.store.update_phase(task_id, target)?;
            } else if target.is_terminal() {
                machine.force_terminal(target);
                self.store.update_phase(task_id, target)?;
            }
        }
        self.store.update_phase_machine(task_id, machine.to_state())?;
        Ok(())
    }

    fn build_phase_context(
        &self,
        machine: &PhaseMachine,
        state: &TaskState,
        last_action: Option<String>,
        last_action_result: Option<String>,
    ) -> Result<PhaseContext> {
        let memory = self.memory(state.task_id());
        Ok(PhaseContext {
            current_phase: machine.current_phase(),
            steps_in_phase: machine.steps_in_phase(),
            total_steps: state.current_step,
            verification_passing: state.verification.checks_failing == 0,
            tests_passing: state.verification.tests_passing,
            files_modified: state.files_modified(),
            facts: memory.facts(None)?,
            last_action,
            last_action_result,
        })
    }

    /// A detected loop does not stop the run when the phase machine is
    /// about to move somewhere new; the transition may break the loop.
    fn can_recover_via_phase(&self, task_id: &str, outcome: &StepOutcome) -> bool {
        let Ok(Some(state)) = self.store.load(task_id) else {
            return false;
        };
        let machine = PhaseMachine::from_state(&state.phase_machine_state);
        let Ok(context) = self.build_phase_context(
            &machine,
            &state,
            Some(outcome.action_name.clone()),
            Some(outcome.result.to_string()),
        ) else {
            return false;
        };
        match machine.should_auto_transition(&context) {
            Some(target) => target != machine.current_phase() && !target.is_terminal(),
            None => false,
        }
    }

    /// Run a task to termination: completion, escalation, failure, or a
    /// budget/loop stop.
    pub async fn run_until_complete(&self, task_id: &str, max_iterations: usize) -> Vec<StepOutcome> {
        self.run_with(task_id, max_iterations, None, |_| {}).await
    }

    pub async fn run_with(
        &self,
        task_id: &str,
        max_iterations: usize,
        budget: Option<AdaptiveBudget>,
        mut on_step: impl FnMut(&StepOutcome),
    ) -> Vec<StepOutcome> {
        *self.stats.lock().expect("stats lock") = RunStats::default();
        let audit = if self.config.audit_enabled {
            AuditLogger::new(&self.project_root, task_id).ok()
        } else {
            None
        };

        let mut budget =
            budget.unwrap_or_else(|| AdaptiveBudget::new(self.config.base_budget, max_iterations as u64));
        let mut outcomes: Vec<StepOutcome> = Vec::new();

        for i in 0..max_iterations {
            let outcome = self.execute_step(task_id).await;
            self.log_step_audit(audit.as_ref(), task_id, &outcome);
            on_step(&outcome);
            outcomes.push(outcome);

            let last = outcomes.last().expect("just pushed");
            if !last.should_continue {
                break;
            }

            let recent = self.store.recent_actions(task_id, 5).unwrap_or_default();
            let facts = self.memory(task_id).facts(None).unwrap_or_default();
            let decision = budget.check_continue((i + 1) as u64, &recent, Some(&facts));

            if decision.should_continue {
                continue;
            }

            if let Some(detection) = decision.detection.filter(|d| d.detected) {
                let last = outcomes.last().expect("just pushed");
                if self.can_recover_via_phase(task_id, last) {
                    info!(%task_id, "loop detected but a phase transition is pending; continuing");
                    continue;
                }
                for suggestion in detection.suggestions.iter().take(3) {
                    info!(%task_id, %suggestion, "loop suggestion");
                }
                let last = outcomes.last_mut().expect("just pushed");
                last.loop_detected = Some(detection);
                last.should_continue = false;
            }

            info!(%task_id, reason = %decision.reason, "run stopped");
            break;
        }

        let final_status = determine_final_status(&outcomes);
        info!(%task_id, %final_status, steps = outcomes.len(), "run finished");
        if let Some(audit) = &audit {
            let total_tokens: u64 = outcomes.iter().map(|o| o.tokens_used).sum();
            let stats = self.stats.lock().expect("stats lock");
            let _ = audit.log_task_summary(
                outcomes.len(),
                final_status,
                total_tokens,
                0,
                stats.compaction_events,
                stats.tokens_saved,
            );
        }

        outcomes
    }

    fn log_step_audit(&self, audit: Option<&AuditLogger>, task_id: &str, outcome: &StepOutcome) {
        let Some(audit) = audit else {
            return;
        };
        let Ok(Some(state)) = self.store.load(task_id) else {
            return;
        };

        let mut token_breakdown = HashMap::new();
        token_breakdown.insert(
            "action".to_string(),
            serde_json::to_string(&outcome.action_params).map(|s| s.len() / 4).unwrap_or(0),
        );
        token_breakdown.insert("result".to_string(), outcome.summary.len() / 4);

        let context_snapshot = serde_yaml::to_string(&serde_json::json!({
            "step": state.current_step,
            "phase": state.phase.to_string(),
            "action": outcome.action_name,
            "action_params": outcome.action_params,
            "result": outcome.result.to_string(),
        }))
        .unwrap_or_default();

        if let Err(e) = audit.log_step(
            state.current_step,
            state.phase,
            &outcome.action_name,
            &outcome.action_params,
            outcome.result,
            &token_breakdown,
            &context_snapshot,
            Some(&outcome.summary),
            None,
        ) {
            warn!(%task_id, error = %e, "audit step logging failed");
        }
    }
}

fn failure_outcome(action: &str, error: String, start: Instant) -> StepOutcome {
    StepOutcome {
        success: false,
        action_name: action.to_string(),
        action_params: Params::new(),
        result: ActionResult::Failure,
        summary: error.clone(),
        should_continue: false,
        tokens_used: 0,
        duration_ms: start.elapsed().as_millis() as u64,
        error: Some(error),
        loop_detected: None,
    }
}
