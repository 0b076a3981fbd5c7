//! Guarded phase machine
//!
//! Explicit state machine over the task phases. Every phase change goes
//! through a registered transition whose guards must all hold; per-phase
//! step ceilings force movement out of stuck phases. The machine is a value
//! object: it serializes to [`PhaseState`] and is rebuilt from that alone,
//! with the transition table and configs recreated by the factory.
//!
//! ```text
//! INIT ──▶ ANALYZE ──▶ PLAN ──▶ IMPLEMENT ◀──▶ VERIFY ──▶ COMPLETE
//!   └───────────────────────────────▲              (fails)
//!       (structure facts seeded)
//!
//!   [any non-terminal phase may move to FAILED or ESCALATED]
//! ```

use std::collections::HashMap;

use statestore::{Phase, PhaseState};
use tracing::{debug, info, warn};
use workmem::{Fact, FactCategory};

/// Everything a guard may inspect
#[derive(Debug, Clone, Default)]
pub struct PhaseContext {
    pub current_phase: Phase,
    pub steps_in_phase: u32,
    pub total_steps: u64,
    /// Derived from checks_failing == 0
    pub verification_passing: bool,
    pub tests_passing: bool,
    pub files_modified: Vec<String>,
    pub facts: Vec<Fact>,
    pub last_action: Option<String>,
    pub last_action_result: Option<String>,
}

impl PhaseContext {
    pub fn has_modifications(&self) -> bool {
        !self.files_modified.is_empty()
    }

    pub fn has_fact_of(&self, category: FactCategory) -> bool {
        self.facts.iter().any(|f| f.category == category)
    }
}

type Guard = fn(&PhaseContext) -> bool;

/// A registered transition between phases
#[derive(Debug, Clone)]
pub struct Transition {
    pub from: Phase,
    pub to: Phase,
    guards: Vec<Guard>,
    pub description: &'static str,
}

impl Transition {
    pub fn new(from: Phase, to: Phase, guards: Vec<Guard>, description: &'static str) -> Self {
        Self {
            from,
            to,
            guards,
            description,
        }
    }

    fn allowed(&self, context: &PhaseContext) -> bool {
        self.guards.iter().all(|guard| guard(context))
    }
}

/// Per-phase configuration: step ceiling plus success/failure conditions
struct PhaseConfig {
    max_steps: u32,
    success: Guard,
    failure: Option<Guard>,
    description: &'static str,
}

/// State machine for task phase management
pub struct PhaseMachine {
    transitions: HashMap<Phase, Vec<Transition>>,
    configs: HashMap<Phase, PhaseConfig>,
    current_phase: Phase,
    steps_in_phase: u32,
    phase_history: Vec<Phase>,
}

impl Default for PhaseMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl PhaseMachine {
    pub fn new() -> Self {
        let mut machine = Self {
            transitions: HashMap::new(),
            configs: HashMap::new(),
            current_phase: Phase::Init,
            steps_in_phase: 0,
            phase_history: Vec::new(),
        };
        machine.setup_default_transitions();
        machine.setup_default_configs();
        machine
    }

    /// Rebuild the machine from its persisted projection
    pub fn from_state(state: &PhaseState) -> Self {
        let mut machine = Self::new();
        machine.current_phase = state.current_phase;
        machine.steps_in_phase = state.steps_in_phase;
        machine.phase_history = state.phase_history.clone();
        machine
    }

    /// Serialize to the persisted projection
    pub fn to_state(&self) -> PhaseState {
        PhaseState {
            current_phase: self.current_phase,
            steps_in_phase: self.steps_in_phase,
            phase_history: self.phase_history.clone(),
        }
    }

    fn setup_default_transitions(&mut self) {
        // Registration order is the auto-transition preference: the
        // skip-ahead wins when precomputed analysis seeded structure facts.
        self.add_transition(Transition {
            from: Phase::Init,
            to: Phase::Implement,
            guards: vec![|ctx| ctx.has_fact_of(FactCategory::CodeStructure)],
            description: "Skip to implement when precomputed analysis is available",
        });
        self.add_transition(Transition {
            from: Phase::Init,
            to: Phase::Analyze,
            guards: vec![],
            description: "Begin analysis",
        });
        self.add_transition(Transition {
            from: Phase::Analyze,
            to: Phase::Plan,
            guards: vec![
                |ctx| ctx.steps_in_phase >= 1,
                |ctx| ctx.has_fact_of(FactCategory::CodeStructure),
            ],
            description: "Move to planning after analysis",
        });
        self.add_transition(Transition {
            from: Phase::Analyze,
            to: Phase::Implement,
            guards: vec![|ctx| ctx.has_fact_of(FactCategory::CodeStructure)],
            description: "Skip planning for simple cases",
        });
        self.add_transition(Transition {
            from: Phase::Plan,
            to: Phase::Implement,
            guards: vec![],
            description: "Begin implementation",
        });
        self.add_transition(Transition {
            from: Phase::Implement,
            to: Phase::Verify,
            guards: vec![|ctx| ctx.has_modifications()],
            description: "Verify changes after modification",
        });
        self.add_transition(Transition {
            from: Phase::Verify,
            to: Phase::Implement,
            guards: vec![|ctx| !ctx.verification_passing],
            description: "Return to implement when verification fails",
        });
        self.add_transition(Transition {
            from: Phase::Verify,
            to: Phase::Complete,
            guards: vec![|ctx| ctx.verification_passing, |ctx| ctx.tests_passing],
            description: "Complete when all checks pass",
        });

        for phase in [Phase::Init, Phase::Analyze, Phase::Plan, Phase::Implement, Phase::Verify] {
            self.add_transition(Transition {
                from: phase,
                to: Phase::Failed,
                guards: vec![|ctx| ctx.last_action_result.as_deref() == Some("fatal")],
                description: "Fail on fatal error",
            });
            self.add_transition(Transition {
                from: phase,
                to: Phase::Escalated,
                guards: vec![|ctx| {
                    matches!(ctx.last_action.as_deref(), Some("escalate") | Some("cannot_fix"))
                }],
                description: "Escalate to human",
            });
        }
    }

    fn setup_default_configs(&mut self) {
        self.configs.insert(Phase::Init, PhaseConfig {
            max_steps: 2,
            success: |_| true,
            failure: None,
            description: "Initial setup phase",
        });
        self.configs.insert(Phase::Analyze, PhaseConfig {
            max_steps: 5,
            success: |ctx| ctx.has_fact_of(FactCategory::CodeStructure),
            failure: None,
            description: "Understand the code and violation",
        });
        self.configs.insert(Phase::Plan, PhaseConfig {
            max_steps: 2,
            success: |_| true,
            failure: None,
            description: "Plan the fix approach",
        });
        self.configs.insert(Phase::Implement, PhaseConfig {
            max_steps: 15,
            success: |ctx| ctx.verification_passing,
            failure: Some(|ctx| ctx.steps_in_phase >= 12 && !ctx.has_modifications()),
            description: "Make code changes",
        });
        self.configs.insert(Phase::Verify, PhaseConfig {
            max_steps: 5,
            success: |ctx| ctx.verification_passing && ctx.tests_passing,
            failure: None,
            description: "Verify the fix is complete",
        });
    }

    pub fn add_transition(&mut self, transition: Transition) {
        self.transitions.entry(transition.from).or_default().push(transition);
    }

    pub fn current_phase(&self) -> Phase {
        self.current_phase
    }

    pub fn steps_in_phase(&self) -> u32 {
        self.steps_in_phase
    }

    pub fn phase_history(&self) -> &[Phase] {
        &self.phase_history
    }

    /// Max steps configured for the current phase (0 for terminal phases)
    pub fn max_steps(&self) -> u32 {
        self.configs.get(&self.current_phase).map(|c| c.max_steps).unwrap_or(0)
    }

    pub fn phase_description(&self) -> &'static str {
        self.configs
            .get(&self.current_phase)
            .map(|c| c.description)
            .unwrap_or("")
    }

    /// True when a registered transition to the target exists and all its
    /// guards hold
    pub fn can_transition(&self, to: Phase, context: &PhaseContext) -> bool {
        self.transitions
            .get(&self.current_phase)
            .map(|ts| ts.iter().any(|t| t.to == to && t.allowed(context)))
            .unwrap_or(false)
    }

    /// All currently valid transitions, in registration order
    pub fn available_transitions(&self, context: &PhaseContext) -> Vec<&Transition> {
        self.transitions
            .get(&self.current_phase)
            .map(|ts| ts.iter().filter(|t| t.allowed(context)).collect())
            .unwrap_or_default()
    }

    /// Attempt a guarded transition. Blocked transitions are logged at
    /// debug level and leave the machine unchanged.
    pub fn transition(&mut self, to: Phase, context: &PhaseContext) -> bool {
        if !self.can_transition(to, context) {
            debug!(
                from = %self.current_phase,
                to = %to,
                steps_in_phase = context.steps_in_phase,
                has_modifications = context.has_modifications(),
                verification_passing = context.verification_passing,
                "phase transition blocked"
            );
            return false;
        }

        info!(from = %self.current_phase, to = %to, "phase transition");
        self.phase_history.push(self.current_phase);
        self.current_phase = to;
        self.steps_in_phase = 0;
        true
    }

    /// Enter a terminal phase regardless of guard state. Terminal phases
    /// must stay reachable (budget exhausted, fatal tool error) even when
    /// no guard admits them; every bypass is logged.
    pub fn force_terminal(&mut self, to: Phase) {
        debug_assert!(to.is_terminal());
        warn!(from = %self.current_phase, to = %to, "terminal phase entered bypassing guards");
        self.phase_history.push(self.current_phase);
        self.current_phase = to;
        self.steps_in_phase = 0;
    }

    /// Record that a step ran in the current phase
    pub fn advance_step(&mut self) {
        self.steps_in_phase += 1;
    }

    /// Pick an automatic transition target:
    /// (a) the phase's success condition holds and a forward transition is
    ///     valid, (b) the step ceiling is hit and any transition is valid,
    /// (c) the failure condition holds -> FAILED. None otherwise.
    pub fn should_auto_transition(&self, context: &PhaseContext) -> Option<Phase> {
        let config = self.configs.get(&self.current_phase)?;

        if (config.success)(context) {
            let current_idx = self.current_phase.order_index();
            for t in self.available_transitions(context) {
                // Terminal phases are entered through action semantics
                // (complete/escalate) or explicit override, never silently
                if t.to.is_terminal() {
                    continue;
                }
                if let (Some(target_idx), Some(cur_idx)) = (t.to.order_index(), current_idx)
                    && target_idx > cur_idx
                {
                    return Some(t.to);
                }
            }
        }

        if self.steps_in_phase >= config.max_steps {
            if let Some(first) = self.available_transitions(context).first() {
                return Some(first.to);
            }
        }

        if let Some(failure) = config.failure
            && failure(context)
        {
            return Some(Phase::Failed);
        }

        None
    }

    /// Runtime diagnostics: issues that usually precede a stuck machine
    pub fn validate_state(&self, context: &PhaseContext) -> Vec<String> {
        let mut issues = Vec::new();

        if self.current_phase == Phase::Analyze
            && self.steps_in_phase >= 3
            && !context.has_fact_of(FactCategory::CodeStructure)
        {
            issues.push(format!(
                "Stuck in ANALYZE (step {}) without code_structure facts; cannot reach IMPLEMENT",
                self.steps_in_phase
            ));
        }

        if self.current_phase == Phase::Implement && !context.has_fact_of(FactCategory::CodeStructure) {
            issues.push("In IMPLEMENT without code_structure facts".to_string());
        }

        if let Some(config) = self.configs.get(&self.current_phase)
            && self.steps_in_phase >= config.max_steps / 2
            && self.available_transitions(context).is_empty()
        {
            issues.push(format!(
                "No transitions available from {} after {} steps",
                self.current_phase, self.steps_in_phase
            ));
        }

        issues
    }

    pub fn reset(&mut self) {
        self.current_phase = Phase::Init;
        self.steps_in_phase = 0;
        self.phase_history.clear();
    }
}
