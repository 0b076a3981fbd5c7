//! Adaptive step budget
//!
//! Prevents runaway execution while letting productive tasks run longer.
//! The budget grows with progress signals (file modifications, passing
//! checks, shrinking violation counts) up to a hard ceiling that is the
//! absolute cost control.

use regex::Regex;
use statestore::{ActionRecord, ActionResult};
use std::sync::OnceLock;
use tracing::debug;
use workmem::Fact;

use crate::loopdetect::{LoopDetection, LoopDetector};

/// Actions whose success counts as a concrete modification
const MUTATING_ACTIONS: &[&str] = &[
    "write_file",
    "edit_file",
    "replace_lines",
    "insert_lines",
    "extract_function",
];

/// Outcome of a continue/stop decision
#[derive(Debug, Clone)]
pub struct BudgetDecision {
    pub should_continue: bool,
    pub reason: String,
    pub detection: Option<LoopDetection>,
}

fn violations_paren_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"Violations?\s*\((\d+)\)").expect("static regex"))
}

fn violations_word_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)(\d+)\s+violations?").expect("static regex"))
}

fn parse_violation_count(summary: &str) -> Option<u64> {
    violations_paren_re()
        .captures(summary)
        .or_else(|| violations_word_re().captures(summary))
        .and_then(|c| c[1].parse().ok())
}

/// Dynamic step budget with loop detection
pub struct AdaptiveBudget {
    base_budget: u64,
    max_budget: u64,
    no_progress_threshold: u32,
    detector: Option<LoopDetector>,
    runaway_threshold: usize,
    progress_count: u64,
    no_progress_streak: u32,
    last_violation_count: Option<u64>,
    last_detection: Option<LoopDetection>,
}

impl Default for AdaptiveBudget {
    fn default() -> Self {
        Self::new(15, 50)
    }
}

impl AdaptiveBudget {
    pub fn new(base_budget: u64, max_budget: u64) -> Self {
        let runaway_threshold = 3;
        Self {
            base_budget,
            max_budget,
            no_progress_threshold: 3,
            detector: Some(LoopDetector::new(runaway_threshold, runaway_threshold + 1, 2, 4)),
            runaway_threshold,
            progress_count: 0,
            no_progress_streak: 0,
            last_violation_count: None,
            last_detection: None,
        }
    }

    pub fn with_no_progress_threshold(mut self, threshold: u32) -> Self {
        self.no_progress_threshold = threshold;
        self
    }

    /// Fall back to the simple identical-failure runaway check
    pub fn without_loop_detector(mut self) -> Self {
        self.detector = None;
        self
    }

    /// Decide whether execution should continue past this step.
    /// `step_number` is 1-indexed; `recent_actions` are most recent last.
    pub fn check_continue(
        &mut self,
        step_number: u64,
        recent_actions: &[ActionRecord],
        facts: Option<&[Fact]>,
    ) -> BudgetDecision {
        self.last_detection = None;

        // 1. Loop detection
        if let Some(detector) = &self.detector {
            let detection = detector.check(recent_actions, facts);
            if detection.detected {
                let loop_type = detection.loop_type.map(|t| t.to_string()).unwrap_or_default();
                let reason = format!("STOPPED: {} - {}", loop_type, detection.description);
                self.last_detection = Some(detection.clone());
                return BudgetDecision {
                    should_continue: false,
                    reason,
                    detection: Some(detection),
                };
            }
        } else if self.detect_runaway_legacy(recent_actions) {
            return BudgetDecision {
                should_continue: false,
                reason: "STOPPED: Runaway detected (same action failed 3+ times)".to_string(),
                detection: None,
            };
        }

        // 2. Progress tracking from the most recent action
        if self.update_progress(recent_actions) {
            self.no_progress_streak = 0;
        } else {
            self.no_progress_streak += 1;
            if self.no_progress_streak >= self.no_progress_threshold {
                return BudgetDecision {
                    should_continue: false,
                    reason: format!("STOPPED: No progress for {} consecutive steps", self.no_progress_streak),
                    detection: None,
                };
            }
        }

        // 3. Dynamic budget with hard ceiling
        let dynamic_budget = self.dynamic_budget();
        if step_number >= dynamic_budget {
            return BudgetDecision {
                should_continue: false,
                reason: format!("STOPPED: Budget exhausted ({}/{} steps)", step_number, dynamic_budget),
                detection: None,
            };
        }

        BudgetDecision {
            should_continue: true,
            reason: format!("Continue (step {}/{})", step_number, dynamic_budget),
            detection: None,
        }
    }

    /// Progress scoring: +1 per mutating success, +3 for a passing check,
    /// +2 when the violation count shrinks.
    fn update_progress(&mut self, recent_actions: &[ActionRecord]) -> bool {
        let Some(latest) = recent_actions.last() else {
            return false;
        };

        if latest.result == ActionResult::Success && MUTATING_ACTIONS.contains(&latest.action.as_str()) {
            self.progress_count += 1;
            debug!(progress = self.progress_count, "progress: file modification");
            return true;
        }

        if latest.summary.contains("Check PASSED") || latest.summary.contains('✓') {
            self.progress_count += 3;
            debug!(progress = self.progress_count, "progress: check passed");
            return true;
        }

        if latest.action == "run_check"
            && let Some(current) = parse_violation_count(&latest.summary)
        {
            let improved = self.last_violation_count.is_some_and(|last| current < last);
            self.last_violation_count = Some(current);
            if improved {
                self.progress_count += 2;
                debug!(progress = self.progress_count, current, "progress: violations decreased");
                return true;
            }
        }

        false
    }

    fn detect_runaway_legacy(&self, recent_actions: &[ActionRecord]) -> bool {
        if recent_actions.len() < self.runaway_threshold {
            return false;
        }
        let last_n = &recent_actions[recent_actions.len() - self.runaway_threshold..];

        if !last_n.iter().all(|a| a.result == ActionResult::Failure) {
            return false;
        }
        let first = &last_n[0];
        if !last_n.iter().all(|a| a.action == first.action) {
            return false;
        }
        last_n[1..]
            .iter()
            .all(|a| a.parameters == first.parameters || a.error == first.error)
    }

    pub fn dynamic_budget(&self) -> u64 {
        (self.base_budget + self.progress_count * 3).min(self.max_budget)
    }

    pub fn progress_count(&self) -> u64 {
        self.progress_count
    }

    pub fn last_detection(&self) -> Option<&LoopDetection> {
        self.last_detection.as_ref()
    }

    pub fn suggestions(&self) -> Vec<String> {
        self.last_detection
            .as_ref()
            .map(|d| d.suggestions.clone())
            .unwrap_or_default()
    }

    pub fn reset(&mut self) {
        self.progress_count = 0;
        self.no_progress_streak = 0;
        self.last_violation_count = None;
        self.last_detection = None;
    }
}
