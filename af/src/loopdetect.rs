//! Loop detection - recognizing non-progressive action patterns
//!
//! Goes beyond "same action repeated": semantic loops (different actions,
//! one outcome), error cycling (A fails, B fails, A again), and no-progress
//! runs of read/check operations. First matching type wins, most specific
//! first.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use statestore::{ActionRecord, ActionResult};
use workmem::{Fact, FactCategory};

/// Types of loops we can detect
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopType {
    /// Same action + params (or error) repeated
    IdenticalAction,
    /// Different actions, same outcome
    SemanticLoop,
    /// A fails -> B fails -> A again
    ErrorCycle,
    /// Actions run but nothing changes
    NoProgress,
}

impl std::fmt::Display for LoopType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LoopType::IdenticalAction => "IDENTICAL_ACTION",
            LoopType::SemanticLoop => "SEMANTIC_LOOP",
            LoopType::ErrorCycle => "ERROR_CYCLE",
            LoopType::NoProgress => "NO_PROGRESS",
        };
        write!(f, "{}", s)
    }
}

/// Result of a loop check
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoopDetection {
    pub detected: bool,
    pub loop_type: Option<LoopType>,
    pub confidence: f64,
    pub description: String,
    pub suggestions: Vec<String>,
    pub evidence: Vec<String>,
}

impl LoopDetection {
    fn none() -> Self {
        Self::default()
    }
}

/// Semantic signature of an action for comparison. Two actions with the
/// same signature are equivalent even when exact parameters differ.
#[derive(Debug, Clone, PartialEq)]
struct ActionSignature {
    action_type: String,
    target_file: Option<String>,
    target_entity: Option<String>,
    outcome: ActionResult,
    error_category: Option<String>,
}

fn categorize_action(action_name: &str) -> String {
    match action_name {
        "edit_file" | "replace_lines" | "insert_lines" | "write_file" => "edit".to_string(),
        "extract_function" | "simplify_conditional" => "extract".to_string(),
        "run_check" | "run_conformance_check" | "run_tests" => "check".to_string(),
        "read_file" | "load_context" => "read".to_string(),
        "complete" | "escalate" | "cannot_fix" => "complete".to_string(),
        other => other.to_string(),
    }
}

fn categorize_error(error: &str) -> String {
    let lower = error.to_lowercase();
    if lower.contains("not found") {
        "not_found".to_string()
    } else if lower.contains("syntax") {
        "syntax_error".to_string()
    } else if lower.contains("control flow") || lower.contains("cannot extract") {
        "extraction_blocked".to_string()
    } else if lower.contains("broke tests") || lower.contains("reverted") {
        "test_regression".to_string()
    } else {
        "other".to_string()
    }
}

/// Actions that never indicate progress on their own
const NON_MUTATING_ACTIONS: &[&str] = &["read_file", "load_context", "run_check", "run_tests"];

/// Summary statistics over recent actions
#[derive(Debug, Clone, Serialize)]
pub struct ActionSummary {
    pub total: usize,
    pub by_action: HashMap<String, usize>,
    pub by_result: HashMap<String, usize>,
    pub success_rate: f64,
    pub most_common: Option<String>,
}

/// Detects loops in agent execution
pub struct LoopDetector {
    identical_threshold: usize,
    semantic_threshold: usize,
    cycle_threshold: usize,
    no_progress_threshold: usize,
}

impl Default for LoopDetector {
    fn default() -> Self {
        Self::new(3, 4, 2, 4)
    }
}

impl LoopDetector {
    pub fn new(
        identical_threshold: usize,
        semantic_threshold: usize,
        cycle_threshold: usize,
        no_progress_threshold: usize,
    ) -> Self {
        Self {
            identical_threshold,
            semantic_threshold,
            cycle_threshold,
            no_progress_threshold,
        }
    }

    /// Check recent actions (most recent last) for a loop. First matching
    /// type wins: identical, cycle, semantic, no-progress.
    pub fn check(&self, actions: &[ActionRecord], facts: Option<&[Fact]>) -> LoopDetection {
        if actions.len() < 2 {
            return LoopDetection::none();
        }

        let signatures: Vec<ActionSignature> = actions.iter().map(to_signature).collect();

        let result = self.check_identical(actions);
        if result.detected {
            return result;
        }

        let result = self.check_error_cycle(&signatures);
        if result.detected {
            return result;
        }

        let result = self.check_semantic(&signatures, facts);
        if result.detected {
            return result;
        }

        self.check_no_progress(actions, facts)
    }

    fn check_identical(&self, actions: &[ActionRecord]) -> LoopDetection {
        if actions.len() < self.identical_threshold {
            return LoopDetection::none();
        }

        let recent = &actions[actions.len() - self.identical_threshold..];
        let first = &recent[0];

        let same_action = recent.iter().all(|a| a.action == first.action);
        let all_failures = recent.iter().all(|a| a.result == ActionResult::Failure);
        // Disjunctive match: identical parameters, or the same error as the
        // first record even when parameters differ
        let all_match = recent[1..]
            .iter()
            .all(|a| a.parameters == first.parameters || (a.error.is_some() && a.error == first.error));

        if !(same_action && all_failures && all_match) {
            return LoopDetection::none();
        }

        LoopDetection {
            detected: true,
            loop_type: Some(LoopType::IdenticalAction),
            confidence: 1.0,
            description: format!(
                "Action '{}' has failed {} consecutive times with same parameters",
                first.action,
                recent.len()
            ),
            suggestions: suggest_for_identical(recent),
            evidence: recent
                .iter()
                .map(|a| format!("Step {}: {} -> {}", a.step, a.action, a.result))
                .collect(),
        }
    }

    fn check_error_cycle(&self, signatures: &[ActionSignature]) -> LoopDetection {
        let failures: Vec<&ActionSignature> = signatures
            .iter()
            .filter(|s| s.outcome == ActionResult::Failure)
            .collect();
        if failures.len() < 3 {
            return LoopDetection::none();
        }

        let mut cycle_count = 0;
        for i in 0..failures.len() - 2 {
            if failures[i].action_type == failures[i + 2].action_type
                && failures[i].action_type != failures[i + 1].action_type
            {
                cycle_count += 1;
            }
        }

        if cycle_count < self.cycle_threshold {
            return LoopDetection::none();
        }

        LoopDetection {
            detected: true,
            loop_type: Some(LoopType::ErrorCycle),
            confidence: 0.9,
            description: "Detected error cycling: alternating between failed approaches".to_string(),
            suggestions: vec![
                "Both approaches have failed repeatedly".to_string(),
                "Consider a fundamentally different strategy".to_string(),
                "The code structure may not support the intended refactoring".to_string(),
                "Use 'cannot_fix' if no viable approach exists".to_string(),
            ],
            evidence: failures
                .iter()
                .rev()
                .take(5)
                .rev()
                .map(|s| format!("{} ({})", s.action_type, s.error_category.as_deref().unwrap_or("-")))
                .collect(),
        }
    }

    fn check_semantic(&self, signatures: &[ActionSignature], facts: Option<&[Fact]>) -> LoopDetection {
        if signatures.len() < self.semantic_threshold {
            return LoopDetection::none();
        }

        let recent = &signatures[signatures.len() - self.semantic_threshold..];

        let distinct_types: Vec<&str> = {
            let mut types: Vec<&str> = recent.iter().map(|s| s.action_type.as_str()).collect();
            types.sort_unstable();
            types.dedup();
            types
        };
        if distinct_types.len() < 2 {
            // Single action type is the identical check's business
            return LoopDetection::none();
        }

        // All failures sharing one error category
        if recent.iter().all(|s| s.outcome == ActionResult::Failure) {
            let mut categories: Vec<&str> = recent.iter().filter_map(|s| s.error_category.as_deref()).collect();
            categories.sort_unstable();
            categories.dedup();
            if categories.len() == 1 {
                return LoopDetection {
                    detected: true,
                    loop_type: Some(LoopType::SemanticLoop),
                    confidence: 0.85,
                    description: format!(
                        "Multiple different approaches all failing with '{}' error",
                        categories[0]
                    ),
                    suggestions: vec![
                        "The underlying issue persists across approaches".to_string(),
                        "Re-examine the root cause before trying more variations".to_string(),
                        "Consider if the violation is fixable automatically".to_string(),
                    ],
                    evidence: recent
                        .iter()
                        .map(|s| format!("{}: {}", s.action_type, s.error_category.as_deref().unwrap_or("-")))
                        .collect(),
                };
            }
        }

        // Three identical error statements in a row
        if let Some(facts) = facts {
            let error_statements: Vec<&str> = facts
                .iter()
                .filter(|f| f.category == FactCategory::Error)
                .map(|f| f.statement.as_str())
                .collect();
            if error_statements.len() >= 3 {
                let last3 = &error_statements[error_statements.len() - 3..];
                if last3.iter().all(|s| *s == last3[0]) {
                    return LoopDetection {
                        detected: true,
                        loop_type: Some(LoopType::SemanticLoop),
                        confidence: 0.8,
                        description: "Different actions producing identical error outcome".to_string(),
                        suggestions: vec!["Address the common error before continuing".to_string()],
                        evidence: last3.iter().map(|s| s.to_string()).collect(),
                    };
                }
            }
        }

        LoopDetection::none()
    }

    fn check_no_progress(&self, actions: &[ActionRecord], facts: Option<&[Fact]>) -> LoopDetection {
        if actions.len() < self.no_progress_threshold {
            return LoopDetection::none();
        }

        let recent = &actions[actions.len() - self.no_progress_threshold..];

        if recent
            .iter()
            .all(|a| NON_MUTATING_ACTIONS.contains(&a.action.as_str()))
        {
            return LoopDetection {
                detected: true,
                loop_type: Some(LoopType::NoProgress),
                confidence: 0.75,
                description: format!(
                    "Last {} actions were read/check operations with no modifications",
                    recent.len()
                ),
                suggestions: vec![
                    "Analysis phase appears complete".to_string(),
                    "Make an actual code modification".to_string(),
                    "Use extract_function or edit_file to fix the violation".to_string(),
                ],
                evidence: recent.iter().map(|a| format!("Step {}: {}", a.step, a.action)).collect(),
            };
        }

        if let Some(facts) = facts {
            let verification_statements: Vec<&str> = facts
                .iter()
                .filter(|f| f.category == FactCategory::Verification)
                .map(|f| f.statement.as_str())
                .collect();
            if verification_statements.len() >= 3 {
                let last3 = &verification_statements[verification_statements.len() - 3..];
                if last3.iter().all(|s| *s == last3[0]) {
                    return LoopDetection {
                        detected: true,
                        loop_type: Some(LoopType::NoProgress),
                        confidence: 0.7,
                        description: "Verification status unchanged despite actions".to_string(),
                        suggestions: vec!["Actions are not affecting the violation".to_string()],
                        evidence: last3.iter().map(|s| s.to_string()).collect(),
                    };
                }
            }
        }

        LoopDetection::none()
    }

    /// Summary statistics about recent action patterns
    pub fn summary(&self, actions: &[ActionRecord]) -> ActionSummary {
        let mut by_action: HashMap<String, usize> = HashMap::new();
        let mut by_result: HashMap<String, usize> = HashMap::new();
        for a in actions {
            *by_action.entry(a.action.clone()).or_default() += 1;
            *by_result.entry(a.result.to_string()).or_default() += 1;
        }

        let success_rate = if actions.is_empty() {
            0.0
        } else {
            *by_result.get("success").unwrap_or(&0) as f64 / actions.len() as f64
        };
        let most_common = by_action
            .iter()
            .max_by_key(|(_, count)| **count)
            .map(|(action, _)| action.clone());

        ActionSummary {
            total: actions.len(),
            by_action,
            by_result,
            success_rate,
            most_common,
        }
    }
}

fn to_signature(action: &ActionRecord) -> ActionSignature {
    let target_entity = action
        .parameters
        .get("function_name")
        .or_else(|| action.parameters.get("source_function"))
        .and_then(|v| v.as_str())
        .map(str::to_string);

    ActionSignature {
        action_type: categorize_action(&action.action),
        target_file: action.target.clone(),
        target_entity,
        outcome: action.result,
        error_category: action.error.as_deref().map(categorize_error),
    }
}

fn suggest_for_identical(recent: &[ActionRecord]) -> Vec<String> {
    let action = recent[0].action.as_str();
    let error = recent[0].error.as_deref().unwrap_or("").to_lowercase();

    let mut suggestions: Vec<String> = Vec::new();

    match action {
        "edit_file" => {
            if error.contains("not found") {
                suggestions.extend([
                    "The text to replace may have changed - re-read the file".to_string(),
                    "Use replace_lines with line numbers instead of text matching".to_string(),
                    "Check for whitespace differences (tabs vs spaces)".to_string(),
                ]);
            } else {
                suggestions.push("Try a different edit approach".to_string());
            }
        }
        "extract_function" => {
            if error.contains("control flow") {
                suggestions.extend([
                    "The selected lines contain early returns or breaks".to_string(),
                    "Try simplify_conditional first to restructure the code".to_string(),
                    "Select a different range that doesn't cross control flow boundaries".to_string(),
                ]);
            } else {
                suggestions.extend([
                    "Check that line numbers are still valid (file may have changed)".to_string(),
                    "Re-analyze the function to get updated extraction suggestions".to_string(),
                ]);
            }
        }
        "run_check" | "run_tests" => {
            suggestions.extend([
                "Repeated checking without modification won't change the result".to_string(),
                "Make a code change before checking again".to_string(),
            ]);
        }
        _ => {}
    }

    if suggestions.is_empty() {
        suggestions = vec![
            "Try a fundamentally different approach".to_string(),
            "Re-analyze the problem from scratch".to_string(),
            "Consider using 'escalate' if stuck".to_string(),
        ];
    }

    suggestions
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(step: u64, action: &str, result: ActionResult) -> ActionRecord {
        ActionRecord::new(step, action, result, "summary")
    }

    fn failing(step: u64, action: &str, error: &str) -> ActionRecord {
        record(step, action, ActionResult::Failure).with_error(Some(error.to_string()))
    }

    #[test]
    fn test_no_detection_on_short_history() {
        let detector = LoopDetector::default();
        let actions = vec![failing(1, "edit_file", "old_text not found")];
        assert!(!detector.check(&actions, None).detected);
    }

    #[test]
    fn test_identical_action_same_params() {
        let detector = LoopDetector::default();
        let mut params = serde_json::Map::new();
        params.insert("path".into(), serde_json::json!("src/m.py"));
        params.insert("old_text".into(), serde_json::json!("X"));

        let actions: Vec<ActionRecord> = (1..=3)
            .map(|step| {
                failing(step, "edit_file", "old_text not found").with_parameters(params.clone())
            })
            .collect();

        let detection = detector.check(&actions, None);
        assert!(detection.detected);
        assert_eq!(detection.loop_type, Some(LoopType::IdenticalAction));
        assert_eq!(detection.confidence, 1.0);
        assert!(
            detection
                .suggestions
                .iter()
                .any(|s| s.contains("re-read the file") || s.contains("line numbers"))
        );
        assert_eq!(detection.evidence.len(), 3);
    }

    #[test]
    fn test_identical_action_same_error_different_params() {
        // The disjunctive clause: matching errors count even when the
        // parameters differ between attempts
        let detector = LoopDetector::default();
        let actions: Vec<ActionRecord> = (1..=3)
            .map(|step| {
                let mut params = serde_json::Map::new();
                params.insert("start_line".into(), serde_json::json!(step * 10));
                failing(step, "extract_function", "cannot extract: control flow").with_parameters(params)
            })
            .collect();

        let detection = detector.check(&actions, None);
        assert!(detection.detected);
        assert_eq!(detection.loop_type, Some(LoopType::IdenticalAction));
        assert!(detection.suggestions.iter().any(|s| s.contains("simplify_conditional")));
    }

    #[test]
    fn test_identical_requires_all_failures() {
        let detector = LoopDetector::default();
        let actions = vec![
            failing(1, "edit_file", "old_text not found"),
            record(2, "edit_file", ActionResult::Success),
            failing(3, "edit_file", "old_text not found"),
        ];
        let detection = detector.check(&actions, None);
        assert_ne!(detection.loop_type, Some(LoopType::IdenticalAction));
    }

    #[test]
    fn test_error_cycle() {
        let detector = LoopDetector::default();
        // edit fails, extract fails, edit fails, extract fails: two A-B-A cycles
        let actions = vec![
            failing(1, "edit_file", "syntax error"),
            failing(2, "extract_function", "control flow"),
            failing(3, "replace_lines", "syntax error"),
            failing(4, "simplify_conditional", "control flow"),
        ];
        let detection = detector.check(&actions, None);
        assert!(detection.detected);
        assert_eq!(detection.loop_type, Some(LoopType::ErrorCycle));
        assert_eq!(detection.confidence, 0.9);
    }

    #[test]
    fn test_semantic_loop_same_error_category() {
        let detector = LoopDetector::default();
        // Four failures, two action types, all "not found"
        let actions = vec![
            failing(1, "edit_file", "old_text not found"),
            failing(2, "edit_file", "old_text not found"),
            failing(3, "read_file", "file not found"),
            failing(4, "load_context", "context not found"),
        ];
        let detection = detector.check(&actions, None);
        assert!(detection.detected);
        assert_eq!(detection.loop_type, Some(LoopType::SemanticLoop));
        assert_eq!(detection.confidence, 0.85);
        assert!(detection.description.contains("not_found"));
    }

    #[test]
    fn test_semantic_loop_from_repeated_error_facts() {
        let detector = LoopDetector::default();
        let actions = vec![
            failing(1, "edit_file", "weird error"),
            record(2, "read_file", ActionResult::Success),
            failing(3, "write_file", "another error"),
            failing(4, "extract_function", "third error"),
        ];
        let facts: Vec<Fact> = (0..3)
            .map(|i| Fact::new(FactCategory::Error, "Edit failed: target text not found in file", 1.0, "t:r", i))
            .collect();

        let detection = detector.check(&actions, Some(&facts));
        assert!(detection.detected);
        assert_eq!(detection.loop_type, Some(LoopType::SemanticLoop));
        assert_eq!(detection.confidence, 0.8);
    }

    #[test]
    fn test_no_progress_non_mutating() {
        let detector = LoopDetector::default();
        let actions = vec![
            record(1, "read_file", ActionResult::Success),
            record(2, "load_context", ActionResult::Success),
            record(3, "run_check", ActionResult::Success),
            record(4, "run_tests", ActionResult::Success),
        ];
        let detection = detector.check(&actions, None);
        assert!(detection.detected);
        assert_eq!(detection.loop_type, Some(LoopType::NoProgress));
        assert_eq!(detection.confidence, 0.75);
    }

    #[test]
    fn test_no_progress_unchanged_verification_facts() {
        let detector = LoopDetector::default();
        let actions = vec![
            record(1, "edit_file", ActionResult::Success),
            record(2, "run_check", ActionResult::Success),
            record(3, "edit_file", ActionResult::Success),
            record(4, "run_check", ActionResult::Success),
        ];
        let facts: Vec<Fact> = (0..3)
            .map(|i| Fact::new(FactCategory::Verification, "Total violations: 4", 1.0, "run_check:violation_count", i))
            .collect();

        let detection = detector.check(&actions, Some(&facts));
        assert!(detection.detected);
        assert_eq!(detection.loop_type, Some(LoopType::NoProgress));
        assert_eq!(detection.confidence, 0.7);
    }

    #[test]
    fn test_healthy_progress_no_detection() {
        let detector = LoopDetector::default();
        let actions = vec![
            record(1, "read_file", ActionResult::Success),
            record(2, "edit_file", ActionResult::Success),
            record(3, "run_check", ActionResult::Success),
            record(4, "complete", ActionResult::Success),
        ];
        assert!(!detector.check(&actions, None).detected);
    }

    #[test]
    fn test_summary_statistics() {
        let detector = LoopDetector::default();
        let actions = vec![
            record(1, "read_file", ActionResult::Success),
            failing(2, "edit_file", "nope"),
            record(3, "edit_file", ActionResult::Success),
        ];
        let summary = detector.summary(&actions);
        assert_eq!(summary.total, 3);
        assert_eq!(summary.by_action.get("edit_file"), Some(&2));
        assert!((summary.success_rate - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(summary.most_common.as_deref(), Some("edit_file"));
    }
}
