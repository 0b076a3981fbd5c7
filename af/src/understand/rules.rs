//! Extraction rules - pattern-to-fact mappings per tool
//!
//! Each tool has an ordered rule list. A rule's pattern is either a regex
//! over the tool output or a predicate on the whole string; on match, the
//! formatter produces the fact statement. Multiple rules may fire on one
//! output.

use regex::{Captures, Regex};
use workmem::{Fact, FactCategory};

/// How a rule matches tool output
pub enum RulePattern {
    Regex(Regex),
    Predicate(fn(&str) -> bool),
}

type Formatter = fn(&str, Option<&Captures>) -> String;

/// Rule for extracting one kind of fact from tool output
pub struct ExtractionRule {
    pub name: &'static str,
    pub pattern: RulePattern,
    pub category: FactCategory,
    pub confidence: f64,
    pub formatter: Formatter,
}

impl ExtractionRule {
    pub fn regex(
        name: &'static str,
        pattern: &str,
        category: FactCategory,
        confidence: f64,
        formatter: Formatter,
    ) -> Self {
        Self {
            name,
            pattern: RulePattern::Regex(Regex::new(pattern).expect("static rule regex")),
            category,
            confidence,
            formatter,
        }
    }

    pub fn predicate(
        name: &'static str,
        pattern: fn(&str) -> bool,
        category: FactCategory,
        confidence: f64,
        formatter: Formatter,
    ) -> Self {
        Self {
            name,
            pattern: RulePattern::Predicate(pattern),
            category,
            confidence,
            formatter,
        }
    }
}

/// Ordered rule collection for one tool
pub struct RuleSet {
    pub tool_name: String,
    rules: Vec<ExtractionRule>,
}

impl RuleSet {
    pub fn new(tool_name: impl Into<String>) -> Self {
        Self {
            tool_name: tool_name.into(),
            rules: Vec::new(),
        }
    }

    pub fn add_rule(mut self, rule: ExtractionRule) -> Self {
        self.rules.push(rule);
        self
    }

    /// Apply every rule; each match produces one fact
    pub fn extract(&self, output: &str, step: u64) -> Vec<Fact> {
        let mut facts = Vec::new();
        for rule in &self.rules {
            let statement = match &rule.pattern {
                RulePattern::Regex(re) => re.captures(output).map(|caps| (rule.formatter)(output, Some(&caps))),
                RulePattern::Predicate(p) => p(output).then(|| (rule.formatter)(output, None)),
            };
            if let Some(statement) = statement {
                facts.push(Fact::new(
                    rule.category,
                    statement,
                    rule.confidence,
                    format!("{}:{}", self.tool_name, rule.name),
                    step,
                ));
            }
        }
        facts
    }
}

/// Rules for conformance check output
pub fn conformance_rules() -> RuleSet {
    RuleSet::new("run_check")
        .add_rule(ExtractionRule::regex(
            "check_passed",
            r"(Check PASSED|All checks passed|✓)",
            FactCategory::Verification,
            1.0,
            |_, _| "Conformance check passed".to_string(),
        ))
        .add_rule(ExtractionRule::regex(
            "complexity_violation",
            r"Function '([^']+)' has complexity (\d+)",
            FactCategory::Verification,
            1.0,
            |_, caps| match caps {
                Some(c) => format!(
                    "Function '{}' has cyclomatic complexity {} (threshold exceeded)",
                    &c[1], &c[2]
                ),
                None => "Complexity violation detected".to_string(),
            },
        ))
        .add_rule(ExtractionRule::regex(
            "length_violation",
            r"Function '([^']+)' has (\d+) lines",
            FactCategory::Verification,
            1.0,
            |_, caps| match caps {
                Some(c) => format!("Function '{}' has {} lines (threshold exceeded)", &c[1], &c[2]),
                None => "Length violation detected".to_string(),
            },
        ))
        .add_rule(ExtractionRule::regex(
            "violation_count",
            r"Violations?\s*\((\d+)\)",
            FactCategory::Verification,
            1.0,
            |_, caps| match caps {
                Some(c) => format!("Total violations: {}", &c[1]),
                None => "Violations found".to_string(),
            },
        ))
}

/// Rules for test runner output
pub fn test_rules() -> RuleSet {
    RuleSet::new("run_tests")
        .add_rule(ExtractionRule::regex(
            "tests_passed",
            r"(\d+) passed",
            FactCategory::Verification,
            1.0,
            |_, caps| match caps {
                Some(c) => format!("Tests passed: {}", &c[1]),
                None => "Tests passed".to_string(),
            },
        ))
        .add_rule(ExtractionRule::regex(
            "tests_failed",
            r"(\d+) failed",
            FactCategory::Verification,
            1.0,
            |_, caps| match caps {
                Some(c) => format!("Tests failed: {}", &c[1]),
                None => "Tests failed".to_string(),
            },
        ))
        .add_rule(ExtractionRule::regex(
            "test_failure_detail",
            r"FAILED\s+([^\s]+)::",
            FactCategory::Error,
            0.9,
            |_, caps| match caps {
                Some(c) => format!("Test failure in: {}", &c[1]),
                None => "Test failure detected".to_string(),
            },
        ))
}

/// Rules for file edit output
pub fn edit_rules() -> RuleSet {
    RuleSet::new("edit_file")
        .add_rule(ExtractionRule::regex(
            "edit_success",
            r"(Edited|Modified|Updated)\s+([^\s:]+)",
            FactCategory::CodeStructure,
            1.0,
            |_, caps| match caps {
                Some(c) => format!("File modified: {}", &c[2]),
                None => "File modified".to_string(),
            },
        ))
        .add_rule(ExtractionRule::regex(
            "edit_not_found",
            r"(old_text not found|text to replace not found)",
            FactCategory::Error,
            1.0,
            |_, _| "Edit failed: target text not found in file".to_string(),
        ))
}

/// Rules for function extraction output
pub fn extract_function_rules() -> RuleSet {
    RuleSet::new("extract_function")
        .add_rule(ExtractionRule::regex(
            "extraction_success",
            r"Extracted.*?'([^']+)'.*?lines?\s*(\d+)-(\d+)",
            FactCategory::CodeStructure,
            1.0,
            |_, caps| match caps {
                Some(c) => format!("Extracted function '{}' from lines {}-{}", &c[1], &c[2], &c[3]),
                None => "Function extracted".to_string(),
            },
        ))
        .add_rule(ExtractionRule::regex(
            "extraction_control_flow",
            r"(cannot extract|control flow|early return|break|continue)",
            FactCategory::Error,
            0.95,
            |_, _| "Extraction blocked by control flow (returns/breaks in selection)".to_string(),
        ))
        .add_rule(ExtractionRule::regex(
            "post_extraction_check_passed",
            r"Check PASSED",
            FactCategory::Verification,
            1.0,
            |_, _| "Conformance check passed after extraction".to_string(),
        ))
}
