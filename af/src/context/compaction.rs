//! Progressive context compaction
//!
//! When a built prompt exceeds its token budget, compaction rules apply in
//! priority order - sacrificing low-value content first - until the
//! estimate fits. Fingerprint, task, and phase sections are never touched.

use serde::Serialize;
use serde_yaml::Value;
use tracing::debug;

/// One named section of the prompt, in render order
#[derive(Debug, Clone)]
pub struct Section {
    pub name: String,
    pub value: Value,
}

impl Section {
    pub fn new(name: impl Into<String>, value: Value) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }

    pub fn text(name: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(name, Value::String(text.into()))
    }

    /// Coarse token estimate for this section (chars / 4)
    pub fn estimate_tokens(&self) -> usize {
        match &self.value {
            Value::String(s) => s.len() / 4,
            other => serde_yaml::to_string(other).map(|s| s.len() / 4).unwrap_or(0),
        }
    }
}

/// Strategy for shrinking a section
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Cut to N tokens, keeping the start
    Truncate(usize),
    /// Keep start and end, drop the middle
    TruncateMiddle(usize),
    /// Keep the N highest-priority list entries
    KeepFirst(usize),
    /// Keep the N most recent list entries
    KeepLast(usize),
    /// Delete the section entirely
    Remove,
}

/// Rule for compacting one section; lower priority compacts first
#[derive(Debug, Clone)]
pub struct CompactionRule {
    pub section: &'static str,
    pub strategy: Strategy,
    pub priority: u8,
}

/// Default rules in spec priority order
fn default_rules() -> Vec<CompactionRule> {
    vec![
        CompactionRule { section: "target_source", strategy: Strategy::TruncateMiddle(800), priority: 1 },
        CompactionRule { section: "similar_fixes", strategy: Strategy::KeepFirst(2), priority: 2 },
        CompactionRule { section: "similar_implementations", strategy: Strategy::KeepFirst(2), priority: 3 },
        CompactionRule { section: "understanding", strategy: Strategy::KeepFirst(10), priority: 4 },
        CompactionRule { section: "action_hints", strategy: Strategy::Truncate(100), priority: 5 },
        CompactionRule { section: "related_patterns", strategy: Strategy::Truncate(300), priority: 6 },
        CompactionRule { section: "file_overview", strategy: Strategy::Truncate(300), priority: 7 },
        CompactionRule { section: "recent", strategy: Strategy::KeepLast(1), priority: 8 },
        CompactionRule { section: "additional", strategy: Strategy::Remove, priority: 9 },
        CompactionRule { section: "related_code", strategy: Strategy::Remove, priority: 10 },
    ]
}

/// Sections that are never compacted (prefix match covers subsections)
const PRESERVED_SECTIONS: &[&str] = &["fingerprint", "task", "phase"];

/// One applied rule, for the audit trail
#[derive(Debug, Clone, Serialize)]
pub struct AppliedRule {
    pub section: String,
    pub strategy: Strategy,
    pub tokens_after: usize,
}

/// Audit record of one compaction pass
#[derive(Debug, Clone, Serialize)]
pub struct CompactionOutcome {
    pub original_tokens: usize,
    pub final_tokens: usize,
    pub budget: usize,
    pub rules_applied: Vec<AppliedRule>,
}

impl CompactionOutcome {
    pub fn applied(&self) -> bool {
        !self.rules_applied.is_empty()
    }

    pub fn tokens_saved(&self) -> usize {
        self.original_tokens.saturating_sub(self.final_tokens)
    }
}

/// Applies compaction rules until the section list fits the budget
pub struct CompactionManager {
    max_tokens: usize,
    rules: Vec<CompactionRule>,
}

impl CompactionManager {
    pub fn new(max_tokens: usize) -> Self {
        let mut rules = default_rules();
        rules.sort_by_key(|r| r.priority);
        Self { max_tokens, rules }
    }

    pub fn with_rules(mut self, mut rules: Vec<CompactionRule>) -> Self {
        rules.sort_by_key(|r| r.priority);
        self.rules = rules;
        self
    }

    pub fn estimate_tokens(sections: &[Section]) -> usize {
        sections.iter().map(|s| s.estimate_tokens()).sum()
    }

    fn preserved(section: &str) -> bool {
        PRESERVED_SECTIONS
            .iter()
            .any(|p| section == *p || section.starts_with(&format!("{}.", p)))
    }

    /// Compact in place. After each applied rule the estimate is recomputed
    /// and the pass stops as soon as the sections fit.
    pub fn compact(&self, sections: &mut Vec<Section>) -> CompactionOutcome {
        let original_tokens = Self::estimate_tokens(sections);
        let mut rules_applied = Vec::new();

        for rule in &self.rules {
            if Self::estimate_tokens(sections) <= self.max_tokens {
                break;
            }
            if Self::preserved(rule.section) {
                continue;
            }
            if apply_rule(sections, rule) {
                let tokens_after = Self::estimate_tokens(sections);
                debug!(section = rule.section, strategy = ?rule.strategy, tokens_after, "compaction rule applied");
                rules_applied.push(AppliedRule {
                    section: rule.section.to_string(),
                    strategy: rule.strategy,
                    tokens_after,
                });
            }
        }

        CompactionOutcome {
            original_tokens,
            final_tokens: Self::estimate_tokens(sections),
            budget: self.max_tokens,
            rules_applied,
        }
    }
}

fn apply_rule(sections: &mut Vec<Section>, rule: &CompactionRule) -> bool {
    let Some(idx) = sections.iter().position(|s| s.name == rule.section) else {
        return false;
    };

    match rule.strategy {
        Strategy::Truncate(max_tokens) => {
            if let Value::String(s) = &sections[idx].value {
                let max_chars = max_tokens * 4;
                if s.len() > max_chars {
                    let mut truncated = s.chars().take(max_chars).collect::<String>();
                    truncated.push_str("... (truncated)");
                    sections[idx].value = Value::String(truncated);
                    return true;
                }
            }
            false
        }
        Strategy::TruncateMiddle(max_tokens) => {
            if let Value::String(s) = &sections[idx].value {
                let max_chars = max_tokens * 4;
                if s.len() > max_chars {
                    let keep = max_chars / 2;
                    let head: String = s.chars().take(keep).collect();
                    let tail: String = {
                        let chars: Vec<char> = s.chars().collect();
                        chars[chars.len().saturating_sub(keep)..].iter().collect()
                    };
                    sections[idx].value = Value::String(format!("{}\n...(middle truncated)...\n{}", head, tail));
                    return true;
                }
            }
            false
        }
        Strategy::KeepFirst(n) => {
            if let Value::Sequence(seq) = &mut sections[idx].value
                && seq.len() > n
            {
                seq.truncate(n);
                return true;
            }
            false
        }
        Strategy::KeepLast(n) => {
            if let Value::Sequence(seq) = &mut sections[idx].value
                && seq.len() > n
            {
                let keep: Vec<Value> = seq[seq.len() - n..].to_vec();
                *seq = keep;
                return true;
            }
            false
        }
        Strategy::Remove => {
            sections.remove(idx);
            true
        }
    }
}
