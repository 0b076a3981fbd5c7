//! Understanding extraction - facts from tool output
//!
//! Two-tier extraction: deterministic rules first, an optional fallback
//! extractor only when rules produce fewer than two facts. The fact store
//! layers supersession and compaction over the persisted understanding.

mod rules;

use std::collections::HashMap;

use eyre::Result;
use regex::Regex;
use statestore::ActionResult;
use std::sync::OnceLock;
use tracing::debug;
use workmem::{Fact, FactCategory, Understanding, WorkingMemory};

pub use rules::{ExtractionRule, RulePattern, RuleSet, conformance_rules, edit_rules, extract_function_rules, test_rules};

/// Hook for extracting facts from outputs the rules cannot read.
/// Returns (category, statement, confidence) triples.
pub trait FactFallback: Send + Sync {
    fn extract(&self, tool_name: &str, output: &str) -> Vec<(FactCategory, String, f64)>;
}

/// Extracts structured facts from tool outputs
pub struct UnderstandingExtractor {
    rule_sets: HashMap<String, RuleSet>,
    fallback: Option<Box<dyn FactFallback>>,
}

impl Default for UnderstandingExtractor {
    fn default() -> Self {
        Self::new()
    }
}

impl UnderstandingExtractor {
    pub fn new() -> Self {
        let mut rule_sets = HashMap::new();
        rule_sets.insert("run_check".to_string(), conformance_rules());
        rule_sets.insert("run_conformance_check".to_string(), conformance_rules());
        rule_sets.insert("run_tests".to_string(), test_rules());
        rule_sets.insert("run_affected_tests".to_string(), test_rules());
        rule_sets.insert("edit_file".to_string(), edit_rules());
        rule_sets.insert("replace_lines".to_string(), edit_rules());
        rule_sets.insert("extract_function".to_string(), extract_function_rules());
        Self {
            rule_sets,
            fallback: None,
        }
    }

    pub fn with_fallback(mut self, fallback: Box<dyn FactFallback>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    /// Register a custom rule set for a tool
    pub fn register_rule_set(&mut self, tool_name: impl Into<String>, rule_set: RuleSet) {
        self.rule_sets.insert(tool_name.into(), rule_set);
    }

    /// Extract facts from one tool output. When no rule fires, a single
    /// generic succeeded/failed fact is emitted at confidence 0.7.
    pub fn extract(
        &self,
        tool_name: &str,
        output: &str,
        result: ActionResult,
        step: u64,
        use_fallback: bool,
    ) -> Vec<Fact> {
        let mut facts = self
            .rule_sets
            .get(tool_name)
            .map(|set| set.extract(output, step))
            .unwrap_or_default();

        if facts.is_empty() {
            let (category, verb) = match result {
                ActionResult::Success => (FactCategory::Verification, "succeeded"),
                _ => (FactCategory::Error, "failed"),
            };
            facts.push(Fact::new(
                category,
                format!("{} {}", tool_name, verb),
                0.7,
                format!("{}:result", tool_name),
                step,
            ));
        }

        if use_fallback
            && facts.len() < 2
            && let Some(fallback) = &self.fallback
        {
            for (category, statement, confidence) in fallback.extract(tool_name, output) {
                facts.push(Fact::new(
                    category,
                    statement,
                    confidence,
                    format!("{}:llm", tool_name),
                    step,
                ));
            }
        }

        debug!(tool = %tool_name, count = facts.len(), "facts extracted");
        facts
    }
}

fn quoted_name_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"'([^']+)'").expect("static regex"))
}

fn quoted_name(statement: &str) -> Option<&str> {
    quoted_name_re()
        .captures(statement)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
}

/// Manages the persisted fact collection with supersession and compaction
pub struct FactStore {
    understanding: Understanding,
    max_facts: usize,
    compaction_threshold: usize,
}

impl Default for FactStore {
    fn default() -> Self {
        Self::new(20, 15)
    }
}

impl FactStore {
    pub fn new(max_facts: usize, compaction_threshold: usize) -> Self {
        Self {
            understanding: Understanding::default(),
            max_facts,
            compaction_threshold,
        }
    }

    /// Load the fact collection from a task's working memory
    pub fn from_memory(memory: &WorkingMemory) -> Result<Self> {
        let mut store = Self::default();
        store.understanding = memory.understanding()?;
        Ok(store)
    }

    /// Write the fact collection back to working memory
    pub fn persist(&self, memory: &WorkingMemory) -> Result<()> {
        memory.set_understanding(&self.understanding)
    }

    /// Add a fact, superseding semantically matching active facts of the
    /// same category, then compact if the active set outgrew its bound.
    pub fn add(&mut self, mut fact: Fact) {
        let superseded: Vec<String> = self
            .understanding
            .active()
            .iter()
            .filter(|existing| should_supersede(existing, &fact))
            .map(|existing| existing.id.clone())
            .collect();

        for id in superseded {
            debug!(old = %id, new = %fact.id, "fact superseded");
            self.understanding.superseded_facts.push(id.clone());
            fact.supersedes = Some(id);
        }

        self.understanding.facts.push(fact);

        if self.understanding.active().len() > self.compaction_threshold {
            let dropped = self.understanding.compact(self.max_facts);
            if dropped > 0 {
                debug!(dropped, "fact store compacted");
            }
        }
    }

    pub fn add_many(&mut self, facts: Vec<Fact>) {
        for fact in facts {
            self.add(fact);
        }
    }

    pub fn active(&self) -> Vec<&Fact> {
        self.understanding.active()
    }

    pub fn by_category(&self, category: FactCategory) -> Vec<&Fact> {
        self.understanding.by_category(category)
    }

    pub fn recent(&self, n: usize) -> Vec<&Fact> {
        self.understanding.recent(n)
    }

    pub fn understanding(&self) -> &Understanding {
        &self.understanding
    }
}

/// Supersession: same category, plus domain matching. Verification facts
/// about complexity replace older complexity facts for the same function;
/// passed replaces passed, failed replaces failed.
fn should_supersede(old: &Fact, new: &Fact) -> bool {
    if old.category != new.category {
        return false;
    }

    if old.category == FactCategory::Verification {
        let old_lower = old.statement.to_lowercase();
        let new_lower = new.statement.to_lowercase();

        if old_lower.contains("complexity") && new_lower.contains("complexity") {
            return match (quoted_name(&old.statement), quoted_name(&new.statement)) {
                (Some(a), Some(b)) => a == b,
                _ => true,
            };
        }
        if old_lower.contains("passed") && new_lower.contains("passed") {
            return true;
        }
        if old_lower.contains("failed") && new_lower.contains("failed") {
            return true;
        }
    }

    false
}
