//! Facts - typed, confidence-weighted conclusions
//!
//! Facts are the primary unit of understanding: conclusions rather than
//! raw tool output. A fact is active until its id lands in the task's
//! superseded set.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Category of an extracted fact
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FactCategory {
    /// AST-derived structure facts
    CodeStructure,
    /// LLM-derived conclusions
    Inference,
    /// Recognized patterns
    Pattern,
    /// Test/check results
    Verification,
    /// Error information
    Error,
}

impl std::fmt::Display for FactCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FactCategory::CodeStructure => "code_structure",
            FactCategory::Inference => "inference",
            FactCategory::Pattern => "pattern",
            FactCategory::Verification => "verification",
            FactCategory::Error => "error",
        };
        write!(f, "{}", s)
    }
}

/// A typed fact extracted from tool output or inference
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fact {
    pub id: String,
    pub category: FactCategory,
    /// The fact itself, as a clear statement
    pub statement: String,
    /// Confidence 0.0-1.0, rounded to two decimals
    pub confidence: f64,
    /// What produced this fact, `tool:rule` form
    pub source: String,
    /// Step when the fact was established
    pub step: u64,
    /// Fact id this one replaces, if any
    #[serde(default)]
    pub supersedes: Option<String>,
}

impl Fact {
    /// Create a fact with a generated `fact_<hex>` id
    pub fn new(
        category: FactCategory,
        statement: impl Into<String>,
        confidence: f64,
        source: impl Into<String>,
        step: u64,
    ) -> Self {
        let id = format!("fact_{}", &Uuid::now_v7().simple().to_string()[..8]);
        Self {
            id,
            category,
            statement: statement.into(),
            confidence: (confidence.clamp(0.0, 1.0) * 100.0).round() / 100.0,
            source: source.into(),
            step,
            supersedes: None,
        }
    }

    /// Retention score: confidence plus a category bonus. Verification
    /// facts carry the check state, error facts prevent repeated mistakes,
    /// structure facts anchor the code understanding.
    pub fn score(&self) -> f64 {
        let bonus = match self.category {
            FactCategory::Verification => 0.3,
            FactCategory::Error => 0.2,
            FactCategory::CodeStructure => 0.1,
            _ => 0.0,
        };
        self.confidence + bonus
    }
}

/// The agent's current understanding: all facts plus the superseded set
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Understanding {
    #[serde(default)]
    pub facts: Vec<Fact>,
    /// Ids of replaced facts; retained in history, excluded from queries
    #[serde(default)]
    pub superseded_facts: Vec<String>,
}

impl Understanding {
    /// Facts that have not been superseded
    pub fn active(&self) -> Vec<&Fact> {
        self.facts
            .iter()
            .filter(|f| !self.superseded_facts.iter().any(|s| s == &f.id))
            .collect()
    }

    pub fn by_category(&self, category: FactCategory) -> Vec<&Fact> {
        self.active().into_iter().filter(|f| f.category == category).collect()
    }

    pub fn high_confidence(&self, threshold: f64) -> Vec<&Fact> {
        self.active().into_iter().filter(|f| f.confidence >= threshold).collect()
    }

    /// Most recent active facts, newest first
    pub fn recent(&self, n: usize) -> Vec<&Fact> {
        let mut active = self.active();
        active.sort_by(|a, b| b.step.cmp(&a.step));
        active.truncate(n);
        active
    }

    pub fn is_superseded(&self, id: &str) -> bool {
        self.superseded_facts.iter().any(|s| s == id)
    }

    /// Supersede all but the top `max_facts` active facts by score.
    /// All facts stay in history; only the superseded set grows.
    /// Returns how many facts were superseded.
    pub fn compact(&mut self, max_facts: usize) -> usize {
        let active_ids: Vec<String> = self.active().iter().map(|f| f.id.clone()).collect();
        if active_ids.len() <= max_facts {
            return 0;
        }

        let mut scored: Vec<(f64, String)> = self
            .active()
            .iter()
            .map(|f| (f.score(), f.id.clone()))
            .collect();
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        let keep: Vec<&String> = scored.iter().take(max_facts).map(|(_, id)| id).collect();

        let mut dropped = 0;
        for id in &active_ids {
            if !keep.iter().any(|k| *k == id) {
                self.superseded_facts.push(id.clone());
                dropped += 1;
            }
        }
        dropped
    }
}
