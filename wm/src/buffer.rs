//! WorkingMemory - the bounded rolling buffer over a YAML file
//!
//! The buffer is loaded fresh on every operation and written back after
//! mutation, so a crashed step loses nothing already persisted. Expiration
//! (step-based) precedes FIFO eviction; pinned items are spared by both.

use std::fs;
use std::path::{Path, PathBuf};

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::fact::{Fact, Understanding};
use crate::item::{ItemType, MemoryItem};

const DEFAULT_MAX_ITEMS: usize = 5;

/// Key of the single pinned item holding the fact collection
const UNDERSTANDING_KEY: &str = "understanding";

/// On-disk buffer document
#[derive(Debug, Serialize, Deserialize)]
struct BufferDoc {
    max_items: usize,
    #[serde(default)]
    items: Vec<MemoryItem>,
}

/// A recent action result, shaped for prompt assembly
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecentAction {
    pub step: u64,
    pub action: String,
    #[serde(default)]
    pub target: Option<String>,
    pub result: String,
    pub summary: String,
}

/// Bounded rolling buffer of recent context items for one task
pub struct WorkingMemory {
    memory_file: PathBuf,
    max_items: usize,
}

impl WorkingMemory {
    /// Open the working memory for a task directory
    pub fn new(task_dir: impl AsRef<Path>) -> Self {
        Self {
            memory_file: task_dir.as_ref().join("working_memory.yaml"),
            max_items: DEFAULT_MAX_ITEMS,
        }
    }

    pub fn with_max_items(mut self, max_items: usize) -> Self {
        self.max_items = max_items;
        self
    }

    fn load(&self) -> Result<Vec<MemoryItem>> {
        if !self.memory_file.exists() {
            return Ok(Vec::new());
        }
        let raw = fs::read_to_string(&self.memory_file)
            .context(format!("Failed to read {}", self.memory_file.display()))?;
        let doc: BufferDoc = serde_yaml::from_str(&raw).unwrap_or(BufferDoc {
            max_items: self.max_items,
            items: Vec::new(),
        });
        Ok(doc.items)
    }

    fn save(&self, items: Vec<MemoryItem>) -> Result<()> {
        if let Some(parent) = self.memory_file.parent() {
            fs::create_dir_all(parent)?;
        }
        let doc = BufferDoc {
            max_items: self.max_items,
            items,
        };
        let tmp = self.memory_file.with_extension("tmp");
        fs::write(&tmp, serde_yaml::to_string(&doc)?)?;
        fs::rename(&tmp, &self.memory_file)?;
        Ok(())
    }

    /// Upsert an item by key. Evicts oldest non-pinned items when the
    /// buffer would exceed its bound.
    pub fn add(&self, item: MemoryItem) -> Result<()> {
        let mut items = self.load()?;
        items.retain(|i| i.key != item.key);
        debug!(key = %item.key, item_type = ?item.item_type, "working memory add");
        items.push(item);
        let items = self.evict_if_needed(items);
        self.save(items)
    }

    /// Record the outcome of one action under `action_step_{step}`
    pub fn add_action_result(
        &self,
        action: &str,
        result: &str,
        summary: &str,
        step: u64,
        target: Option<String>,
    ) -> Result<()> {
        let content = serde_json::json!({
            "action": action,
            "result": result,
            "summary": summary,
            "target": target,
        });
        self.add(MemoryItem::new(ItemType::ActionResult, format!("action_step_{}", step), content).at_step(step))
    }

    /// Stash loaded file content, expiring after a few steps
    pub fn load_context(&self, key: &str, content: &str, step: u64, expires_after_steps: u64) -> Result<()> {
        self.add(
            MemoryItem::new(ItemType::LoadedContext, key, serde_json::Value::String(content.to_string()))
                .at_step(step)
                .expiring_after(expires_after_steps),
        )
    }

    /// All non-expired items. Expired ones are dropped from the file as a
    /// side effect when a step is given.
    pub fn items(&self, current_step: Option<u64>) -> Result<Vec<MemoryItem>> {
        let items = self.load()?;
        let Some(step) = current_step else {
            return Ok(items);
        };

        let before = items.len();
        let alive: Vec<MemoryItem> = items.into_iter().filter(|i| !i.is_expired(step)).collect();
        if alive.len() < before {
            debug!(evicted = before - alive.len(), "expired working memory items dropped");
            self.save(alive.clone())?;
        }
        Ok(alive)
    }

    pub fn items_by_type(&self, item_type: ItemType, current_step: Option<u64>) -> Result<Vec<MemoryItem>> {
        Ok(self
            .items(current_step)?
            .into_iter()
            .filter(|i| i.item_type == item_type)
            .collect())
    }

    /// Most recent action results, returned in chronological order
    pub fn action_results(&self, limit: usize, current_step: Option<u64>) -> Result<Vec<RecentAction>> {
        let mut items = self.items_by_type(ItemType::ActionResult, current_step)?;
        items.sort_by(|a, b| b.step.unwrap_or(0).cmp(&a.step.unwrap_or(0)));
        items.truncate(limit);
        items.reverse();

        Ok(items
            .into_iter()
            .map(|item| RecentAction {
                step: item.step.unwrap_or(0),
                action: item
                    .content
                    .get("action")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string(),
                target: item
                    .content
                    .get("target")
                    .and_then(|v| v.as_str())
                    .map(str::to_string),
                result: item
                    .content
                    .get("result")
                    .and_then(|v| v.as_str())
                    .unwrap_or("success")
                    .to_string(),
                summary: item
                    .content
                    .get("summary")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string(),
            })
            .collect())
    }

    /// Loaded context items as (key, content) pairs
    pub fn loaded_context(&self, current_step: Option<u64>) -> Result<Vec<(String, String)>> {
        Ok(self
            .items_by_type(ItemType::LoadedContext, current_step)?
            .into_iter()
            .map(|i| (i.key, i.content.as_str().unwrap_or_default().to_string()))
            .collect())
    }

    // === Facts ===
    //
    // The whole fact collection persists as one pinned item so it never
    // competes with observations for buffer slots.

    /// Read the persisted understanding (empty if none)
    pub fn understanding(&self) -> Result<Understanding> {
        let items = self.load()?;
        let Some(item) = items.iter().find(|i| i.key == UNDERSTANDING_KEY) else {
            return Ok(Understanding::default());
        };
        Ok(serde_json::from_value(item.content.clone()).unwrap_or_default())
    }

    /// Replace the persisted understanding
    pub fn set_understanding(&self, understanding: &Understanding) -> Result<()> {
        self.add(
            MemoryItem::new(ItemType::Fact, UNDERSTANDING_KEY, serde_json::to_value(understanding)?).pinned(),
        )
    }

    /// Append a fact without supersession logic (the fact store layers that)
    pub fn add_fact(&self, fact: Fact) -> Result<()> {
        let mut understanding = self.understanding()?;
        understanding.facts.push(fact);
        self.set_understanding(&understanding)
    }

    /// Active facts, optionally filtered by minimum confidence
    pub fn facts(&self, min_confidence: Option<f64>) -> Result<Vec<Fact>> {
        let understanding = self.understanding()?;
        let threshold = min_confidence.unwrap_or(0.0);
        Ok(understanding
            .active()
            .into_iter()
            .filter(|f| f.confidence >= threshold)
            .cloned()
            .collect())
    }

    pub fn remove(&self, key: &str) -> Result<bool> {
        let mut items = self.load()?;
        let before = items.len();
        items.retain(|i| i.key != key);
        if items.len() < before {
            self.save(items)?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Clear the buffer, returning how many items were removed
    pub fn clear(&self, keep_pinned: bool) -> Result<usize> {
        let items = self.load()?;
        let before = items.len();
        let kept: Vec<MemoryItem> = if keep_pinned {
            items.into_iter().filter(|i| i.pinned).collect()
        } else {
            Vec::new()
        };
        let removed = before - kept.len();
        self.save(kept)?;
        Ok(removed)
    }

    pub fn pin(&self, key: &str) -> Result<bool> {
        self.set_pinned(key, true)
    }

    pub fn unpin(&self, key: &str) -> Result<bool> {
        self.set_pinned(key, false)
    }

    fn set_pinned(&self, key: &str, pinned: bool) -> Result<bool> {
        let mut items = self.load()?;
        let mut found = false;
        for item in &mut items {
            if item.key == key {
                item.pinned = pinned;
                found = true;
            }
        }
        if found {
            self.save(items)?;
        }
        Ok(found)
    }

    /// Keep pinned items plus the most recently added unpinned items that
    /// fit in the remaining space.
    fn evict_if_needed(&self, items: Vec<MemoryItem>) -> Vec<MemoryItem> {
        if items.len() <= self.max_items {
            return items;
        }

        let pinned_count = items.iter().filter(|i| i.pinned).count();
        let space_for_unpinned = self.max_items.saturating_sub(pinned_count);

        let mut unpinned: Vec<&MemoryItem> = items.iter().filter(|i| !i.pinned).collect();
        unpinned.sort_by(|a, b| b.added_at.cmp(&a.added_at));
        let keep_keys: Vec<String> = unpinned
            .into_iter()
            .take(space_for_unpinned)
            .map(|i| i.key.clone())
            .collect();

        items
            .into_iter()
            .filter(|i| i.pinned || keep_keys.iter().any(|k| k == &i.key))
            .collect()
    }
}
