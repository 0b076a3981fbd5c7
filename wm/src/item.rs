//! Working memory items

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of observation held in working memory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemType {
    ActionResult,
    LoadedContext,
    Note,
    Fact,
}

/// Single item in the rolling buffer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryItem {
    #[serde(rename = "type")]
    pub item_type: ItemType,
    /// Unique within a task; re-adding a key updates in place
    pub key: String,
    pub content: serde_json::Value,
    pub added_at: DateTime<Utc>,
    #[serde(default)]
    pub step: Option<u64>,
    #[serde(default)]
    pub expires_after_steps: Option<u64>,
    #[serde(default)]
    pub pinned: bool,
}

impl MemoryItem {
    pub fn new(item_type: ItemType, key: impl Into<String>, content: serde_json::Value) -> Self {
        Self {
            item_type,
            key: key.into(),
            content,
            added_at: Utc::now(),
            step: None,
            expires_after_steps: None,
            pinned: false,
        }
    }

    pub fn at_step(mut self, step: u64) -> Self {
        self.step = Some(step);
        self
    }

    pub fn expiring_after(mut self, steps: u64) -> Self {
        self.expires_after_steps = Some(steps);
        self
    }

    pub fn pinned(mut self) -> Self {
        self.pinned = true;
        self
    }

    /// An item added at step s0 with expiry k is expired at any read with
    /// current_step > s0 + k, unless pinned.
    pub fn is_expired(&self, current_step: u64) -> bool {
        if self.pinned {
            return false;
        }
        match (self.expires_after_steps, self.step) {
            (Some(expires), Some(added)) => current_step.saturating_sub(added) > expires,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expiry_window() {
        let item = MemoryItem::new(ItemType::LoadedContext, "full_file:src/m.py", serde_json::json!("..."))
            .at_step(2)
            .expiring_after(3);

        assert!(!item.is_expired(2));
        assert!(!item.is_expired(5)); // exactly s0 + k still alive
        assert!(item.is_expired(6));
    }

    #[test]
    fn test_pinned_never_expires() {
        let item = MemoryItem::new(ItemType::Note, "plan", serde_json::json!("keep"))
            .at_step(1)
            .expiring_after(1)
            .pinned();
        assert!(!item.is_expired(100));
    }

    #[test]
    fn test_no_expiry_without_step() {
        let item = MemoryItem::new(ItemType::Note, "n", serde_json::json!("x")).expiring_after(1);
        assert!(!item.is_expired(50));
    }

    #[test]
    fn test_serde_type_tag() {
        let item = MemoryItem::new(ItemType::ActionResult, "action_step_1", serde_json::json!({"action": "read_file"}));
        let yaml = serde_yaml::to_string(&item).unwrap();
        assert!(yaml.contains("type: action_result"));
        let back: MemoryItem = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(back.item_type, ItemType::ActionResult);
    }
}
