//! WorkMem - bounded rolling working memory for the agent harness
//!
//! A per-task buffer of recent observations (action results, loaded file
//! content, notes) persisted to a single YAML file and reloaded fresh each
//! step. Items are evicted FIFO when the buffer is full unless pinned, and
//! expire after a configurable number of steps.
//!
//! Facts - the agent's extracted understanding - also live here, persisted
//! as one pinned `understanding` item so the rolling-buffer bound applies
//! to observations while facts obey their own compaction bound.

mod buffer;
mod fact;
mod item;

pub use buffer::{RecentAction, WorkingMemory};
pub use fact::{Fact, FactCategory, Understanding};
pub use item::{ItemType, MemoryItem};
