//! Prompt assembly with tiered token budgets

mod builder;
mod compaction;
mod fingerprint;
mod prompts;

pub use builder::{BuiltContext, ContextBuilder, DEFAULT_MAX_TOKENS};
pub use compaction::{AppliedRule, CompactionManager, CompactionOutcome, CompactionRule, Section, Strategy};
pub use fingerprint::{FingerprintSource, ProjectFingerprint};
pub use prompts::PromptRegistry;
