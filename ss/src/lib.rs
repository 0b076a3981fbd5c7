//! StateStore - per-task persistent state for the agent harness
//!
//! All agent state lives on disk; the engine has no memory except what it
//! loads from the store at the start of each step. Each task owns a
//! directory:
//!
//! ```text
//! .agentforge/tasks/{task_id}/
//! ├── task.yaml                 # Immutable: goal, success criteria
//! ├── state.yaml                # Mutable: phase, step, verification
//! ├── actions.yaml              # Append-only log of all actions
//! ├── working_memory.yaml       # Rolling buffer (owned by workmem)
//! └── artifacts/
//!     ├── inputs/
//!     ├── outputs/
//!     └── snapshots/
//! ```
//!
//! Persisted state carries a `schema_version`; older versions are migrated
//! forward on load and re-saved.

mod migrate;
mod records;
mod store;

pub use migrate::{SCHEMA_VERSION, migrate_state_doc};
pub use records::{
    ActionRecord, ActionResult, ContextData, Phase, PhaseState, TaskSpec, TaskState, VerificationStatus, now,
};
pub use store::{ArtifactKind, TaskStateStore};
