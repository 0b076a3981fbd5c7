//! TaskStateStore - on-disk task state with locking and atomic saves
//!
//! One directory per task. Writers take an exclusive advisory lock on the
//! task's lock file; readers take a shared lock. Saves go through a
//! temporary sibling and an atomic rename, so a crash never leaves a
//! half-written state file. A state file that fails to parse is quarantined
//! (renamed with a `.corrupted` suffix) and the load reports "not found".

use std::fs::{self, File};
use std::path::{Path, PathBuf};

use eyre::{Context, Result};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::migrate::{SCHEMA_VERSION, migrate_state_doc};
use crate::records::{
    ActionRecord, ActionResult, ContextData, Phase, PhaseState, TaskSpec, TaskState, VerificationStatus, now,
};

/// Artifact directory kinds under `artifacts/`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    Inputs,
    Outputs,
    Snapshots,
}

impl ArtifactKind {
    fn dir_name(&self) -> &'static str {
        match self {
            ArtifactKind::Inputs => "inputs",
            ArtifactKind::Outputs => "outputs",
            ArtifactKind::Snapshots => "snapshots",
        }
    }
}

/// Mutable portion persisted in state.yaml
#[derive(Debug, Serialize, Deserialize)]
struct StateDoc {
    schema_version: String,
    phase: Phase,
    current_step: u64,
    verification: VerificationStatus,
    last_updated: chrono::DateTime<chrono::Utc>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    context_data: ContextData,
    #[serde(default)]
    phase_machine_state: PhaseState,
}

/// Append-only actions.yaml document
#[derive(Debug, Default, Serialize, Deserialize)]
struct ActionsDoc {
    #[serde(default)]
    actions: Vec<ActionRecord>,
}

/// Manages task state on disk
pub struct TaskStateStore {
    root: PathBuf,
}

impl TaskStateStore {
    /// Create a store rooted at the given project path
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    fn tasks_dir(&self) -> PathBuf {
        self.root.join(".agentforge").join("tasks")
    }

    /// Directory owned by a task (also hosts its working memory file)
    pub fn task_dir(&self, task_id: &str) -> PathBuf {
        self.tasks_dir().join(task_id)
    }

    fn lock_file(&self, task_id: &str) -> Result<File> {
        let task_dir = self.task_dir(task_id);
        fs::create_dir_all(&task_dir).context("Failed to create task directory")?;
        File::create(task_dir.join(".lock")).context("Failed to open task lock file")
    }

    fn write_lock(&self, task_id: &str) -> Result<File> {
        let file = self.lock_file(task_id)?;
        file.lock_exclusive().context("Failed to take exclusive task lock")?;
        Ok(file)
    }

    fn read_lock(&self, task_id: &str) -> Result<File> {
        let file = self.lock_file(task_id)?;
        file.lock_shared().context("Failed to take shared task lock")?;
        Ok(file)
    }

    /// Create a new task and persist it. Idempotent on the filesystem.
    pub fn create_task(&self, spec: TaskSpec, context_data: ContextData) -> Result<TaskState> {
        let task_id = spec.task_id.clone();
        debug!(%task_id, task_type = %spec.task_type, "create_task");
        let _lock = self.write_lock(&task_id)?;
        let task_dir = self.task_dir(&task_id);

        for kind in ["inputs", "outputs", "snapshots"] {
            fs::create_dir_all(task_dir.join("artifacts").join(kind))?;
        }

        let state = TaskState::new(spec, context_data);

        write_atomic(&task_dir.join("task.yaml"), &serde_yaml::to_string(&state.spec)?)?;
        self.save_unlocked(&state)?;
        write_atomic(
            &task_dir.join("actions.yaml"),
            &serde_yaml::to_string(&ActionsDoc::default())?,
        )?;

        // Seed an empty working memory file; workmem owns it afterwards
        let memory_file = task_dir.join("working_memory.yaml");
        if !memory_file.exists() {
            write_atomic(&memory_file, "max_items: 5\nitems: []\n")?;
        }

        info!(%task_id, "task created");
        Ok(state)
    }

    /// Load task state, migrating older schema versions forward.
    /// Returns None for unknown tasks and for quarantined state files.
    pub fn load(&self, task_id: &str) -> Result<Option<TaskState>> {
        if !self.task_dir(task_id).exists() {
            return Ok(None);
        }
        let _lock = self.read_lock(task_id)?;
        self.load_unlocked(task_id)
    }

    fn load_unlocked(&self, task_id: &str) -> Result<Option<TaskState>> {
        let task_dir = self.task_dir(task_id);
        let task_file = task_dir.join("task.yaml");
        let state_file = task_dir.join("state.yaml");
        if !task_file.exists() || !state_file.exists() {
            return Ok(None);
        }

        let spec: TaskSpec = match read_yaml(&task_file) {
            Ok(spec) => spec,
            Err(e) => {
                quarantine(&task_file, &e);
                return Ok(None);
            }
        };

        let mut raw: serde_yaml::Value = match read_yaml(&state_file) {
            Ok(raw) => raw,
            Err(e) => {
                quarantine(&state_file, &e);
                return Ok(None);
            }
        };

        let migrated = migrate_state_doc(&mut raw);

        let doc: StateDoc = match serde_yaml::from_value(raw) {
            Ok(doc) => doc,
            Err(e) => {
                quarantine(&state_file, &eyre::eyre!(e));
                return Ok(None);
            }
        };

        let state = TaskState {
            spec,
            phase: doc.phase,
            current_step: doc.current_step,
            verification: doc.verification,
            context_data: doc.context_data,
            phase_machine_state: doc.phase_machine_state,
            last_updated: doc.last_updated,
            error: doc.error,
            schema_version: doc.schema_version,
        };

        // Re-save migrated state so the migration runs once
        if migrated {
            self.save_unlocked(&state)?;
        }

        Ok(Some(state))
    }

    /// Full replacement of the mutable state portion
    pub fn save(&self, state: &mut TaskState) -> Result<()> {
        let _lock = self.write_lock(state.task_id())?;
        state.last_updated = now();
        self.save_unlocked(state)
    }

    fn save_unlocked(&self, state: &TaskState) -> Result<()> {
        let doc = StateDoc {
            schema_version: SCHEMA_VERSION.to_string(),
            phase: state.phase,
            current_step: state.current_step,
            verification: state.verification.clone(),
            last_updated: state.last_updated,
            error: state.error.clone(),
            context_data: state.context_data.clone(),
            phase_machine_state: state.phase_machine_state.clone(),
        };
        let path = self.task_dir(state.task_id()).join("state.yaml");
        write_atomic(&path, &serde_yaml::to_string(&doc)?)
    }

    /// Append a record for the step after the current counter value.
    /// The record lands on disk before the counter advances; the executor
    /// tolerates the gap a crash between the two can leave.
    #[allow(clippy::too_many_arguments)]
    pub fn record_action(
        &self,
        task_id: &str,
        action: &str,
        target: Option<String>,
        parameters: serde_json::Map<String, serde_json::Value>,
        result: ActionResult,
        summary: &str,
        duration_ms: Option<u64>,
        error: Option<String>,
    ) -> Result<ActionRecord> {
        let _lock = self.write_lock(task_id)?;
        let state = self
            .load_unlocked(task_id)?
            .ok_or_else(|| eyre::eyre!("Task not found: {}", task_id))?;

        let mut record = ActionRecord::new(state.current_step + 1, action, result, summary)
            .with_target(target)
            .with_parameters(parameters)
            .with_error(error);
        if let Some(d) = duration_ms {
            record = record.with_duration_ms(d);
        }

        let actions_file = self.task_dir(task_id).join("actions.yaml");
        let mut doc: ActionsDoc = if actions_file.exists() {
            read_yaml(&actions_file).unwrap_or_default()
        } else {
            ActionsDoc::default()
        };
        doc.actions.push(record.clone());
        write_atomic(&actions_file, &serde_yaml::to_string(&doc)?)?;

        debug!(%task_id, step = record.step, action = %record.action, result = %record.result, "action recorded");
        Ok(record)
    }

    /// Advance the step counter and return the new value
    pub fn increment_step(&self, task_id: &str) -> Result<u64> {
        let _lock = self.write_lock(task_id)?;
        let Some(mut state) = self.load_unlocked(task_id)? else {
            return Ok(0);
        };
        state.current_step += 1;
        state.last_updated = now();
        self.save_unlocked(&state)?;
        Ok(state.current_step)
    }

    /// Most recent actions from the append-only log, in chronological order
    pub fn recent_actions(&self, task_id: &str, limit: usize) -> Result<Vec<ActionRecord>> {
        let actions_file = self.task_dir(task_id).join("actions.yaml");
        if !actions_file.exists() {
            return Ok(Vec::new());
        }
        let _lock = self.read_lock(task_id)?;
        let doc: ActionsDoc = read_yaml(&actions_file).unwrap_or_default();
        let skip = doc.actions.len().saturating_sub(limit);
        Ok(doc.actions.into_iter().skip(skip).collect())
    }

    /// All recorded actions
    pub fn all_actions(&self, task_id: &str) -> Result<Vec<ActionRecord>> {
        self.recent_actions(task_id, usize::MAX)
    }

    pub fn update_phase(&self, task_id: &str, phase: Phase) -> Result<()> {
        self.mutate(task_id, |state| {
            state.phase = phase;
        })
    }

    pub fn update_phase_machine(&self, task_id: &str, machine_state: PhaseState) -> Result<()> {
        self.mutate(task_id, |state| {
            state.phase_machine_state = machine_state;
        })
    }

    /// Record a verification observation; `ready_for_completion` is derived.
    pub fn update_verification(
        &self,
        task_id: &str,
        checks_passing: u32,
        checks_failing: u32,
        tests_passing: bool,
        details: serde_json::Map<String, serde_json::Value>,
    ) -> Result<()> {
        self.mutate(task_id, |state| {
            state.verification = VerificationStatus::observed(checks_passing, checks_failing, tests_passing, details);
        })
    }

    pub fn update_context_data(&self, task_id: &str, key: &str, value: serde_json::Value) -> Result<()> {
        self.mutate(task_id, |state| {
            state.context_data.insert(key.to_string(), value);
        })
    }

    /// Set the task error and move it to FAILED
    pub fn set_error(&self, task_id: &str, message: &str) -> Result<()> {
        warn!(%task_id, %message, "task failed");
        self.mutate(task_id, |state| {
            state.error = Some(message.to_string());
            state.phase = Phase::Failed;
        })
    }

    fn mutate(&self, task_id: &str, f: impl FnOnce(&mut TaskState)) -> Result<()> {
        let _lock = self.write_lock(task_id)?;
        let Some(mut state) = self.load_unlocked(task_id)? else {
            return Err(eyre::eyre!("Task not found: {}", task_id));
        };
        f(&mut state);
        state.last_updated = now();
        self.save_unlocked(&state)
    }

    /// Save an artifact file, returning its path
    pub fn save_artifact(&self, task_id: &str, kind: ArtifactKind, name: &str, content: &str) -> Result<PathBuf> {
        let dir = self.task_dir(task_id).join("artifacts").join(kind.dir_name());
        fs::create_dir_all(&dir)?;
        let path = dir.join(name);
        write_atomic(&path, content)?;
        Ok(path)
    }

    /// Load an artifact if present
    pub fn load_artifact(&self, task_id: &str, kind: ArtifactKind, name: &str) -> Result<Option<String>> {
        let path = self.task_dir(task_id).join("artifacts").join(kind.dir_name()).join(name);
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(fs::read_to_string(&path)?))
    }

    /// List task ids, optionally filtered by current phase
    pub fn list_tasks(&self, status: Option<Phase>) -> Result<Vec<String>> {
        let tasks_dir = self.tasks_dir();
        if !tasks_dir.exists() {
            return Ok(Vec::new());
        }

        let mut task_ids = Vec::new();
        for entry in fs::read_dir(&tasks_dir)? {
            let entry = entry?;
            let path = entry.path();
            if !path.is_dir() || !path.join("task.yaml").exists() {
                continue;
            }
            let Some(id) = path.file_name().and_then(|n| n.to_str()).map(str::to_string) else {
                continue;
            };
            match status {
                Some(phase) => {
                    if let Some(state) = self.load(&id)?
                        && state.phase == phase
                    {
                        task_ids.push(id);
                    }
                }
                None => task_ids.push(id),
            }
        }
        task_ids.sort();
        Ok(task_ids)
    }

    /// Delete a task and all its data
    pub fn delete_task(&self, task_id: &str) -> Result<bool> {
        let task_dir = self.task_dir(task_id);
        if task_dir.exists() {
            fs::remove_dir_all(&task_dir)?;
            info!(%task_id, "task deleted");
            return Ok(true);
        }
        Ok(false)
    }
}

fn read_yaml<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = fs::read_to_string(path).context(format!("Failed to read {}", path.display()))?;
    serde_yaml::from_str(&raw).context(format!("Failed to parse {}", path.display()))
}

/// Write via temp sibling + rename so readers never see a torn file
fn write_atomic(path: &Path, content: &str) -> Result<()> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, content).context(format!("Failed to write {}", tmp.display()))?;
    fs::rename(&tmp, path).context(format!("Failed to replace {}", path.display()))?;
    Ok(())
}

/// Rename an unreadable file out of the way instead of raising
fn quarantine(path: &Path, err: &eyre::Report) {
    let target = PathBuf::from(format!("{}.corrupted", path.display()));
    warn!(file = %path.display(), error = %err, "quarantining corrupt state file");
    if let Err(e) = fs::rename(path, &target) {
        warn!(file = %path.display(), error = %e, "quarantine rename failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tempfile::tempdir;

    fn spec(id: &str) -> TaskSpec {
        TaskSpec::with_id(id, "fix_violation", "Fix complexity in src/m.py", vec![
            "check passes".to_string(),
            "tests green".to_string(),
        ])
    }

    #[test]
    fn test_create_and_load() {
        let temp = tempdir().unwrap();
        let store = TaskStateStore::new(temp.path());

        let mut ctx = ContextData::new();
        ctx.insert("file_path".into(), serde_json::json!("src/m.py"));
        let created = store.create_task(spec("task_a"), ctx).unwrap();
        assert_eq!(created.phase, Phase::Init);
        assert_eq!(created.current_step, 0);

        let loaded = store.load("task_a").unwrap().unwrap();
        assert_eq!(loaded.spec, created.spec);
        assert_eq!(loaded.context_str("file_path"), Some("src/m.py"));
        assert_eq!(loaded.schema_version, SCHEMA_VERSION);

        // Layout
        let dir = store.task_dir("task_a");
        assert!(dir.join("task.yaml").exists());
        assert!(dir.join("state.yaml").exists());
        assert!(dir.join("actions.yaml").exists());
        assert!(dir.join("working_memory.yaml").exists());
        assert!(dir.join("artifacts/inputs").is_dir());
        assert!(dir.join("artifacts/outputs").is_dir());
        assert!(dir.join("artifacts/snapshots").is_dir());
    }

    #[test]
    fn test_load_unknown_task() {
        let temp = tempdir().unwrap();
        let store = TaskStateStore::new(temp.path());
        assert!(store.load("missing").unwrap().is_none());
    }

    #[test]
    fn test_record_then_increment_ordering() {
        let temp = tempdir().unwrap();
        let store = TaskStateStore::new(temp.path());
        store.create_task(spec("task_b"), ContextData::new()).unwrap();

        let record = store
            .record_action(
                "task_b",
                "read_file",
                Some("src/m.py".into()),
                serde_json::Map::new(),
                ActionResult::Success,
                "Read 120 lines",
                Some(12),
                None,
            )
            .unwrap();
        assert_eq!(record.step, 1);

        // Counter still behind until incremented
        assert_eq!(store.load("task_b").unwrap().unwrap().current_step, 0);
        assert_eq!(store.increment_step("task_b").unwrap(), 1);
        assert_eq!(store.load("task_b").unwrap().unwrap().current_step, 1);
    }

    #[test]
    fn test_action_log_append_only() {
        let temp = tempdir().unwrap();
        let store = TaskStateStore::new(temp.path());
        store.create_task(spec("task_c"), ContextData::new()).unwrap();

        for i in 0..4u64 {
            store
                .record_action(
                    "task_c",
                    "run_check",
                    None,
                    serde_json::Map::new(),
                    ActionResult::Failure,
                    &format!("check {}", i),
                    None,
                    Some("violation".into()),
                )
                .unwrap();
            store.increment_step("task_c").unwrap();
        }

        let all = store.all_actions("task_c").unwrap();
        assert_eq!(all.len(), 4);
        assert_eq!(all.iter().map(|a| a.step).collect::<Vec<_>>(), vec![1, 2, 3, 4]);

        let recent = store.recent_actions("task_c", 2).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].step, 3);
        assert_eq!(recent[1].step, 4);
    }

    #[test]
    fn test_update_verification_derives_ready() {
        let temp = tempdir().unwrap();
        let store = TaskStateStore::new(temp.path());
        store.create_task(spec("task_d"), ContextData::new()).unwrap();

        store
            .update_verification("task_d", 3, 0, true, serde_json::Map::new())
            .unwrap();
        let state = store.load("task_d").unwrap().unwrap();
        assert!(state.verification.ready_for_completion);
        assert!(state.verification.last_check_time.is_some());

        store
            .update_verification("task_d", 2, 1, true, serde_json::Map::new())
            .unwrap();
        let state = store.load("task_d").unwrap().unwrap();
        assert!(!state.verification.ready_for_completion);
    }

    #[test]
    fn test_set_error_moves_to_failed() {
        let temp = tempdir().unwrap();
        let store = TaskStateStore::new(temp.path());
        store.create_task(spec("task_e"), ContextData::new()).unwrap();

        store.set_error("task_e", "tool exploded").unwrap();
        let state = store.load("task_e").unwrap().unwrap();
        assert_eq!(state.phase, Phase::Failed);
        assert_eq!(state.error.as_deref(), Some("tool exploded"));
    }

    #[test]
    fn test_corrupt_state_quarantined() {
        let temp = tempdir().unwrap();
        let store = TaskStateStore::new(temp.path());
        store.create_task(spec("task_f"), ContextData::new()).unwrap();

        let state_file = store.task_dir("task_f").join("state.yaml");
        fs::write(&state_file, "phase: [unclosed").unwrap();

        assert!(store.load("task_f").unwrap().is_none());
        assert!(!state_file.exists());
        assert!(store.task_dir("task_f").join("state.yaml.corrupted").exists());
    }

    #[test]
    fn test_schema_migration_on_load() {
        let temp = tempdir().unwrap();
        let store = TaskStateStore::new(temp.path());
        store.create_task(spec("task_g"), ContextData::new()).unwrap();

        // Rewrite state.yaml as a legacy 1.0 document
        let legacy = "schema_version: '1.0'\n\
                      phase: implement\n\
                      current_step: 3\n\
                      verification:\n  checks_passing: 1\n  checks_failing: 2\n  tests_passing: false\n\
                      last_updated: 2025-01-01T00:00:00Z\n\
                      context_data: {}\n";
        fs::write(store.task_dir("task_g").join("state.yaml"), legacy).unwrap();

        let state = store.load("task_g").unwrap().unwrap();
        assert_eq!(state.schema_version, SCHEMA_VERSION);
        assert_eq!(state.phase, Phase::Implement);
        assert_eq!(state.current_step, 3);
        assert!(!state.verification.ready_for_completion);
        assert_eq!(state.phase_machine_state, PhaseState::default());

        // Migration re-saved the file at the current version
        let raw = fs::read_to_string(store.task_dir("task_g").join("state.yaml")).unwrap();
        assert!(raw.contains(&format!("schema_version: '{}'", SCHEMA_VERSION)));
    }

    #[test]
    fn test_artifacts_round_trip() {
        let temp = tempdir().unwrap();
        let store = TaskStateStore::new(temp.path());
        store.create_task(spec("task_h"), ContextData::new()).unwrap();

        let path = store
            .save_artifact("task_h", ArtifactKind::Snapshots, "m.py.before", "def foo(): pass\n")
            .unwrap();
        assert!(path.exists());
        let content = store
            .load_artifact("task_h", ArtifactKind::Snapshots, "m.py.before")
            .unwrap();
        assert_eq!(content.as_deref(), Some("def foo(): pass\n"));
        assert!(
            store
                .load_artifact("task_h", ArtifactKind::Inputs, "missing")
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn test_list_tasks_with_status_filter() {
        let temp = tempdir().unwrap();
        let store = TaskStateStore::new(temp.path());
        store.create_task(spec("task_i"), ContextData::new()).unwrap();
        store.create_task(spec("task_j"), ContextData::new()).unwrap();
        store.update_phase("task_j", Phase::Complete).unwrap();

        assert_eq!(store.list_tasks(None).unwrap(), vec!["task_i", "task_j"]);
        assert_eq!(store.list_tasks(Some(Phase::Complete)).unwrap(), vec!["task_j"]);
        assert_eq!(store.list_tasks(Some(Phase::Init)).unwrap(), vec!["task_i"]);
    }

    #[test]
    fn test_delete_task() {
        let temp = tempdir().unwrap();
        let store = TaskStateStore::new(temp.path());
        store.create_task(spec("task_k"), ContextData::new()).unwrap();

        assert!(store.delete_task("task_k").unwrap());
        assert!(store.load("task_k").unwrap().is_none());
        assert!(!store.delete_task("task_k").unwrap());
    }

    proptest! {
        #[test]
        fn prop_state_save_load_round_trip(step in 0u64..10_000, failing in 0u32..50, tests_passing: bool) {
            let temp = tempdir().unwrap();
            let store = TaskStateStore::new(temp.path());
            let mut state = store.create_task(spec("task_prop"), ContextData::new()).unwrap();

            state.current_step = step;
            state.verification = VerificationStatus::observed(1, failing, tests_passing, serde_json::Map::new());
            store.save(&mut state).unwrap();

            let loaded = store.load("task_prop").unwrap().unwrap();
            prop_assert_eq!(loaded.current_step, step);
            prop_assert_eq!(loaded.verification.checks_failing, failing);
            prop_assert_eq!(loaded.verification.ready_for_completion, failing == 0 && tests_passing);
        }
    }
}
