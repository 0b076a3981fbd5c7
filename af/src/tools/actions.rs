//! Reference file actions for fix-violation tasks
//!
//! The minimum action surface the LLM contract names, implemented against
//! the local filesystem. Refactoring providers (extract_function,
//! simplify_conditional) and the check/test runners stay host-supplied;
//! these cover the file plumbing every task needs.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use statestore::{TaskState, TaskStateStore};
use tracing::debug;
use workmem::{ItemType, MemoryItem, WorkingMemory};

use crate::response::Params;

use super::{ActionExecutor, ActionOutput};

fn get_str<'a>(params: &'a Params, key: &str) -> Option<&'a str> {
    params.get(key).and_then(|v| v.as_str())
}

fn get_u64(params: &Params, key: &str) -> Option<u64> {
    params.get(key).and_then(|v| v.as_u64())
}

/// Collapse runs of whitespace so fuzzy matching survives reindentation
fn normalize(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// File read/write/edit actions plus context loading and plan recording.
/// One instance registers under several action names.
pub struct FileActions {
    project_root: PathBuf,
    store: Arc<TaskStateStore>,
}

impl FileActions {
    pub fn new(project_root: impl AsRef<Path>, store: Arc<TaskStateStore>) -> Self {
        Self {
            project_root: project_root.as_ref().to_path_buf(),
            store,
        }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        self.project_root.join(path)
    }

    fn read_file(&self, params: &Params) -> ActionOutput {
        let Some(path) = get_str(params, "path").or_else(|| get_str(params, "file_path")) else {
            return ActionOutput::failure("read_file needs a path", "Missing parameter: path");
        };
        match fs::read_to_string(self.resolve(path)) {
            Ok(content) => {
                let lines = content.lines().count();
                ActionOutput::success(format!("Read {} lines from {}", lines, path)).with_output(content)
            }
            Err(e) => ActionOutput::failure(format!("Could not read {}", path), format!("{}: {}", path, e)),
        }
    }

    fn write_file(&self, params: &Params) -> ActionOutput {
        let Some(path) = get_str(params, "path").or_else(|| get_str(params, "file_path")) else {
            return ActionOutput::failure("write_file needs a path", "Missing parameter: path");
        };
        let content = get_str(params, "content").unwrap_or_default();

        let full = self.resolve(path);
        if let Some(parent) = full.parent()
            && let Err(e) = fs::create_dir_all(parent)
        {
            return ActionOutput::failure(format!("Could not create {}", path), e.to_string());
        }
        match fs::write(&full, content) {
            Ok(()) => ActionOutput::success(format!("Wrote {} ({} bytes)", path, content.len())),
            Err(e) => ActionOutput::failure(format!("Could not write {}", path), e.to_string()),
        }
    }

    fn edit_file(&self, params: &Params) -> ActionOutput {
        let Some(path) = get_str(params, "path").or_else(|| get_str(params, "file_path")) else {
            return ActionOutput::failure("edit_file needs a path", "Missing parameter: path");
        };
        let Some(old_text) = get_str(params, "old_text") else {
            return ActionOutput::failure("edit_file needs old_text", "Missing parameter: old_text");
        };
        let new_text = get_str(params, "new_text").unwrap_or_default();

        let full = self.resolve(path);
        let content = match fs::read_to_string(&full) {
            Ok(c) => c,
            Err(e) => return ActionOutput::failure(format!("Could not read {}", path), e.to_string()),
        };

        let updated = if content.contains(old_text) {
            content.replacen(old_text, new_text, 1)
        } else if let Some(updated) = fuzzy_replace(&content, old_text, new_text) {
            debug!(%path, "edit_file matched after whitespace normalization");
            updated
        } else {
            return ActionOutput::failure(
                format!("Edit failed in {}", path),
                "old_text not found in file".to_string(),
            );
        };

        match fs::write(&full, updated) {
            Ok(()) => ActionOutput::success(format!("Edited {}", path)),
            Err(e) => ActionOutput::failure(format!("Could not write {}", path), e.to_string()),
        }
    }

    fn replace_lines(&self, params: &Params) -> ActionOutput {
        let Some(path) = get_str(params, "file_path").or_else(|| get_str(params, "path")) else {
            return ActionOutput::failure("replace_lines needs file_path", "Missing parameter: file_path");
        };
        let (Some(start), Some(end)) = (get_u64(params, "start_line"), get_u64(params, "end_line")) else {
            return ActionOutput::failure(
                "replace_lines needs start_line and end_line",
                "Missing parameter: start_line/end_line",
            );
        };
        let new_content = get_str(params, "new_content").unwrap_or_default();

        let full = self.resolve(path);
        let content = match fs::read_to_string(&full) {
            Ok(c) => c,
            Err(e) => return ActionOutput::failure(format!("Could not read {}", path), e.to_string()),
        };
        let lines: Vec<&str> = content.lines().collect();

        if start == 0 || end < start || end as usize > lines.len() {
            return ActionOutput::failure(
                format!("Invalid line range {}-{} for {}", start, end, path),
                format!("Line range out of bounds (file has {} lines)", lines.len()),
            );
        }

        let mut updated: Vec<&str> = Vec::with_capacity(lines.len());
        updated.extend(&lines[..(start - 1) as usize]);
        updated.extend(new_content.lines());
        updated.extend(&lines[end as usize..]);
        let mut body = updated.join("\n");
        if content.ends_with('\n') {
            body.push('\n');
        }

        match fs::write(&full, body) {
            Ok(()) => ActionOutput::success(format!("Updated {} lines {}-{}", path, start, end)),
            Err(e) => ActionOutput::failure(format!("Could not write {}", path), e.to_string()),
        }
    }

    fn insert_lines(&self, params: &Params) -> ActionOutput {
        let Some(path) = get_str(params, "file_path").or_else(|| get_str(params, "path")) else {
            return ActionOutput::failure("insert_lines needs file_path", "Missing parameter: file_path");
        };
        let Some(line_number) = get_u64(params, "line_number") else {
            return ActionOutput::failure("insert_lines needs line_number", "Missing parameter: line_number");
        };
        let new_content = get_str(params, "new_content").unwrap_or_default();

        let full = self.resolve(path);
        let content = match fs::read_to_string(&full) {
            Ok(c) => c,
            Err(e) => return ActionOutput::failure(format!("Could not read {}", path), e.to_string()),
        };
        let lines: Vec<&str> = content.lines().collect();

        if line_number == 0 || line_number as usize > lines.len() + 1 {
            return ActionOutput::failure(
                format!("Invalid line {} for {}", line_number, path),
                format!("Line out of bounds (file has {} lines)", lines.len()),
            );
        }

        let at = (line_number - 1) as usize;
        let mut updated: Vec<&str> = Vec::with_capacity(lines.len() + 1);
        updated.extend(&lines[..at]);
        updated.extend(new_content.lines());
        updated.extend(&lines[at..]);
        let mut body = updated.join("\n");
        if content.ends_with('\n') {
            body.push('\n');
        }

        match fs::write(&full, body) {
            Ok(()) => ActionOutput::success(format!("Updated {} at line {}", path, line_number)),
            Err(e) => ActionOutput::failure(format!("Could not write {}", path), e.to_string()),
        }
    }

    fn load_context(&self, params: &Params, state: &TaskState) -> ActionOutput {
        let Some(path) = get_str(params, "item")
            .or_else(|| get_str(params, "path"))
            .or_else(|| get_str(params, "file_path"))
        else {
            return ActionOutput::failure("load_context needs an item", "Missing parameter: item");
        };

        let content = match fs::read_to_string(self.resolve(path)) {
            Ok(c) => c,
            Err(e) => return ActionOutput::failure(format!("Could not load {}", path), e.to_string()),
        };

        let memory = WorkingMemory::new(self.store.task_dir(state.task_id()));
        let key = format!("full_file:{}", path);
        if let Err(e) = memory.load_context(&key, &content, state.current_step, 3) {
            return ActionOutput::failure(format!("Could not stash {}", path), e.to_string());
        }
        ActionOutput::success(format!("Loaded {} into context ({} lines)", path, content.lines().count()))
    }

    fn plan_fix(&self, params: &Params, state: &TaskState) -> ActionOutput {
        let diagnosis = get_str(params, "diagnosis").unwrap_or("(no diagnosis)");
        let approach = get_str(params, "approach").unwrap_or("(no approach)");

        let plan = serde_json::json!({ "diagnosis": diagnosis, "approach": approach });
        if let Err(e) = self.store.update_context_data(state.task_id(), "plan", plan.clone()) {
            return ActionOutput::failure("Could not record plan", e.to_string());
        }
        let memory = WorkingMemory::new(self.store.task_dir(state.task_id()));
        let _ = memory.add(
            MemoryItem::new(ItemType::Note, "plan", plan)
                .at_step(state.current_step)
                .pinned(),
        );

        ActionOutput::success(format!("Plan recorded: {}", approach))
    }
}

/// Whitespace-normalized line-window match for edit_file
fn fuzzy_replace(content: &str, old_text: &str, new_text: &str) -> Option<String> {
    let content_lines: Vec<&str> = content.lines().collect();
    let old_lines: Vec<String> = old_text.lines().map(normalize).collect();
    if old_lines.is_empty() || content_lines.len() < old_lines.len() {
        return None;
    }

    for start in 0..=(content_lines.len() - old_lines.len()) {
        let window_matches = old_lines
            .iter()
            .enumerate()
            .all(|(i, old)| normalize(content_lines[start + i]) == *old);
        if window_matches {
            let mut updated: Vec<&str> = Vec::new();
            updated.extend(&content_lines[..start]);
            updated.extend(new_text.lines());
            updated.extend(&content_lines[start + old_lines.len()..]);
            let mut body = updated.join("\n");
            if content.ends_with('\n') {
                body.push('\n');
            }
            return Some(body);
        }
    }
    None
}

#[async_trait]
impl ActionExecutor for FileActions {
    async fn execute(&self, action: &str, params: &Params, state: &TaskState) -> ActionOutput {
        match action {
            "read_file" => self.read_file(params),
            "write_file" => self.write_file(params),
            "edit_file" => self.edit_file(params),
            "replace_lines" => self.replace_lines(params),
            "insert_lines" => self.insert_lines(params),
            "load_context" => self.load_context(params, state),
            "plan_fix" => self.plan_fix(params, state),
            other => ActionOutput::failure(
                format!("Unsupported file action: {}", other),
                format!("No executor registered for: {}", other),
            ),
        }
    }
}
