//! Project fingerprint - compact orientation context
//!
//! A few lines describing the project the agent is working in. Opaque to
//! the rest of the engine; hosts can substitute their own source.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Source of the fingerprint block at the top of every prompt
pub trait FingerprintSource: Send + Sync {
    fn fingerprint(&self) -> String;
}

/// Default fingerprint: project name, top-level layout, file counts by
/// extension (one directory level deep - orientation, not an index).
pub struct ProjectFingerprint {
    root: PathBuf,
}

impl ProjectFingerprint {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }
}

impl FingerprintSource for ProjectFingerprint {
    fn fingerprint(&self) -> String {
        let name = self
            .root
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("project")
            .to_string();

        let mut dirs: Vec<String> = Vec::new();
        let mut by_ext: BTreeMap<String, usize> = BTreeMap::new();

        if let Ok(entries) = fs::read_dir(&self.root) {
            for entry in entries.flatten() {
                let path = entry.path();
                let Some(entry_name) = path.file_name().and_then(|n| n.to_str()) else {
                    continue;
                };
                if entry_name.starts_with('.') {
                    continue;
                }
                if path.is_dir() {
                    dirs.push(format!("{}/", entry_name));
                    if let Ok(children) = fs::read_dir(&path) {
                        for child in children.flatten() {
                            count_extension(&child.path(), &mut by_ext);
                        }
                    }
                } else {
                    count_extension(&path, &mut by_ext);
                }
            }
        }
        dirs.sort();

        let mut lines = vec![format!("project: {}", name)];
        if !dirs.is_empty() {
            lines.push(format!("layout: {}", dirs.join(" ")));
        }
        if !by_ext.is_empty() {
            let counts: Vec<String> = by_ext.iter().map(|(ext, n)| format!("{}:{}", ext, n)).collect();
            lines.push(format!("files: {}", counts.join(" ")));
        }
        lines.join("\n")
    }
}

fn count_extension(path: &Path, by_ext: &mut BTreeMap<String, usize>) {
    if path.is_file()
        && let Some(ext) = path.extension().and_then(|e| e.to_str())
    {
        *by_ext.entry(ext.to_string()).or_default() += 1;
    }
}
