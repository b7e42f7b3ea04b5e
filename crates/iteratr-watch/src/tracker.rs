// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// One changed file inside the working directory, keyed by relative path.
#[derive(Debug, Clone, PartialEq)]
pub struct FileChange {
    pub rel_path: String,
    pub abs_path: PathBuf,
    pub is_new: bool,
    pub additions: u32,
    pub deletions: u32,
}

/// Per-iteration change set.  Authoritative records come from agent edit
/// events; the watcher only fills gaps and never clobbers richer metadata.
pub struct FileChangeTracker {
    workdir: PathBuf,
    changes: Mutex<HashMap<String, FileChange>>,
}

impl FileChangeTracker {
    pub fn new(workdir: PathBuf) -> Self {
        Self {
            workdir,
            changes: Mutex::new(HashMap::new()),
        }
    }

    /// Record an authoritative edit from the agent stream.  Overwrites any
    /// prior entry for the same path.
    pub fn record_change(&self, path: &str, is_new: bool, additions: u32, deletions: u32) {
        let (rel, abs) = self.normalize(path);
        let change = FileChange {
            rel_path: rel.clone(),
            abs_path: abs,
            is_new,
            additions,
            deletions,
        };
        self.changes
            .lock()
            .expect("tracker mutex poisoned")
            .insert(rel, change);
    }

    /// Merge watcher sightings: inserts paths not yet present with zeroed
    /// metadata, never replacing an existing (richer) record.
    pub fn merge_watcher_paths(&self, paths: impl IntoIterator<Item = String>) {
        let mut changes = self.changes.lock().expect("tracker mutex poisoned");
        for path in paths {
            let abs = self.workdir.join(&path);
            changes.entry(path.clone()).or_insert(FileChange {
                rel_path: path,
                abs_path: abs,
                is_new: false,
                additions: 0,
                deletions: 0,
            });
        }
    }

    /// Runs at each iteration boundary.
    pub fn clear(&self) {
        self.changes.lock().expect("tracker mutex poisoned").clear();
    }

    pub fn has_changes(&self) -> bool {
        !self.changes.lock().expect("tracker mutex poisoned").is_empty()
    }

    /// Snapshot of the current change set, sorted by relative path.
    pub fn changes(&self) -> Vec<FileChange> {
        let mut list: Vec<FileChange> = self
            .changes
            .lock()
            .expect("tracker mutex poisoned")
            .values()
            .cloned()
            .collect();
        list.sort_by(|a, b| a.rel_path.cmp(&b.rel_path));
        list
    }

    fn normalize(&self, path: &str) -> (String, PathBuf) {
        let p = Path::new(path);
        if p.is_absolute() {
            let rel = p
                .strip_prefix(&self.workdir)
                .map(|r| r.to_string_lossy().into_owned())
                .unwrap_or_else(|_| path.to_string());
            (rel, p.to_path_buf())
        } else {
            (path.to_string(), self.workdir.join(p))
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> FileChangeTracker {
        FileChangeTracker::new(PathBuf::from("/work"))
    }

    #[test]
    fn record_change_relativizes_absolute_paths() {
        let t = tracker();
        t.record_change("/work/src/main.rs", false, 10, 2);
        let changes = t.changes();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].rel_path, "src/main.rs");
        assert_eq!(changes[0].abs_path, PathBuf::from("/work/src/main.rs"));
    }

    #[test]
    fn record_change_overwrites_prior_entry() {
        let t = tracker();
        t.record_change("src/lib.rs", true, 5, 0);
        t.record_change("src/lib.rs", false, 8, 3);
        let changes = t.changes();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].additions, 8);
        assert!(!changes[0].is_new);
    }

    #[test]
    fn watcher_merge_never_clobbers_authoritative_metadata() {
        let t = tracker();
        t.record_change("src/lib.rs", true, 12, 4);
        t.merge_watcher_paths(["src/lib.rs".to_string(), "README.md".to_string()]);

        let changes = t.changes();
        assert_eq!(changes.len(), 2);
        let lib = changes.iter().find(|c| c.rel_path == "src/lib.rs").unwrap();
        assert_eq!((lib.additions, lib.deletions), (12, 4));
        assert!(lib.is_new);
        let readme = changes.iter().find(|c| c.rel_path == "README.md").unwrap();
        assert_eq!((readme.additions, readme.deletions), (0, 0));
    }

    #[test]
    fn watcher_paths_fill_gaps_only() {
        let t = tracker();
        t.merge_watcher_paths(["a.txt".to_string()]);
        t.merge_watcher_paths(["a.txt".to_string(), "b.txt".to_string()]);
        assert_eq!(t.changes().len(), 2);
    }

    #[test]
    fn clear_empties_the_set() {
        let t = tracker();
        t.record_change("x", false, 1, 1);
        assert!(t.has_changes());
        t.clear();
        assert!(!t.has_changes());
        assert!(t.changes().is_empty());
    }

    #[test]
    fn changes_are_sorted_by_path() {
        let t = tracker();
        t.record_change("zz.rs", false, 1, 0);
        t.record_change("aa.rs", false, 1, 0);
        let changes = t.changes();
        let paths: Vec<&str> = changes.iter().map(|c| c.rel_path.as_str()).collect();
        assert_eq!(paths, ["aa.rs", "zz.rs"]);
    }
}
