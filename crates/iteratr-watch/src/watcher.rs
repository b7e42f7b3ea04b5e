// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use notify::event::{EventKind, ModifyKind};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use tracing::{debug, warn};

use crate::gitignore::Gitignore;

/// Directory basenames excluded regardless of gitignore content.  The data
/// directory basename is appended at construction time.
pub const FIXED_EXCLUDES: [&str; 3] = [".git", "node_modules", "target"];

/// Recursive watcher over the working directory.
///
/// Never signals anything: it accumulates relative paths with a sighting
/// timestamp and the orchestrator polls (and clears) the set at iteration
/// boundaries.  On create/write/rename events only; gitignored paths and
/// fixed excludes are dropped at event time.
pub struct WorkdirWatcher {
    // kept alive for the watch registration; dropping stops the stream
    _watcher: Option<RecommendedWatcher>,
    changes: Arc<Mutex<HashMap<String, SystemTime>>>,
}

impl WorkdirWatcher {
    /// Start watching `workdir`.  Watch-registration failures degrade to an
    /// inert watcher (the tracker's agent-reported edits remain).
    pub fn start(workdir: &Path, data_dir_basename: &str) -> Self {
        let workdir = match workdir.canonicalize() {
            Ok(dir) => dir,
            Err(e) => {
                warn!(error = %e, "cannot canonicalize workdir, watcher disabled");
                return Self::inert();
            }
        };

        let mut excluded: HashSet<String> =
            FIXED_EXCLUDES.iter().map(|s| s.to_string()).collect();
        excluded.insert(data_dir_basename.to_string());

        let gitignore = Gitignore::from_workdir(&workdir);
        let changes: Arc<Mutex<HashMap<String, SystemTime>>> =
            Arc::new(Mutex::new(HashMap::new()));

        let (tx, rx) = mpsc::channel::<notify::Event>();
        let watcher = match notify::recommended_watcher(
            move |res: Result<notify::Event, notify::Error>| match res {
                Ok(event) => {
                    let _ = tx.send(event);
                }
                Err(e) => debug!(error = %e, "watch stream error"),
            },
        ) {
            Ok(w) => w,
            Err(e) => {
                warn!(error = %e, "could not create filesystem watcher, degrading");
                return Self::inert();
            }
        };

        let mut watcher = watcher;
        if let Err(e) = watcher.watch(&workdir, RecursiveMode::Recursive) {
            // kernel watch resources exhausted or similar; degrade
            warn!(error = %e, dir = %workdir.display(), "could not watch workdir, degrading");
            return Self::inert();
        }

        let accumulator = changes.clone();
        std::thread::Builder::new()
            .name("workdir-watcher".to_string())
            .spawn(move || {
                while let Ok(event) = rx.recv() {
                    if !is_change_kind(&event.kind) {
                        continue;
                    }
                    for path in &event.paths {
                        if let Some(rel) =
                            relevant_path(&workdir, &excluded, &gitignore, path)
                        {
                            accumulator
                                .lock()
                                .expect("watcher mutex poisoned")
                                .insert(rel, SystemTime::now());
                        }
                    }
                }
            })
            .map_err(|e| warn!(error = %e, "could not start watcher thread"))
            .ok();

        Self {
            _watcher: Some(watcher),
            changes,
        }
    }

    fn inert() -> Self {
        Self {
            _watcher: None,
            changes: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Current accumulated change set (relative paths, sorted).
    pub fn changed_paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self
            .changes
            .lock()
            .expect("watcher mutex poisoned")
            .keys()
            .cloned()
            .collect();
        paths.sort();
        paths
    }

    /// Runs at each iteration boundary.
    pub fn clear(&self) {
        self.changes.lock().expect("watcher mutex poisoned").clear();
    }

    /// Dropping the inner watcher deregisters all watches; the worker thread
    /// exits when the event channel closes.
    pub fn stop(mut self) {
        self._watcher = None;
    }
}

fn is_change_kind(kind: &EventKind) -> bool {
    match kind {
        EventKind::Create(_) => true,
        EventKind::Modify(ModifyKind::Data(_)) => true,
        EventKind::Modify(ModifyKind::Name(_)) => true,
        EventKind::Modify(ModifyKind::Any) => true,
        // metadata-only changes (chmod, mtime) are not edits
        _ => false,
    }
}

/// Normalize an event path to working-directory-relative form; None when it
/// resolves outside the workdir, hits a fixed exclude, or is gitignored.
fn relevant_path(
    workdir: &Path,
    excluded: &HashSet<String>,
    gitignore: &Gitignore,
    path: &Path,
) -> Option<String> {
    let rel: PathBuf = path.strip_prefix(workdir).ok()?.to_path_buf();
    let rel_str = rel.to_string_lossy().replace('\\', "/");
    if rel_str.is_empty() {
        return None;
    }
    for component in rel_str.split('/') {
        if excluded.contains(component) {
            return None;
        }
    }
    let is_dir = path.is_dir();
    if gitignore.is_ignored(&rel_str, is_dir) {
        return None;
    }
    // directories themselves are not change-set entries
    if is_dir {
        return None;
    }
    Some(rel_str)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
