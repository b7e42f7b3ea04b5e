// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Filesystem observation: gitignore-aware recursive watching of the working
//! directory, and the per-iteration file-change tracker that merges
//! authoritative agent edit reports with opportunistic watcher sightings.

mod gitignore;
mod tracker;
mod watcher;

pub use gitignore::Gitignore;
pub use tracker::{FileChange, FileChangeTracker};
pub use watcher::{WorkdirWatcher, FIXED_EXCLUDES};
