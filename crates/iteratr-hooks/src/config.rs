// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Hook configuration file name, looked up at the working directory root.
pub const HOOKS_FILE_NAME: &str = ".iteratr.hooks.yml";

fn default_timeout() -> u64 {
    30
}

/// One shell command bound to a lifecycle point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HookConfig {
    /// Run under `sh -c` with `{{var}}` placeholders expanded first.
    pub command: String,
    /// Seconds before the command is killed.
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    /// Whether captured stdout is piped into the agent's next turn.
    #[serde(default)]
    pub pipe_output: bool,
}

/// The lifecycle points hooks can bind to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecyclePoint {
    SessionStart,
    PreIteration,
    PostIteration,
    OnTaskComplete,
    OnError,
    SessionEnd,
}

impl std::fmt::Display for LifecyclePoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LifecyclePoint::SessionStart => "session_start",
            LifecyclePoint::PreIteration => "pre_iteration",
            LifecyclePoint::PostIteration => "post_iteration",
            LifecyclePoint::OnTaskComplete => "on_task_complete",
            LifecyclePoint::OnError => "on_error",
            LifecyclePoint::SessionEnd => "session_end",
        };
        f.write_str(s)
    }
}

/// All configured hook groups, one ordered list per lifecycle point.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HookSet {
    #[serde(default)]
    pub session_start: Vec<HookConfig>,
    #[serde(default)]
    pub pre_iteration: Vec<HookConfig>,
    #[serde(default)]
    pub post_iteration: Vec<HookConfig>,
    #[serde(default)]
    pub on_task_complete: Vec<HookConfig>,
    #[serde(default)]
    pub on_error: Vec<HookConfig>,
    #[serde(default)]
    pub session_end: Vec<HookConfig>,
}

impl HookSet {
    pub fn group(&self, point: LifecyclePoint) -> &[HookConfig] {
        match point {
            LifecyclePoint::SessionStart => &self.session_start,
            LifecyclePoint::PreIteration => &self.pre_iteration,
            LifecyclePoint::PostIteration => &self.post_iteration,
            LifecyclePoint::OnTaskComplete => &self.on_task_complete,
            LifecyclePoint::OnError => &self.on_error,
            LifecyclePoint::SessionEnd => &self.session_end,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.session_start.is_empty()
            && self.pre_iteration.is_empty()
            && self.post_iteration.is_empty()
            && self.on_task_complete.is_empty()
            && self.on_error.is_empty()
            && self.session_end.is_empty()
    }
}

#[derive(Debug, Deserialize)]
struct HooksFile {
    #[allow(dead_code)]
    #[serde(default)]
    version: u32,
    #[serde(default)]
    hooks: HookSet,
}

/// Load `.iteratr.hooks.yml` from the working directory.  A missing file is
/// not an error; it means no hooks are configured.
pub fn load_hooks(workdir: &Path) -> anyhow::Result<HookSet> {
    let path = workdir.join(HOOKS_FILE_NAME);
    if !path.is_file() {
        debug!(path = %path.display(), "no hooks file");
        return Ok(HookSet::default());
    }
    let text = std::fs::read_to_string(&path)
        .with_context(|| format!("reading {}", path.display()))?;
    let parsed: HooksFile =
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    Ok(parsed.hooks)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_empty_set() {
        let dir = tempfile::tempdir().unwrap();
        let hooks = load_hooks(dir.path()).unwrap();
        assert!(hooks.is_empty());
    }

    #[test]
    fn parses_groups_and_defaults() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(HOOKS_FILE_NAME),
            r#"
version: 1
hooks:
  post_iteration:
    - command: "cargo test"
      pipe_output: true
      timeout: 120
  session_end:
    - command: "notify-send done"
"#,
        )
        .unwrap();
        let hooks = load_hooks(dir.path()).unwrap();
        assert_eq!(hooks.post_iteration.len(), 1);
        assert_eq!(hooks.post_iteration[0].timeout, 120);
        assert!(hooks.post_iteration[0].pipe_output);
        // defaults fill in for omitted fields
        assert_eq!(hooks.session_end[0].timeout, 30);
        assert!(!hooks.session_end[0].pipe_output);
        assert!(hooks.pre_iteration.is_empty());
    }

    #[test]
    fn malformed_yaml_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(HOOKS_FILE_NAME), "hooks: [not, a, map]").unwrap();
        assert!(load_hooks(dir.path()).is_err());
    }

    #[test]
    fn group_lookup_matches_point() {
        let mut hooks = HookSet::default();
        hooks.on_error.push(HookConfig {
            command: "echo {{error}}".into(),
            timeout: 5,
            pipe_output: true,
        });
        assert_eq!(hooks.group(LifecyclePoint::OnError).len(), 1);
        assert!(hooks.group(LifecyclePoint::PreIteration).is_empty());
    }

    #[test]
    fn lifecycle_point_names_are_snake_case() {
        assert_eq!(LifecyclePoint::OnTaskComplete.to_string(), "on_task_complete");
        assert_eq!(LifecyclePoint::SessionStart.to_string(), "session_start");
    }
}
