// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing::debug;

use crate::Config;

/// Ordered list of config file locations searched from lowest to highest priority.
/// Later files override earlier ones.
fn config_search_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();

    // 1. XDG / home
    if let Some(home) = dirs::home_dir() {
        paths.push(home.join(".config/iteratr/config.yaml"));
        paths.push(home.join(".config/iteratr/config.yml"));
    }

    // 2. Workspace-local
    paths.push(PathBuf::from(".iteratr.yaml"));
    paths.push(PathBuf::from(".iteratr.yml"));

    paths
}

/// Load configuration by merging all discovered YAML files over the
/// environment-variable defaults (ITERATR_DATA_DIR, ITERATR_MODEL).
/// Precedence, lowest to highest: env defaults, discovered files, the
/// explicit `extra` path (e.g. `--config` CLI flag).  CLI flags beat all of
/// these and are applied by the caller.
pub fn load(extra: Option<&Path>) -> anyhow::Result<Config> {
    let mut merged = env_layer();

    for path in config_search_paths() {
        if path.is_file() {
            debug!(path = %path.display(), "loading config layer");
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            let layer: serde_yaml::Value = serde_yaml::from_str(&text)
                .with_context(|| format!("parsing {}", path.display()))?;
            merge_yaml(&mut merged, layer);
        }
    }

    if let Some(p) = extra {
        debug!(path = %p.display(), "loading explicit config");
        let text =
            std::fs::read_to_string(p).with_context(|| format!("reading {}", p.display()))?;
        let layer: serde_yaml::Value =
            serde_yaml::from_str(&text).with_context(|| format!("parsing {}", p.display()))?;
        merge_yaml(&mut merged, layer);
    }

    let config: Config = if matches!(merged, serde_yaml::Value::Mapping(ref m) if m.is_empty()) {
        Config::default()
    } else {
        serde_yaml::from_value(merged).context("invalid configuration")?
    };
    Ok(config)
}

/// Environment variables as the lowest-priority config layer.  A config file
/// that sets the same field wins the merge; fields absent everywhere fall
/// back to the serde defaults.
fn env_layer() -> serde_yaml::Value {
    let mut map = serde_yaml::Mapping::new();
    if let Ok(dir) = std::env::var("ITERATR_DATA_DIR") {
        if !dir.trim().is_empty() {
            map.insert("data_dir".into(), dir.into());
        }
    }
    if let Ok(model) = std::env::var("ITERATR_MODEL") {
        if !model.trim().is_empty() {
            map.insert("model".into(), model.into());
        }
    }
    serde_yaml::Value::Mapping(map)
}

/// Deep-merge `src` into `dst`; src wins on scalar conflicts.
fn merge_yaml(dst: &mut serde_yaml::Value, src: serde_yaml::Value) {
    match (dst, src) {
        (serde_yaml::Value::Mapping(d), serde_yaml::Value::Mapping(s)) => {
            for (k, v) in s {
                let entry = d
                    .entry(k)
                    .or_insert(serde_yaml::Value::Mapping(serde_yaml::Mapping::new()));
                merge_yaml(entry, v);
            }
        }
        (dst, src) => *dst = src,
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn val(s: &str) -> serde_yaml::Value {
        serde_yaml::from_str(s).unwrap()
    }

    #[test]
    fn merge_scalar_src_wins() {
        let mut dst = val("x: 1");
        let src = val("x: 2");
        merge_yaml(&mut dst, src);
        assert_eq!(dst["x"].as_i64(), Some(2));
    }

    #[test]
    fn merge_preserves_keys_not_in_src() {
        let mut dst = val("a: 1\nb: 2");
        let src = val("b: 99");
        merge_yaml(&mut dst, src);
        assert_eq!(dst["a"].as_i64(), Some(1));
        assert_eq!(dst["b"].as_i64(), Some(99));
    }

    #[test]
    fn merge_nested_tables() {
        let mut dst = val("agent:\n  command: opencode\n  args: [acp]");
        let src = val("agent:\n  command: claude");
        merge_yaml(&mut dst, src);
        assert_eq!(dst["agent"]["command"].as_str(), Some("claude"));
        assert_eq!(dst["agent"]["args"][0].as_str(), Some("acp"));
    }

    #[test]
    fn load_returns_error_when_explicit_path_missing() {
        let result = load(Some(Path::new("/tmp/iteratr_nonexistent_config_xyz.yaml")));
        assert!(result.is_err());
    }

    #[test]
    fn load_explicit_file_overrides_defaults() {
        use std::io::Write;
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "model: claude-sonnet\niterations: 7").unwrap();
        let cfg = load(Some(f.path())).unwrap();
        assert_eq!(cfg.model, "claude-sonnet");
        assert_eq!(cfg.iterations, 7);
        // untouched fields keep their serde defaults
        assert_eq!(cfg.spec_path, crate::DEFAULT_SPEC_PATH);
    }

    /// Single test owning ITERATR_DATA_DIR so parallel tests never race on it.
    #[test]
    fn data_dir_env_is_only_a_default() {
        use std::io::Write;
        std::env::set_var("ITERATR_DATA_DIR", "/from-env");

        // env fills the value when no config file sets it
        let mut unset = tempfile::NamedTempFile::new().unwrap();
        writeln!(unset, "iterations: 1").unwrap();
        let cfg = load(Some(unset.path())).unwrap();
        assert_eq!(cfg.data_dir, "/from-env");

        // a config file that sets data_dir beats the env default
        let mut set = tempfile::NamedTempFile::new().unwrap();
        writeln!(set, "data_dir: /from-config").unwrap();
        let cfg = load(Some(set.path())).unwrap();
        assert_eq!(cfg.data_dir, "/from-config");

        std::env::remove_var("ITERATR_DATA_DIR");
    }
}
