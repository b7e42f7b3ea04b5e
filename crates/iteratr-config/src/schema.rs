// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Default data directory, relative to the working directory.
pub const DEFAULT_DATA_DIR: &str = ".iteratr";

/// Default spec file path, relative to the working directory.
pub const DEFAULT_SPEC_PATH: &str = "specs/SPEC.md";

fn default_data_dir() -> String {
    DEFAULT_DATA_DIR.to_string()
}

fn default_spec_path() -> String {
    DEFAULT_SPEC_PATH.to_string()
}

fn default_agent_command() -> String {
    "opencode".to_string()
}

fn default_agent_args() -> Vec<String> {
    vec!["acp".to_string()]
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub agent: AgentCommandConfig,

    /// Model identifier forwarded to the agent via `session/set_model`.
    /// Empty string means "use the agent's own default".
    ///
    /// Resolution order: `--model` flag > this field > `ITERATR_MODEL`.
    #[serde(default)]
    pub model: String,

    /// Maximum number of iterations per `build` invocation. 0 = unlimited.
    #[serde(default)]
    pub iterations: u32,

    /// Ask the agent to commit its own edits at the end of each iteration
    /// (only when the working directory is a git repository and the tracker
    /// saw changes).
    #[serde(default)]
    pub auto_commit: bool,

    /// Data directory holding the event log and the server port file.
    /// Overridable with ITERATR_DATA_DIR.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,

    /// Path to the specification document driving the session.
    #[serde(default = "default_spec_path")]
    pub spec_path: String,
}

/// How to spawn the external coding agent.
///
/// The agent must speak line-delimited JSON-RPC on stdio (`initialize`,
/// `session/new`, `session/prompt`); anything else it prints on stderr is
/// forwarded to the log at debug level.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentCommandConfig {
    /// Executable name or path.
    #[serde(default = "default_agent_command")]
    pub command: String,
    /// Arguments passed to the executable.
    #[serde(default = "default_agent_args")]
    pub args: Vec<String>,
}

impl Default for AgentCommandConfig {
    fn default() -> Self {
        Self {
            command: default_agent_command(),
            args: default_agent_args(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            agent: AgentCommandConfig::default(),
            model: String::new(),
            iterations: 0,
            auto_commit: false,
            data_dir: default_data_dir(),
            spec_path: default_spec_path(),
        }
    }
}

impl Config {
    /// Resolved data directory as a path, honouring the ITERATR_DATA_DIR
    /// override applied by the loader.
    pub fn data_dir_path(&self) -> PathBuf {
        PathBuf::from(&self.data_dir)
    }

    /// Where the embedded log server stores events.
    pub fn storage_dir(&self) -> PathBuf {
        self.data_dir_path().join("data")
    }

    /// The port file the primary writes while the log server is running.
    pub fn port_file(&self) -> PathBuf {
        self.storage_dir().join("server.port")
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_empty_yaml() {
        let parsed: Config = serde_yaml::from_str("{}").unwrap();
        assert_eq!(parsed, Config::default());
        assert_eq!(parsed.data_dir, DEFAULT_DATA_DIR);
        assert_eq!(parsed.spec_path, DEFAULT_SPEC_PATH);
    }

    #[test]
    fn port_file_lives_under_storage_dir() {
        let cfg: Config = serde_yaml::from_str("data_dir: /tmp/x").unwrap();
        assert_eq!(cfg.port_file(), PathBuf::from("/tmp/x/data/server.port"));
    }

    #[test]
    fn agent_defaults_are_populated() {
        let cfg: Config = serde_yaml::from_str("{}").unwrap();
        assert_eq!(cfg.agent.command, "opencode");
        assert_eq!(cfg.agent.args, vec!["acp"]);
    }

    #[test]
    fn partial_agent_section_keeps_field_defaults() {
        let cfg: Config = serde_yaml::from_str("agent:\n  command: myagent").unwrap();
        assert_eq!(cfg.agent.command, "myagent");
        // args falls back to its own serde default
        assert_eq!(cfg.agent.args, vec!["acp"]);
    }

    #[test]
    fn iterations_and_auto_commit_parse() {
        let cfg: Config = serde_yaml::from_str("iterations: 12\nauto_commit: true").unwrap();
        assert_eq!(cfg.iterations, 12);
        assert!(cfg.auto_commit);
    }
}
