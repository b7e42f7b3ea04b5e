// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "iteratr",
    about = "Drives an AI coding agent through an iterative, auditable build loop",
    version,
    long_about = None,
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Explicit config file (merged over ~/.config/iteratr and .iteratr.yml)
    #[arg(long, short = 'c', global = true)]
    pub config: Option<PathBuf>,

    /// Increase log verbosity (-v info, -vv debug); ITERATR_LOG_LEVEL wins
    #[arg(long, short = 'v', action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the iteration loop: plan from the spec, then iterate until all
    /// tasks are completed or a limit is hit.
    Build {
        /// Session name ([A-Za-z0-9_-], max 64 chars)
        #[arg(long, short = 's', default_value = "main")]
        session: String,
        /// Spec file driving the session (default from config: specs/SPEC.md)
        #[arg(long)]
        spec: Option<PathBuf>,
        /// Maximum iterations this run (0 = unlimited)
        #[arg(long, short = 'n')]
        iterations: Option<u32>,
        /// Model identifier forwarded to the agent
        #[arg(long, short = 'm')]
        model: Option<String>,
        /// Ask the agent to commit its edits after each iteration
        #[arg(long)]
        auto_commit: bool,
        /// Purge the session's event history before starting
        #[arg(long)]
        reset: bool,
        /// Validate spec, config, hooks and templates, then exit
        #[arg(long)]
        dry_run: bool,
        /// Template variables substituted as {{key}} in the prompt
        #[arg(long = "var", value_name = "KEY=VALUE")]
        vars: Vec<String>,
        /// Extra instructions injected into every iteration prompt
        #[arg(value_name = "PROMPT")]
        extra: Option<String>,
    },

    /// Scaffold the default spec file (refuses to overwrite).
    Spec,

    /// Check the environment: agent binary, data directory, port file,
    /// hooks file, template override. Non-zero exit on any failure.
    Doctor,

    /// Write the default iteration template to .iteratr.template
    /// (refuses to overwrite).
    GenTemplate,

    /// Print the merged configuration as YAML.
    Config,

    /// Talk to the running session's event log.  Used by the agent itself
    /// (via shell) to manage tasks, notes, and iteration summaries.
    /// Prints JSON on stdout; exit 0 on success.
    Tool {
        #[command(subcommand)]
        command: ToolCommands,
    },
}

/// `--session` defaults from ITERATR_SESSION, which the orchestrator exports
/// to the agent subprocess.
#[derive(Subcommand, Debug)]
pub enum ToolCommands {
    /// Add one task; prints the created task.
    TaskAdd {
        #[arg(long)]
        content: String,
        /// 0 = critical … 4 = lowest
        #[arg(long, default_value_t = 2)]
        priority: u8,
        /// Task IDs this task depends on (repeatable)
        #[arg(long = "depends")]
        depends: Vec<String>,
        #[arg(long, env = "ITERATR_SESSION", default_value = "main")]
        session: String,
    },
    /// Add several tasks at once from a JSON array of
    /// {"content", "priority", "depends_on"} objects.
    TaskBatchAdd {
        #[arg(long)]
        json: String,
        #[arg(long, env = "ITERATR_SESSION", default_value = "main")]
        session: String,
    },
    /// Set a task's status (remaining | in_progress | completed | blocked).
    TaskStatus {
        #[arg(long)]
        id: String,
        #[arg(long)]
        status: String,
        #[arg(long, default_value_t = 0)]
        iteration: u32,
        #[arg(long, env = "ITERATR_SESSION", default_value = "main")]
        session: String,
    },
    /// Set a task's priority (0 = critical … 4 = lowest).
    TaskPriority {
        #[arg(long)]
        id: String,
        #[arg(long)]
        priority: u8,
        #[arg(long, env = "ITERATR_SESSION", default_value = "main")]
        session: String,
    },
    /// Replace a task's dependency set.
    TaskDepends {
        #[arg(long)]
        id: String,
        #[arg(long = "depends")]
        depends: Vec<String>,
        #[arg(long, env = "ITERATR_SESSION", default_value = "main")]
        session: String,
    },
    /// List all tasks ordered by (priority, id).
    TaskList {
        #[arg(long, env = "ITERATR_SESSION", default_value = "main")]
        session: String,
    },
    /// Print the highest-priority ready task, or null.
    TaskNext {
        #[arg(long, env = "ITERATR_SESSION", default_value = "main")]
        session: String,
    },
    /// Record a note (learning | stuck | tip | decision).
    NoteAdd {
        #[arg(long)]
        content: String,
        #[arg(long = "type")]
        note_type: String,
        #[arg(long, default_value_t = 0)]
        iteration: u32,
        #[arg(long, env = "ITERATR_SESSION", default_value = "main")]
        session: String,
    },
    /// List notes, optionally filtered by type.
    NoteList {
        #[arg(long = "type")]
        note_type: Option<String>,
        #[arg(long, env = "ITERATR_SESSION", default_value = "main")]
        session: String,
    },
    /// Record the summary for an iteration.
    IterationSummary {
        #[arg(long)]
        iteration: u32,
        #[arg(long)]
        summary: String,
        /// Task IDs worked during the iteration (repeatable)
        #[arg(long = "task")]
        tasks: Vec<String>,
        #[arg(long, env = "ITERATR_SESSION", default_value = "main")]
        session: String,
    },
    /// Latch the session complete; the orchestrator stops iterating.
    SessionComplete {
        #[arg(long, env = "ITERATR_SESSION", default_value = "main")]
        session: String,
    },
}
