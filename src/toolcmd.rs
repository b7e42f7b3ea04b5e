// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! `iteratr tool <sub>`: the command surface the agent itself uses (via
//! shell) to manage tasks, notes, and iteration summaries.  Connects to the
//! running session's event log through the port file and prints JSON on
//! stdout; exit 0 on success, non-zero with a stderr message on failure.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use iteratr_config::Config;
use iteratr_events::LogClient;
use iteratr_store::{NoteType, SessionStore, StoreError, TaskDraft, TaskStatus};

use crate::cli::ToolCommands;
use crate::output::{write_stderr, EXIT_RUNTIME_ERROR, EXIT_SUCCESS, EXIT_VALIDATION_ERROR};

pub async fn run_tool(command: ToolCommands, config: &Config) -> i32 {
    match execute(command, config).await {
        Ok(value) => {
            match serde_json::to_string_pretty(&value) {
                Ok(text) => println!("{text}"),
                Err(e) => {
                    write_stderr(&format!("[iteratr:error] serializing output: {e}"));
                    return EXIT_RUNTIME_ERROR;
                }
            }
            EXIT_SUCCESS
        }
        Err(ToolError::Validation(msg)) => {
            write_stderr(&format!("[iteratr:error] {msg}"));
            EXIT_VALIDATION_ERROR
        }
        Err(ToolError::Runtime(msg)) => {
            write_stderr(&format!("[iteratr:error] {msg}"));
            EXIT_RUNTIME_ERROR
        }
    }
}

enum ToolError {
    Validation(String),
    Runtime(String),
}

impl From<StoreError> for ToolError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::InvalidArgument(m) => ToolError::Validation(m),
            StoreError::Conflict(m) => ToolError::Validation(m),
            StoreError::Unavailable(m) => ToolError::Runtime(m),
        }
    }
}

async fn execute(command: ToolCommands, config: &Config) -> Result<serde_json::Value, ToolError> {
    match command {
        ToolCommands::TaskAdd {
            content,
            priority,
            depends,
            session,
        } => {
            let store = connect(config, &session).await?;
            let task = store
                .task_add(&content, priority, depends.into_iter().collect())
                .await?;
            Ok(serde_json::to_value(task).unwrap_or_default())
        }
        ToolCommands::TaskBatchAdd { json, session } => {
            let drafts: Vec<TaskDraft> = serde_json::from_str(&json)
                .map_err(|e| ToolError::Validation(format!("invalid --json: {e}")))?;
            let store = connect(config, &session).await?;
            let tasks = store.task_batch_add(drafts).await?;
            Ok(serde_json::to_value(tasks).unwrap_or_default())
        }
        ToolCommands::TaskStatus {
            id,
            status,
            iteration,
            session,
        } => {
            let status: TaskStatus = status
                .parse()
                .map_err(ToolError::Validation)?;
            let store = connect(config, &session).await?;
            store.task_status(&id, status, iteration).await?;
            Ok(json!({"ok": true, "task_id": id, "status": status}))
        }
        ToolCommands::TaskPriority {
            id,
            priority,
            session,
        } => {
            let store = connect(config, &session).await?;
            store.task_priority(&id, priority).await?;
            Ok(json!({"ok": true, "task_id": id, "priority": priority}))
        }
        ToolCommands::TaskDepends {
            id,
            depends,
            session,
        } => {
            let store = connect(config, &session).await?;
            let depends: BTreeSet<String> = depends.into_iter().collect();
            store.task_depends(&id, depends.clone()).await?;
            Ok(json!({"ok": true, "task_id": id, "depends_on": depends}))
        }
        ToolCommands::TaskList { session } => {
            let store = connect(config, &session).await?;
            let tasks = store.task_list().await?;
            Ok(serde_json::to_value(tasks).unwrap_or_default())
        }
        ToolCommands::TaskNext { session } => {
            let store = connect(config, &session).await?;
            let next = store.task_next().await?;
            Ok(next
                .map(|task| serde_json::to_value(task).unwrap_or_default())
                .unwrap_or(serde_json::Value::Null))
        }
        ToolCommands::NoteAdd {
            content,
            note_type,
            iteration,
            session,
        } => {
            let note_type: NoteType = note_type
                .parse()
                .map_err(ToolError::Validation)?;
            let store = connect(config, &session).await?;
            let note = store.note_add(&content, note_type, iteration).await?;
            Ok(serde_json::to_value(note).unwrap_or_default())
        }
        ToolCommands::NoteList { note_type, session } => {
            let filter = match note_type {
                Some(raw) => Some(raw.parse::<NoteType>().map_err(ToolError::Validation)?),
                None => None,
            };
            let store = connect(config, &session).await?;
            let notes = store.note_list(filter).await?;
            Ok(serde_json::to_value(notes).unwrap_or_default())
        }
        ToolCommands::IterationSummary {
            iteration,
            summary,
            tasks,
            session,
        } => {
            let store = connect(config, &session).await?;
            store
                .iteration_summary(iteration, &summary, tasks.into_iter().collect())
                .await?;
            Ok(json!({"ok": true, "iteration": iteration}))
        }
        ToolCommands::SessionComplete { session } => {
            let store = connect(config, &session).await?;
            store.session_complete().await?;
            Ok(json!({"ok": true, "complete": true}))
        }
    }
}

/// Find the running session's log server via the port file and open a store.
async fn connect(config: &Config, session: &str) -> Result<SessionStore, ToolError> {
    let port_file = config.port_file();
    let port: u16 = match std::env::var("ITERATR_PORT") {
        Ok(value) => value
            .parse()
            .map_err(|_| ToolError::Validation(format!("invalid ITERATR_PORT {value:?}")))?,
        Err(_) => std::fs::read_to_string(&port_file)
            .map_err(|_| {
                ToolError::Runtime(format!(
                    "no running session ({} missing)",
                    port_file.display()
                ))
            })?
            .trim()
            .parse()
            .map_err(|_| ToolError::Runtime("unparseable port file".to_string()))?,
    };

    let client = LogClient::connect_with_timeout(port, Duration::from_secs(2))
        .await
        .map_err(|e| ToolError::Runtime(format!("cannot reach event log on port {port}: {e}")))?;
    SessionStore::new(Arc::new(client), session).map_err(ToolError::from)
}
