// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Renders the per-iteration prompt: template variables are filled from the
//! current folded state, the spec document, and the run environment.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use iteratr_hooks::{expand_vars, HookSet};
use iteratr_store::{NoteType, State};

/// Everything the templater needs for one prompt.
pub struct PromptInputs<'a> {
    pub session: &'a str,
    pub iteration: u32,
    pub spec: &'a str,
    pub state: &'a State,
    pub extra: &'a str,
    pub port: u16,
    pub binary: &'a str,
    pub hooks: &'a HookSet,
}

/// Render `template` with the full variable set.  The spec is included
/// verbatim (unescaped).
pub fn render_prompt(template: &str, inputs: &PromptInputs<'_>) -> String {
    let now = Utc::now();
    let vars: HashMap<String, String> = [
        ("session".to_string(), inputs.session.to_string()),
        ("iteration".to_string(), inputs.iteration.to_string()),
        ("spec".to_string(), inputs.spec.to_string()),
        ("tasks".to_string(), render_tasks(inputs.state)),
        ("notes".to_string(), render_notes(inputs.state)),
        ("history".to_string(), render_history(inputs.state, now)),
        ("extra".to_string(), inputs.extra.to_string()),
        ("port".to_string(), inputs.port.to_string()),
        ("binary".to_string(), inputs.binary.to_string()),
        ("hooks".to_string(), render_hooks(inputs.hooks)),
    ]
    .into();
    expand_vars(template, &vars)
}

/// One line per task; a fixed placeholder when there are none yet.
pub fn render_tasks(state: &State) -> String {
    if state.tasks.is_empty() {
        return "(no tasks yet)".to_string();
    }
    let mut tasks: Vec<_> = state.tasks.values().collect();
    tasks.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.id.cmp(&b.id)));

    let mut out = String::new();
    for task in tasks {
        let deps = if task.depends_on.is_empty() {
            String::new()
        } else {
            format!(
                " (depends: {})",
                task.depends_on.iter().cloned().collect::<Vec<_>>().join(", ")
            )
        };
        out.push_str(&format!(
            "- [{}] p{} {} — {}{}\n",
            task.status, task.priority, task.id, task.content, deps
        ));
    }
    out.trim_end().to_string()
}

/// Notes grouped by type in fixed order; only non-empty groups appear.
pub fn render_notes(state: &State) -> String {
    if state.notes.is_empty() {
        return "(none)".to_string();
    }
    let mut out = String::new();
    for note_type in NoteType::ORDERED {
        let group: Vec<_> = state
            .notes
            .iter()
            .filter(|n| n.note_type == note_type)
            .collect();
        if group.is_empty() {
            continue;
        }
        out.push_str(&format!("### {note_type}\n"));
        for note in group {
            out.push_str(&format!("- (iter {}) {}\n", note.iteration, note.content));
        }
        out.push('\n');
    }
    out.trim_end().to_string()
}

/// The last 5 iterations that have a summary, chronological, each annotated
/// with a "time ago" string.
pub fn render_history(state: &State, now: DateTime<Utc>) -> String {
    let summarized: Vec<_> = state
        .iterations
        .iter()
        .filter(|i| i.summary.is_some())
        .collect();
    if summarized.is_empty() {
        return "(none)".to_string();
    }
    let start = summarized.len().saturating_sub(5);
    let mut out = String::new();
    for iteration in &summarized[start..] {
        let when = iteration.ended_at.unwrap_or(iteration.started_at);
        out.push_str(&format!(
            "- #{} ({}): {}\n",
            iteration.number,
            time_ago(now, when),
            iteration.summary.as_deref().unwrap_or_default()
        ));
    }
    out.trim_end().to_string()
}

/// What will run around the agent's turns, so it can anticipate verification.
pub fn render_hooks(hooks: &HookSet) -> String {
    if hooks.is_empty() {
        return "(none)".to_string();
    }
    let mut out = String::new();
    for (name, group) in [
        ("session_start", &hooks.session_start),
        ("pre_iteration", &hooks.pre_iteration),
        ("post_iteration", &hooks.post_iteration),
        ("on_task_complete", &hooks.on_task_complete),
        ("on_error", &hooks.on_error),
        ("session_end", &hooks.session_end),
    ] {
        for hook in group {
            let piped = if hook.pipe_output { " (output piped to you)" } else { "" };
            out.push_str(&format!("- {name}: `{}`{piped}\n", hook.command));
        }
    }
    out.trim_end().to_string()
}

/// Largest applicable unit of {just now, Nmin ago, Nhr ago, N days ago}.
pub fn time_ago(now: DateTime<Utc>, then: DateTime<Utc>) -> String {
    let secs = (now - then).num_seconds().max(0);
    if secs < 60 {
        "just now".to_string()
    } else if secs < 3600 {
        format!("{}min ago", secs / 60)
    } else if secs < 86_400 {
        format!("{}hr ago", secs / 3600)
    } else {
        format!("{} days ago", secs / 86_400)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
