// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Compiled-in prompt templates.  The iteration template can be overridden
//! by a `.iteratr.template` file at the working directory; the planning
//! template is fixed.

use iteratr_watch::FileChange;

/// Template for the planning pass (iteration #0).  Only loads tasks from the
/// spec into the store; the restricted tool list keeps the agent from
/// starting implementation work early.
pub const PLANNING_TEMPLATE: &str = "\
You are planning work for session {{session}}. This is iteration #0: a planning pass only.

Read the specification below and break it into a complete, ordered task list.

Rules:
- Use ONLY these commands in this pass: `{{binary}} tool task-add`, `{{binary}} tool task-list`, `{{binary}} tool iteration-summary`.
- Add one task per independently verifiable piece of work: `{{binary}} tool task-add --content \"...\" --priority N` (0 = critical, 4 = lowest).
- Wire ordering constraints with `--depends <task-id>` using IDs printed by earlier task-add calls.
- Do NOT edit any files in this pass.
- When the list is complete, record it: `{{binary}} tool iteration-summary --iteration 0 --summary \"<one paragraph describing the plan>\"`.

The task store listens on port {{port}}.

## Specification

{{spec}}
";

/// Default template for a normal iteration.  Overridable via
/// `.iteratr.template`.
pub const DEFAULT_ITERATION_TEMPLATE: &str = "\
You are working on session {{session}}, iteration {{iteration}}.

Pick exactly ONE task and complete it:
1. Run `{{binary}} tool task-next` to see the best candidate (or `{{binary}} tool task-list` to choose yourself).
2. Mark it: `{{binary}} tool task-status --id <task-id> --status in_progress --iteration {{iteration}}`.
3. Implement it. Edit files, run the tests, fix what breaks.
4. When it genuinely works, mark it: `{{binary}} tool task-status --id <task-id> --status completed --iteration {{iteration}}`.
5. Record anything future iterations should know: `{{binary}} tool note-add --type learning|stuck|tip|decision --content \"...\" --iteration {{iteration}}`.
6. Summarize: `{{binary}} tool iteration-summary --iteration {{iteration}} --summary \"...\" --task <task-id>`.
7. If EVERY task is completed, finish the session: `{{binary}} tool session-complete`.

If you are blocked, mark the task blocked and write a `stuck` note instead of guessing.

The task store listens on port {{port}}.

## Tasks

{{tasks}}

## Notes

{{notes}}

## Recent iterations

{{history}}

## Hooks configured

{{hooks}}

{{extra}}

## Specification

{{spec}}
";

/// Framing for hook output delivered at the start of a turn.
pub fn frame_hook_output(output: &str) -> String {
    format!(
        "Output from lifecycle hooks (read before continuing):\n\n```\n{}\n```",
        output.trim_end()
    )
}

/// Framing for piped post-iteration hook output sent as its own turn.
pub fn verification_prompt(output: &str) -> String {
    format!(
        "The post-iteration verification hooks produced the output below. \
         Review it; if it shows failures caused by your changes, fix them now \
         before anything else.\n\n```\n{}\n```",
        output.trim_end()
    )
}

/// Recovery prompt after a failed turn.  `can_continue` is true when the
/// failure hit mid-task (no summary yet, or a task still in progress).
pub fn recovery_prompt(error: &str, can_continue: bool) -> String {
    if can_continue {
        format!(
            "The previous turn failed with: {error}\n\n\
             You were in the middle of a task. Recover your bearings \
             (`task-list`, look at the working tree) and continue completing \
             your current task."
        )
    } else {
        format!(
            "The previous turn failed with: {error}\n\n\
             Fix anything the failure left half-done (reverted edits, broken \
             build), then stop and summarize the iteration. Do not start new \
             work."
        )
    }
}

/// Prompt asking the agent to commit the iteration's edits itself.
pub fn commit_prompt(iteration: u32, changes: &[FileChange]) -> String {
    let mut listing = String::new();
    for change in changes {
        let flag = if change.is_new { " (new)" } else { "" };
        listing.push_str(&format!(
            "- {}{} (+{} -{})\n",
            change.rel_path, flag, change.additions, change.deletions
        ));
    }
    format!(
        "Iteration {iteration} changed the files below. Commit them now with a \
         concise message describing what the iteration accomplished. Stage only \
         these files; do not push.\n\n{listing}"
    )
}

/// Framing for queued user messages delivered after a turn.
pub const USER_MESSAGE_FRAME: &str =
    "Message from the user (read and honour before continuing):";

// ─── Unit tests ──────────────────────────────────────────────────────────────
