// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use serde::{Deserialize, Serialize};

/// The five event kinds a session's history is segmented into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Task,
    Note,
    Inbox,
    Iteration,
    Control,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Task => "task",
            EventKind::Note => "note",
            EventKind::Inbox => "inbox",
            EventKind::Iteration => "iteration",
            EventKind::Control => "control",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "task" => Some(EventKind::Task),
            "note" => Some(EventKind::Note),
            "inbox" => Some(EventKind::Inbox),
            "iteration" => Some(EventKind::Iteration),
            "control" => Some(EventKind::Control),
            _ => None,
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Build the subject `iteratr.<session>.<kind>`.
pub fn subject(session: &str, kind: EventKind) -> String {
    format!("iteratr.{session}.{kind}")
}

/// Prefix wildcard matching a session's entire history: `iteratr.<session>.>`.
pub fn session_prefix(session: &str) -> String {
    format!("iteratr.{session}.>")
}

/// Session names are constrained to `[A-Za-z0-9_-]{1..64}`.
pub fn validate_session_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 64
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Split `iteratr.<session>.<kind>` back into its session and kind parts.
pub fn parse_subject(subject: &str) -> Option<(String, EventKind)> {
    let rest = subject.strip_prefix("iteratr.")?;
    let (session, kind) = rest.rsplit_once('.')?;
    if !validate_session_name(session) {
        return None;
    }
    Some((session.to_string(), EventKind::from_str(kind)?))
}

/// True when `subject` is selected by `pattern`.
///
/// A pattern is either a literal subject or a prefix wildcard ending in `.>`
/// which selects every subject below that prefix (one or more further tokens).
pub fn prefix_matches(pattern: &str, subject: &str) -> bool {
    match pattern.strip_suffix(">") {
        Some(prefix) => subject.len() > prefix.len() && subject.starts_with(prefix),
        None => pattern == subject,
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
