// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use iteratr_events::EventKind;

// ── Domain enums ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Remaining,
    InProgress,
    Completed,
    Blocked,
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Remaining => "remaining",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Blocked => "blocked",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "remaining" => Ok(TaskStatus::Remaining),
            "in_progress" => Ok(TaskStatus::InProgress),
            "completed" => Ok(TaskStatus::Completed),
            "blocked" => Ok(TaskStatus::Blocked),
            other => Err(format!("unknown task status {other:?}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoteType {
    Learning,
    Stuck,
    Tip,
    Decision,
}

impl NoteType {
    /// Fixed display order used when grouping notes in prompts.
    pub const ORDERED: [NoteType; 4] = [
        NoteType::Learning,
        NoteType::Stuck,
        NoteType::Tip,
        NoteType::Decision,
    ];
}

impl std::fmt::Display for NoteType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            NoteType::Learning => "learning",
            NoteType::Stuck => "stuck",
            NoteType::Tip => "tip",
            NoteType::Decision => "decision",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for NoteType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "learning" => Ok(NoteType::Learning),
            "stuck" => Ok(NoteType::Stuck),
            "tip" => Ok(NoteType::Tip),
            "decision" => Ok(NoteType::Decision),
            other => Err(format!("unknown note type {other:?}")),
        }
    }
}

// ── Event bodies, one tagged enum per subject kind ────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", content = "meta", rename_all = "snake_case")]
pub enum TaskEvent {
    Add {
        task_id: String,
        content: String,
        priority: u8,
        #[serde(default)]
        depends_on: BTreeSet<String>,
    },
    Status {
        task_id: String,
        status: TaskStatus,
        iteration: u32,
    },
    Priority {
        task_id: String,
        priority: u8,
    },
    Depends {
        task_id: String,
        depends_on: BTreeSet<String>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", content = "meta", rename_all = "snake_case")]
pub enum NoteEvent {
    Add {
        note_id: String,
        #[serde(rename = "type")]
        note_type: NoteType,
        content: String,
        iteration: u32,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", content = "meta", rename_all = "snake_case")]
pub enum InboxEvent {
    Add { message_id: String, content: String },
    MarkRead { message_id: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", content = "meta", rename_all = "snake_case")]
pub enum IterationEvent {
    Start {
        number: u32,
    },
    Complete {
        number: u32,
    },
    Summary {
        number: u32,
        summary: String,
        #[serde(default)]
        tasks_worked: BTreeSet<String>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", content = "meta", rename_all = "snake_case")]
pub enum ControlEvent {
    Complete,
    Restart,
    Reset,
    SetModel { model: String },
}

/// A decoded event body together with its subject kind.
#[derive(Debug, Clone)]
pub enum EventBody {
    Task(TaskEvent),
    Note(NoteEvent),
    Inbox(InboxEvent),
    Iteration(IterationEvent),
    Control(ControlEvent),
}

impl EventBody {
    pub fn kind(&self) -> EventKind {
        match self {
            EventBody::Task(_) => EventKind::Task,
            EventBody::Note(_) => EventKind::Note,
            EventBody::Inbox(_) => EventKind::Inbox,
            EventBody::Iteration(_) => EventKind::Iteration,
            EventBody::Control(_) => EventKind::Control,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            EventBody::Task(e) => serde_json::to_value(e),
            EventBody::Note(e) => serde_json::to_value(e),
            EventBody::Inbox(e) => serde_json::to_value(e),
            EventBody::Iteration(e) => serde_json::to_value(e),
            EventBody::Control(e) => serde_json::to_value(e),
        }
        .unwrap_or(serde_json::Value::Null)
    }

    /// Decode a raw record body according to its subject kind.  Returns None
    /// for bodies that do not validate; the fold skips those.
    pub fn decode(kind: EventKind, body: &serde_json::Value) -> Option<Self> {
        let body = body.clone();
        match kind {
            EventKind::Task => serde_json::from_value(body).ok().map(EventBody::Task),
            EventKind::Note => serde_json::from_value(body).ok().map(EventBody::Note),
            EventKind::Inbox => serde_json::from_value(body).ok().map(EventBody::Inbox),
            EventKind::Iteration => serde_json::from_value(body).ok().map(EventBody::Iteration),
            EventKind::Control => serde_json::from_value(body).ok().map(EventBody::Control),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_add_wire_shape() {
        let ev = TaskEvent::Add {
            task_id: "t1".into(),
            content: "Write README".into(),
            priority: 2,
            depends_on: BTreeSet::new(),
        };
        let v = serde_json::to_value(&ev).unwrap();
        assert_eq!(v["action"], "add");
        assert_eq!(v["meta"]["task_id"], "t1");
        assert_eq!(v["meta"]["priority"], 2);
    }

    #[test]
    fn task_status_round_trips() {
        let ev = TaskEvent::Status {
            task_id: "t1".into(),
            status: TaskStatus::InProgress,
            iteration: 3,
        };
        let v = serde_json::to_value(&ev).unwrap();
        assert_eq!(v["meta"]["status"], "in_progress");
        let back: TaskEvent = serde_json::from_value(v).unwrap();
        assert!(matches!(back, TaskEvent::Status { iteration: 3, .. }));
    }

    #[test]
    fn decode_dispatches_on_kind() {
        let body = serde_json::json!({
            "action": "add",
            "meta": {"note_id": "n1", "type": "tip", "content": "x", "iteration": 1}
        });
        let decoded = EventBody::decode(EventKind::Note, &body).unwrap();
        assert!(matches!(decoded, EventBody::Note(NoteEvent::Add { .. })));
        // the same body is not a valid control event
        assert!(EventBody::decode(EventKind::Control, &body).is_none());
    }

    #[test]
    fn control_set_model_round_trips() {
        let ev = ControlEvent::SetModel {
            model: "claude-sonnet".into(),
        };
        let v = serde_json::to_value(&ev).unwrap();
        assert_eq!(v["action"], "set_model");
        let back = EventBody::decode(EventKind::Control, &v).unwrap();
        assert!(matches!(
            back,
            EventBody::Control(ControlEvent::SetModel { .. })
        ));
    }

    #[test]
    fn status_parses_from_str() {
        assert_eq!(
            "in_progress".parse::<TaskStatus>().unwrap(),
            TaskStatus::InProgress
        );
        assert!("bogus".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn note_type_ordering_is_fixed() {
        let names: Vec<String> = NoteType::ORDERED.iter().map(|t| t.to_string()).collect();
        assert_eq!(names, ["learning", "stuck", "tip", "decision"]);
    }
}
