// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use tracing::debug;

use iteratr_events::{parse_subject, EventRecord};

use crate::event::{
    ControlEvent, EventBody, InboxEvent, IterationEvent, NoteEvent, TaskEvent, TaskStatus,
};

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct Task {
    pub id: String,
    pub content: String,
    pub status: TaskStatus,
    /// 0 = critical … 4 = lowest.
    pub priority: u8,
    pub depends_on: BTreeSet<String>,
    /// Iteration in which the task was last touched.
    pub iteration: u32,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct Note {
    pub id: String,
    #[serde(rename = "type")]
    pub note_type: crate::event::NoteType,
    pub content: String,
    pub iteration: u32,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct Message {
    pub id: String,
    pub content: String,
    pub read: bool,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct Iteration {
    pub number: u32,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub summary: Option<String>,
    pub tasks_worked: BTreeSet<String>,
}

/// In-memory fold over one session's event history.
///
/// Replay is deterministic: folding the same records twice yields
/// structurally equal states.  Duplicate iteration-lifecycle events are
/// no-ops; task events are last-write-wins per field.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct State {
    pub tasks: BTreeMap<String, Task>,
    pub notes: Vec<Note>,
    pub inbox: Vec<Message>,
    pub iterations: Vec<Iteration>,
    pub complete: bool,
    pub model: String,
}

impl State {
    /// Fold a full history in sequence order.
    pub fn replay<'a>(records: impl IntoIterator<Item = &'a EventRecord>) -> Self {
        let mut state = State::default();
        for record in records {
            state.apply(record);
        }
        state
    }

    /// Apply one record.  Records that do not decode are skipped (logged at
    /// debug), keeping replay total.
    pub fn apply(&mut self, record: &EventRecord) {
        let Some((_, kind)) = parse_subject(&record.subject) else {
            debug!(subject = %record.subject, "skipping record with foreign subject");
            return;
        };
        let Some(body) = EventBody::decode(kind, &record.body) else {
            debug!(subject = %record.subject, seq = record.seq, "skipping undecodable event body");
            return;
        };
        match body {
            EventBody::Task(ev) => self.apply_task(ev),
            EventBody::Note(ev) => self.apply_note(ev),
            EventBody::Inbox(ev) => self.apply_inbox(ev),
            EventBody::Iteration(ev) => self.apply_iteration(ev, record.published_at),
            EventBody::Control(ev) => self.apply_control(ev),
        }
    }

    fn apply_task(&mut self, ev: TaskEvent) {
        match ev {
            TaskEvent::Add {
                task_id,
                content,
                priority,
                depends_on,
            } => {
                let entry = self.tasks.entry(task_id.clone()).or_insert(Task {
                    id: task_id,
                    content: String::new(),
                    status: TaskStatus::Remaining,
                    priority: 0,
                    depends_on: BTreeSet::new(),
                    iteration: 0,
                });
                entry.content = content;
                entry.priority = priority;
                entry.depends_on = depends_on;
            }
            TaskEvent::Status {
                task_id,
                status,
                iteration,
            } => {
                if let Some(task) = self.tasks.get_mut(&task_id) {
                    task.status = status;
                    task.iteration = iteration;
                }
            }
            TaskEvent::Priority { task_id, priority } => {
                if let Some(task) = self.tasks.get_mut(&task_id) {
                    task.priority = priority;
                }
            }
            TaskEvent::Depends {
                task_id,
                depends_on,
            } => {
                if let Some(task) = self.tasks.get_mut(&task_id) {
                    task.depends_on = depends_on;
                }
            }
        }
    }

    fn apply_note(&mut self, ev: NoteEvent) {
        let NoteEvent::Add {
            note_id,
            note_type,
            content,
            iteration,
        } = ev;
        self.notes.push(Note {
            id: note_id,
            note_type,
            content,
            iteration,
        });
    }

    fn apply_inbox(&mut self, ev: InboxEvent) {
        match ev {
            InboxEvent::Add {
                message_id,
                content,
            } => self.inbox.push(Message {
                id: message_id,
                content,
                read: false,
            }),
            InboxEvent::MarkRead { message_id } => {
                if let Some(msg) = self.inbox.iter_mut().find(|m| m.id == message_id) {
                    msg.read = true;
                }
            }
        }
    }

    fn apply_iteration(&mut self, ev: IterationEvent, at: DateTime<Utc>) {
        match ev {
            IterationEvent::Start { number } => {
                // duplicate starts keep the first StartedAt
                if self.iteration(number).is_none() {
                    self.insert_iteration(Iteration {
                        number,
                        started_at: at,
                        ended_at: None,
                        summary: None,
                        tasks_worked: BTreeSet::new(),
                    });
                }
            }
            IterationEvent::Complete { number } => {
                let iteration = self.iteration_or_insert(number, at);
                if iteration.ended_at.is_none() {
                    iteration.ended_at = Some(at);
                }
            }
            IterationEvent::Summary {
                number,
                summary,
                tasks_worked,
            } => {
                let iteration = self.iteration_or_insert(number, at);
                iteration.summary = Some(summary);
                iteration.tasks_worked.extend(tasks_worked);
            }
        }
    }

    fn apply_control(&mut self, ev: ControlEvent) {
        match ev {
            ControlEvent::Complete => self.complete = true,
            ControlEvent::Restart => self.complete = false,
            ControlEvent::Reset => *self = State::default(),
            ControlEvent::SetModel { model } => self.model = model,
        }
    }

    // ── Derived queries ───────────────────────────────────────────────────────

    pub fn iteration(&self, number: u32) -> Option<&Iteration> {
        self.iterations.iter().find(|i| i.number == number)
    }

    fn iteration_or_insert(&mut self, number: u32, at: DateTime<Utc>) -> &mut Iteration {
        if self.iterations.iter().all(|i| i.number != number) {
            self.insert_iteration(Iteration {
                number,
                started_at: at,
                ended_at: None,
                summary: None,
                tasks_worked: BTreeSet::new(),
            });
        }
        self.iterations
            .iter_mut()
            .find(|i| i.number == number)
            .expect("iteration inserted above")
    }

    fn insert_iteration(&mut self, iteration: Iteration) {
        let idx = self
            .iterations
            .partition_point(|i| i.number < iteration.number);
        self.iterations.insert(idx, iteration);
    }

    /// Highest iteration number seen, if any.
    pub fn highest_iteration(&self) -> Option<u32> {
        self.iterations.last().map(|i| i.number)
    }

    /// A task is ready iff status is remaining and every dependency exists
    /// and is completed.
    pub fn is_ready(&self, task: &Task) -> bool {
        task.status == TaskStatus::Remaining
            && task.depends_on.iter().all(|dep| {
                self.tasks
                    .get(dep)
                    .is_some_and(|d| d.status == TaskStatus::Completed)
            })
    }

    /// A task is blocked iff explicitly marked blocked, or remaining with any
    /// non-completed (or missing) dependency.
    pub fn is_blocked(&self, task: &Task) -> bool {
        match task.status {
            TaskStatus::Blocked => true,
            TaskStatus::Remaining => !self.is_ready(task),
            _ => false,
        }
    }

    /// The next task hint: the ready task with the smallest priority number;
    /// ties broken by lexicographic ID.  None iff no ready task exists.
    pub fn next_task(&self) -> Option<&Task> {
        self.tasks
            .values()
            .filter(|t| self.is_ready(t))
            .min_by(|a, b| a.priority.cmp(&b.priority).then(a.id.cmp(&b.id)))
    }

    /// Unread inbox messages, oldest first.
    pub fn unread_messages(&self) -> Vec<&Message> {
        self.inbox.iter().filter(|m| !m.read).collect()
    }

    pub fn remaining_task_count(&self) -> usize {
        self.tasks
            .values()
            .filter(|t| t.status != TaskStatus::Completed)
            .count()
    }

    /// Whether any task is currently marked in-progress.
    pub fn any_task_in_progress(&self) -> bool {
        self.tasks
            .values()
            .any(|t| t.status == TaskStatus::InProgress)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
