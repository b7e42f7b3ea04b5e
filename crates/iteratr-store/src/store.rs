// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::BTreeSet;
use std::sync::Arc;

use uuid::Uuid;

use iteratr_events::{session_prefix, subject, validate_session_name, EventKind, LogClient, LogError};

use crate::event::{
    ControlEvent, EventBody, InboxEvent, IterationEvent, NoteEvent, NoteType, TaskEvent,
    TaskStatus,
};
use crate::state::{Message, Note, State, Task};

/// Highest (least urgent) task priority.  0 is critical.
pub const MAX_PRIORITY: u8 = 4;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Transport trouble talking to the log; retryable at the iteration level.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// The caller passed something that can never succeed.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// The operation referenced an ID that does not exist.
    #[error("conflict: {0}")]
    Conflict(String),
}

impl From<LogError> for StoreError {
    fn from(err: LogError) -> Self {
        match err {
            LogError::Unavailable(m) => StoreError::Unavailable(m),
            // a permanent refusal by the log means the write was malformed
            LogError::Rejected(m) => StoreError::InvalidArgument(m),
        }
    }
}

/// Input to `task_batch_add`.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct TaskDraft {
    pub content: String,
    #[serde(default)]
    pub priority: u8,
    #[serde(default)]
    pub depends_on: BTreeSet<String>,
}

/// The single producer of events in the core.  Every mutation publishes
/// exactly one event; callers re-fold by calling `load_state` afterwards
/// rather than holding state snapshots across awaits.
#[derive(Debug)]
pub struct SessionStore {
    client: Arc<LogClient>,
    session: String,
}

impl SessionStore {
    pub fn new(client: Arc<LogClient>, session: &str) -> Result<Self, StoreError> {
        if !validate_session_name(session) {
            return Err(StoreError::InvalidArgument(format!(
                "invalid session name {session:?} (allowed: [A-Za-z0-9_-], 1-64 chars)"
            )));
        }
        Ok(Self {
            client,
            session: session.to_string(),
        })
    }

    pub fn session(&self) -> &str {
        &self.session
    }

    /// Full replay of the session's history into a fresh `State`.
    pub async fn load_state(&self) -> Result<State, StoreError> {
        let records = self.client.scan(&session_prefix(&self.session)).await?;
        Ok(State::replay(&records))
    }

    async fn publish(&self, body: EventBody) -> Result<(), StoreError> {
        let subject = subject(&self.session, body.kind());
        self.client.publish(&subject, body.to_json()).await?;
        Ok(())
    }

    // ── Task ops ──────────────────────────────────────────────────────────────

    pub async fn task_add(
        &self,
        content: &str,
        priority: u8,
        depends_on: BTreeSet<String>,
    ) -> Result<Task, StoreError> {
        validate_task_input(content, priority)?;
        let state = self.load_state().await?;
        for dep in &depends_on {
            if !state.tasks.contains_key(dep) {
                return Err(StoreError::Conflict(format!("unknown dependency {dep:?}")));
            }
        }

        let task = Task {
            id: Uuid::new_v4().to_string(),
            content: content.to_string(),
            status: TaskStatus::Remaining,
            priority,
            depends_on,
            iteration: 0,
        };
        self.publish(EventBody::Task(TaskEvent::Add {
            task_id: task.id.clone(),
            content: task.content.clone(),
            priority: task.priority,
            depends_on: task.depends_on.clone(),
        }))
        .await?;
        Ok(task)
    }

    /// Add several tasks in one call.  Dependencies must reference tasks that
    /// already exist; use `task_depends` for links between batch members.
    pub async fn task_batch_add(&self, drafts: Vec<TaskDraft>) -> Result<Vec<Task>, StoreError> {
        if drafts.is_empty() {
            return Err(StoreError::InvalidArgument("empty task batch".into()));
        }
        let state = self.load_state().await?;
        for draft in &drafts {
            validate_task_input(&draft.content, draft.priority)?;
            for dep in &draft.depends_on {
                if !state.tasks.contains_key(dep) {
                    return Err(StoreError::Conflict(format!("unknown dependency {dep:?}")));
                }
            }
        }

        let mut added = Vec::with_capacity(drafts.len());
        for draft in drafts {
            let task = Task {
                id: Uuid::new_v4().to_string(),
                content: draft.content,
                status: TaskStatus::Remaining,
                priority: draft.priority,
                depends_on: draft.depends_on,
                iteration: 0,
            };
            self.publish(EventBody::Task(TaskEvent::Add {
                task_id: task.id.clone(),
                content: task.content.clone(),
                priority: task.priority,
                depends_on: task.depends_on.clone(),
            }))
            .await?;
            added.push(task);
        }
        Ok(added)
    }

    pub async fn task_status(
        &self,
        task_id: &str,
        status: TaskStatus,
        iteration: u32,
    ) -> Result<(), StoreError> {
        self.require_task(task_id).await?;
        self.publish(EventBody::Task(TaskEvent::Status {
            task_id: task_id.to_string(),
            status,
            iteration,
        }))
        .await
    }

    pub async fn task_priority(&self, task_id: &str, priority: u8) -> Result<(), StoreError> {
        if priority > MAX_PRIORITY {
            return Err(StoreError::InvalidArgument(format!(
                "priority {priority} out of range 0..={MAX_PRIORITY}"
            )));
        }
        self.require_task(task_id).await?;
        self.publish(EventBody::Task(TaskEvent::Priority {
            task_id: task_id.to_string(),
            priority,
        }))
        .await
    }

    pub async fn task_depends(
        &self,
        task_id: &str,
        depends_on: BTreeSet<String>,
    ) -> Result<(), StoreError> {
        let state = self.load_state().await?;
        if !state.tasks.contains_key(task_id) {
            return Err(StoreError::Conflict(format!("unknown task {task_id:?}")));
        }
        for dep in &depends_on {
            if !state.tasks.contains_key(dep) {
                return Err(StoreError::Conflict(format!("unknown dependency {dep:?}")));
            }
            if dep == task_id {
                return Err(StoreError::InvalidArgument(
                    "task cannot depend on itself".into(),
                ));
            }
        }
        self.publish(EventBody::Task(TaskEvent::Depends {
            task_id: task_id.to_string(),
            depends_on,
        }))
        .await
    }

    /// Folded projection of all tasks, ordered by (priority, id).
    pub async fn task_list(&self) -> Result<Vec<Task>, StoreError> {
        let state = self.load_state().await?;
        let mut tasks: Vec<Task> = state.tasks.into_values().collect();
        tasks.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.id.cmp(&b.id)));
        Ok(tasks)
    }

    /// The highest-priority ready task, if any (deterministic tie-break).
    pub async fn task_next(&self) -> Result<Option<Task>, StoreError> {
        let state = self.load_state().await?;
        Ok(state.next_task().cloned())
    }

    // ── Note ops ──────────────────────────────────────────────────────────────

    pub async fn note_add(
        &self,
        content: &str,
        note_type: NoteType,
        iteration: u32,
    ) -> Result<Note, StoreError> {
        if content.trim().is_empty() {
            return Err(StoreError::InvalidArgument("empty note content".into()));
        }
        let note = Note {
            id: Uuid::new_v4().to_string(),
            note_type,
            content: content.to_string(),
            iteration,
        };
        self.publish(EventBody::Note(NoteEvent::Add {
            note_id: note.id.clone(),
            note_type,
            content: note.content.clone(),
            iteration,
        }))
        .await?;
        Ok(note)
    }

    pub async fn note_list(&self, note_type: Option<NoteType>) -> Result<Vec<Note>, StoreError> {
        let state = self.load_state().await?;
        Ok(state
            .notes
            .into_iter()
            .filter(|n| note_type.is_none_or(|t| n.note_type == t))
            .collect())
    }

    // ── Inbox ops ─────────────────────────────────────────────────────────────

    pub async fn inbox_add(&self, content: &str) -> Result<Message, StoreError> {
        if content.trim().is_empty() {
            return Err(StoreError::InvalidArgument("empty message".into()));
        }
        let message = Message {
            id: Uuid::new_v4().to_string(),
            content: content.to_string(),
            read: false,
        };
        self.publish(EventBody::Inbox(InboxEvent::Add {
            message_id: message.id.clone(),
            content: message.content.clone(),
        }))
        .await?;
        Ok(message)
    }

    pub async fn inbox_list(&self) -> Result<Vec<Message>, StoreError> {
        Ok(self.load_state().await?.inbox)
    }

    pub async fn inbox_mark_read(&self, message_id: &str) -> Result<(), StoreError> {
        let state = self.load_state().await?;
        if !state.inbox.iter().any(|m| m.id == message_id) {
            return Err(StoreError::Conflict(format!(
                "unknown message {message_id:?}"
            )));
        }
        self.publish(EventBody::Inbox(InboxEvent::MarkRead {
            message_id: message_id.to_string(),
        }))
        .await
    }

    // ── Iteration ops ─────────────────────────────────────────────────────────

    pub async fn iteration_start(&self, number: u32) -> Result<(), StoreError> {
        self.publish(EventBody::Iteration(IterationEvent::Start { number }))
            .await
    }

    pub async fn iteration_complete(&self, number: u32) -> Result<(), StoreError> {
        self.publish(EventBody::Iteration(IterationEvent::Complete { number }))
            .await
    }

    pub async fn iteration_summary(
        &self,
        number: u32,
        summary: &str,
        tasks_worked: BTreeSet<String>,
    ) -> Result<(), StoreError> {
        if summary.trim().is_empty() {
            return Err(StoreError::InvalidArgument("empty summary".into()));
        }
        self.publish(EventBody::Iteration(IterationEvent::Summary {
            number,
            summary: summary.to_string(),
            tasks_worked,
        }))
        .await
    }

    // ── Session ops ───────────────────────────────────────────────────────────

    pub async fn session_complete(&self) -> Result<(), StoreError> {
        self.publish(EventBody::Control(ControlEvent::Complete)).await
    }

    pub async fn session_restart(&self) -> Result<(), StoreError> {
        self.publish(EventBody::Control(ControlEvent::Restart)).await
    }

    pub async fn set_session_model(&self, model: &str) -> Result<(), StoreError> {
        self.publish(EventBody::Control(ControlEvent::SetModel {
            model: model.to_string(),
        }))
        .await
    }

    /// Purge the session's entire history.  Subsequent loads see an empty
    /// state until new events arrive.
    pub async fn reset_session(&self) -> Result<(), StoreError> {
        self.client.purge(&session_prefix(&self.session)).await?;
        Ok(())
    }

    /// The subject carrying this session's task events (for subscriptions).
    pub fn task_subject(&self) -> String {
        subject(&self.session, EventKind::Task)
    }

    async fn require_task(&self, task_id: &str) -> Result<(), StoreError> {
        let state = self.load_state().await?;
        if state.tasks.contains_key(task_id) {
            Ok(())
        } else {
            Err(StoreError::Conflict(format!("unknown task {task_id:?}")))
        }
    }
}

fn validate_task_input(content: &str, priority: u8) -> Result<(), StoreError> {
    if content.trim().is_empty() {
        return Err(StoreError::InvalidArgument("empty task content".into()));
    }
    if priority > MAX_PRIORITY {
        return Err(StoreError::InvalidArgument(format!(
            "priority {priority} out of range 0..={MAX_PRIORITY}"
        )));
    }
    Ok(())
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use iteratr_events::LogServer;

    async fn test_store() -> (SessionStore, LogServer, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let server = LogServer::start(dir.path()).await.unwrap();
        let client = Arc::new(LogClient::connect(server.port()).await.unwrap());
        let store = SessionStore::new(client, "test-session").unwrap();
        (store, server, dir)
    }

    #[tokio::test]
    async fn invalid_session_name_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let server = LogServer::start(dir.path()).await.unwrap();
        let client = Arc::new(LogClient::connect(server.port()).await.unwrap());
        let err = SessionStore::new(client, "bad name").unwrap_err();
        assert!(matches!(err, StoreError::InvalidArgument(_)));
        server.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn load_state_twice_is_structurally_equal() {
        let (store, server, _dir) = test_store().await;
        store.task_add("one", 1, BTreeSet::new()).await.unwrap();
        store.note_add("learned", NoteType::Learning, 1).await.unwrap();

        let a = store.load_state().await.unwrap();
        let b = store.load_state().await.unwrap();
        assert_eq!(a, b);
        server.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn task_add_then_status_round_trip() {
        let (store, server, _dir) = test_store().await;
        let task = store.task_add("build it", 2, BTreeSet::new()).await.unwrap();
        store
            .task_status(&task.id, TaskStatus::InProgress, 3)
            .await
            .unwrap();

        let state = store.load_state().await.unwrap();
        let loaded = &state.tasks[&task.id];
        assert_eq!(loaded.status, TaskStatus::InProgress);
        assert_eq!(loaded.iteration, 3);
        server.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn status_on_missing_task_is_conflict() {
        let (store, server, _dir) = test_store().await;
        let err = store
            .task_status("no-such", TaskStatus::Completed, 1)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
        server.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn add_with_unknown_dependency_is_conflict() {
        let (store, server, _dir) = test_store().await;
        let err = store
            .task_add("b", 1, BTreeSet::from(["ghost".to_string()]))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
        server.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn priority_out_of_range_is_invalid_argument() {
        let (store, server, _dir) = test_store().await;
        let err = store.task_add("x", 5, BTreeSet::new()).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidArgument(_)));
        server.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn task_next_respects_priority_and_dependencies() {
        let (store, server, _dir) = test_store().await;
        let a = store.task_add("first", 1, BTreeSet::new()).await.unwrap();
        let _b = store
            .task_add("gated", 0, BTreeSet::from([a.id.clone()]))
            .await
            .unwrap();

        // b has the better priority but is gated on a
        let next = store.task_next().await.unwrap().unwrap();
        assert_eq!(next.id, a.id);

        store
            .task_status(&a.id, TaskStatus::Completed, 1)
            .await
            .unwrap();
        let next = store.task_next().await.unwrap().unwrap();
        assert_eq!(next.content, "gated");
        server.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn batch_add_publishes_every_task() {
        let (store, server, _dir) = test_store().await;
        let drafts = vec![
            TaskDraft {
                content: "a".into(),
                priority: 0,
                depends_on: BTreeSet::new(),
            },
            TaskDraft {
                content: "b".into(),
                priority: 3,
                depends_on: BTreeSet::new(),
            },
        ];
        let added = store.task_batch_add(drafts).await.unwrap();
        assert_eq!(added.len(), 2);
        let listed = store.task_list().await.unwrap();
        assert_eq!(listed.len(), 2);
        // list is ordered by priority
        assert_eq!(listed[0].content, "a");
        server.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn reset_clears_history() {
        let (store, server, _dir) = test_store().await;
        for n in 0..5 {
            store.iteration_start(n).await.unwrap();
            store.iteration_complete(n).await.unwrap();
        }
        assert_eq!(store.load_state().await.unwrap().iterations.len(), 5);

        store.reset_session().await.unwrap();
        let state = store.load_state().await.unwrap();
        assert_eq!(state, State::default());
        server.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn complete_then_restart_reopens_session() {
        let (store, server, _dir) = test_store().await;
        store.session_complete().await.unwrap();
        assert!(store.load_state().await.unwrap().complete);

        store.session_restart().await.unwrap();
        assert!(!store.load_state().await.unwrap().complete);
        server.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn set_model_is_folded() {
        let (store, server, _dir) = test_store().await;
        store.set_session_model("claude-opus").await.unwrap();
        assert_eq!(store.load_state().await.unwrap().model, "claude-opus");
        server.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn note_list_filters_by_type() {
        let (store, server, _dir) = test_store().await;
        store.note_add("l1", NoteType::Learning, 1).await.unwrap();
        store.note_add("t1", NoteType::Tip, 1).await.unwrap();

        let tips = store.note_list(Some(NoteType::Tip)).await.unwrap();
        assert_eq!(tips.len(), 1);
        assert_eq!(tips[0].content, "t1");
        assert_eq!(store.note_list(None).await.unwrap().len(), 2);
        server.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn inbox_lifecycle() {
        let (store, server, _dir) = test_store().await;
        let msg = store.inbox_add("please add tests").await.unwrap();
        assert_eq!(store.load_state().await.unwrap().unread_messages().len(), 1);

        store.inbox_mark_read(&msg.id).await.unwrap();
        assert!(store.load_state().await.unwrap().unread_messages().is_empty());

        let err = store.inbox_mark_read("ghost").await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
        server.shutdown().await.unwrap();
    }
}
