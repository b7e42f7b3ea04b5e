// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! The iteration state machine: planning, the main loop, hook interleaving,
//! user-message queueing, pause/resume, error recovery, completion detection,
//! and ordered teardown.
//!
//! ```text
//! Start()            Run()                                      Stop()
//!   │                  │                                          │
//!   ├─ log bootstrap   ├─ Planning (#0, only on empty history)    ├─ cancel ctx
//!   ├─ session store   ├─ session_start hooks → pending buffer    ├─ stop watcher
//!   ├─ agent spawn     │                                          ├─ stop agent
//!   ├─ fs watcher      │  per iteration N:                        ├─ close log conn
//!   └─ task sub        │    pending + pre hooks → prompt → turn   └─ stop server
//!                      │    post hooks → verification turn          (primary only)
//!                      │    watcher merge → auto-commit turn
//!                      │    reload → Completing? → drain messages
//!                      │    pause point
//!                      └─ FinalDelivery → session_end hooks
//! ```

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Context;
use futures::FutureExt;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use iteratr_agent::{
    extract_file_edits, AgentConnection, AgentError, ContentBlock, SessionUpdate, StopReason,
    ToolCallStatus,
};
use iteratr_events::{connect_or_spawn, EventKind, LogBootstrap};
use iteratr_hooks::{
    execute_all, execute_all_piped, load_hooks, HookObserver, HookOutcome, HookSet,
    LifecyclePoint, NullObserver,
};
use iteratr_store::{EventBody, SessionStore, TaskEvent, TaskStatus};
use iteratr_watch::{FileChangeTracker, WorkdirWatcher};

use crate::events::OrchestratorEvent;
use crate::prompts::{
    commit_prompt, frame_hook_output, recovery_prompt, verification_prompt,
    DEFAULT_ITERATION_TEMPLATE, PLANNING_TEMPLATE,
};
use crate::render::{render_prompt, PromptInputs};

/// Capacity of the user-message channel; the front-end applies backpressure
/// when it fills.
pub const USER_QUEUE_CAPACITY: usize = 10;

// ── Options ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct OrchestratorOptions {
    pub session: String,
    pub workdir: PathBuf,
    /// Data directory (event log storage + port file live under `data/`).
    pub data_dir: PathBuf,
    pub spec_path: PathBuf,
    /// Model forwarded to the agent; empty = agent default.
    pub model: String,
    /// Maximum iterations per run; 0 = unlimited.
    pub iteration_limit: u32,
    pub auto_commit: bool,
    pub agent_command: String,
    pub agent_args: Vec<String>,
    /// Override for the iteration template (.iteratr.template content).
    pub iteration_template: Option<String>,
    /// Extra text injected as `{{extra}}` into the prompt.
    pub extra: String,
    /// User-supplied `--var KEY=VALUE` pairs, substituted into the template
    /// after the built-in variables.
    pub extra_vars: HashMap<String, String>,
    /// Purge the session's history before starting.
    pub reset: bool,
}

// ── Handle ────────────────────────────────────────────────────────────────────

struct Shared {
    pause_requested: AtomicBool,
    paused: AtomicBool,
    resume: Notify,
    pending_output: Mutex<String>,
    current_iteration: AtomicU32,
    hooks_run: AtomicU64,
}

impl Shared {
    fn append_pending(&self, text: &str) {
        let mut buffer = self.pending_output.lock().expect("pending buffer poisoned");
        if !buffer.is_empty() {
            buffer.push_str("\n\n");
        }
        buffer.push_str(text.trim_end());
    }

    fn take_pending(&self) -> String {
        std::mem::take(&mut *self.pending_output.lock().expect("pending buffer poisoned"))
    }
}

/// Cloneable control surface for the front-end: pause control, user-message
/// input, and cancellation.
#[derive(Clone)]
pub struct OrchestratorHandle {
    shared: Arc<Shared>,
    cancel: CancellationToken,
    user_tx: mpsc::Sender<String>,
}

impl OrchestratorHandle {
    /// Flag a pause; the orchestrator observes it between iterations, never
    /// mid-turn.
    pub fn request_pause(&self) {
        self.shared.pause_requested.store(true, Ordering::SeqCst);
    }

    /// Withdraw a pause request that has not been observed yet.  Returns
    /// false when the orchestrator is already paused (use `resume`).
    pub fn cancel_pause(&self) -> bool {
        if self.shared.paused.load(Ordering::SeqCst) {
            return false;
        }
        self.shared.pause_requested.store(false, Ordering::SeqCst);
        true
    }

    pub fn resume(&self) {
        self.shared.resume.notify_one();
    }

    pub fn is_paused(&self) -> bool {
        self.shared.paused.load(Ordering::SeqCst)
    }

    /// Queue a user message for delivery after the current turn.  Errors when
    /// the queue is full (bounded; the caller applies its own backpressure)
    /// or the orchestrator is gone.
    pub fn send_user_message(&self, text: String) -> Result<(), String> {
        self.user_tx
            .try_send(text)
            .map_err(|e| format!("user message queue: {e}"))
    }

    /// Cancel the root context; a live turn is interrupted and the run
    /// unwinds toward `stop()`.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Number of hook commands run so far (progress reporting).
    pub fn hooks_run(&self) -> u64 {
        self.shared.hooks_run.load(Ordering::Relaxed)
    }
}

// ── Orchestrator ──────────────────────────────────────────────────────────────

/// Everything `start()` brings up and `stop()` tears down.
struct Runtime {
    log: Option<LogBootstrap>,
    store: SessionStore,
    hooks: HookSet,
    tracker: Arc<FileChangeTracker>,
    watcher: Option<WorkdirWatcher>,
    agent: Option<AgentConnection>,
    agent_session: String,
    task_subscription: Option<iteratr_events::Subscription>,
    task_worker: Option<tokio::task::JoinHandle<()>>,
    spec_text: String,
    binary: String,
    port: u16,
}

enum CompletingOutcome {
    /// The agent restarted the session; re-enter the main loop.
    Restarted,
    /// Shut down.
    Stopped,
}

pub struct Orchestrator {
    opts: OrchestratorOptions,
    shared: Arc<Shared>,
    cancel: CancellationToken,
    events_tx: mpsc::Sender<OrchestratorEvent>,
    user_rx: mpsc::Receiver<String>,
    runtime: Option<Runtime>,
    /// First stop() outcome, replayed by subsequent calls.
    stop_result: Option<Option<String>>,
}

impl Orchestrator {
    /// Create an orchestrator and its control handle.  `events_tx` should be
    /// a channel of a few hundred slots; streamed agent text is dropped (not
    /// blocked on) if the consumer falls behind.
    pub fn new(
        opts: OrchestratorOptions,
        events_tx: mpsc::Sender<OrchestratorEvent>,
    ) -> (Self, OrchestratorHandle) {
        let (user_tx, user_rx) = mpsc::channel(USER_QUEUE_CAPACITY);
        let shared = Arc::new(Shared {
            pause_requested: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            resume: Notify::new(),
            pending_output: Mutex::new(String::new()),
            current_iteration: AtomicU32::new(0),
            hooks_run: AtomicU64::new(0),
        });
        let cancel = CancellationToken::new();
        let handle = OrchestratorHandle {
            shared: shared.clone(),
            cancel: cancel.clone(),
            user_tx,
        };
        (
            Self {
                opts,
                shared,
                cancel,
                events_tx,
                user_rx,
                runtime: None,
                stop_result: None,
            },
            handle,
        )
    }

    /// Bring up every dependency: event log (primary or subordinate), session
    /// store, agent subprocess, filesystem watcher, task-event subscription.
    pub async fn start(&mut self) -> anyhow::Result<()> {
        let spec_text = std::fs::read_to_string(&self.opts.spec_path).with_context(|| {
            format!("reading spec file {}", self.opts.spec_path.display())
        })?;

        let storage_dir = self.opts.data_dir.join("data");
        std::fs::create_dir_all(&storage_dir)
            .with_context(|| format!("creating {}", storage_dir.display()))?;

        let log = connect_or_spawn(&storage_dir).await?;
        let port = log.port;
        let store = SessionStore::new(log.client.clone(), &self.opts.session)
            .map_err(|e| anyhow::anyhow!("{e}"))?;

        if self.opts.reset {
            self.emit(OrchestratorEvent::Info(format!(
                "resetting session {}",
                self.opts.session
            )));
            store
                .reset_session()
                .await
                .map_err(|e| anyhow::anyhow!("reset: {e}"))?;
        }

        let hooks = load_hooks(&self.opts.workdir)?;

        // ── Agent subprocess ─────────────────────────────────────────────────
        // The session name and log port are exported so `iteratr tool ...`
        // invocations from inside the agent hit the right session.
        let agent_env = vec![
            ("ITERATR_SESSION".to_string(), self.opts.session.clone()),
            ("ITERATR_PORT".to_string(), port.to_string()),
        ];
        let mut agent = AgentConnection::spawn(
            &self.opts.agent_command,
            &self.opts.agent_args,
            &self.opts.workdir,
            &agent_env,
            self.cancel.clone(),
        )
        .await?;
        agent.initialize().await?;
        let agent_session = agent.new_session(&self.opts.workdir).await?;
        if !self.opts.model.is_empty() {
            agent.set_model(&agent_session, &self.opts.model).await?;
            store
                .set_session_model(&self.opts.model)
                .await
                .map_err(|e| anyhow::anyhow!("set model: {e}"))?;
        }

        // ── Filesystem watcher ───────────────────────────────────────────────
        let data_dir_basename = self
            .opts
            .data_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| ".iteratr".to_string());
        let watcher = WorkdirWatcher::start(&self.opts.workdir, &data_dir_basename);

        let tracker = Arc::new(FileChangeTracker::new(self.opts.workdir.clone()));

        // ── on_task_complete subscription ────────────────────────────────────
        // The log callback must not block: it forwards completed task IDs to
        // a worker task that runs the hooks and appends to the pending buffer.
        let (task_subscription, task_worker) = if hooks.on_task_complete.is_empty() {
            (None, None)
        } else {
            let (tx, mut rx) = mpsc::unbounded_channel::<String>();
            let subscription = log
                .client
                .subscribe(&store.task_subject(), move |record| {
                    if let Some(EventBody::Task(TaskEvent::Status {
                        task_id,
                        status: TaskStatus::Completed,
                        ..
                    })) = EventBody::decode(EventKind::Task, &record.body)
                    {
                        let _ = tx.send(task_id);
                    }
                })
                .await?;

            let worker_store = SessionStore::new(log.client.clone(), &self.opts.session)
                .map_err(|e| anyhow::anyhow!("{e}"))?;
            let group = hooks.on_task_complete.clone();
            let workdir = self.opts.workdir.clone();
            let session = self.opts.session.clone();
            let shared = self.shared.clone();
            let cancel = self.cancel.clone();
            let worker = tokio::spawn(async move {
                while let Some(task_id) = rx.recv().await {
                    if cancel.is_cancelled() {
                        break;
                    }
                    let task_content = match worker_store.load_state().await {
                        Ok(state) => state
                            .tasks
                            .get(&task_id)
                            .map(|t| t.content.clone())
                            .unwrap_or_default(),
                        Err(e) => {
                            warn!(error = %e, "task-complete hook: state load failed");
                            String::new()
                        }
                    };
                    let vars: HashMap<String, String> = [
                        ("session".to_string(), session.clone()),
                        (
                            "iteration".to_string(),
                            shared.current_iteration.load(Ordering::SeqCst).to_string(),
                        ),
                        ("task_id".to_string(), task_id.clone()),
                        ("task_content".to_string(), task_content),
                    ]
                    .into();
                    match execute_all_piped(&cancel, &group, &workdir, &vars, &mut NullObserver)
                        .await
                    {
                        Ok(output) if !output.is_empty() => shared.append_pending(&output),
                        Ok(_) => {}
                        Err(_) => break, // cancelled
                    }
                    shared.hooks_run.fetch_add(group.len() as u64, Ordering::Relaxed);
                }
            });
            (Some(subscription), Some(worker))
        };

        self.runtime = Some(Runtime {
            log: Some(log),
            store,
            hooks,
            tracker,
            watcher: Some(watcher),
            agent: Some(agent),
            agent_session,
            task_subscription,
            task_worker,
            spec_text,
            binary: std::env::current_exe()
                .map(|p| p.to_string_lossy().into_owned())
                .unwrap_or_else(|_| "iteratr".to_string()),
            port,
        });
        Ok(())
    }

    /// Drive the loop to completion.  Panics inside the iteration body are
    /// caught, wrapped, and surfaced as errors.
    pub async fn run(&mut self) -> anyhow::Result<()> {
        let mut runtime = self
            .runtime
            .take()
            .context("run() called before start()")?;
        let result = std::panic::AssertUnwindSafe(self.run_inner(&mut runtime))
            .catch_unwind()
            .await;
        self.runtime = Some(runtime);
        match result {
            Ok(run_result) => run_result,
            Err(panic) => {
                let msg = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                Err(anyhow::anyhow!("iteration panicked: {msg}"))
            }
        }
    }

    async fn run_inner(&mut self, rt: &mut Runtime) -> anyhow::Result<()> {
        let state = rt
            .store
            .load_state()
            .await
            .map_err(|e| anyhow::anyhow!("initial state load: {e}"))?;

        // Planning runs only for sessions whose history has zero iterations;
        // a restart resumes at highest + 1.
        let mut next = match state.highest_iteration() {
            None => {
                self.run_planning(rt).await?;
                1
            }
            Some(highest) => highest + 1,
        };

        if !rt.hooks.session_start.is_empty() {
            let output = self
                .run_hooks_piped(rt, LifecyclePoint::SessionStart, &self.base_vars(0))
                .await?;
            if !output.is_empty() {
                self.shared.append_pending(&output);
            }
        }

        let mut runs = 0u32;
        let result = loop {
            // ── BetweenIterations ────────────────────────────────────────────
            if self.cancel.is_cancelled() {
                break Ok(());
            }
            if self.opts.iteration_limit > 0 && runs >= self.opts.iteration_limit {
                self.emit(OrchestratorEvent::Info(format!(
                    "iteration limit {} reached",
                    self.opts.iteration_limit
                )));
                break Ok(());
            }
            let state = rt
                .store
                .load_state()
                .await
                .map_err(|e| anyhow::anyhow!("state load: {e}"))?;
            if state.complete {
                match self.completing(rt).await? {
                    CompletingOutcome::Restarted => {
                        let state = rt
                            .store
                            .load_state()
                            .await
                            .map_err(|e| anyhow::anyhow!("state load: {e}"))?;
                        next = state.highest_iteration().map(|h| h + 1).unwrap_or(1);
                        continue;
                    }
                    CompletingOutcome::Stopped => break Ok(()),
                }
            }
            self.wait_if_paused().await;
            if self.cancel.is_cancelled() {
                break Ok(());
            }

            // ── RunningIteration ─────────────────────────────────────────────
            let n = next;
            runs += 1;
            next += 1;
            self.shared.current_iteration.store(n, Ordering::SeqCst);
            rt.tracker.clear();
            if let Some(watcher) = &rt.watcher {
                watcher.clear();
            }
            rt.store
                .iteration_start(n)
                .await
                .map_err(|e| anyhow::anyhow!("iteration start: {e}"))?;
            self.emit(OrchestratorEvent::IterationStarted(n));

            let pending = self.shared.take_pending();
            let pre = self
                .run_hooks_piped(rt, LifecyclePoint::PreIteration, &self.base_vars(n))
                .await?;
            let hook_output = join_nonempty(&pending, &pre);

            let prompt = self.build_prompt(rt, n, &state);
            let mut blocks = Vec::new();
            if !hook_output.is_empty() {
                blocks.push(ContentBlock::text(frame_hook_output(&hook_output)));
            }
            blocks.push(ContentBlock::text(prompt));

            if let Err(err) = self.send_turn(rt, &blocks).await {
                if matches!(err, AgentError::Cancelled) {
                    break Ok(());
                }
                if !self.recover(rt, n, &err).await? {
                    break Err(anyhow::Error::from(err));
                }
                continue;
            }

            rt.store
                .iteration_complete(n)
                .await
                .map_err(|e| anyhow::anyhow!("iteration complete: {e}"))?;
            self.emit(OrchestratorEvent::IterationCompleted(n));

            // ── post_iteration ───────────────────────────────────────────────
            let post = self
                .run_hooks_piped(rt, LifecyclePoint::PostIteration, &self.base_vars(n))
                .await?;
            if !post.is_empty() {
                let verification = vec![ContentBlock::text(verification_prompt(&post))];
                if let Err(err) = self.send_turn(rt, &verification).await {
                    if matches!(err, AgentError::Cancelled) {
                        break Ok(());
                    }
                    if !self.recover(rt, n, &err).await? {
                        break Err(anyhow::Error::from(err));
                    }
                    continue;
                }
            }

            // ── Watcher merge + auto-commit ──────────────────────────────────
            if let Some(watcher) = &rt.watcher {
                rt.tracker.merge_watcher_paths(watcher.changed_paths());
            }
            if self.opts.auto_commit
                && self.opts.workdir.join(".git").exists()
                && rt.tracker.has_changes()
            {
                let prompt = commit_prompt(n, &rt.tracker.changes());
                if let Err(err) = self
                    .send_turn(rt, &[ContentBlock::text(prompt)])
                    .await
                {
                    if matches!(err, AgentError::Cancelled) {
                        break Ok(());
                    }
                    self.emit(OrchestratorEvent::Warning(format!(
                        "auto-commit turn failed: {err}"
                    )));
                }
            }

            // ── Reload, queued messages, pause ───────────────────────────────
            let state = rt
                .store
                .load_state()
                .await
                .map_err(|e| anyhow::anyhow!("state reload: {e}"))?;
            if state.complete {
                continue; // loop head enters Completing
            }
            if let Err(err) = self.deliver_queued_messages(rt).await {
                if matches!(err, AgentError::Cancelled) {
                    break Ok(());
                }
                if !self.recover(rt, n, &err).await? {
                    break Err(anyhow::Error::from(err));
                }
            }
        };

        // Failures surface to the caller of run(); FinalDelivery and the
        // session_end hooks run only on orderly loop exit.
        if result.is_err() {
            return result;
        }

        // ── FinalDelivery ────────────────────────────────────────────────────
        let pending = self.shared.take_pending();
        if !pending.is_empty() && !self.cancel.is_cancelled() {
            let blocks = vec![ContentBlock::text(frame_hook_output(&pending))];
            if let Err(e) = self.send_turn(rt, &blocks).await {
                debug!(error = %e, "final delivery turn failed");
            }
        }

        // ── SessionEnd ───────────────────────────────────────────────────────
        if !rt.hooks.session_end.is_empty() {
            let vars = self.base_vars(self.shared.current_iteration.load(Ordering::SeqCst));
            // pipe_output is ignored at session end; run for side effects only
            let mut observer = self.hook_observer(LifecyclePoint::SessionEnd);
            if let Err(e) = execute_all(
                &CancellationToken::new(),
                &rt.hooks.session_end,
                &self.opts.workdir,
                &vars,
                &mut observer,
            )
            .await
            {
                warn!(error = %e, "session_end hooks failed");
            }
        }

        result
    }

    /// Planning pass (iteration #0): restricted template, no hooks, single
    /// turn, complete event on success.
    async fn run_planning(&mut self, rt: &mut Runtime) -> anyhow::Result<()> {
        self.shared.current_iteration.store(0, Ordering::SeqCst);
        rt.store
            .iteration_start(0)
            .await
            .map_err(|e| anyhow::anyhow!("planning start: {e}"))?;
        self.emit(OrchestratorEvent::IterationStarted(0));

        let state = rt
            .store
            .load_state()
            .await
            .map_err(|e| anyhow::anyhow!("state load: {e}"))?;
        let prompt = render_prompt(
            PLANNING_TEMPLATE,
            &PromptInputs {
                session: &self.opts.session,
                iteration: 0,
                spec: &rt.spec_text,
                state: &state,
                extra: &self.opts.extra,
                port: rt.port,
                binary: &rt.binary,
                hooks: &rt.hooks,
            },
        );
        self.send_turn(rt, &[ContentBlock::text(prompt)])
            .await
            .map_err(anyhow::Error::from)?;

        rt.store
            .iteration_complete(0)
            .await
            .map_err(|e| anyhow::anyhow!("planning complete: {e}"))?;
        self.emit(OrchestratorEvent::IterationCompleted(0));
        Ok(())
    }

    /// Completing: the session latched complete.  Keep serving queued user
    /// messages; if the agent restarts the session (complete cleared),
    /// re-enter the loop.
    async fn completing(&mut self, rt: &mut Runtime) -> anyhow::Result<CompletingOutcome> {
        self.emit(OrchestratorEvent::SessionCompleted);
        loop {
            let first = tokio::select! {
                _ = self.cancel.cancelled() => return Ok(CompletingOutcome::Stopped),
                received = self.user_rx.recv() => match received {
                    Some(message) => message,
                    None => return Ok(CompletingOutcome::Stopped),
                },
            };
            let mut messages = vec![first];
            while let Ok(more) = self.user_rx.try_recv() {
                messages.push(more);
            }
            if let Err(e) = self.send_messages_turn(rt, messages).await {
                if matches!(e, AgentError::Cancelled) {
                    return Ok(CompletingOutcome::Stopped);
                }
                self.emit(OrchestratorEvent::Warning(format!(
                    "message turn failed while complete: {e}"
                )));
            }
            let state = rt
                .store
                .load_state()
                .await
                .map_err(|e| anyhow::anyhow!("state load: {e}"))?;
            if !state.complete {
                self.emit(OrchestratorEvent::Info("session restarted".into()));
                return Ok(CompletingOutcome::Restarted);
            }
        }
    }

    /// DrainingQueuedMessages: everything queued goes out as one multi-block
    /// prompt, blocks in arrival order.
    async fn deliver_queued_messages(&mut self, rt: &mut Runtime) -> Result<(), AgentError> {
        let mut messages = Vec::new();
        while let Ok(message) = self.user_rx.try_recv() {
            messages.push(message);
        }
        if messages.is_empty() {
            return Ok(());
        }
        self.send_messages_turn(rt, messages).await
    }

    async fn send_messages_turn(
        &mut self,
        rt: &mut Runtime,
        messages: Vec<String>,
    ) -> Result<(), AgentError> {
        // record in the durable inbox; delivery marks them read
        let mut ids = Vec::new();
        for message in &messages {
            match rt.store.inbox_add(message).await {
                Ok(record) => ids.push(record.id),
                Err(e) => warn!(error = %e, "inbox add failed"),
            }
        }
        let blocks: Vec<ContentBlock> = messages.into_iter().map(ContentBlock::text).collect();
        self.send_turn(rt, &blocks).await?;
        for id in ids {
            if let Err(e) = rt.store.inbox_mark_read(&id).await {
                warn!(error = %e, "inbox mark-read failed");
            }
        }
        Ok(())
    }

    /// ErrorRecovery: run on_error hooks (piped, `{{error}}` populated) and
    /// send a framed recovery prompt as a follow-up turn.  Returns false when
    /// no on_error hooks exist (caller propagates the original error).
    async fn recover(
        &mut self,
        rt: &mut Runtime,
        iteration: u32,
        err: &AgentError,
    ) -> anyhow::Result<bool> {
        if rt.hooks.on_error.is_empty() {
            return Ok(false);
        }
        self.emit(OrchestratorEvent::Warning(format!(
            "turn failed, attempting recovery: {err}"
        )));

        let mut vars = self.base_vars(iteration);
        vars.insert("error".to_string(), err.to_string());
        let hook_output = self
            .run_hooks_piped(rt, LifecyclePoint::OnError, &vars)
            .await?;

        let state = rt
            .store
            .load_state()
            .await
            .map_err(|e| anyhow::anyhow!("state load during recovery: {e}"))?;
        let can_continue = state
            .iteration(iteration)
            .and_then(|i| i.summary.as_ref())
            .is_none()
            || state.any_task_in_progress();

        let mut blocks = Vec::new();
        if !hook_output.is_empty() {
            blocks.push(ContentBlock::text(frame_hook_output(&hook_output)));
        }
        blocks.push(ContentBlock::text(recovery_prompt(
            &err.to_string(),
            can_continue,
        )));
        if let Err(e) = self.send_turn(rt, &blocks).await {
            warn!(error = %e, "recovery turn itself failed");
        }
        Ok(true)
    }

    /// Pause is only observed here, between iterations.
    async fn wait_if_paused(&mut self) {
        if !self.shared.pause_requested.load(Ordering::SeqCst) {
            return;
        }
        self.shared.paused.store(true, Ordering::SeqCst);
        self.emit(OrchestratorEvent::Paused);
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            _ = self.shared.resume.notified() => {}
        }
        self.shared.paused.store(false, Ordering::SeqCst);
        self.shared.pause_requested.store(false, Ordering::SeqCst);
        self.emit(OrchestratorEvent::Resumed);
    }

    /// One agent turn.  Text and thought chunks flow to the event channel;
    /// completed edit tool calls feed the file tracker.
    async fn send_turn(
        &mut self,
        rt: &mut Runtime,
        blocks: &[ContentBlock],
    ) -> Result<StopReason, AgentError> {
        let agent = rt
            .agent
            .as_mut()
            .ok_or_else(|| AgentError::Crash("agent already stopped".into()))?;
        let tracker = rt.tracker.clone();
        let events_tx = self.events_tx.clone();
        // kind arrives on the initial tool_call; updates only carry the id
        let mut kinds: HashMap<String, String> = HashMap::new();
        let mut on_update = move |update: SessionUpdate| match update {
            SessionUpdate::AgentMessageChunk {
                content: ContentBlock::Text { text },
            } => {
                let _ = events_tx.try_send(OrchestratorEvent::AgentText(text));
            }
            SessionUpdate::AgentThoughtChunk {
                content: ContentBlock::Text { text },
            } => {
                let _ = events_tx.try_send(OrchestratorEvent::AgentThought(text));
            }
            SessionUpdate::ToolCall {
                tool_call_id, kind, ..
            } => {
                kinds.insert(tool_call_id, kind);
            }
            SessionUpdate::ToolCallUpdate {
                tool_call_id,
                status,
                content,
                ..
            } => {
                let is_edit = kinds.get(&tool_call_id).is_some_and(|k| k == "edit");
                if status == ToolCallStatus::Completed && is_edit {
                    for edit in extract_file_edits(&content) {
                        tracker.record_change(
                            &edit.path,
                            edit.is_new,
                            edit.additions,
                            edit.deletions,
                        );
                        let _ = events_tx
                            .try_send(OrchestratorEvent::FileEdited { path: edit.path });
                    }
                }
            }
            SessionUpdate::AvailableCommandsUpdate {} => {}
        };
        agent
            .prompt(&rt.agent_session, blocks, &mut on_update)
            .await
    }

    fn build_prompt(&self, rt: &Runtime, iteration: u32, state: &iteratr_store::State) -> String {
        let template = rt_template(&self.opts.iteration_template);
        let rendered = render_prompt(
            template,
            &PromptInputs {
                session: &self.opts.session,
                iteration,
                spec: &rt.spec_text,
                state,
                extra: &self.opts.extra,
                port: rt.port,
                binary: &rt.binary,
                hooks: &rt.hooks,
            },
        );
        iteratr_hooks::expand_vars(&rendered, &self.opts.extra_vars)
    }

    async fn run_hooks_piped(
        &self,
        rt: &Runtime,
        point: LifecyclePoint,
        vars: &HashMap<String, String>,
    ) -> anyhow::Result<String> {
        let group = rt.hooks.group(point);
        if group.is_empty() {
            return Ok(String::new());
        }
        let mut observer = self.hook_observer(point);
        let output =
            execute_all_piped(&self.cancel, group, &self.opts.workdir, vars, &mut observer)
                .await?;
        self.shared
            .hooks_run
            .fetch_add(group.len() as u64, Ordering::Relaxed);
        Ok(output)
    }

    fn hook_observer(&self, point: LifecyclePoint) -> EventHookObserver {
        EventHookObserver {
            point,
            events_tx: self.events_tx.clone(),
        }
    }

    fn base_vars(&self, iteration: u32) -> HashMap<String, String> {
        [
            ("session".to_string(), self.opts.session.clone()),
            ("iteration".to_string(), iteration.to_string()),
        ]
        .into()
    }

    fn emit(&self, event: OrchestratorEvent) {
        let _ = self.events_tx.try_send(event);
    }

    /// Idempotent, ordered teardown.  Repeated calls replay the first
    /// outcome.
    pub async fn stop(&mut self) -> anyhow::Result<()> {
        if let Some(previous) = &self.stop_result {
            return match previous {
                None => Ok(()),
                Some(message) => Err(anyhow::anyhow!("{message}")),
            };
        }

        self.cancel.cancel();
        let mut errors: Vec<String> = Vec::new();

        if let Some(mut rt) = self.runtime.take() {
            if let Some(watcher) = rt.watcher.take() {
                watcher.stop();
            }
            if let Some(subscription) = rt.task_subscription.take() {
                subscription.unsubscribe().await;
            }
            if let Some(worker) = rt.task_worker.take() {
                worker.abort();
                let _ = worker.await;
            }
            if let Some(agent) = rt.agent.take() {
                agent.stop(Some(&rt.agent_session)).await;
            }
            if let Some(log) = rt.log.take() {
                if let Err(e) = log.shutdown().await {
                    errors.push(format!("log shutdown: {e}"));
                }
            }
        }

        let outcome = if errors.is_empty() {
            None
        } else {
            Some(errors.join("; "))
        };
        self.stop_result = Some(outcome.clone());
        match outcome {
            None => Ok(()),
            Some(message) => Err(anyhow::anyhow!("{message}")),
        }
    }
}

fn rt_template(override_template: &Option<String>) -> &str {
    override_template
        .as_deref()
        .filter(|t| !t.trim().is_empty())
        .unwrap_or(DEFAULT_ITERATION_TEMPLATE)
}

fn join_nonempty(a: &str, b: &str) -> String {
    match (a.is_empty(), b.is_empty()) {
        (true, true) => String::new(),
        (true, false) => b.to_string(),
        (false, true) => a.to_string(),
        (false, false) => format!("{a}\n\n{b}"),
    }
}

/// Bridges hook progress into the orchestrator event stream.
struct EventHookObserver {
    point: LifecyclePoint,
    events_tx: mpsc::Sender<OrchestratorEvent>,
}

impl HookObserver for EventHookObserver {
    fn on_start(&mut self, index: usize, command: &str) {
        let _ = self.events_tx.try_send(OrchestratorEvent::HookStarted {
            point: self.point.to_string(),
            index,
            command: command.to_string(),
        });
    }

    fn on_complete(&mut self, index: usize, outcome: &HookOutcome) {
        let _ = self.events_tx.try_send(OrchestratorEvent::HookCompleted {
            point: self.point.to_string(),
            index,
            failed: outcome.failed,
            duration_ms: outcome.duration.as_millis() as u64,
        });
    }
}

