// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT

/// Events emitted by the orchestrator during a run.
/// Consumers (the headless front-end, a TUI) subscribe to these to drive
/// their output; the orchestrator never writes to the terminal itself.
#[derive(Debug, Clone)]
pub enum OrchestratorEvent {
    /// A streamed assistant prose chunk from the agent.
    AgentText(String),
    /// A streamed reasoning chunk from the agent.
    AgentThought(String),
    /// An iteration has been started (0 = planning).
    IterationStarted(u32),
    /// An iteration finished its turn and was published complete.
    IterationCompleted(u32),
    /// A hook command is about to run.
    HookStarted {
        point: String,
        index: usize,
        command: String,
    },
    /// A hook command finished.
    HookCompleted {
        point: String,
        index: usize,
        failed: bool,
        duration_ms: u64,
    },
    /// A file edit was recorded from the agent stream.
    FileEdited { path: String },
    /// The orchestrator observed the pause request and is now waiting.
    Paused,
    /// Resume was signalled; the loop continues.
    Resumed,
    /// The session latched complete.
    SessionCompleted,
    /// A recoverable problem worth showing (hook failure detail, recovery
    /// turn, dropped watcher).
    Warning(String),
    /// Progress information.
    Info(String),
}
