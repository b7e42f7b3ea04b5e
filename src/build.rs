// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Headless front-end for the orchestrator: argument resolution, dry-run
//! validation, event rendering to stderr, Ctrl+C handling, and the doctor /
//! scaffolding commands.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use iteratr_config::Config;
use iteratr_core::{
    Orchestrator, OrchestratorEvent, OrchestratorOptions, DEFAULT_ITERATION_TEMPLATE,
};
use iteratr_events::validate_session_name;
use iteratr_hooks::parse_var;

use crate::output::{
    write_progress, write_stderr, write_stdout, EXIT_INTERRUPT, EXIT_RUNTIME_ERROR,
    EXIT_SUCCESS, EXIT_VALIDATION_ERROR,
};

/// Template override file at the working directory.
const TEMPLATE_FILE: &str = ".iteratr.template";

const SPEC_SKELETON: &str = "\
# Project Specification

Describe what to build. The planning pass turns this document into tasks.

## Goals

- [ ] First goal

## Constraints

- Keep the test suite green after every iteration.
";

pub struct BuildArgs {
    pub config: Config,
    pub session: String,
    pub spec: Option<PathBuf>,
    pub iterations: Option<u32>,
    pub model: Option<String>,
    pub auto_commit: bool,
    pub reset: bool,
    pub dry_run: bool,
    pub vars: Vec<String>,
    pub extra: Option<String>,
}

pub async fn run_build(args: BuildArgs) -> i32 {
    let workdir = match std::env::current_dir() {
        Ok(dir) => dir,
        Err(e) => {
            write_stderr(&format!("[iteratr:error] cannot resolve working directory: {e}"));
            return EXIT_RUNTIME_ERROR;
        }
    };

    if !validate_session_name(&args.session) {
        write_stderr(&format!(
            "[iteratr:error] invalid session name {:?} (allowed: [A-Za-z0-9_-], 1-64 chars)",
            args.session
        ));
        return EXIT_VALIDATION_ERROR;
    }

    let mut extra_vars: HashMap<String, String> = HashMap::new();
    for spec in &args.vars {
        match parse_var(spec) {
            Some((key, value)) => {
                extra_vars.insert(key, value);
            }
            None => {
                write_stderr(&format!("[iteratr:error] invalid --var {spec:?} (expected KEY=VALUE)"));
                return EXIT_VALIDATION_ERROR;
            }
        }
    }

    let spec_path = args
        .spec
        .unwrap_or_else(|| PathBuf::from(&args.config.spec_path));
    if !spec_path.is_file() {
        write_stderr(&format!(
            "[iteratr:error] spec file not found: {} (create one with `iteratr spec`)",
            spec_path.display()
        ));
        return EXIT_VALIDATION_ERROR;
    }

    let iteration_template = match read_template_override(&workdir) {
        Ok(template) => template,
        Err(e) => {
            write_stderr(&format!("[iteratr:error] {e}"));
            return EXIT_VALIDATION_ERROR;
        }
    };

    let model = args
        .model
        .unwrap_or_else(|| args.config.model.clone());

    let opts = OrchestratorOptions {
        session: args.session,
        workdir: workdir.clone(),
        data_dir: workdir.join(&args.config.data_dir),
        spec_path,
        model,
        iteration_limit: args.iterations.unwrap_or(args.config.iterations),
        auto_commit: args.auto_commit || args.config.auto_commit,
        agent_command: args.config.agent.command.clone(),
        agent_args: args.config.agent.args.clone(),
        iteration_template,
        extra: args.extra.unwrap_or_default(),
        extra_vars,
        reset: args.reset,
    };

    if args.dry_run {
        return dry_run(&opts, &workdir);
    }

    // ── Wire the front-end ───────────────────────────────────────────────────
    let (events_tx, events_rx) = mpsc::channel(256);
    let (mut orchestrator, handle) = Orchestrator::new(opts, events_tx);
    let renderer = tokio::spawn(render_events(events_rx));

    let interrupted = Arc::new(AtomicBool::new(false));
    {
        let handle = handle.clone();
        let interrupted = interrupted.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                write_stderr("[iteratr:interrupted] Ctrl+C received, shutting down");
                interrupted.store(true, Ordering::SeqCst);
                handle.shutdown();
            }
        });
    }

    let mut code = EXIT_SUCCESS;
    if let Err(e) = orchestrator.start().await {
        write_stderr(&format!("[iteratr:error] startup failed: {e:#}"));
        code = EXIT_RUNTIME_ERROR;
    } else if let Err(e) = orchestrator.run().await {
        write_stderr(&format!("[iteratr:error] {e:#}"));
        code = EXIT_RUNTIME_ERROR;
    }

    if let Err(e) = orchestrator.stop().await {
        write_stderr(&format!("[iteratr:warn] shutdown reported: {e:#}"));
    }
    drop(orchestrator);

    // give the renderer up to 2s to drain remaining events
    let _ = tokio::time::timeout(Duration::from_secs(2), renderer).await;

    if interrupted.load(Ordering::SeqCst) {
        EXIT_INTERRUPT
    } else {
        code
    }
}

fn dry_run(opts: &OrchestratorOptions, workdir: &Path) -> i32 {
    write_progress("[iteratr:dry-run] validation only, the agent will not start");
    write_progress(&format!("[iteratr:dry-run] session={}", opts.session));
    write_progress(&format!("[iteratr:dry-run] spec={}", opts.spec_path.display()));
    write_progress(&format!(
        "[iteratr:dry-run] agent={} {}",
        opts.agent_command,
        opts.agent_args.join(" ")
    ));
    write_progress(&format!(
        "[iteratr:dry-run] iterations={} auto_commit={}",
        opts.iteration_limit, opts.auto_commit
    ));
    match iteratr_hooks::load_hooks(workdir) {
        Ok(hooks) if hooks.is_empty() => write_progress("[iteratr:dry-run] hooks: none"),
        Ok(_) => write_progress("[iteratr:dry-run] hooks: ok"),
        Err(e) => {
            write_stderr(&format!("[iteratr:error] hooks file invalid: {e:#}"));
            return EXIT_VALIDATION_ERROR;
        }
    }
    write_progress(&format!(
        "[iteratr:dry-run] template: {}",
        if opts.iteration_template.is_some() {
            "override"
        } else {
            "built-in"
        }
    ));
    EXIT_SUCCESS
}

async fn render_events(mut events_rx: mpsc::Receiver<OrchestratorEvent>) {
    while let Some(event) = events_rx.recv().await {
        match event {
            OrchestratorEvent::AgentText(text) => write_stdout(&text),
            OrchestratorEvent::AgentThought(text) => {
                let trimmed = text.trim();
                if !trimmed.is_empty() {
                    write_progress(&format!("[iteratr:thinking] {trimmed}"));
                }
            }
            OrchestratorEvent::IterationStarted(n) => {
                write_progress(&format!("[iteratr:iteration:start] n={n}"));
            }
            OrchestratorEvent::IterationCompleted(n) => {
                write_progress(&format!("[iteratr:iteration:complete] n={n}"));
            }
            OrchestratorEvent::HookStarted { point, index, command } => {
                write_progress(&format!(
                    "[iteratr:hook:start] point={point} index={index} command={command:?}"
                ));
            }
            OrchestratorEvent::HookCompleted { point, index, failed, duration_ms } => {
                write_progress(&format!(
                    "[iteratr:hook:complete] point={point} index={index} failed={failed} duration_ms={duration_ms}"
                ));
            }
            OrchestratorEvent::FileEdited { path } => {
                write_progress(&format!("[iteratr:edit] {path}"));
            }
            OrchestratorEvent::Paused => write_progress("[iteratr:paused]"),
            OrchestratorEvent::Resumed => write_progress("[iteratr:resumed]"),
            OrchestratorEvent::SessionCompleted => {
                write_progress("[iteratr:session:complete] all tasks done");
            }
            OrchestratorEvent::Warning(msg) => write_progress(&format!("[iteratr:warn] {msg}")),
            OrchestratorEvent::Info(msg) => write_progress(&format!("[iteratr:info] {msg}")),
        }
    }
}

fn read_template_override(workdir: &Path) -> anyhow::Result<Option<String>> {
    let path = workdir.join(TEMPLATE_FILE);
    if !path.is_file() {
        return Ok(None);
    }
    let text = std::fs::read_to_string(&path)
        .map_err(|e| anyhow::anyhow!("reading {}: {e}", path.display()))?;
    Ok(Some(text))
}

// ── Doctor ────────────────────────────────────────────────────────────────────

pub async fn run_doctor(config: &Config) -> i32 {
    let mut failed = false;
    let mut check = |name: &str, ok: bool, detail: String| {
        let verdict = if ok { "ok" } else { "FAIL" };
        write_progress(&format!("[iteratr:doctor] {name}: {verdict} {detail}"));
        failed |= !ok;
    };

    // agent binary
    let agent = &config.agent.command;
    let resolved = resolve_binary(agent);
    check(
        "agent binary",
        resolved.is_some(),
        resolved
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| format!("{agent:?} not found in PATH")),
    );

    // data dir writable
    let storage = config.storage_dir();
    let writable = std::fs::create_dir_all(&storage)
        .and_then(|_| {
            let probe = storage.join(".doctor-probe");
            std::fs::write(&probe, b"ok")?;
            std::fs::remove_file(&probe)
        })
        .is_ok();
    check("data dir", writable, storage.display().to_string());

    // port file / server state
    let port_file = config.port_file();
    match std::fs::read_to_string(&port_file) {
        Ok(text) => match text.trim().parse::<u16>() {
            Ok(port) => {
                let live = iteratr_events::LogClient::connect_with_timeout(
                    port,
                    Duration::from_millis(500),
                )
                .await
                .is_ok();
                check(
                    "log server",
                    true,
                    format!(
                        "port {port} ({})",
                        if live { "live" } else { "stale port file" }
                    ),
                );
            }
            Err(_) => check("log server", false, "unparseable port file".into()),
        },
        Err(_) => check("log server", true, "not running".into()),
    }

    // hooks file
    let workdir = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    match iteratr_hooks::load_hooks(&workdir) {
        Ok(hooks) if hooks.is_empty() => check("hooks file", true, "none configured".into()),
        Ok(_) => check("hooks file", true, "parsed".into()),
        Err(e) => check("hooks file", false, format!("{e:#}")),
    }

    // template override
    match read_template_override(&workdir) {
        Ok(None) => check("template", true, "built-in".into()),
        Ok(Some(_)) => check("template", true, "override parsed".into()),
        Err(e) => check("template", false, format!("{e:#}")),
    }

    // spec file
    let spec = PathBuf::from(&config.spec_path);
    check("spec file", spec.is_file(), spec.display().to_string());

    if failed {
        EXIT_VALIDATION_ERROR
    } else {
        EXIT_SUCCESS
    }
}

fn resolve_binary(command: &str) -> Option<PathBuf> {
    if command.contains('/') {
        let path = PathBuf::from(command);
        return path.is_file().then_some(path);
    }
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(command))
        .find(|candidate| candidate.is_file())
}

// ── Scaffolding ───────────────────────────────────────────────────────────────

pub fn scaffold_spec(config: &Config) -> i32 {
    let path = PathBuf::from(&config.spec_path);
    if path.exists() {
        write_stderr(&format!(
            "[iteratr:error] {} already exists, not overwriting",
            path.display()
        ));
        return EXIT_VALIDATION_ERROR;
    }
    if let Some(parent) = path.parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            write_stderr(&format!("[iteratr:error] creating {}: {e}", parent.display()));
            return EXIT_RUNTIME_ERROR;
        }
    }
    match std::fs::write(&path, SPEC_SKELETON) {
        Ok(()) => {
            write_progress(&format!("[iteratr:info] wrote {}", path.display()));
            EXIT_SUCCESS
        }
        Err(e) => {
            write_stderr(&format!("[iteratr:error] writing {}: {e}", path.display()));
            EXIT_RUNTIME_ERROR
        }
    }
}

pub fn gen_template() -> i32 {
    let path = PathBuf::from(TEMPLATE_FILE);
    if path.exists() {
        write_stderr(&format!(
            "[iteratr:error] {} already exists, not overwriting",
            path.display()
        ));
        return EXIT_VALIDATION_ERROR;
    }
    match std::fs::write(&path, DEFAULT_ITERATION_TEMPLATE) {
        Ok(()) => {
            write_progress(&format!("[iteratr:info] wrote {}", path.display()));
            EXIT_SUCCESS
        }
        Err(e) => {
            write_stderr(&format!("[iteratr:error] writing {}: {e}", path.display()));
            EXIT_RUNTIME_ERROR
        }
    }
}
