// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};

use anyhow::bail;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::HookConfig;
use crate::vars::expand_vars;

/// Result of one hook command.
#[derive(Debug, Clone)]
pub struct HookOutcome {
    pub output: String,
    pub duration: Duration,
    pub failed: bool,
}

/// Progress callbacks for the front-end.  All methods default to no-ops.
pub trait HookObserver: Send {
    fn on_start(&mut self, _index: usize, _command: &str) {}
    fn on_complete(&mut self, _index: usize, _outcome: &HookOutcome) {}
}

/// Observer that reports nothing.
pub struct NullObserver;

impl HookObserver for NullObserver {}

/// Run every hook of `group` in order and return the combined output of all
/// of them, joined by blank lines.
///
/// Failures (non-zero exit, timeout) are captured into the output with a
/// marker and never abort the run; only cancellation of `cancel` raises.
pub async fn execute_all(
    cancel: &CancellationToken,
    group: &[HookConfig],
    workdir: &Path,
    vars: &HashMap<String, String>,
    observer: &mut dyn HookObserver,
) -> anyhow::Result<String> {
    let outcomes = run_group(cancel, group, workdir, vars, observer).await?;
    Ok(join_outputs(
        outcomes.iter().map(|(_, outcome)| outcome.output.as_str()),
    ))
}

/// Like [`execute_all`], but the returned string contains only the outputs
/// of hooks with `pipe_output = true`.  Non-piped hooks still run for their
/// side effects.
pub async fn execute_all_piped(
    cancel: &CancellationToken,
    group: &[HookConfig],
    workdir: &Path,
    vars: &HashMap<String, String>,
    observer: &mut dyn HookObserver,
) -> anyhow::Result<String> {
    let outcomes = run_group(cancel, group, workdir, vars, observer).await?;
    Ok(join_outputs(outcomes.iter().filter_map(|(hook, outcome)| {
        hook.pipe_output.then_some(outcome.output.as_str())
    })))
}

async fn run_group<'a>(
    cancel: &CancellationToken,
    group: &'a [HookConfig],
    workdir: &Path,
    vars: &HashMap<String, String>,
    observer: &mut dyn HookObserver,
) -> anyhow::Result<Vec<(&'a HookConfig, HookOutcome)>> {
    let mut outcomes = Vec::with_capacity(group.len());
    for (index, hook) in group.iter().enumerate() {
        let command = expand_vars(&hook.command, vars);
        observer.on_start(index, &command);
        let outcome = run_hook(cancel, &command, hook.timeout, workdir).await?;
        observer.on_complete(index, &outcome);
        outcomes.push((hook, outcome));
    }
    Ok(outcomes)
}

/// Run one command under `sh -c`, capturing stdout and stderr.  On timeout
/// the process is killed and the partial stdout is returned with a marker.
async fn run_hook(
    cancel: &CancellationToken,
    command: &str,
    timeout_secs: u64,
    workdir: &Path,
) -> anyhow::Result<HookOutcome> {
    debug!(command, timeout_secs, "running hook");
    let start = Instant::now();

    let mut child = match Command::new("sh")
        .arg("-c")
        .arg(command)
        .current_dir(workdir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
    {
        Ok(child) => child,
        Err(e) => {
            // spawn failure degrades like any other hook failure
            return Ok(HookOutcome {
                output: format!("[hook failed to start: {e}]"),
                duration: start.elapsed(),
                failed: true,
            });
        }
    };

    // Readers are detached so partial output survives a kill.
    let mut stdout_pipe = child.stdout.take();
    let mut stderr_pipe = child.stderr.take();
    let stdout_task = tokio::spawn(async move {
        let mut buf = String::new();
        if let Some(pipe) = stdout_pipe.as_mut() {
            let _ = pipe.read_to_string(&mut buf).await;
        }
        buf
    });
    let stderr_task = tokio::spawn(async move {
        let mut buf = String::new();
        if let Some(pipe) = stderr_pipe.as_mut() {
            let _ = pipe.read_to_string(&mut buf).await;
        }
        buf
    });

    tokio::select! {
        _ = cancel.cancelled() => {
            let _ = child.kill().await;
            bail!("hook execution cancelled");
        }
        _ = tokio::time::sleep(Duration::from_secs(timeout_secs)) => {
            let _ = child.kill().await;
            let partial = stdout_task.await.unwrap_or_default();
            let mut output = partial;
            if !output.is_empty() && !output.ends_with('\n') {
                output.push('\n');
            }
            output.push_str(&format!("[hook timed out after {timeout_secs}s]"));
            Ok(HookOutcome { output, duration: start.elapsed(), failed: true })
        }
        status = child.wait() => {
            let stdout = stdout_task.await.unwrap_or_default();
            let stderr = stderr_task.await.unwrap_or_default();
            let mut output = stdout.trim_end().to_string();
            let failed = match status {
                Ok(status) if status.success() => false,
                Ok(status) => {
                    let code = status.code().unwrap_or(-1);
                    if !output.is_empty() {
                        output.push('\n');
                    }
                    output.push_str(&format!("[exit {code}]"));
                    if !stderr.trim().is_empty() {
                        output.push_str("\n[stderr]\n");
                        output.push_str(stderr.trim_end());
                    }
                    true
                }
                Err(e) => {
                    if !output.is_empty() {
                        output.push('\n');
                    }
                    output.push_str(&format!("[hook wait failed: {e}]"));
                    true
                }
            };
            Ok(HookOutcome { output, duration: start.elapsed(), failed })
        }
    }
}

fn join_outputs<'a>(outputs: impl Iterator<Item = &'a str>) -> String {
    outputs
        .map(str::trim_end)
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("\n\n")
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn hook(command: &str, timeout: u64, pipe_output: bool) -> HookConfig {
        HookConfig {
            command: command.into(),
            timeout,
            pipe_output,
        }
    }

    fn no_vars() -> HashMap<String, String> {
        HashMap::new()
    }

    struct Recording {
        started: Vec<String>,
        completed: Vec<bool>,
    }

    impl HookObserver for Recording {
        fn on_start(&mut self, _index: usize, command: &str) {
            self.started.push(command.to_string());
        }
        fn on_complete(&mut self, _index: usize, outcome: &HookOutcome) {
            self.completed.push(outcome.failed);
        }
    }

    #[tokio::test]
    async fn captures_stdout_of_each_hook() {
        let cancel = CancellationToken::new();
        let group = vec![hook("echo one", 5, true), hook("echo two", 5, true)];
        let out = execute_all(&cancel, &group, Path::new("."), &no_vars(), &mut NullObserver)
            .await
            .unwrap();
        assert_eq!(out, "one\n\ntwo");
    }

    #[tokio::test]
    async fn piped_filter_keeps_only_flagged_hooks() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("side-effect");
        let group = vec![
            hook(&format!("touch {}", marker.display()), 5, false),
            hook("echo piped-only", 5, true),
        ];
        let cancel = CancellationToken::new();
        let out = execute_all_piped(&cancel, &group, dir.path(), &no_vars(), &mut NullObserver)
            .await
            .unwrap();
        assert_eq!(out, "piped-only");
        // the non-piped hook still executed
        assert!(marker.exists());
    }

    #[tokio::test]
    async fn template_vars_expand_in_command() {
        let cancel = CancellationToken::new();
        let vars: HashMap<String, String> = [
            ("session".to_string(), "s1".to_string()),
            ("iteration".to_string(), "4".to_string()),
        ]
        .into();
        let group = vec![hook("echo {{session}}/{{iteration}}", 5, true)];
        let out = execute_all(&cancel, &group, Path::new("."), &vars, &mut NullObserver)
            .await
            .unwrap();
        assert_eq!(out, "s1/4");
    }

    #[tokio::test]
    async fn non_zero_exit_appends_stderr_and_marker() {
        let cancel = CancellationToken::new();
        let group = vec![hook("echo partial; echo oops >&2; exit 3", 5, true)];
        let out = execute_all(&cancel, &group, Path::new("."), &no_vars(), &mut NullObserver)
            .await
            .unwrap();
        assert!(out.contains("partial"));
        assert!(out.contains("[exit 3]"));
        assert!(out.contains("[stderr]"));
        assert!(out.contains("oops"));
    }

    #[tokio::test]
    async fn timeout_kills_and_keeps_partial_output() {
        let cancel = CancellationToken::new();
        let group = vec![hook("echo early; sleep 30", 1, true)];
        let start = Instant::now();
        let out = execute_all(&cancel, &group, Path::new("."), &no_vars(), &mut NullObserver)
            .await
            .unwrap();
        assert!(start.elapsed() < Duration::from_secs(10));
        assert!(out.contains("early"));
        assert!(out.contains("[hook timed out after 1s]"));
    }

    #[tokio::test]
    async fn cancellation_propagates_as_error() {
        let cancel = CancellationToken::new();
        let group = vec![hook("sleep 30", 60, true)];
        let cancel2 = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            cancel2.cancel();
        });
        let err = execute_all(&cancel, &group, Path::new("."), &no_vars(), &mut NullObserver)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("cancelled"));
    }

    #[tokio::test]
    async fn observer_sees_expanded_commands_and_outcomes() {
        let cancel = CancellationToken::new();
        let vars: HashMap<String, String> = [("error".to_string(), "boom".to_string())].into();
        let group = vec![hook("echo {{error}}", 5, false), hook("false", 5, false)];
        let mut observer = Recording {
            started: Vec::new(),
            completed: Vec::new(),
        };
        execute_all(&cancel, &group, Path::new("."), &vars, &mut observer)
            .await
            .unwrap();
        assert_eq!(observer.started, vec!["echo boom", "false"]);
        assert_eq!(observer.completed, vec![false, true]);
    }

    #[tokio::test]
    async fn empty_group_returns_empty_string() {
        let cancel = CancellationToken::new();
        let out = execute_all(&cancel, &[], Path::new("."), &no_vars(), &mut NullObserver)
            .await
            .unwrap();
        assert!(out.is_empty());
    }
}
