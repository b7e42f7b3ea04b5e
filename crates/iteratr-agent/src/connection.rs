// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::Path;
use std::process::Stdio;

use futures::StreamExt;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio_util::codec::{FramedRead, LinesCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::protocol::{
    CancelParams, ClientCapabilities, ContentBlock, FsCapabilities, InitializeParams,
    JsonRpcMessage, JsonRpcRequest, NewSessionParams, NewSessionResult, PromptParams,
    PromptResult, SessionNotification, SessionUpdate, SetModelParams, StopReason,
    PROTOCOL_VERSION,
};

const MAX_LINE_BYTES: usize = 16 * 1024 * 1024;

/// Agent connection failures.  RPC errors and crashes are kept distinct
/// because the orchestrator's recovery path treats them alike but reports
/// them differently.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    /// The agent answered the request with a JSON-RPC error.
    #[error("agent error {code}: {message}")]
    Rpc { code: i64, message: String },
    /// Child exit or stdio EOF mid-turn.
    #[error("agent crashed: {0}")]
    Crash(String),
    /// The response existed but did not have the promised shape.
    #[error("agent protocol error: {0}")]
    Protocol(String),
    /// Could not start the child process at all.
    #[error("failed to spawn agent: {0}")]
    Spawn(String),
    /// The orchestrator's context was cancelled mid-turn; the child has been
    /// killed.
    #[error("agent turn cancelled")]
    Cancelled,
}

impl AgentError {
    pub fn is_crash(&self) -> bool {
        matches!(self, AgentError::Crash(_))
    }
}

/// A single long-lived agent child process.
///
/// Exactly one request is in flight at a time: every method takes `&mut self`
/// and drains interleaved notifications until the matching response arrives.
pub struct AgentConnection {
    child: Child,
    stdin: ChildStdin,
    stdout: FramedRead<ChildStdout, LinesCodec>,
    next_id: u64,
    cancel: CancellationToken,
}

impl AgentConnection {
    /// Spawn the agent subprocess with stdio piped.  `envs` are exported to
    /// the child (session name, log port) so tools it shells out to can find
    /// the running session.  Stderr is forwarded to the log at debug level
    /// from its own task.
    pub async fn spawn(
        command: &str,
        args: &[String],
        workdir: &Path,
        envs: &[(String, String)],
        cancel: CancellationToken,
    ) -> Result<Self, AgentError> {
        debug!(command, ?args, "spawning agent");
        let mut child = Command::new(command)
            .args(args)
            .current_dir(workdir)
            .envs(envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| AgentError::Spawn(format!("{command}: {e}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| AgentError::Spawn("agent stdin not piped".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AgentError::Spawn("agent stdout not piped".into()))?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(target: "agent_stderr", "{line}");
                }
            });
        }

        Ok(Self {
            child,
            stdin,
            stdout: FramedRead::new(stdout, LinesCodec::new_with_max_length(MAX_LINE_BYTES)),
            next_id: 0,
            cancel,
        })
    }

    /// Protocol handshake; must be the first request on the connection.
    pub async fn initialize(&mut self) -> Result<(), AgentError> {
        let params = InitializeParams {
            protocol_version: PROTOCOL_VERSION,
            client_capabilities: ClientCapabilities {
                fs: FsCapabilities {
                    read_text_file: true,
                    write_text_file: true,
                },
            },
        };
        self.request("initialize", to_params(&params)?, &mut |_| {})
            .await?;
        Ok(())
    }

    /// Create the agent-side session rooted at `cwd`; returns the agent's
    /// session ID for use in subsequent prompts.
    pub async fn new_session(&mut self, cwd: &Path) -> Result<String, AgentError> {
        let params = NewSessionParams {
            cwd: cwd.to_string_lossy().into_owned(),
        };
        let result = self
            .request("session/new", to_params(&params)?, &mut |_| {})
            .await?;
        let parsed: NewSessionResult = serde_json::from_value(result)
            .map_err(|e| AgentError::Protocol(format!("session/new result: {e}")))?;
        Ok(parsed.session_id)
    }

    pub async fn set_model(&mut self, session_id: &str, model_id: &str) -> Result<(), AgentError> {
        let params = SetModelParams {
            session_id,
            model_id,
        };
        self.request("session/set_model", to_params(&params)?, &mut |_| {})
            .await?;
        Ok(())
    }

    /// Send one prompt turn.  `on_update` observes every streamed
    /// `session/update` notification; the call returns once the response
    /// (carrying the stop reason) has arrived, after all notifications.
    pub async fn prompt(
        &mut self,
        session_id: &str,
        content: &[ContentBlock],
        on_update: &mut dyn FnMut(SessionUpdate),
    ) -> Result<StopReason, AgentError> {
        let params = PromptParams {
            session_id,
            content,
        };
        let result = self
            .request("session/prompt", to_params(&params)?, on_update)
            .await?;
        let parsed: PromptResult = serde_json::from_value(result)
            .map_err(|e| AgentError::Protocol(format!("session/prompt result: {e}")))?;
        Ok(parsed.stop_reason)
    }

    /// Close stdio, kill the child, and reap it.  Best-effort `session/cancel`
    /// is sent first so a well-behaved agent can stop cleanly.
    pub async fn stop(mut self, session_id: Option<&str>) {
        if let Some(id) = session_id {
            let notification = serde_json::json!({
                "jsonrpc": "2.0",
                "method": "session/cancel",
                "params": CancelParams { session_id: id },
            });
            let _ = self.write_line(&notification.to_string()).await;
        }
        let _ = self.stdin.shutdown().await;
        if let Err(e) = self.child.kill().await {
            debug!(error = %e, "agent child already gone");
        }
        let _ = self.child.wait().await;
    }

    // ── Internals ─────────────────────────────────────────────────────────────

    async fn request(
        &mut self,
        method: &str,
        params: serde_json::Value,
        on_update: &mut dyn FnMut(SessionUpdate),
    ) -> Result<serde_json::Value, AgentError> {
        self.next_id += 1;
        let id = self.next_id;
        let request = JsonRpcRequest {
            jsonrpc: "2.0",
            id,
            method,
            params,
        };
        let line = serde_json::to_string(&request)
            .map_err(|e| AgentError::Protocol(format!("encoding {method}: {e}")))?;
        self.write_line(&line).await?;

        loop {
            let line = tokio::select! {
                _ = self.cancel.cancelled() => {
                    let _ = self.child.kill().await;
                    return Err(AgentError::Cancelled);
                }
                next = self.stdout.next() => match next {
                    Some(Ok(line)) => line,
                    Some(Err(e)) => return Err(AgentError::Crash(format!("stdout read: {e}"))),
                    None => return Err(AgentError::Crash(format!(
                        "stdio closed while waiting for {method} response"
                    ))),
                },
            };

            let message: JsonRpcMessage = match serde_json::from_str(&line) {
                Ok(msg) => msg,
                Err(e) => {
                    // parse errors on stream content are logged and skipped
                    warn!(error = %e, "unparseable line from agent");
                    continue;
                }
            };

            match (message.id, message.method.as_deref()) {
                (Some(rid), _) if rid == id => {
                    if let Some(err) = message.error {
                        return Err(AgentError::Rpc {
                            code: err.code,
                            message: err.message,
                        });
                    }
                    return Ok(message.result.unwrap_or(serde_json::Value::Null));
                }
                (Some(rid), _) => {
                    warn!(expected = id, got = rid, "response for unknown request id");
                }
                (None, Some("session/update")) => {
                    let params = message.params.unwrap_or(serde_json::Value::Null);
                    match serde_json::from_value::<SessionNotification>(params) {
                        Ok(notification) => on_update(notification.update),
                        Err(e) => debug!(error = %e, "ignoring unknown session update"),
                    }
                }
                (None, Some(other)) => {
                    debug!(method = other, "ignoring unknown notification");
                }
                (None, None) => {
                    debug!("ignoring message with neither id nor method");
                }
            }
        }
    }

    async fn write_line(&mut self, line: &str) -> Result<(), AgentError> {
        self.stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| AgentError::Crash(format!("stdin write: {e}")))?;
        self.stdin
            .write_all(b"\n")
            .await
            .map_err(|e| AgentError::Crash(format!("stdin write: {e}")))?;
        self.stdin
            .flush()
            .await
            .map_err(|e| AgentError::Crash(format!("stdin flush: {e}")))
    }
}

fn to_params<T: serde::Serialize>(params: &T) -> Result<serde_json::Value, AgentError> {
    serde_json::to_value(params).map_err(|e| AgentError::Protocol(format!("params: {e}")))
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    /// A scripted fake agent: a shell loop that answers the fixed request
    /// sequence our client produces (ids 1, 2, 3, ...).
    fn fake_agent(script: &str) -> (String, Vec<String>) {
        ("sh".to_string(), vec!["-c".to_string(), script.to_string()])
    }

    const HANDSHAKE: &str = r#"
read _init
echo '{"jsonrpc":"2.0","id":1,"result":{"protocolVersion":1}}'
read _new
echo '{"jsonrpc":"2.0","id":2,"result":{"sessionId":"sess-1"}}'
"#;

    async fn connect(script: &str) -> AgentConnection {
        let (cmd, args) = fake_agent(script);
        let dir = std::env::temp_dir();
        AgentConnection::spawn(&cmd, &args, &dir, &[], CancellationToken::new())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn handshake_returns_session_id() {
        let mut conn = connect(HANDSHAKE).await;
        conn.initialize().await.unwrap();
        let session = conn.new_session(Path::new("/tmp")).await.unwrap();
        assert_eq!(session, "sess-1");
        conn.stop(Some("sess-1")).await;
    }

    #[tokio::test]
    async fn prompt_streams_updates_before_response() {
        let script = format!(
            "{HANDSHAKE}
read _prompt
echo '{{\"jsonrpc\":\"2.0\",\"method\":\"session/update\",\"params\":{{\"sessionId\":\"sess-1\",\"update\":{{\"sessionUpdate\":\"agent_message_chunk\",\"content\":{{\"type\":\"text\",\"text\":\"hi\"}}}}}}}}'
echo '{{\"jsonrpc\":\"2.0\",\"method\":\"session/update\",\"params\":{{\"sessionId\":\"sess-1\",\"update\":{{\"sessionUpdate\":\"agent_thought_chunk\",\"content\":{{\"type\":\"text\",\"text\":\"mull\"}}}}}}}}'
echo '{{\"jsonrpc\":\"2.0\",\"id\":3,\"result\":{{\"stopReason\":\"end_turn\"}}}}'
"
        );
        let mut conn = connect(&script).await;
        conn.initialize().await.unwrap();
        let session = conn.new_session(Path::new("/tmp")).await.unwrap();

        let mut texts = Vec::new();
        let mut thoughts = Vec::new();
        let stop = conn
            .prompt(&session, &[ContentBlock::text("go")], &mut |update| {
                match update {
                    SessionUpdate::AgentMessageChunk {
                        content: ContentBlock::Text { text },
                    } => texts.push(text),
                    SessionUpdate::AgentThoughtChunk {
                        content: ContentBlock::Text { text },
                    } => thoughts.push(text),
                    _ => {}
                }
            })
            .await
            .unwrap();

        assert_eq!(stop, StopReason::EndTurn);
        assert_eq!(texts, vec!["hi"]);
        assert_eq!(thoughts, vec!["mull"]);
        conn.stop(None).await;
    }

    #[tokio::test]
    async fn rpc_error_is_agent_error_not_crash() {
        let script = format!(
            "{HANDSHAKE}
read _prompt
echo '{{\"jsonrpc\":\"2.0\",\"id\":3,\"error\":{{\"code\":-32000,\"message\":\"model overloaded\"}}}}'
"
        );
        let mut conn = connect(&script).await;
        conn.initialize().await.unwrap();
        let session = conn.new_session(Path::new("/tmp")).await.unwrap();

        let err = conn
            .prompt(&session, &[ContentBlock::text("go")], &mut |_| {})
            .await
            .unwrap_err();
        match err {
            AgentError::Rpc { code, message } => {
                assert_eq!(code, -32000);
                assert!(message.contains("overloaded"));
            }
            other => panic!("expected Rpc error, got {other:?}"),
        }
        conn.stop(None).await;
    }

    #[tokio::test]
    async fn eof_mid_turn_is_crash() {
        // agent exits right after the handshake
        let mut conn = connect(HANDSHAKE).await;
        conn.initialize().await.unwrap();
        let session = conn.new_session(Path::new("/tmp")).await.unwrap();

        let err = conn
            .prompt(&session, &[ContentBlock::text("go")], &mut |_| {})
            .await
            .unwrap_err();
        assert!(err.is_crash(), "expected crash, got {err:?}");
        conn.stop(None).await;
    }

    #[tokio::test]
    async fn garbage_lines_are_skipped() {
        let script = format!(
            "{HANDSHAKE}
read _prompt
echo 'this is not json'
echo '{{\"jsonrpc\":\"2.0\",\"id\":3,\"result\":{{\"stopReason\":\"end_turn\"}}}}'
"
        );
        let mut conn = connect(&script).await;
        conn.initialize().await.unwrap();
        let session = conn.new_session(Path::new("/tmp")).await.unwrap();
        let stop = conn
            .prompt(&session, &[ContentBlock::text("go")], &mut |_| {})
            .await
            .unwrap();
        assert_eq!(stop, StopReason::EndTurn);
        conn.stop(None).await;
    }

    #[tokio::test]
    async fn cancellation_kills_the_turn() {
        // agent never answers the prompt
        let script = format!("{HANDSHAKE}\nread _prompt\nsleep 60\n");
        let cancel = CancellationToken::new();
        let (cmd, args) = fake_agent(&script);
        let mut conn = AgentConnection::spawn(
            &cmd,
            &args,
            &std::env::temp_dir(),
            &[],
            cancel.clone(),
        )
        .await
        .unwrap();
        conn.initialize().await.unwrap();
        let session = conn.new_session(Path::new("/tmp")).await.unwrap();

        let canceller = tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            cancel.cancel();
        });
        let err = conn
            .prompt(&session, &[ContentBlock::text("go")], &mut |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Cancelled));
        canceller.await.unwrap();
        conn.stop(None).await;
    }
}
