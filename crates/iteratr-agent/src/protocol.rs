// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Wire types for the agent's line-delimited JSON-RPC 2.0 protocol.
//!
//! One message per `\n`-terminated line.  Requests carry monotonically
//! assigned integer IDs; responses echo the ID; notifications have no ID.
//! Streamed `session/update` notifications interleave with the response to
//! the in-flight request.

use serde::{Deserialize, Serialize};

pub const PROTOCOL_VERSION: u32 = 1;

// ── JSON-RPC envelope ─────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub(crate) struct JsonRpcRequest<'a> {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: &'a str,
    pub params: serde_json::Value,
}

/// Any inbound message: a response (has `id`) or a notification (has
/// `method`, no `id`).
#[derive(Debug, Deserialize)]
pub(crate) struct JsonRpcMessage {
    pub id: Option<u64>,
    pub result: Option<serde_json::Value>,
    pub error: Option<JsonRpcErrorBody>,
    pub method: Option<String>,
    pub params: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcErrorBody {
    pub code: i64,
    pub message: String,
}

// ── Request/response payloads ─────────────────────────────────────────────────

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct InitializeParams {
    pub protocol_version: u32,
    pub client_capabilities: ClientCapabilities,
}

#[derive(Debug, Serialize)]
pub(crate) struct ClientCapabilities {
    pub fs: FsCapabilities,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct FsCapabilities {
    pub read_text_file: bool,
    pub write_text_file: bool,
}

#[derive(Debug, Serialize)]
pub(crate) struct NewSessionParams {
    pub cwd: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct NewSessionResult {
    pub session_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct SetModelParams<'a> {
    pub session_id: &'a str,
    pub model_id: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct PromptParams<'a> {
    pub session_id: &'a str,
    pub content: &'a [ContentBlock],
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct PromptResult {
    pub stop_reason: StopReason,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct CancelParams<'a> {
    pub session_id: &'a str,
}

/// An ordered prompt block.  The orchestrator sends hook output, queued user
/// messages, and the primary prompt as separate blocks so the agent can tell
/// their roles apart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text { text: String },
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        ContentBlock::Text { text: text.into() }
    }
}

/// Why the agent ended the turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndTurn,
    MaxTokens,
    Cancelled,
    Refusal,
    MaxTurnRequests,
}

// ── Streamed session updates ──────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct SessionNotification {
    #[allow(dead_code)]
    pub session_id: Option<String>,
    pub update: SessionUpdate,
}

/// One streamed update, discriminated by `sessionUpdate`.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "sessionUpdate", rename_all = "snake_case")]
pub enum SessionUpdate {
    AgentMessageChunk {
        content: ContentBlock,
    },
    AgentThoughtChunk {
        content: ContentBlock,
    },
    #[serde(rename_all = "camelCase")]
    ToolCall {
        tool_call_id: String,
        #[serde(default)]
        title: String,
        #[serde(default)]
        kind: String,
        #[serde(default)]
        status: ToolCallStatus,
        #[serde(default)]
        raw_input: serde_json::Value,
    },
    #[serde(rename_all = "camelCase")]
    ToolCallUpdate {
        tool_call_id: String,
        status: ToolCallStatus,
        #[serde(default)]
        raw_input: serde_json::Value,
        #[serde(default)]
        content: Vec<ToolCallContent>,
    },
    AvailableCommandsUpdate {},
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ToolCallStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Error,
    Canceled,
    /// Anything the protocol grows later; never tracked.
    Unknown,
}

impl<'de> Deserialize<'de> for ToolCallStatus {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Ok(match raw.as_str() {
            "pending" => ToolCallStatus::Pending,
            "in_progress" => ToolCallStatus::InProgress,
            "completed" => ToolCallStatus::Completed,
            "error" => ToolCallStatus::Error,
            "canceled" => ToolCallStatus::Canceled,
            _ => ToolCallStatus::Unknown,
        })
    }
}

/// Content blocks attached to a tool-call update.  Only diff blocks matter
/// for file tracking; everything else is tolerated and ignored.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolCallContent {
    #[serde(rename_all = "camelCase")]
    Diff {
        path: String,
        #[serde(default)]
        old_text: Option<String>,
        new_text: String,
    },
    #[serde(other)]
    Other,
}

/// A file edit extracted from a completed edit tool call.
#[derive(Debug, Clone, PartialEq)]
pub struct FileEdit {
    pub path: String,
    pub is_new: bool,
    pub additions: u32,
    pub deletions: u32,
}

/// Extract file edits from the diff blocks of a completed edit tool call.
///
/// Adds/deletes are the agent-reported delta line counts; no further diffing
/// is done here.
pub fn extract_file_edits(content: &[ToolCallContent]) -> Vec<FileEdit> {
    content
        .iter()
        .filter_map(|block| match block {
            ToolCallContent::Diff {
                path,
                old_text,
                new_text,
            } => {
                let old = old_text.as_deref().unwrap_or("");
                Some(FileEdit {
                    path: path.clone(),
                    is_new: old.is_empty(),
                    additions: count_lines(new_text),
                    deletions: count_lines(old),
                })
            }
            ToolCallContent::Other => None,
        })
        .collect()
}

fn count_lines(text: &str) -> u32 {
    if text.is_empty() {
        0
    } else {
        text.lines().count() as u32
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_params_wire_shape() {
        let blocks = vec![ContentBlock::text("hello")];
        let params = PromptParams {
            session_id: "s1",
            content: &blocks,
        };
        let v = serde_json::to_value(&params).unwrap();
        assert_eq!(v["sessionId"], "s1");
        assert_eq!(v["content"][0]["type"], "text");
        assert_eq!(v["content"][0]["text"], "hello");
    }

    #[test]
    fn stop_reason_parses_snake_case() {
        let r: PromptResult = serde_json::from_value(serde_json::json!({
            "stopReason": "max_turn_requests"
        }))
        .unwrap();
        assert_eq!(r.stop_reason, StopReason::MaxTurnRequests);
    }

    #[test]
    fn message_chunk_update_parses() {
        let update: SessionUpdate = serde_json::from_value(serde_json::json!({
            "sessionUpdate": "agent_message_chunk",
            "content": {"type": "text", "text": "working on it"}
        }))
        .unwrap();
        match update {
            SessionUpdate::AgentMessageChunk {
                content: ContentBlock::Text { text },
            } => assert_eq!(text, "working on it"),
            other => panic!("unexpected update {other:?}"),
        }
    }

    #[test]
    fn tool_call_update_with_diff_parses() {
        let update: SessionUpdate = serde_json::from_value(serde_json::json!({
            "sessionUpdate": "tool_call_update",
            "toolCallId": "call-1",
            "status": "completed",
            "content": [
                {"type": "diff", "path": "src/lib.rs", "oldText": "a\nb\n", "newText": "a\nb\nc\n"},
                {"type": "content", "whatever": true}
            ]
        }))
        .unwrap();
        let SessionUpdate::ToolCallUpdate {
            status, content, ..
        } = update
        else {
            panic!("expected tool_call_update");
        };
        assert_eq!(status, ToolCallStatus::Completed);
        let edits = extract_file_edits(&content);
        assert_eq!(edits.len(), 1);
        assert_eq!(edits[0].path, "src/lib.rs");
        assert!(!edits[0].is_new);
        assert_eq!(edits[0].additions, 3);
        assert_eq!(edits[0].deletions, 2);
    }

    #[test]
    fn missing_old_text_marks_file_as_new() {
        let content = vec![ToolCallContent::Diff {
            path: "README.md".into(),
            old_text: None,
            new_text: "# Title\n".into(),
        }];
        let edits = extract_file_edits(&content);
        assert!(edits[0].is_new);
        assert_eq!(edits[0].deletions, 0);
    }

    #[test]
    fn unknown_tool_status_is_tolerated() {
        let status: ToolCallStatus = serde_json::from_str("\"something_new\"").unwrap();
        assert_eq!(status, ToolCallStatus::Unknown);
    }

    #[test]
    fn available_commands_update_parses_as_ignorable() {
        let update: SessionUpdate = serde_json::from_value(serde_json::json!({
            "sessionUpdate": "available_commands_update",
            "availableCommands": []
        }))
        .unwrap();
        assert!(matches!(update, SessionUpdate::AvailableCommandsUpdate {}));
    }
}
