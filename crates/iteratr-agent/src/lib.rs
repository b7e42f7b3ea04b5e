// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Connection to the external coding agent: a child process speaking
//! line-delimited JSON-RPC 2.0 over stdio, with streamed `session/update`
//! notifications interleaved with each in-flight request.

mod connection;
mod protocol;

pub use connection::{AgentConnection, AgentError};
pub use protocol::{
    extract_file_edits, ContentBlock, FileEdit, SessionUpdate, StopReason, ToolCallContent,
    ToolCallStatus, PROTOCOL_VERSION,
};
