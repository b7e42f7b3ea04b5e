// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A durable event as stored and served by the log.
///
/// `seq` is assigned by the server and strictly increases across all
/// subjects; within one session it totally orders the history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub seq: u64,
    pub published_at: DateTime<Utc>,
    pub subject: String,
    pub body: serde_json::Value,
}

// ── Client → server ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub(crate) enum Request {
    Publish {
        subject: String,
        body: serde_json::Value,
    },
    Scan {
        prefix: String,
    },
    Subscribe {
        subject: String,
    },
    Purge {
        prefix: String,
    },
}

// ── Server → client ───────────────────────────────────────────────────────────

/// One reply line.  Exactly one of the optional fields is set per line.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct Reply {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ok: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event: Option<EventRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub done: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<WireError>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct WireError {
    /// "rejected" for permanent refusals; anything else is transport-level.
    pub kind: String,
    pub message: String,
}

impl Reply {
    pub fn ack(seq: u64) -> Self {
        Reply {
            ok: Some(true),
            seq: Some(seq),
            ..Default::default()
        }
    }

    pub fn ok() -> Self {
        Reply {
            ok: Some(true),
            ..Default::default()
        }
    }

    pub fn event(record: EventRecord) -> Self {
        Reply {
            event: Some(record),
            ..Default::default()
        }
    }

    pub fn done() -> Self {
        Reply {
            done: Some(true),
            ..Default::default()
        }
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Reply {
            error: Some(WireError {
                kind: "rejected".into(),
                message: message.into(),
            }),
            ..Default::default()
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
