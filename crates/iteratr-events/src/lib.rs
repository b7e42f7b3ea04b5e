// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Embedded event log: a subject-keyed, append-only record store with prefix
//! scans, prefix purges, and live subscriptions.
//!
//! The log is served by a loopback TCP server speaking one JSON object per
//! line.  A session's whole history lives under the subject prefix
//! `iteratr.<session>.` and is totally ordered by server-assigned sequence
//! numbers.
//!
//! # Typical flow
//!
//! ```text
//! Client                              Server
//!    │                                   │
//!    │── {"op":"publish",subject,body} ─►│  append to JSONL, assign seq
//!    │◄─ {"ok":true,"seq":41} ───────────│  broadcast to subscribers
//!    │                                   │
//!    │── {"op":"scan","prefix":P} ──────►│
//!    │◄─ {"event":{...}} × N ────────────│  historical records in seq order
//!    │◄─ {"done":true} ──────────────────│
//!    │                                   │
//!    │── {"op":"subscribe",subject} ────►│  connection switches to push mode
//!    │◄─ {"event":{...}} ... ────────────│  until either side closes
//! ```

mod bootstrap;
mod client;
mod protocol;
mod server;
mod subject;

pub use bootstrap::{connect_or_spawn, LogBootstrap, LogRole};
pub use client::{LogClient, LogError, Subscription};
pub use protocol::EventRecord;
pub use server::{LogServer, RETENTION_DAYS};
pub use subject::{
    parse_subject, prefix_matches, session_prefix, subject, validate_session_name, EventKind,
};
