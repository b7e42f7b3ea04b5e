// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_util::codec::{Framed, LinesCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::protocol::{EventRecord, Reply, Request};
use crate::subject::{parse_subject, prefix_matches};

/// Time-based retention applied when the server loads its storage file.
pub const RETENTION_DAYS: i64 = 30;

/// Bodies above this size are rejected as permanent errors.
const MAX_BODY_BYTES: usize = 256 * 1024;

/// Wire lines above this size indicate a broken client.
const MAX_LINE_BYTES: usize = 1024 * 1024;

// ── Storage ───────────────────────────────────────────────────────────────────

/// Append-only JSONL storage with in-memory replica.
///
/// The mutex around this struct is the linearization point for sequence
/// numbers: append happens under the lock, so seq order equals file order.
struct Storage {
    path: PathBuf,
    events: Vec<EventRecord>,
    next_seq: u64,
}

impl Storage {
    fn load(dir: &Path) -> anyhow::Result<Self> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("creating storage dir {}", dir.display()))?;
        let path = dir.join("events.jsonl");

        let mut events: Vec<EventRecord> = Vec::new();
        let mut dropped = 0usize;
        let cutoff = Utc::now() - chrono::Duration::days(RETENTION_DAYS);

        if path.is_file() {
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            for line in text.lines() {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<EventRecord>(line) {
                    Ok(rec) if rec.published_at >= cutoff => events.push(rec),
                    Ok(_) => dropped += 1,
                    Err(e) => {
                        warn!(error = %e, "skipping corrupt event record");
                        dropped += 1;
                    }
                }
            }
        }

        events.sort_by_key(|r| r.seq);
        let next_seq = events.last().map(|r| r.seq + 1).unwrap_or(1);

        let mut storage = Self { path, events, next_seq };
        if dropped > 0 {
            debug!(dropped, "compacting event storage after retention sweep");
            storage.rewrite()?;
        }
        Ok(storage)
    }

    fn append(&mut self, subject: String, body: serde_json::Value) -> anyhow::Result<EventRecord> {
        let record = EventRecord {
            seq: self.next_seq,
            published_at: Utc::now(),
            subject,
            body,
        };
        let mut line = serde_json::to_string(&record)?;
        line.push('\n');

        use std::io::Write;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("opening {}", self.path.display()))?;
        file.write_all(line.as_bytes())?;

        self.next_seq += 1;
        self.events.push(record.clone());
        Ok(record)
    }

    fn scan(&self, prefix: &str) -> Vec<EventRecord> {
        self.events
            .iter()
            .filter(|r| prefix_matches(prefix, &r.subject))
            .cloned()
            .collect()
    }

    fn purge(&mut self, prefix: &str) -> anyhow::Result<()> {
        let before = self.events.len();
        self.events.retain(|r| !prefix_matches(prefix, &r.subject));
        if self.events.len() != before {
            self.rewrite()?;
        }
        Ok(())
    }

    fn rewrite(&mut self) -> anyhow::Result<()> {
        let mut out = String::new();
        for rec in &self.events {
            out.push_str(&serde_json::to_string(rec)?);
            out.push('\n');
        }
        std::fs::write(&self.path, out)
            .with_context(|| format!("rewriting {}", self.path.display()))
    }
}

// ── Server ────────────────────────────────────────────────────────────────────

/// The embedded log server.  Binds an ephemeral loopback port; the primary
/// orchestrator writes that port to the port file.
pub struct LogServer {
    port: u16,
    cancel: CancellationToken,
    task: tokio::task::JoinHandle<()>,
}

impl LogServer {
    pub async fn start(storage_dir: &Path) -> anyhow::Result<Self> {
        let storage = Arc::new(Mutex::new(Storage::load(storage_dir)?));
        let (publish_tx, _) = broadcast::channel::<EventRecord>(1024);

        let listener = TcpListener::bind(("127.0.0.1", 0))
            .await
            .context("binding log server")?;
        let port = listener.local_addr()?.port();
        debug!(port, "event log server listening");

        let cancel = CancellationToken::new();
        let accept_cancel = cancel.clone();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = accept_cancel.cancelled() => break,
                    accepted = listener.accept() => {
                        let (stream, peer) = match accepted {
                            Ok(pair) => pair,
                            Err(e) => {
                                warn!(error = %e, "accept failed");
                                continue;
                            }
                        };
                        debug!(%peer, "log client connected");
                        let storage = storage.clone();
                        let publish_tx = publish_tx.clone();
                        let conn_cancel = accept_cancel.child_token();
                        tokio::spawn(async move {
                            if let Err(e) =
                                serve_connection(stream, storage, publish_tx, conn_cancel).await
                            {
                                debug!(error = %e, "log connection ended with error");
                            }
                        });
                    }
                }
            }
        });

        Ok(Self { port, cancel, task })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Stop accepting, drop live connections, wait up to 5s for the accept
    /// loop to unwind.
    pub async fn shutdown(self) -> anyhow::Result<()> {
        self.cancel.cancel();
        match tokio::time::timeout(Duration::from_secs(5), self.task).await {
            Ok(joined) => joined.context("log server task panicked")?,
            Err(_) => warn!("log server did not stop within 5s"),
        }
        Ok(())
    }
}

// ── Connection handling ───────────────────────────────────────────────────────

async fn serve_connection(
    stream: TcpStream,
    storage: Arc<Mutex<Storage>>,
    publish_tx: broadcast::Sender<EventRecord>,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let mut framed = Framed::new(stream, LinesCodec::new_with_max_length(MAX_LINE_BYTES));

    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            next = framed.next() => match next {
                Some(line) => line?,
                None => return Ok(()),
            },
        };

        let request: Request = match serde_json::from_str(&line) {
            Ok(req) => req,
            Err(e) => {
                framed
                    .send(serde_json::to_string(&Reply::rejected(format!(
                        "malformed request: {e}"
                    )))?)
                    .await?;
                continue;
            }
        };

        match request {
            Request::Publish { subject, body } => {
                let reply = handle_publish(&storage, &publish_tx, subject, body);
                framed.send(serde_json::to_string(&reply)?).await?;
            }
            Request::Scan { prefix } => {
                // Snapshot under the lock, stream outside it.
                let records = storage
                    .lock()
                    .expect("storage mutex poisoned")
                    .scan(&prefix);
                for rec in records {
                    framed.send(serde_json::to_string(&Reply::event(rec))?).await?;
                }
                framed.send(serde_json::to_string(&Reply::done())?).await?;
            }
            Request::Purge { prefix } => {
                let result = storage
                    .lock()
                    .expect("storage mutex poisoned")
                    .purge(&prefix);
                let reply = match result {
                    Ok(()) => Reply::ok(),
                    Err(e) => Reply::rejected(format!("purge failed: {e}")),
                };
                framed.send(serde_json::to_string(&reply)?).await?;
            }
            Request::Subscribe { subject } => {
                // The connection switches to push mode until the client
                // disconnects; no further requests are read from it.
                return pump_subscription(framed, publish_tx.subscribe(), subject, cancel).await;
            }
        }
    }
}

fn handle_publish(
    storage: &Arc<Mutex<Storage>>,
    publish_tx: &broadcast::Sender<EventRecord>,
    subject: String,
    body: serde_json::Value,
) -> Reply {
    if parse_subject(&subject).is_none() {
        return Reply::rejected(format!("invalid subject {subject:?}"));
    }
    let body_len = body.to_string().len();
    if body_len > MAX_BODY_BYTES {
        return Reply::rejected(format!("body too large ({body_len} bytes)"));
    }

    let appended = storage
        .lock()
        .expect("storage mutex poisoned")
        .append(subject, body);
    match appended {
        Ok(record) => {
            let seq = record.seq;
            // No subscribers is fine; send only fails when the channel is empty.
            let _ = publish_tx.send(record);
            Reply::ack(seq)
        }
        Err(e) => Reply::rejected(format!("append failed: {e}")),
    }
}

async fn pump_subscription(
    mut framed: Framed<TcpStream, LinesCodec>,
    mut rx: broadcast::Receiver<EventRecord>,
    subject: String,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            // Detect client disconnect.
            next = framed.next() => {
                if next.is_none() {
                    return Ok(());
                }
            }
            received = rx.recv() => match received {
                Ok(record) => {
                    if prefix_matches(&subject, &record.subject) {
                        framed.send(serde_json::to_string(&Reply::event(record))?).await?;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(missed = n, "subscriber lagged behind publish stream");
                }
                Err(broadcast::error::RecvError::Closed) => return Ok(()),
            },
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn record(seq: u64, subject: &str, days_old: i64) -> EventRecord {
        EventRecord {
            seq,
            published_at: Utc::now() - chrono::Duration::days(days_old),
            subject: subject.into(),
            body: serde_json::json!({"n": seq}),
        }
    }

    fn write_records(dir: &Path, records: &[EventRecord]) {
        let mut out = String::new();
        for r in records {
            out.push_str(&serde_json::to_string(r).unwrap());
            out.push('\n');
        }
        std::fs::write(dir.join("events.jsonl"), out).unwrap();
    }

    #[test]
    fn load_assigns_next_seq_after_highest() {
        let dir = tempfile::tempdir().unwrap();
        write_records(
            dir.path(),
            &[record(1, "iteratr.s.task", 0), record(5, "iteratr.s.note", 0)],
        );
        let storage = Storage::load(dir.path()).unwrap();
        assert_eq!(storage.next_seq, 6);
        assert_eq!(storage.events.len(), 2);
    }

    #[test]
    fn load_drops_records_past_retention() {
        let dir = tempfile::tempdir().unwrap();
        write_records(
            dir.path(),
            &[
                record(1, "iteratr.s.task", RETENTION_DAYS + 1),
                record(2, "iteratr.s.task", 0),
            ],
        );
        let storage = Storage::load(dir.path()).unwrap();
        assert_eq!(storage.events.len(), 1);
        assert_eq!(storage.events[0].seq, 2);

        // compaction rewrote the file: a fresh load sees only the kept record
        let again = Storage::load(dir.path()).unwrap();
        assert_eq!(again.events.len(), 1);
    }

    #[test]
    fn append_assigns_increasing_seq_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let mut storage = Storage::load(dir.path()).unwrap();
        let a = storage
            .append("iteratr.s.task".into(), serde_json::json!({"a": 1}))
            .unwrap();
        let b = storage
            .append("iteratr.s.note".into(), serde_json::json!({"b": 2}))
            .unwrap();
        assert!(b.seq > a.seq);

        let reloaded = Storage::load(dir.path()).unwrap();
        assert_eq!(reloaded.events.len(), 2);
        assert_eq!(reloaded.next_seq, b.seq + 1);
    }

    #[test]
    fn scan_filters_by_prefix_in_seq_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut storage = Storage::load(dir.path()).unwrap();
        storage.append("iteratr.a.task".into(), serde_json::json!(1)).unwrap();
        storage.append("iteratr.b.task".into(), serde_json::json!(2)).unwrap();
        storage.append("iteratr.a.note".into(), serde_json::json!(3)).unwrap();

        let scanned = storage.scan("iteratr.a.>");
        assert_eq!(scanned.len(), 2);
        assert!(scanned[0].seq < scanned[1].seq);
        assert!(scanned.iter().all(|r| r.subject.starts_with("iteratr.a.")));
    }

    #[test]
    fn purge_removes_prefix_and_rewrites() {
        let dir = tempfile::tempdir().unwrap();
        let mut storage = Storage::load(dir.path()).unwrap();
        storage.append("iteratr.a.task".into(), serde_json::json!(1)).unwrap();
        storage.append("iteratr.b.task".into(), serde_json::json!(2)).unwrap();
        storage.purge("iteratr.a.>").unwrap();

        assert!(storage.scan("iteratr.a.>").is_empty());
        assert_eq!(storage.scan("iteratr.b.>").len(), 1);

        let reloaded = Storage::load(dir.path()).unwrap();
        assert!(reloaded.scan("iteratr.a.>").is_empty());
        assert_eq!(reloaded.scan("iteratr.b.>").len(), 1);
    }

    #[test]
    fn corrupt_lines_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("events.jsonl"),
            "not json\n{\"seq\":1,\"published_at\":\"2099-01-01T00:00:00Z\",\"subject\":\"iteratr.s.task\",\"body\":{}}\n",
        )
        .unwrap();
        let storage = Storage::load(dir.path()).unwrap();
        assert_eq!(storage.events.len(), 1);
    }

    #[test]
    fn oversized_body_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(Mutex::new(Storage::load(dir.path()).unwrap()));
        let (tx, _) = broadcast::channel(8);
        let big = "x".repeat(MAX_BODY_BYTES + 1);
        let reply = handle_publish(
            &storage,
            &tx,
            "iteratr.s.task".into(),
            serde_json::json!(big),
        );
        assert!(reply.error.is_some());
    }

    #[test]
    fn invalid_subject_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(Mutex::new(Storage::load(dir.path()).unwrap()));
        let (tx, _) = broadcast::channel(8);
        let reply = handle_publish(&storage, &tx, "bogus".into(), serde_json::json!({}));
        assert!(reply.error.is_some());
        let reply = handle_publish(
            &storage,
            &tx,
            "iteratr.bad name.task".into(),
            serde_json::json!({}),
        );
        assert!(reply.error.is_some());
    }
}
