// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::codec::{Framed, LinesCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::protocol::{EventRecord, Reply, Request};

const MAX_LINE_BYTES: usize = 1024 * 1024;

/// Failure modes of the log client, kept distinct so callers can tell
/// retryable transport trouble from permanent refusals.
#[derive(Debug, thiserror::Error)]
pub enum LogError {
    /// Transport-level failure (connect refused, connection dropped, codec
    /// error).  Retryable in principle; the orchestrator surfaces it.
    #[error("event log unavailable: {0}")]
    Unavailable(String),
    /// The server refused the operation permanently (bad subject, oversized
    /// body).  The store turns this into a fatal session error.
    #[error("event log rejected request: {0}")]
    Rejected(String),
}

type Conn = Framed<TcpStream, LinesCodec>;

/// Client for the embedded log server.
///
/// Request/response operations (publish, scan, purge) share one connection,
/// serialized by a mutex; each subscription runs on its own connection with
/// a dedicated reader task.
#[derive(Debug)]
pub struct LogClient {
    addr: SocketAddr,
    conn: Mutex<Conn>,
}

impl LogClient {
    /// Connect with the default probe timeout.
    pub async fn connect(port: u16) -> Result<Self, LogError> {
        Self::connect_with_timeout(port, Duration::from_secs(2)).await
    }

    /// Connect, failing with `Unavailable` when the server does not accept
    /// within `timeout`.  The primary/subordinate bootstrap uses a 500 ms
    /// probe here to detect stale port files.
    pub async fn connect_with_timeout(port: u16, timeout: Duration) -> Result<Self, LogError> {
        let addr: SocketAddr = ([127, 0, 0, 1], port).into();
        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| LogError::Unavailable(format!("connect to {addr} timed out")))?
            .map_err(|e| LogError::Unavailable(format!("connect to {addr}: {e}")))?;
        Ok(Self {
            addr,
            conn: Mutex::new(new_framed(stream)),
        })
    }

    /// Publish one event; blocks until the server acknowledges with the
    /// assigned sequence number.
    pub async fn publish(
        &self,
        subject: &str,
        body: serde_json::Value,
    ) -> Result<u64, LogError> {
        let mut conn = self.conn.lock().await;
        send_request(
            &mut conn,
            &Request::Publish {
                subject: subject.to_string(),
                body,
            },
        )
        .await?;
        let reply = read_reply(&mut conn).await?;
        match (reply.seq, reply.error) {
            (Some(seq), _) => Ok(seq),
            (None, Some(err)) if err.kind == "rejected" => Err(LogError::Rejected(err.message)),
            (None, Some(err)) => Err(LogError::Unavailable(err.message)),
            (None, None) => Err(LogError::Unavailable("publish: missing ack".into())),
        }
    }

    /// Fetch the full history under `prefix` in sequence order.
    pub async fn scan(&self, prefix: &str) -> Result<Vec<EventRecord>, LogError> {
        let mut conn = self.conn.lock().await;
        send_request(
            &mut conn,
            &Request::Scan {
                prefix: prefix.to_string(),
            },
        )
        .await?;

        let mut records = Vec::new();
        loop {
            let reply = read_reply(&mut conn).await?;
            if let Some(err) = reply.error {
                return Err(LogError::Unavailable(err.message));
            }
            if let Some(record) = reply.event {
                records.push(record);
                continue;
            }
            if reply.done == Some(true) {
                return Ok(records);
            }
        }
    }

    /// Remove all events under `prefix`.
    pub async fn purge(&self, prefix: &str) -> Result<(), LogError> {
        let mut conn = self.conn.lock().await;
        send_request(
            &mut conn,
            &Request::Purge {
                prefix: prefix.to_string(),
            },
        )
        .await?;
        let reply = read_reply(&mut conn).await?;
        match reply.error {
            None => Ok(()),
            Some(err) if err.kind == "rejected" => Err(LogError::Rejected(err.message)),
            Some(err) => Err(LogError::Unavailable(err.message)),
        }
    }

    /// Open a dedicated connection and push every new event matching
    /// `subject` into `handler` from a background task.
    ///
    /// The handler runs on the subscription's own task and must not block;
    /// long work belongs on a channel back to the owner.
    pub async fn subscribe(
        &self,
        subject: &str,
        handler: impl Fn(EventRecord) + Send + Sync + 'static,
    ) -> Result<Subscription, LogError> {
        let stream = TcpStream::connect(self.addr)
            .await
            .map_err(|e| LogError::Unavailable(format!("subscribe connect: {e}")))?;
        let mut framed = new_framed(stream);
        send_request(
            &mut framed,
            &Request::Subscribe {
                subject: subject.to_string(),
            },
        )
        .await?;

        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();
        let subject = subject.to_string();
        let handler = Arc::new(handler);
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = task_cancel.cancelled() => break,
                    next = framed.next() => {
                        let line = match next {
                            Some(Ok(line)) => line,
                            Some(Err(e)) => {
                                warn!(error = %e, subject, "subscription read error");
                                break;
                            }
                            None => {
                                debug!(subject, "subscription closed by server");
                                break;
                            }
                        };
                        match serde_json::from_str::<Reply>(&line) {
                            Ok(reply) => {
                                if let Some(record) = reply.event {
                                    handler(record);
                                }
                            }
                            Err(e) => warn!(error = %e, "malformed subscription line"),
                        }
                    }
                }
            }
        });

        Ok(Subscription { cancel, task: Some(task) })
    }

    /// Drain and close the shared connection; capped at 2 s.
    pub async fn close(&self) {
        let drained = tokio::time::timeout(Duration::from_secs(2), async {
            let mut conn = self.conn.lock().await;
            let _ = SinkExt::<String>::close(&mut *conn).await;
        })
        .await;
        if drained.is_err() {
            warn!("event log connection did not drain within 2s");
        }
    }
}

/// Handle for a live subscription; dropping it (or calling `unsubscribe`)
/// stops the reader task and closes its connection.
pub struct Subscription {
    cancel: CancellationToken,
    task: Option<tokio::task::JoinHandle<()>>,
}

impl Subscription {
    pub async fn unsubscribe(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

// ── Helpers ───────────────────────────────────────────────────────────────────

fn new_framed(stream: TcpStream) -> Conn {
    Framed::new(stream, LinesCodec::new_with_max_length(MAX_LINE_BYTES))
}

async fn send_request(conn: &mut Conn, request: &Request) -> Result<(), LogError> {
    let line = serde_json::to_string(request)
        .map_err(|e| LogError::Rejected(format!("unencodable request: {e}")))?;
    conn.send(line)
        .await
        .map_err(|e| LogError::Unavailable(format!("send: {e}")))
}

async fn read_reply(conn: &mut Conn) -> Result<Reply, LogError> {
    let line = conn
        .next()
        .await
        .ok_or_else(|| LogError::Unavailable("server closed connection".into()))?
        .map_err(|e| LogError::Unavailable(format!("read: {e}")))?;
    serde_json::from_str(&line).map_err(|e| LogError::Unavailable(format!("malformed reply: {e}")))
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::LogServer;

    async fn test_server() -> (LogServer, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let server = LogServer::start(dir.path()).await.unwrap();
        (server, dir)
    }

    #[tokio::test]
    async fn publish_returns_increasing_seq() {
        let (server, _dir) = test_server().await;
        let client = LogClient::connect(server.port()).await.unwrap();

        let a = client
            .publish("iteratr.s.task", serde_json::json!({"n": 1}))
            .await
            .unwrap();
        let b = client
            .publish("iteratr.s.task", serde_json::json!({"n": 2}))
            .await
            .unwrap();
        assert!(b > a);
        server.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn scan_returns_history_in_order() {
        let (server, _dir) = test_server().await;
        let client = LogClient::connect(server.port()).await.unwrap();

        for n in 0..5 {
            client
                .publish("iteratr.s.note", serde_json::json!({"n": n}))
                .await
                .unwrap();
        }
        client
            .publish("iteratr.other.note", serde_json::json!({"n": 99}))
            .await
            .unwrap();

        let records = client.scan("iteratr.s.>").await.unwrap();
        assert_eq!(records.len(), 5);
        for pair in records.windows(2) {
            assert!(pair[0].seq < pair[1].seq);
        }
        server.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn invalid_subject_is_rejected_not_unavailable() {
        let (server, _dir) = test_server().await;
        let client = LogClient::connect(server.port()).await.unwrap();

        let err = client
            .publish("not-a-subject", serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, LogError::Rejected(_)), "got {err:?}");
        server.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn purge_empties_prefix() {
        let (server, _dir) = test_server().await;
        let client = LogClient::connect(server.port()).await.unwrap();

        client
            .publish("iteratr.s.task", serde_json::json!({}))
            .await
            .unwrap();
        client.purge("iteratr.s.>").await.unwrap();
        assert!(client.scan("iteratr.s.>").await.unwrap().is_empty());

        // new publishes are visible again after the purge
        client
            .publish("iteratr.s.task", serde_json::json!({}))
            .await
            .unwrap();
        assert_eq!(client.scan("iteratr.s.>").await.unwrap().len(), 1);
        server.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn subscription_receives_live_events() {
        let (server, _dir) = test_server().await;
        let client = LogClient::connect(server.port()).await.unwrap();

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let sub = client
            .subscribe("iteratr.s.task", move |record| {
                let _ = tx.send(record);
            })
            .await
            .unwrap();

        client
            .publish("iteratr.s.task", serde_json::json!({"hello": true}))
            .await
            .unwrap();
        client
            .publish("iteratr.s.note", serde_json::json!({"filtered": true}))
            .await
            .unwrap();

        let received = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for subscription event")
            .unwrap();
        assert_eq!(received.subject, "iteratr.s.task");

        // the note publish must not arrive on a task-only subscription
        assert!(rx.try_recv().is_err());

        sub.unsubscribe().await;
        server.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn connect_to_dead_port_is_unavailable() {
        let err = LogClient::connect_with_timeout(1, Duration::from_millis(300))
            .await
            .unwrap_err();
        assert!(matches!(err, LogError::Unavailable(_)));
    }
}
