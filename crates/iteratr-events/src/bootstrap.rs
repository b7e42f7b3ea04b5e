// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::{debug, info, warn};

use crate::client::LogClient;
use crate::server::LogServer;

/// Whether this process owns the embedded log server or merely connects to
/// one started by another orchestrator instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogRole {
    Primary,
    Subordinate,
}

/// A connected event log plus the ownership needed to tear it down.
pub struct LogBootstrap {
    pub client: Arc<LogClient>,
    pub port: u16,
    role: LogRole,
    server: Option<LogServer>,
    port_file: PathBuf,
}

/// How long a connect probe against an existing port file may take before
/// the file is treated as stale and this process becomes primary.
const STALE_PROBE: Duration = Duration::from_millis(500);

/// Connect to an existing log server via the port file, or start an embedded
/// one and become primary.  Only the primary writes the port file and removes
/// it on shutdown.
pub async fn connect_or_spawn(storage_dir: &Path) -> anyhow::Result<LogBootstrap> {
    let port_file = storage_dir.join("server.port");

    if let Some(port) = read_port_file(&port_file) {
        match LogClient::connect_with_timeout(port, STALE_PROBE).await {
            Ok(client) => {
                info!(port, "connected to existing event log server (subordinate)");
                return Ok(LogBootstrap {
                    client: Arc::new(client),
                    port,
                    role: LogRole::Subordinate,
                    server: None,
                    port_file,
                });
            }
            Err(e) => {
                warn!(port, error = %e, "stale port file, starting embedded server");
            }
        }
    }

    let server = LogServer::start(storage_dir).await?;
    let port = server.port();
    std::fs::write(&port_file, format!("{port}\n"))
        .with_context(|| format!("writing {}", port_file.display()))?;
    debug!(port, "wrote port file");

    let client = LogClient::connect(port)
        .await
        .context("connecting to embedded log server")?;
    info!(port, "started embedded event log server (primary)");

    Ok(LogBootstrap {
        client: Arc::new(client),
        port,
        role: LogRole::Primary,
        server: Some(server),
        port_file,
    })
}

impl LogBootstrap {
    pub fn role(&self) -> LogRole {
        self.role
    }

    /// Ordered teardown: drain the client connection (≤2 s); when primary,
    /// stop the server (≤5 s) and remove the port file.
    pub async fn shutdown(self) -> anyhow::Result<()> {
        self.client.close().await;
        if let Some(server) = self.server {
            server.shutdown().await?;
            if let Err(e) = std::fs::remove_file(&self.port_file) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(error = %e, "could not remove port file");
                }
            }
        }
        Ok(())
    }
}

fn read_port_file(path: &Path) -> Option<u16> {
    let text = std::fs::read_to_string(path).ok()?;
    text.trim().parse::<u16>().ok()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
