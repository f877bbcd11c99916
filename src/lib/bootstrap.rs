// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The startup handshake with the parent supervisor, log file setup,
//! and admin-network address resolution. The worker reads exactly one
//! message from stdin, answers exactly once on stdout, and is driven
//! over its control socket from then on.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use slog::{debug, o, Drain, Logger};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::process::Command;
use uuid::Uuid;

use crate::migrate::{MigrateError, MigrationRecord, VmPayload};
use crate::ring::RingDrain;

/// Well-known path of the helper that reports this node's network
/// configuration as JSON.
pub const SYSINFO: &str = "/usr/bin/sysinfo";

/// How long the worker waits for its first supervisor connection when
/// the startup message does not say.
pub const DEFAULT_STARTUP_TIMEOUT_SECS: u64 = 60;

/// The single message the parent sends on stdin.
#[derive(Debug, Deserialize)]
pub struct StartupMessage {
    pub req_id: String,
    pub uuid: Uuid,
    #[serde(rename = "timeoutSeconds", default)]
    pub timeout_seconds: Option<u64>,
    pub payload: StartupPayload,
}

#[derive(Debug, Deserialize)]
pub struct StartupPayload {
    #[serde(rename = "migrationTask")]
    pub migration_task: MigrationTask,
    pub vm: VmPayload,
}

#[derive(Debug, Deserialize)]
pub struct MigrationTask {
    pub action: Action,
    pub record: MigrationRecord,
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Sync,
    Switch,
}

impl StartupMessage {
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(
            self.timeout_seconds.unwrap_or(DEFAULT_STARTUP_TIMEOUT_SECS),
        )
    }
}

/// The single reply the worker writes on stdout.
#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum StartupReply {
    Ready { host: String, pid: u32, port: u16 },
    Failed { error: StartupFailure },
}

#[derive(Debug, Serialize)]
pub struct StartupFailure {
    pub message: String,
    pub stack: String,
}

pub fn ready_reply(addr: SocketAddr) -> StartupReply {
    StartupReply::Ready {
        host: addr.ip().to_string(),
        pid: std::process::id(),
        port: addr.port(),
    }
}

pub fn error_reply(err: &anyhow::Error) -> StartupReply {
    StartupReply::Failed {
        error: StartupFailure {
            message: err.to_string(),
            // The closest thing we have to a stack: the error and
            // its cause chain.
            stack: format!("{err:?}"),
        },
    }
}

pub async fn read_startup_message<R: AsyncBufRead + Unpin>(
    reader: &mut R,
) -> anyhow::Result<StartupMessage> {
    let mut line = String::new();
    let n = reader
        .read_line(&mut line)
        .await
        .context("reading startup message")?;
    anyhow::ensure!(
        n > 0,
        "parent closed stdin before sending the startup message"
    );
    serde_json::from_str(line.trim()).context("parsing startup message")
}

pub async fn write_reply<W: AsyncWrite + Unpin>(
    writer: &mut W,
    reply: &StartupReply,
) -> anyhow::Result<()> {
    let mut line =
        serde_json::to_vec(reply).context("serializing startup reply")?;
    line.push(b'\n');
    writer
        .write_all(&line)
        .await
        .context("writing startup reply")?;
    writer.flush().await.context("flushing startup reply")?;
    Ok(())
}

/// Where the log file goes: `logdir` names the directory (default
/// `/var/tmp`), and setting `logtimestamp` embeds the startup time in
/// the file name.
fn log_file_path() -> PathBuf {
    let dir = std::env::var("logdir")
        .unwrap_or_else(|_| "/var/tmp".to_string());
    let name = if std::env::var_os("logtimestamp").is_some() {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        format!("migrate-sender-{now}.log")
    } else {
        "migrate-sender.log".to_string()
    };
    PathBuf::from(dir).join(name)
}

/// Builds the root logger: the full-format file drain at debug level,
/// with the crash ring alongside it, behind an async drain.
pub fn open_log(
    ring: &RingDrain,
) -> anyhow::Result<(Logger, slog_async::AsyncGuard)> {
    let path = log_file_path();
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| {
            format!("opening log file {}", path.display())
        })?;

    let decorator = slog_term::PlainDecorator::new(file);
    let file_drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog::Duplicate::new(file_drain, ring.clone().fuse()).fuse();
    let drain = slog::LevelFilter::new(drain, slog::Level::Debug).fuse();
    let (drain, guard) = slog_async::Async::new(drain).build_with_guard();
    let log =
        slog::Logger::root(drain.fuse(), o!("pid" => std::process::id()));
    Ok((log, guard))
}

/// Asks the local helper for this node's admin-network address.
pub async fn resolve_admin_ip(log: &Logger) -> Result<IpAddr, MigrateError> {
    debug!(log, "resolving admin ip via {}", SYSINFO);
    let mut cmd = Command::new(SYSINFO);
    let output = cmd.output().await.map_err(|e| {
        MigrateError::Setup(format!("running {SYSINFO}: {e}"))
    })?;
    if !output.status.success() {
        return Err(MigrateError::Setup(format!(
            "{SYSINFO} exited {:?}: {}",
            output.status.code(),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    let info: serde_json::Value = serde_json::from_slice(&output.stdout)
        .map_err(|e| {
            MigrateError::Setup(format!("parsing {SYSINFO} output: {e}"))
        })?;
    let ip = info
        .get("Admin IP")
        .and_then(|v| v.as_str())
        .ok_or_else(|| {
            MigrateError::Setup(format!(
                "{SYSINFO} output carries no admin address"
            ))
        })?;
    ip.parse().map_err(|e| {
        MigrateError::Setup(format!("bad admin address {ip:?}: {e}"))
    })
}
