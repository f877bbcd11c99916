// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Support functions for driving the ZFS command line tool: snapshot
//! bookkeeping for the migration naming scheme, send-size estimation,
//! and spawning the send stream itself.

use std::process::Stdio;
use std::time::Duration;

use slog::{debug, info, Logger};
use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStdout, Command};
use tokio::time;

use crate::codec::ProtocolError;
use crate::migrate::MigrateError;

/// Well-known path of the storage tool.
pub const ZFS: &str = "/usr/sbin/zfs";

/// Short names of migration snapshots are this prefix followed by a
/// positive integer sequence number.
pub const SNAPSHOT_PREFIX: &str = "vm-migration-";

const SNAPSHOT_TIMEOUT: Duration = Duration::from_secs(15 * 60);
const ESTIMATE_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// How much of each end of the send stream's stderr is retained for
/// error reporting.
const STDERR_WINDOW: usize = 2500;

/// Parses a snapshot short name against the migration naming scheme,
/// yielding its sequence number. Names with a zero, empty, or
/// non-numeric suffix are not migration snapshots.
pub fn snapshot_seq(short: &str) -> Option<u64> {
    let digits = short.strip_prefix(SNAPSHOT_PREFIX)?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let seq = digits.parse().ok()?;
    (seq > 0).then_some(seq)
}

/// The migration snapshot short name for a sequence number.
pub fn snapshot_name(seq: u64) -> String {
    format!("{SNAPSHOT_PREFIX}{seq}")
}

/// Lists the migration snapshots of `dataset`, sorted ascending by
/// sequence number. Snapshots of child datasets and snapshots outside
/// the migration naming scheme are ignored.
pub async fn list_migration_snapshots(
    log: &Logger,
    dataset: &str,
) -> Result<Vec<String>, MigrateError> {
    let out = run_zfs(
        log,
        &["list", "-H", "-r", "-t", "snapshot", "-o", "name", dataset],
        "list snapshots",
        None,
    )
    .await?;

    let mut snaps: Vec<(u64, String)> = Vec::new();
    for line in out.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let Some((ds, short)) = line.split_once('@') else {
            continue;
        };
        if ds != dataset {
            continue;
        }
        if let Some(seq) = snapshot_seq(short) {
            snaps.push((seq, short.to_string()));
        }
    }
    // Ordering is numeric on the sequence number; lexicographic
    // ordering would place vm-migration-10 before vm-migration-2.
    snaps.sort_unstable_by_key(|(seq, _)| *seq);
    Ok(snaps.into_iter().map(|(_, short)| short).collect())
}

/// Creates `dataset@short` recursively.
pub async fn create_snapshot(
    log: &Logger,
    dataset: &str,
    short: &str,
) -> Result<(), MigrateError> {
    let full = format!("{dataset}@{short}");
    info!(log, "creating migration snapshot"; "snapshot" => &full);
    run_zfs(
        log,
        &["snapshot", "-r", &full],
        "create snapshot",
        Some(SNAPSHOT_TIMEOUT),
    )
    .await?;
    Ok(())
}

/// Runs the send described by `args` as a dry run and returns the
/// stream size estimate in bytes.
pub async fn estimate_send(
    log: &Logger,
    args: &[String],
) -> Result<u64, MigrateError> {
    let mut dry: Vec<&str> = Vec::with_capacity(args.len() + 2);
    let mut it = args.iter().map(String::as_str);
    if let Some(verb) = it.next() {
        dry.push(verb);
    }
    dry.push("-n");
    dry.push("-P");
    dry.extend(it);

    let out =
        run_zfs(log, &dry, "estimate send size", Some(ESTIMATE_TIMEOUT))
            .await?;
    parse_send_estimate(&out)
        .ok_or(MigrateError::Protocol(ProtocolError::NoSendEstimate))
}

/// The parsable dry run reports the stream size as its last non-empty
/// output line, `size <bytes>`.
fn parse_send_estimate(out: &str) -> Option<u64> {
    let line = out.lines().rev().find(|l| !l.trim().is_empty())?;
    let mut words = line.split_whitespace();
    if words.next()? != "size" {
        return None;
    }
    let size = words.next()?.parse().ok()?;
    words.next().is_none().then_some(size)
}

async fn run_zfs(
    log: &Logger,
    args: &[&str],
    stage: &str,
    deadline: Option<Duration>,
) -> Result<String, MigrateError> {
    debug!(log, "zfs {}", args.join(" "));
    let mut cmd = Command::new(ZFS);
    cmd.args(args).stdin(Stdio::null()).kill_on_drop(true);
    let fut = cmd.output();
    let output = match deadline {
        Some(dur) => time::timeout(dur, fut).await.map_err(|_| {
            MigrateError::storage(
                stage,
                format!("`zfs {}` timed out after {:?}", args.join(" "), dur),
            )
        })?,
        None => fut.await,
    }
    .map_err(|e| {
        MigrateError::storage(stage, format!("could not run {ZFS}: {e}"))
    })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(MigrateError::storage(
            stage,
            format!(
                "`zfs {}` exited {:?}: {}",
                args.join(" "),
                output.status.code(),
                stderr.trim()
            ),
        ));
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// A sliding window over a byte stream that retains the first and
/// last `limit` bytes, with an elision marker between them once
/// anything in the middle has been dropped.
#[derive(Debug, Default)]
pub struct StderrWindow {
    head: Vec<u8>,
    tail: std::collections::VecDeque<u8>,
    dropped: bool,
    limit: usize,
}

impl StderrWindow {
    fn new(limit: usize) -> StderrWindow {
        StderrWindow { limit, ..Default::default() }
    }

    fn push(&mut self, chunk: &[u8]) {
        for &b in chunk {
            if self.head.len() < self.limit {
                self.head.push(b);
            } else {
                if self.tail.len() == self.limit {
                    self.tail.pop_front();
                    self.dropped = true;
                }
                self.tail.push_back(b);
            }
        }
    }

    /// Renders the retained window, lossily, for an error message.
    pub fn contents(&self) -> String {
        let mut buf = self.head.clone();
        if self.dropped {
            buf.extend_from_slice(b"\n...\n");
        }
        buf.extend(self.tail.iter());
        String::from_utf8_lossy(&buf).trim().to_string()
    }
}

/// A running `zfs send` whose stdout is being consumed elsewhere.
/// Dropping the stream kills the child.
pub struct SendStream {
    child: Child,
    stderr_task: tokio::task::JoinHandle<StderrWindow>,
}

impl SendStream {
    /// Waits for the send process to finish. A non-zero exit is an
    /// error carrying the retained stderr window.
    pub async fn wait(mut self) -> Result<(), MigrateError> {
        let status = self.child.wait().await.map_err(|e| {
            MigrateError::storage("send stream", e.to_string())
        })?;
        let window = self.stderr_task.await.unwrap_or_default();
        if !status.success() {
            return Err(MigrateError::storage(
                "send stream",
                format!(
                    "zfs send exited {:?}: {}",
                    status.code(),
                    window.contents()
                ),
            ));
        }
        Ok(())
    }
}

/// Spawns the send described by `args`. Returns the handle and the
/// child's stdout, which the caller forwards to the receiver; the OS
/// pipe provides the backpressure between the two.
pub fn start_send(
    log: &Logger,
    args: &[String],
) -> Result<(SendStream, ChildStdout), MigrateError> {
    info!(log, "starting send"; "args" => args.join(" "));
    let mut child = Command::new(ZFS)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| {
            MigrateError::storage(
                "start send",
                format!("could not spawn {ZFS}: {e}"),
            )
        })?;

    let stdout = child.stdout.take().ok_or_else(|| {
        MigrateError::storage("start send", "send process has no stdout")
    })?;
    let mut stderr = child.stderr.take().ok_or_else(|| {
        MigrateError::storage("start send", "send process has no stderr")
    })?;

    let stderr_task = tokio::spawn(async move {
        let mut window = StderrWindow::new(STDERR_WINDOW);
        let mut buf = [0u8; 4096];
        loop {
            match stderr.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => window.push(&buf[..n]),
            }
        }
        window
    });

    Ok((SendStream { child, stderr_task }, stdout))
}
