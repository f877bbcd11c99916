// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The sync pipeline: for each of the VM's datasets, negotiate
//! resumability and snapshot naming with the receiver, cut the new
//! migration snapshot, estimate the stream, then pipe the stream
//! across and wait for the receiver's definitive acknowledgment.
//!
//! The collect phase runs for every dataset before any streaming
//! begins, so the total-progress estimate is settled before anything
//! user-visible moves.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use slog::{info, o, warn, Logger};
use tokio::time;

use crate::codec::Extras;
use crate::link::ReceiverLink;
use crate::migrate::{self, MigrateError, ProgressEntry};
use crate::progress::Progress;
use crate::server::Worker;
use crate::zfs;

/// How often the shared counters are refreshed from the byte count of
/// an in-flight stream.
const PROGRESS_SAMPLE_INTERVAL: Duration = Duration::from_millis(495);

/// Per-dataset state assembled by the collect phase and consumed by
/// the streaming phase.
#[derive(Clone, Debug)]
pub struct DatasetContext {
    pub dataset: String,
    pub target_dataset: String,
    pub source_snapshots: Vec<String>,
    pub target_snapshots: Vec<String>,
    pub is_first_sync: bool,
    pub token: Option<String>,
    pub prev_snapshot: String,
    pub snapshot: String,
    pub estimated_size: u64,
}

impl DatasetContext {
    /// A previously failed send is continued from the receiver-held
    /// token rather than replayed from a snapshot pair.
    pub fn continue_last_sync(&self) -> bool {
        self.token.is_some()
    }

    /// The argument list for the send this context describes.
    /// Deterministic: the same context always yields the same
    /// arguments.
    pub fn send_args(&self) -> Vec<String> {
        match (&self.token, self.is_first_sync) {
            (Some(token), _) => {
                vec!["send".to_string(), "-t".to_string(), token.clone()]
            }
            (None, true) => vec![
                "send".to_string(),
                "--replicate".to_string(),
                format!("{}@{}", self.dataset, self.snapshot),
            ],
            (None, false) => vec![
                "send".to_string(),
                "-I".to_string(),
                format!("{}@{}", self.dataset, self.prev_snapshot),
                format!("{}@{}", self.dataset, self.snapshot),
            ],
        }
    }
}

/// What the record's history implies about this attempt. The history
/// already includes the entry for the attempt now underway.
#[derive(Clone, Copy, Debug, PartialEq)]
enum Disposition {
    /// Nothing has ever been sent: full replication.
    FirstSync,
    /// The previous attempt succeeded: incremental send.
    Incremental,
    /// The previous attempt did not succeed; ask the receiver for a
    /// resume token.
    MaybeResume,
}

fn disposition(history: &[ProgressEntry]) -> Disposition {
    let phases: Vec<&ProgressEntry> = history
        .iter()
        .filter(|e| e.phase == "sync" && e.state != "warning")
        .collect();
    match phases.len() {
        0 | 1 => Disposition::FirstSync,
        n if phases[n - 2].state == "success" => Disposition::Incremental,
        _ => Disposition::MaybeResume,
    }
}

/// Settles the first-sync/resume question once the receiver has
/// spoken. Returns `(is_first_sync, token)`: a usable token continues
/// the failed sync; an empty or absent one falls back to full
/// replication when the target holds nothing and to an incremental
/// send otherwise.
fn resolve_disposition(
    disp: Disposition,
    token: Option<&str>,
    target_snapshots: &[String],
) -> (bool, Option<String>) {
    match disp {
        Disposition::FirstSync => (true, None),
        Disposition::Incremental => (false, None),
        Disposition::MaybeResume => match token {
            Some(t) if !t.is_empty() => (false, Some(t.to_string())),
            _ => (target_snapshots.is_empty(), None),
        },
    }
}

/// Advances past snapshot names the target already holds. Returns the
/// settled previous-sequence number and whether any advancing
/// happened.
fn plan_snapshots(from_seq: u64, target_snapshots: &[String]) -> (u64, bool) {
    let mut seq = from_seq;
    while target_snapshots
        .iter()
        .any(|s| *s == zfs::snapshot_name(seq + 1))
    {
        seq += 1;
    }
    (seq, seq != from_seq)
}

fn numerically_ordered(names: &[String]) -> bool {
    let seqs: Vec<u64> =
        names.iter().filter_map(|n| zfs::snapshot_seq(n)).collect();
    seqs.windows(2).all(|w| w[0] <= w[1])
}

fn fs_extras(target_dataset: &str) -> Extras {
    let mut extras = Extras::new();
    extras.insert("zfsFilesystem".to_string(), json!(target_dataset));
    extras
}

/// Runs the whole sync: collect across all datasets, stream across
/// all datasets, then wind the receiver down.
pub async fn run(
    worker: &Arc<Worker>,
    host: &str,
    port: u16,
) -> Result<(), MigrateError> {
    let log = worker.log.new(o!("task" => "sync"));
    if worker.record.lock().unwrap().is_none() {
        return Err(MigrateError::NoRecord);
    }
    let datasets = migrate::vm_datasets(&worker.vm);
    info!(log, "sync starting"; "datasets" => datasets.join(" "));

    let result = run_phases(worker, &log, &datasets, host, port).await;

    // Wind the receiver down no matter how the phases fared; a
    // failure here never masks the phase result.
    shutdown_receiver(&log, host, port).await;

    if result.is_ok() {
        // Estimates and actual stream sizes legitimately differ;
        // settle the terminal report on the total.
        worker.progress.set_current(worker.progress.total());
        info!(log, "sync complete";
            "bytes" => worker.progress.current());
    }
    result
}

async fn run_phases(
    worker: &Arc<Worker>,
    log: &Logger,
    datasets: &[String],
    host: &str,
    port: u16,
) -> Result<(), MigrateError> {
    let mut contexts = Vec::with_capacity(datasets.len());
    for dataset in datasets {
        worker.check_stop()?;
        let ctx = collect(worker, log, dataset, host, port).await?;
        info!(log, "dataset state collected";
            "dataset" => dataset,
            "snapshot" => &ctx.snapshot,
            "first_sync" => ctx.is_first_sync,
            "continue_last" => ctx.continue_last_sync(),
            "estimated_size" => ctx.estimated_size);
        contexts.push(ctx);
    }

    let estimate: u64 = contexts.iter().map(|c| c.estimated_size).sum();
    worker.progress.add_total(estimate);

    for ctx in &contexts {
        worker.check_stop()?;
        stream(worker, log, ctx, host, port).await?;
    }
    Ok(())
}

/// Collect phase for one dataset, on a fresh link.
async fn collect(
    worker: &Arc<Worker>,
    log: &Logger,
    dataset: &str,
    host: &str,
    port: u16,
) -> Result<DatasetContext, MigrateError> {
    let log = log.new(
        o!("dataset" => dataset.to_string(), "phase" => "collect"),
    );
    let record = worker
        .record
        .lock()
        .unwrap()
        .clone()
        .ok_or(MigrateError::NoRecord)?;

    let source_snapshots =
        zfs::list_migration_snapshots(&log, dataset).await?;
    let target_dataset = migrate::target_dataset(&record, dataset);

    let mut link = ReceiverLink::connect(host, port, &log).await?;
    let result = collect_on_link(
        worker,
        &log,
        &mut link,
        dataset,
        &target_dataset,
        &record.progress_history,
        source_snapshots,
    )
    .await;
    link.close().await;
    result
}

async fn collect_on_link(
    worker: &Arc<Worker>,
    log: &Logger,
    link: &mut ReceiverLink,
    dataset: &str,
    target_dataset: &str,
    history: &[ProgressEntry],
    mut source_snapshots: Vec<String>,
) -> Result<DatasetContext, MigrateError> {
    let resp = link
        .request("get-zfs-snapshot-names", fs_extras(target_dataset))
        .await?;
    let target_snapshots = resp.field_names("names");
    if !numerically_ordered(&target_snapshots) {
        warn!(log, "target snapshot list is not in sequence order";
            "names" => target_snapshots.join(","));
    }

    let disp = disposition(history);
    let reported_token = if disp == Disposition::MaybeResume {
        let resp = link
            .request("get-zfs-resume-token", fs_extras(target_dataset))
            .await?;
        resp.field_str("token").map(str::to_string)
    } else {
        None
    };
    let (mut is_first_sync, token) = resolve_disposition(
        disp,
        reported_token.as_deref(),
        &target_snapshots,
    );
    if token.is_some() {
        info!(log, "previous sync left resumable state");
    }

    // Plan the snapshot pair. The sequence counter is shared across
    // this sync's datasets, so a collision advances it for all of
    // them.
    let (prev_seq, collided) = {
        let mut guard = worker.record.lock().unwrap();
        let rec = guard.as_mut().ok_or(MigrateError::NoRecord)?;
        let (seq, collided) =
            plan_snapshots(rec.num_sync_phases, &target_snapshots);
        rec.num_sync_phases = seq;
        (seq, collided)
    };
    if collided {
        // A target snapshot with the planned name means at least one
        // earlier sync completed.
        info!(log, "target already holds planned snapshot, skipping ahead";
            "next_seq" => prev_seq + 1);
        is_first_sync = false;
    }
    let prev_snapshot = zfs::snapshot_name(prev_seq);
    let snapshot = zfs::snapshot_name(prev_seq + 1);

    if token.is_none() && !source_snapshots.iter().any(|s| *s == snapshot)
    {
        zfs::create_snapshot(log, dataset, &snapshot).await?;
        source_snapshots.push(snapshot.clone());
    }

    let mut ctx = DatasetContext {
        dataset: dataset.to_string(),
        target_dataset: target_dataset.to_string(),
        source_snapshots,
        target_snapshots,
        is_first_sync,
        token,
        prev_snapshot,
        snapshot,
        estimated_size: 0,
    };
    ctx.estimated_size = zfs::estimate_send(log, &ctx.send_args()).await?;
    Ok(ctx)
}

/// Streaming phase for one dataset, on a fresh link.
async fn stream(
    worker: &Arc<Worker>,
    log: &Logger,
    ctx: &DatasetContext,
    host: &str,
    port: u16,
) -> Result<(), MigrateError> {
    let log = log
        .new(o!("dataset" => ctx.dataset.clone(), "phase" => "stream"));
    let mut link = ReceiverLink::connect(host, port, &log).await?;
    let result = stream_on_link(worker, &log, ctx, &mut link).await;
    link.close().await;
    result
}

async fn stream_on_link(
    worker: &Arc<Worker>,
    log: &Logger,
    ctx: &DatasetContext,
    link: &mut ReceiverLink,
) -> Result<(), MigrateError> {
    link.expect_sync_success();
    let mut extras = fs_extras(&ctx.target_dataset);
    extras.insert("isFirstSync".to_string(), json!(ctx.is_first_sync));
    link.request("sync", extras).await?;
    info!(log, "receiver ready to consume stream";
        "estimated_size" => ctx.estimated_size);

    let (send, mut stdout) = zfs::start_send(log, &ctx.send_args())?;

    // The sampler refreshes the shared counters from the bytes
    // forwarded so far, on top of where the previous datasets left
    // off.
    let forwarded = Arc::new(AtomicU64::new(0));
    let baseline = worker.progress.current();
    let sampler = tokio::spawn(sample_progress(
        Arc::clone(&worker.progress),
        Arc::clone(&worker.stop),
        Arc::clone(&forwarded),
        baseline,
    ));

    let copy_result = link.stream_from(&mut stdout, &forwarded).await;

    // Settle the final byte count before tearing the sampler down.
    worker
        .progress
        .set_current(baseline + forwarded.load(Ordering::Relaxed));
    sampler.abort();

    copy_result?;
    send.wait().await?;
    link.wait_sync_success().await
}

async fn sample_progress(
    progress: Arc<Progress>,
    stop: Arc<AtomicBool>,
    forwarded: Arc<AtomicU64>,
    baseline: u64,
) {
    let mut ticker = time::interval(PROGRESS_SAMPLE_INTERVAL);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        if stop.load(Ordering::SeqCst) {
            break;
        }
        progress.set_current(baseline + forwarded.load(Ordering::Relaxed));
    }
}

/// Best-effort receiver teardown once the sync is over, one way or
/// the other.
async fn shutdown_receiver(log: &Logger, host: &str, port: u16) {
    let result = async {
        let mut link = ReceiverLink::connect(host, port, log).await?;
        link.request("stop", Extras::new()).await?;
        link.close().await;
        Ok::<(), MigrateError>(())
    }
    .await;
    if let Err(e) = result {
        warn!(log, "receiver shutdown failed: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> DatasetContext {
        DatasetContext {
            dataset: "zones/x".to_string(),
            target_dataset: "zones/x".to_string(),
            source_snapshots: vec![],
            target_snapshots: vec![],
            is_first_sync: false,
            token: None,
            prev_snapshot: "vm-migration-1".to_string(),
            snapshot: "vm-migration-2".to_string(),
            estimated_size: 0,
        }
    }

    fn history(states: &[&str]) -> Vec<ProgressEntry> {
        states.iter().map(|s| ProgressEntry::new("sync", s)).collect()
    }

    #[test]
    fn send_args_for_first_sync() {
        let mut c = ctx();
        c.is_first_sync = true;
        c.snapshot = "vm-migration-1".to_string();
        assert_eq!(
            c.send_args(),
            vec!["send", "--replicate", "zones/x@vm-migration-1"]
        );
    }

    #[test]
    fn send_args_for_incremental() {
        let c = ctx();
        assert_eq!(
            c.send_args(),
            vec![
                "send",
                "-I",
                "zones/x@vm-migration-1",
                "zones/x@vm-migration-2"
            ]
        );
    }

    #[test]
    fn send_args_for_resume_override_everything_else() {
        let mut c = ctx();
        c.is_first_sync = true;
        c.token = Some("1-abcd-ef".to_string());
        assert_eq!(c.send_args(), vec!["send", "-t", "1-abcd-ef"]);
        assert!(c.continue_last_sync());
    }

    #[test]
    fn send_args_are_deterministic() {
        let c = ctx();
        assert_eq!(c.send_args(), c.send_args());
    }

    #[test]
    fn lone_history_entry_means_first_sync() {
        assert_eq!(disposition(&history(&[])), Disposition::FirstSync);
        assert_eq!(
            disposition(&history(&["running"])),
            Disposition::FirstSync
        );
    }

    #[test]
    fn successful_predecessor_means_incremental() {
        assert_eq!(
            disposition(&history(&["success", "running"])),
            Disposition::Incremental
        );
    }

    #[test]
    fn failed_predecessor_means_resume() {
        assert_eq!(
            disposition(&history(&["running", "running"])),
            Disposition::MaybeResume
        );
        assert_eq!(
            disposition(&history(&["success", "error", "running"])),
            Disposition::MaybeResume
        );
    }

    #[test]
    fn warnings_do_not_count_as_attempts() {
        assert_eq!(
            disposition(&history(&["success", "warning", "running"])),
            Disposition::Incremental
        );
        // A lone warning leaves only the current attempt.
        assert_eq!(
            disposition(&history(&["warning", "running"])),
            Disposition::FirstSync
        );
    }

    #[test]
    fn other_phases_are_ignored() {
        let mut h = history(&["success", "running"]);
        h.insert(1, ProgressEntry::new("begin", "failed"));
        assert_eq!(disposition(&h), Disposition::Incremental);
    }

    #[test]
    fn usable_token_continues_the_last_sync() {
        let target = vec!["vm-migration-1".to_string()];
        let (first, token) = resolve_disposition(
            Disposition::MaybeResume,
            Some("1-abcd-ef"),
            &target,
        );
        assert!(!first);
        assert_eq!(token.as_deref(), Some("1-abcd-ef"));
    }

    #[test]
    fn empty_token_with_bare_target_downgrades_to_first_sync() {
        let (first, token) =
            resolve_disposition(Disposition::MaybeResume, Some(""), &[]);
        assert!(first);
        assert!(token.is_none());
        let (first, token) =
            resolve_disposition(Disposition::MaybeResume, None, &[]);
        assert!(first);
        assert!(token.is_none());
    }

    #[test]
    fn empty_token_with_populated_target_downgrades_to_incremental() {
        let target = vec!["vm-migration-1".to_string()];
        let (first, token) = resolve_disposition(
            Disposition::MaybeResume,
            Some(""),
            &target,
        );
        assert!(!first);
        assert!(token.is_none());
    }

    #[test]
    fn plan_skips_past_existing_target_snapshots() {
        let target = vec![
            "vm-migration-1".to_string(),
            "vm-migration-2".to_string(),
        ];
        let (seq, collided) = plan_snapshots(1, &target);
        assert_eq!(seq, 2);
        assert!(collided);
        assert_eq!(zfs::snapshot_name(seq), "vm-migration-2");
        assert_eq!(zfs::snapshot_name(seq + 1), "vm-migration-3");
    }

    #[test]
    fn plan_keeps_sequence_without_collision() {
        let target = vec!["vm-migration-1".to_string()];
        assert_eq!(plan_snapshots(1, &target), (1, false));
        assert_eq!(plan_snapshots(0, &[]), (0, false));
    }

    #[test]
    fn ordered_check_is_numeric() {
        let ordered = vec![
            "vm-migration-2".to_string(),
            "vm-migration-10".to_string(),
        ];
        assert!(numerically_ordered(&ordered));
        let unordered = vec![
            "vm-migration-10".to_string(),
            "vm-migration-2".to_string(),
        ];
        assert!(!numerically_ordered(&unordered));
    }
}
