// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::codec::{Extras, ProtocolError};

pub mod sync;

/// Errors which may occur during the course of a migration sync
#[derive(Debug, Error)]
pub enum MigrateError {
    /// The storage tool exited non-zero, timed out, or produced
    /// unparseable output; the message names the failing stage
    #[error("{0}: {1}")]
    Storage(String, String),

    /// The receiver link failed: connect error, idle timeout,
    /// unexpected end, or a framing violation
    #[error("receiver link error: {0}")]
    Link(String),

    /// A peer violated the event schema
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The receiver reported an asynchronous error
    #[error("sync error: {0}")]
    Remote(String),

    /// Bootstrap failed before the control server came up
    #[error("setup error: {0}")]
    Setup(String),

    /// The receiver closed the link without announcing success
    #[error("no sync-success received from target")]
    NoSyncSuccess,

    /// A sync command arrived while one was already running
    #[error("a sync is already in progress")]
    SyncInProgress,

    /// A sync command arrived before any record was handed in
    #[error("no migration record has been set")]
    NoRecord,

    /// The worker was told to stop
    #[error("worker is stopping")]
    Stopped,
}

impl MigrateError {
    pub(crate) fn storage(stage: &str, msg: impl ToString) -> MigrateError {
        MigrateError::Storage(stage.to_string(), msg.to_string())
    }

    pub(crate) fn link(msg: impl ToString) -> MigrateError {
        MigrateError::Link(msg.to_string())
    }
}

/// The supervisor-owned description of one VM migration. Handed in at
/// startup and replaceable wholesale via `set-record`; immutable for
/// the duration of a sync except for `num_sync_phases`, which
/// advances when a snapshot name collision forces skipping forward.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct MigrationRecord {
    pub vm_uuid: String,
    pub target_vm_uuid: String,
    #[serde(default)]
    pub num_sync_phases: u64,
    #[serde(default)]
    pub progress_history: Vec<ProgressEntry>,
}

/// One phase transition in the record's history. Entries carry more
/// fields than we read (timestamps and the like); they ride along in
/// `extras` so a replaced record round-trips faithfully.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct ProgressEntry {
    pub phase: String,
    pub state: String,
    #[serde(flatten)]
    pub extras: Extras,
}

impl ProgressEntry {
    #[cfg(test)]
    pub fn new(phase: &str, state: &str) -> ProgressEntry {
        ProgressEntry {
            phase: phase.to_string(),
            state: state.to_string(),
            extras: Extras::new(),
        }
    }
}

/// The VM description from the startup payload.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct VmPayload {
    pub uuid: String,
    pub zfs_filesystem: String,
    pub brand: String,
    #[serde(default)]
    pub disks: Vec<VmDisk>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct VmDisk {
    pub zfs_filesystem: String,
}

/// Whether this brand keeps auxiliary disk volumes on independent
/// dataset roots. Everything else parents the disks under the zone
/// root, where `-r` recursion picks them up.
fn disks_are_peer_datasets(brand: &str) -> bool {
    brand == "kvm"
}

/// The datasets to migrate for this VM, in lexical order: the zone
/// root always, plus each disk volume for brands whose disks are not
/// children of the root.
pub fn vm_datasets(vm: &VmPayload) -> Vec<String> {
    let mut datasets = vec![vm.zfs_filesystem.clone()];
    if disks_are_peer_datasets(&vm.brand) {
        datasets.extend(vm.disks.iter().map(|d| d.zfs_filesystem.clone()));
    }
    datasets.sort_unstable();
    datasets.dedup();
    datasets
}

/// Maps a source dataset name to the name used on the target: when
/// the VM keeps its identity the name passes through verbatim,
/// otherwise the source VM id substring is rewritten to the target
/// id.
pub fn target_dataset(record: &MigrationRecord, dataset: &str) -> String {
    if record.vm_uuid == record.target_vm_uuid {
        dataset.to_string()
    } else {
        dataset.replace(&record.vm_uuid, &record.target_vm_uuid)
    }
}
