// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::sync::Arc;

use anyhow::Context;
use slog::{error, info, o, Logger};
use tokio::io::{AsyncReadExt, BufReader, Stdin};

use migrate_sender::bootstrap::{self, Action, StartupMessage};
use migrate_sender::ring::{self, RingDrain, RING_CAPACITY};
use migrate_sender::server::{ControlServer, Worker};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let ring = RingDrain::new(RING_CAPACITY);
    ring::install_panic_hook(ring.clone());
    let (log, _log_guard) =
        bootstrap::open_log(&ring).context("initializing logging")?;

    let mut stdin = BufReader::new(tokio::io::stdin());
    let mut stdout = tokio::io::stdout();

    let msg = match bootstrap::read_startup_message(&mut stdin).await {
        Ok(msg) => msg,
        Err(e) => {
            error!(log, "bad startup message: {e:#}");
            let _ = bootstrap::write_reply(
                &mut stdout,
                &bootstrap::error_reply(&e),
            )
            .await;
            return Err(e);
        }
    };

    let log = log.new(o!(
        "req_id" => msg.req_id.clone(),
        "task_uuid" => msg.uuid.to_string(),
    ));
    info!(log, "worker started"; "vm" => &msg.payload.vm.uuid);

    let (server, worker) = match setup(&log, &msg).await {
        Ok(parts) => parts,
        Err(e) => {
            error!(log, "bootstrap failed: {e:#}");
            let _ = bootstrap::write_reply(
                &mut stdout,
                &bootstrap::error_reply(&e),
            )
            .await;
            return Err(e);
        }
    };

    let addr = server.local_addr();
    bootstrap::write_reply(&mut stdout, &bootstrap::ready_reply(addr))
        .await?;

    spawn_parent_watchdog(stdin, Arc::clone(&worker), log.clone());

    server.serve(Arc::clone(&worker), msg.startup_timeout()).await;
    info!(log, "worker exiting");
    Ok(())
}

async fn setup(
    log: &Logger,
    msg: &StartupMessage,
) -> anyhow::Result<(ControlServer, Arc<Worker>)> {
    match msg.payload.migration_task.action {
        Action::Sync => {}
        Action::Switch => {
            anyhow::bail!("switch action is not supported by this worker")
        }
    }

    let admin_ip = bootstrap::resolve_admin_ip(log).await?;
    let server = ControlServer::bind(admin_ip).await?;
    let worker = Worker::new(
        log.clone(),
        msg.payload.vm.clone(),
        Some(msg.payload.migration_task.record.clone()),
    );
    Ok((server, worker))
}

/// Ends the worker when the parent supervisor goes away: stdin stays
/// open for the life of the parent and sees EOF when it exits.
fn spawn_parent_watchdog(
    mut stdin: BufReader<Stdin>,
    worker: Arc<Worker>,
    log: Logger,
) {
    tokio::spawn(async move {
        let mut buf = [0u8; 256];
        loop {
            match stdin.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
        }
        info!(log, "parent supervisor disconnected");
        worker.shutdown();
    });
}
