// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The control surface the parent supervisor drives: a TCP listener
//! on the admin network speaking line-delimited JSON requests, and
//! the shared `Worker` state those requests act on.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use slog::{debug, error, info, o, warn, Logger};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio::time;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::codec::{Event, EventFramer, Extras, ProtocolError, Request};
use crate::migrate::{self, MigrateError, MigrationRecord, VmPayload};
use crate::progress::{Progress, Subscriber, Watcher};

/// How long terminal events get to drain once shutdown begins.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Everything one worker process mutates: the migration record, the
/// transfer counters, the stop flag, and the watcher singleton. One
/// live sync per worker.
pub struct Worker {
    pub log: Logger,
    pub vm: VmPayload,
    pub record: Mutex<Option<MigrationRecord>>,
    pub progress: Arc<Progress>,
    pub stop: Arc<AtomicBool>,
    watcher: Mutex<Option<Watcher>>,
    sync_running: AtomicBool,
    shutdown: watch::Sender<bool>,
}

impl Worker {
    pub fn new(
        log: Logger,
        vm: VmPayload,
        record: Option<MigrationRecord>,
    ) -> Arc<Worker> {
        let (shutdown, _) = watch::channel(false);
        Arc::new(Worker {
            log,
            vm,
            record: Mutex::new(record),
            progress: Arc::new(Progress::new()),
            stop: Arc::new(AtomicBool::new(false)),
            watcher: Mutex::new(None),
            sync_running: AtomicBool::new(false),
            shutdown,
        })
    }

    /// Subscribes a control socket to progress events, starting the
    /// watcher if this is the first subscription.
    pub fn subscribe_progress(&self, sub: Subscriber) {
        let mut slot = self.watcher.lock().unwrap();
        slot.get_or_insert_with(|| {
            Watcher::start(
                Arc::clone(&self.progress),
                Arc::clone(&self.stop),
                self.log.clone(),
            )
        })
        .subscribe(sub);
    }

    /// Errors out if a stop was requested; pipeline steps call this
    /// at their suspension points.
    pub fn check_stop(&self) -> Result<(), MigrateError> {
        if self.stop.load(Ordering::SeqCst) {
            Err(MigrateError::Stopped)
        } else {
            Ok(())
        }
    }

    /// Sets the stop flag, ends the watcher, and tells the listener
    /// and every connection to wind down.
    pub fn shutdown(&self) {
        info!(self.log, "worker shutting down");
        self.stop.store(true, Ordering::SeqCst);
        if let Some(watcher) = self.watcher.lock().unwrap().take() {
            watcher.end();
        }
        self.shutdown.send_replace(true);
    }

    fn shutdown_rx(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    fn try_claim_sync(&self) -> bool {
        !self.sync_running.swap(true, Ordering::SeqCst)
    }
}

/// The supervisor-facing TCP listener.
pub struct ControlServer {
    listener: TcpListener,
    local: SocketAddr,
}

impl ControlServer {
    /// Binds an ephemeral port on the admin interface.
    pub async fn bind(ip: IpAddr) -> Result<ControlServer, MigrateError> {
        let listener = TcpListener::bind((ip, 0)).await.map_err(|e| {
            MigrateError::Setup(format!(
                "binding control listener on {ip}: {e}"
            ))
        })?;
        let local = listener.local_addr().map_err(|e| {
            MigrateError::Setup(format!("reading listener address: {e}"))
        })?;
        Ok(ControlServer { listener, local })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    /// Accepts supervisor connections until shutdown. If nothing
    /// connects within `startup_timeout` the worker is presumed
    /// orphaned and ends itself.
    pub async fn serve(self, worker: Arc<Worker>, startup_timeout: Duration) {
        let log = worker.log.new(o!("task" => "control"));
        info!(log, "control server listening"; "addr" => self.local.to_string());

        let mut shutdown_rx = worker.shutdown_rx();
        let mut conns = JoinSet::new();
        let startup_deadline = time::sleep(startup_timeout);
        tokio::pin!(startup_deadline);
        let mut seen_conn = false;

        loop {
            if *shutdown_rx.borrow_and_update() {
                break;
            }
            tokio::select! {
                biased;

                _ = shutdown_rx.changed() => break,

                _ = &mut startup_deadline, if !seen_conn => {
                    warn!(log, "no supervisor connection within {:?}",
                        startup_timeout);
                    worker.shutdown();
                    break;
                }

                accepted = self.listener.accept() => match accepted {
                    Ok((sock, addr)) => {
                        seen_conn = true;
                        debug!(log, "accepted control connection";
                            "from" => addr.to_string());
                        conns.spawn(handle_conn(
                            Arc::clone(&worker),
                            sock,
                            log.new(o!("conn" => addr.to_string())),
                        ));
                    }
                    Err(e) => {
                        error!(log, "control listener accept error: {e}");
                    }
                },
            }
        }

        drop(self.listener);
        // Give connections a moment to flush terminal events.
        let drained = time::timeout(DRAIN_TIMEOUT, async {
            while conns.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(log, "control connections did not drain in time");
            conns.shutdown().await;
        }
        info!(log, "control server closed");
    }
}

async fn handle_conn(worker: Arc<Worker>, sock: TcpStream, log: Logger) {
    let (read_half, write_half) = sock.into_split();
    let mut reader = FramedRead::new(read_half, EventFramer::new());
    let mut writer = FramedWrite::new(write_half, EventFramer::new());

    // All replies and progress events funnel through one channel so
    // the socket sees whole lines regardless of who is talking.
    let (tx, mut rx) = mpsc::unbounded_channel::<Event>();
    let mut writer_task = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            if writer.send(event).await.is_err() {
                break;
            }
        }
    });

    let mut shutdown_rx = worker.shutdown_rx();
    loop {
        if *shutdown_rx.borrow_and_update() {
            break;
        }
        tokio::select! {
            biased;

            _ = shutdown_rx.changed() => break,

            item = reader.next() => match item {
                None => {
                    debug!(log, "control connection closed by peer");
                    break;
                }
                Some(Ok(Event::Request(req))) => {
                    dispatch(&worker, &tx, req, &log);
                }
                Some(Ok(other)) => {
                    warn!(log, "ignoring non-request control event";
                        "event" => format!("{other:?}"));
                }
                Some(Err(ProtocolError::Io(e))) => {
                    warn!(log, "control socket read error: {e}");
                    break;
                }
                Some(Err(e)) => {
                    // Malformed lines are logged and discarded; the
                    // stream stays usable for later commands.
                    warn!(log, "discarding malformed control line: {e}");
                }
            },
        }
    }

    drop(tx);
    if time::timeout(Duration::from_secs(1), &mut writer_task)
        .await
        .is_err()
    {
        writer_task.abort();
    }
}

fn dispatch(
    worker: &Arc<Worker>,
    tx: &Subscriber,
    req: Request,
    log: &Logger,
) {
    debug!(log, "control request";
        "command" => &req.command, "event_id" => req.event_id);
    match req.command.as_str() {
        "ping" => {
            let mut extras = Extras::new();
            extras.insert("pid".to_string(), std::process::id().into());
            extras.insert(
                "version".to_string(),
                env!("CARGO_PKG_VERSION").into(),
            );
            let _ = tx.send(Event::response("ping", req.event_id, extras));
        }

        "set-record" => {
            let parsed = req
                .extras
                .get("record")
                .cloned()
                .map(serde_json::from_value::<MigrationRecord>);
            match parsed {
                Some(Ok(record)) => {
                    debug!(log, "record replaced";
                        "vm_uuid" => &record.vm_uuid);
                    *worker.record.lock().unwrap() = Some(record);
                    let _ = tx.send(Event::response(
                        "set-record",
                        req.event_id,
                        Extras::new(),
                    ));
                }
                _ => {
                    let _ = tx.send(Event::error(
                        Some("set-record"),
                        Some(req.event_id),
                        "set-record request carried no usable record",
                    ));
                }
            }
        }

        "watch" => {
            worker.subscribe_progress(tx.clone());
            let _ = tx.send(Event::response(
                "watch",
                req.event_id,
                Extras::new(),
            ));
        }

        "sync" => handle_sync(worker, tx, req, log),

        "stop" | "end" => {
            let _ = tx.send(Event::response(
                &req.command,
                req.event_id,
                Extras::new(),
            ));
            worker.shutdown();
        }

        _ => {
            let _ = tx.send(Event::error(
                Some(req.command.as_str()),
                Some(req.event_id),
                "Not Implemented",
            ));
        }
    }
}

fn handle_sync(
    worker: &Arc<Worker>,
    tx: &Subscriber,
    req: Request,
    log: &Logger,
) {
    let host = req
        .extras
        .get("host")
        .and_then(|v| v.as_str())
        .map(str::to_string);
    let port = req
        .extras
        .get("port")
        .and_then(|v| v.as_u64())
        .and_then(|p| u16::try_from(p).ok());
    let (Some(host), Some(port)) = (host, port) else {
        let _ = tx.send(Event::error(
            Some("sync"),
            Some(req.event_id),
            "sync request must carry the receiver host and port",
        ));
        return;
    };

    if !worker.try_claim_sync() {
        let _ = tx.send(Event::error(
            Some("sync"),
            Some(req.event_id),
            MigrateError::SyncInProgress,
        ));
        return;
    }

    worker.subscribe_progress(tx.clone());
    let worker = Arc::clone(worker);
    let tx = tx.clone();
    let log = log.clone();
    tokio::spawn(async move {
        let result = migrate::sync::run(&worker, &host, port).await;
        match result {
            Ok(()) => {
                info!(log, "sync completed");
                let _ = tx.send(Event::response(
                    "sync",
                    req.event_id,
                    Extras::new(),
                ));
            }
            Err(e) => {
                error!(log, "sync failed: {e}");
                let _ =
                    tx.send(Event::error(Some("sync"), Some(req.event_id), e));
            }
        }
        // The terminal status is delivered; this worker's job is
        // done either way.
        worker.shutdown();
    });
}
