// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The link to the remote receiver agent: one TCP connection carrying
//! line-delimited JSON control frames and, after a `sync` request is
//! acknowledged, the raw bytes of the send stream on the outbound
//! direction. The inbound direction stays framed throughout; nothing
//! reads the outbound direction, so byte boundaries of the bulk data
//! are preserved.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::StreamExt;
use slog::{debug, info, o, warn, Logger};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time;
use tokio::time::Instant;
use tokio_util::codec::FramedRead;

use crate::codec::{
    Event, EventFramer, Extras, ProtocolError, Request, Response,
};
use crate::migrate::MigrateError;

/// How long the inbound direction may stay silent while we are
/// waiting on the receiver.
const IDLE_TIMEOUT: Duration = Duration::from_secs(5 * 60);

struct Shared {
    /// Waiters keyed by the event id of the request they answer.
    pending: Mutex<HashMap<u64, oneshot::Sender<Response>>>,

    /// Set once a `sync` request has been issued; a `sync-success`
    /// seen before then is a protocol violation.
    expect_sync: AtomicBool,

    /// Set when `sync-success` arrives, so a subsequent end of the
    /// inbound direction reads as a graceful close rather than a
    /// dropped connection.
    ended_ok: AtomicBool,

    /// When the link last moved bytes in either direction. The idle
    /// timeout measures against this, so an hour-long outbound stream
    /// with a silent receiver is not mistaken for a dead link.
    activity: Mutex<Instant>,
}

impl Shared {
    fn touch(&self) {
        *self.activity.lock().unwrap() = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.activity.lock().unwrap().elapsed()
    }
}

/// One connection to the receiver. Requests are correlated to
/// responses by event id; asynchronous `error` and `sync-success`
/// events are routed to whichever pipeline step is currently
/// awaiting.
pub struct ReceiverLink {
    log: Logger,
    writer: OwnedWriteHalf,
    shared: Arc<Shared>,
    errors: mpsc::UnboundedReceiver<MigrateError>,
    sync_success: mpsc::UnboundedReceiver<()>,
    next_event_id: u64,
    throttle: Option<u64>,
    demux: tokio::task::JoinHandle<()>,
}

impl ReceiverLink {
    /// Connects to the receiver at `host:port` and starts the demux
    /// task for the inbound direction.
    pub async fn connect(
        host: &str,
        port: u16,
        log: &Logger,
    ) -> Result<ReceiverLink, MigrateError> {
        let peer = format!("{host}:{port}");
        let log = log.new(o!("peer" => peer.clone()));
        debug!(log, "connecting to receiver");
        let sock = TcpStream::connect(&peer).await.map_err(|e| {
            MigrateError::link(format!("connect to {peer}: {e}"))
        })?;
        let _ = sock.set_nodelay(true);
        let (read_half, write_half) = sock.into_split();

        let shared = Arc::new(Shared {
            pending: Mutex::new(HashMap::new()),
            expect_sync: AtomicBool::new(false),
            ended_ok: AtomicBool::new(false),
            activity: Mutex::new(Instant::now()),
        });
        let (err_tx, err_rx) = mpsc::unbounded_channel();
        let (sync_tx, sync_rx) = mpsc::unbounded_channel();
        let demux = tokio::spawn(demux(
            FramedRead::new(read_half, EventFramer::new()),
            Arc::clone(&shared),
            err_tx,
            sync_tx,
            log.clone(),
        ));

        Ok(ReceiverLink {
            log,
            writer: write_half,
            shared,
            errors: err_rx,
            sync_success: sync_rx,
            next_event_id: 1,
            throttle: None,
            demux,
        })
    }

    /// Configures the reserved byte-rate limit for bulk streaming.
    /// Left unset in this revision; the send stream is piped to the
    /// socket directly.
    #[allow(dead_code)]
    pub fn set_throttle(&mut self, bytes_per_sec: Option<u64>) {
        self.throttle = bytes_per_sec;
    }

    /// Issues `command` and waits for its response. An asynchronous
    /// receiver error or link failure arriving first is returned
    /// instead.
    pub async fn request(
        &mut self,
        command: &str,
        extras: Extras,
    ) -> Result<Response, MigrateError> {
        let event_id = self.next_event_id;
        self.next_event_id += 1;

        let (tx, rx) = oneshot::channel();
        self.shared.pending.lock().unwrap().insert(event_id, tx);

        debug!(self.log, "issuing request";
            "command" => command, "event_id" => event_id);
        let event = Event::Request(Request {
            command: command.to_string(),
            event_id,
            extras,
        });
        self.send_event(event).await?;

        let res = tokio::select! {
            resp = rx => Ok(resp),
            err = self.errors.recv() => Err(flatten_err(err)),
        };
        match res {
            Ok(Ok(resp)) => Ok(resp),
            Ok(Err(_)) => Err(self.closed_err()),
            Err(e) => Err(e),
        }
    }

    /// The demux task reports its failure reason right before it
    /// drops the waiters and sinks, so when one of those closes under
    /// us the real error is usually sitting in the error channel.
    fn closed_err(&mut self) -> MigrateError {
        self.errors
            .try_recv()
            .unwrap_or_else(|_| MigrateError::link("receiver link closed"))
    }

    /// Arms the sync-success sink. Called before the `sync` request
    /// goes out; a success announcement before this point is
    /// untimely.
    pub fn expect_sync_success(&self) {
        self.shared.expect_sync.store(true, Ordering::SeqCst);
    }

    /// Forwards `src` (the send process stdout) into the socket,
    /// adding every byte written to `counter`. Returns early if the
    /// receiver reports an error or the link fails.
    pub async fn stream_from<R: AsyncRead + Unpin>(
        &mut self,
        src: &mut R,
        counter: &AtomicU64,
    ) -> Result<(), MigrateError> {
        let Self { writer, errors, throttle, shared, .. } = self;
        tokio::select! {
            res = copy_counted(src, writer, counter, *throttle, shared) => {
                res
            }
            err = errors.recv() => Err(flatten_err(err)),
        }
    }

    /// Waits for the receiver's asynchronous `sync-success`. The
    /// announcement may already have arrived and been buffered.
    pub async fn wait_sync_success(&mut self) -> Result<(), MigrateError> {
        let Self { sync_success, errors, .. } = &mut *self;
        let res = tokio::select! {
            success = sync_success.recv() => Ok(success),
            err = errors.recv() => Err(flatten_err(err)),
        };
        match res {
            Ok(Some(())) => {
                info!(self.log, "receiver announced sync-success");
                Ok(())
            }
            Ok(None) => Err(self.closed_err()),
            Err(e) => Err(e),
        }
    }

    /// Closes the link. Our half goes down first so the demux task
    /// never mistakes the local close for a dropped peer.
    pub async fn close(self) {
        self.demux.abort();
        let _ = self.demux.await;
        drop(self.writer);
    }

    async fn send_event(&mut self, event: Event) -> Result<(), MigrateError> {
        let mut buf = bytes::BytesMut::new();
        use tokio_util::codec::Encoder;
        EventFramer::new()
            .encode(event, &mut buf)
            .map_err(MigrateError::Protocol)?;
        self.writer
            .write_all(&buf)
            .await
            .map_err(|e| MigrateError::link(format!("write: {e}")))?;
        self.writer
            .flush()
            .await
            .map_err(|e| MigrateError::link(format!("flush: {e}")))?;
        self.shared.touch();
        Ok(())
    }
}

fn flatten_err(err: Option<MigrateError>) -> MigrateError {
    err.unwrap_or_else(|| MigrateError::link("receiver link closed"))
}

async fn copy_counted<R, W>(
    src: &mut R,
    dst: &mut W,
    counter: &AtomicU64,
    throttle: Option<u64>,
    shared: &Shared,
) -> Result<(), MigrateError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let start = Instant::now();
    let mut sent: u64 = 0;
    let mut buf = vec![0u8; 128 * 1024];
    loop {
        let n = src.read(&mut buf).await.map_err(|e| {
            MigrateError::storage(
                "send stream",
                format!("reading send output: {e}"),
            )
        })?;
        if n == 0 {
            break;
        }
        dst.write_all(&buf[..n]).await.map_err(|e| {
            MigrateError::link(format!("writing send stream: {e}"))
        })?;
        sent += n as u64;
        counter.fetch_add(n as u64, Ordering::Relaxed);
        shared.touch();

        if let Some(rate) = throttle {
            // Pace the pipe to the configured byte rate.
            let target = Duration::from_secs_f64(sent as f64 / rate as f64);
            let elapsed = start.elapsed();
            if target > elapsed {
                time::sleep(target - elapsed).await;
            }
        }
    }
    dst.flush()
        .await
        .map_err(|e| MigrateError::link(format!("flush: {e}")))?;
    Ok(())
}

/// Reads framed events off the inbound direction and routes them:
/// responses to their waiters, asynchronous errors to the error sink,
/// `sync-success` to the sync sink. Runs until the link dies or is
/// closed.
async fn demux(
    mut reader: FramedRead<OwnedReadHalf, EventFramer>,
    shared: Arc<Shared>,
    err_tx: mpsc::UnboundedSender<MigrateError>,
    sync_tx: mpsc::UnboundedSender<()>,
    log: Logger,
) {
    loop {
        let next = time::timeout(IDLE_TIMEOUT, reader.next()).await;
        let event = match next {
            Err(_) => {
                // Outbound traffic counts as liveness too; only a
                // link quiet in both directions is dead.
                if shared.idle_for() < IDLE_TIMEOUT {
                    continue;
                }
                let _ = err_tx.send(MigrateError::link(format!(
                    "receiver idle for {IDLE_TIMEOUT:?}"
                )));
                break;
            }
            Ok(None) => {
                if !shared.ended_ok.load(Ordering::SeqCst) {
                    let _ = err_tx.send(MigrateError::NoSyncSuccess);
                }
                break;
            }
            Ok(Some(Err(e))) => {
                let _ = err_tx.send(match e {
                    ProtocolError::Io(e) => {
                        MigrateError::link(format!("read: {e}"))
                    }
                    other => MigrateError::link(other.to_string()),
                });
                break;
            }
            Ok(Some(Ok(event))) => {
                shared.touch();
                event
            }
        };

        match event {
            Event::Response(resp) => {
                let waiter = shared
                    .pending
                    .lock()
                    .unwrap()
                    .remove(&resp.event_id);
                match waiter {
                    Some(tx) => {
                        // The waiter may have given up; that is fine.
                        let _ = tx.send(resp);
                    }
                    None => {
                        let _ = err_tx.send(MigrateError::link(format!(
                            "response for unknown event id {}",
                            resp.event_id
                        )));
                        break;
                    }
                }
            }
            Event::Error(err) => {
                warn!(log, "receiver reported error";
                    "message" => &err.message);
                let _ = err_tx.send(MigrateError::Remote(err.message));
            }
            Event::SyncSuccess(_) => {
                if shared.expect_sync.load(Ordering::SeqCst) {
                    shared.ended_ok.store(true, Ordering::SeqCst);
                    let _ = sync_tx.send(());
                } else {
                    let _ = err_tx.send(MigrateError::Protocol(
                        ProtocolError::UntimelySyncSuccess,
                    ));
                }
            }
            other => {
                let _ = err_tx.send(MigrateError::link(format!(
                    "unexpected event from receiver: {other:?}"
                )));
                break;
            }
        }
    }
    // Fail any waiters still outstanding when the demux winds down.
    shared.pending.lock().unwrap().clear();
}
