// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Shared transfer counters and the watcher that broadcasts them to
//! subscribed control sockets.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use slog::{debug, info, o, Logger};
use tokio::sync::mpsc;
use tokio::time;

use crate::codec::{Event, ProgressEvent};

/// Every 60th tick broadcasts even without progress, so a subscriber
/// sees life at least once a minute during a long quiet stretch.
const KEEPALIVE_TICKS: u64 = 60;

/// The transfer counters for the one sync this worker may run.
/// Written by the orchestrator's serial phases and the periodic
/// sampler; read by the watcher without further locking.
#[derive(Debug, Default)]
pub struct Progress {
    current: AtomicU64,
    total: AtomicU64,
}

impl Progress {
    pub fn new() -> Progress {
        Progress::default()
    }

    pub fn current(&self) -> u64 {
        self.current.load(Ordering::Relaxed)
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> (u64, u64) {
        (self.current(), self.total())
    }

    /// Updates the bytes-moved counter, raising the total alongside
    /// it if the estimate turned out low.
    pub fn set_current(&self, value: u64) {
        self.current.store(value, Ordering::Relaxed);
        self.total.fetch_max(value, Ordering::Relaxed);
    }

    /// Grows the total by a freshly estimated amount.
    pub fn add_total(&self, delta: u64) {
        self.total.fetch_add(delta, Ordering::Relaxed);
    }
}

/// A subscribed control socket's outbound event channel.
pub type Subscriber = mpsc::UnboundedSender<Event>;

/// Decides what a tick does. Returns `(broadcast, store)`: whether to
/// emit at all, and whether the peer should persist the entry (the
/// keep-alive ticks ask it to).
fn tick_action(tick: u64, current: u64, last: u64) -> (bool, bool) {
    let keepalive = tick % KEEPALIVE_TICKS == 0;
    (current != last || keepalive, keepalive)
}

/// The singleton progress broadcaster. Created on the first `sync` or
/// `watch` command; runs until the stop flag is set or it is ended.
pub struct Watcher {
    subscribers: Arc<Mutex<Vec<Subscriber>>>,
    task: tokio::task::JoinHandle<()>,
}

impl Watcher {
    pub fn start(
        progress: Arc<Progress>,
        stop: Arc<AtomicBool>,
        log: Logger,
    ) -> Watcher {
        let log = log.new(o!("task" => "watcher"));
        let subscribers: Arc<Mutex<Vec<Subscriber>>> =
            Arc::new(Mutex::new(Vec::new()));
        let subs = Arc::clone(&subscribers);
        let task = tokio::spawn(async move {
            let mut ticker = time::interval(Duration::from_secs(1));
            // The first tick of an interval completes immediately;
            // swallow it so ticks land on one-second boundaries.
            ticker.tick().await;

            let mut last = 0;
            let mut tick: u64 = 0;
            loop {
                ticker.tick().await;
                if stop.load(Ordering::SeqCst) {
                    info!(log, "stop flag set, watcher exiting");
                    break;
                }
                tick += 1;
                let (current, total) = progress.snapshot();
                let (broadcast, store) = tick_action(tick, current, last);
                if !broadcast {
                    continue;
                }
                last = current;

                let event = Event::Progress(ProgressEvent {
                    phase: "sync".to_string(),
                    state: "running".to_string(),
                    current_progress: current,
                    total_progress: total,
                    store,
                });
                let mut subs = subs.lock().unwrap();
                subs.retain(|sub| match sub.send(event.clone()) {
                    Ok(()) => true,
                    Err(_) => {
                        debug!(log, "dropping dead progress subscriber");
                        false
                    }
                });
            }
        });
        Watcher { subscribers, task }
    }

    /// Adds a control socket to the broadcast list.
    pub fn subscribe(&self, sub: Subscriber) {
        self.subscribers.lock().unwrap().push(sub);
    }

    /// Cancels the timer and drops every subscriber channel, which
    /// lets the owning connections tear their sockets down.
    pub fn end(self) {
        self.task.abort();
        self.subscribers.lock().unwrap().clear();
    }
}
