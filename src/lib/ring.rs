// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! An in-memory ring of the most recent log entries, kept alongside
//! the file drain so a crash can dump the tail of the log to stderr
//! even when the file is not at hand.

use std::collections::VecDeque;
use std::fmt::Write as _;
use std::sync::{Arc, Mutex};

use slog::{Drain, Never, OwnedKVList, Record, KV};

/// How many formatted entries the ring retains.
pub const RING_CAPACITY: usize = 100;

#[derive(Clone)]
pub struct RingDrain {
    entries: Arc<Mutex<VecDeque<String>>>,
    capacity: usize,
}

impl RingDrain {
    pub fn new(capacity: usize) -> RingDrain {
        RingDrain {
            entries: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity,
        }
    }

    /// The retained entries, oldest first.
    pub fn dump(&self) -> Vec<String> {
        self.entries.lock().unwrap().iter().cloned().collect()
    }
}

impl Drain for RingDrain {
    type Ok = ();
    type Err = Never;

    fn log(
        &self,
        record: &Record,
        values: &OwnedKVList,
    ) -> Result<(), Never> {
        let mut line = format!(
            "{} {} {}",
            record.level().as_short_str(),
            record.module(),
            record.msg()
        );
        let mut ser = LineSerializer { line: &mut line };
        let _ = record.kv().serialize(record, &mut ser);
        let _ = values.serialize(record, &mut ser);

        let mut entries = self.entries.lock().unwrap();
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(line);
        Ok(())
    }
}

struct LineSerializer<'a> {
    line: &'a mut String,
}

impl slog::Serializer for LineSerializer<'_> {
    fn emit_arguments(
        &mut self,
        key: slog::Key,
        val: &std::fmt::Arguments,
    ) -> slog::Result {
        let _ = write!(self.line, " {key}={val}");
        Ok(())
    }
}

/// Arranges for a panicking worker to dump the ring to stderr before
/// the default hook reports the panic itself.
pub fn install_panic_hook(ring: RingDrain) {
    let previous = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let entries = ring.dump();
        if !entries.is_empty() {
            eprintln!("last {} log entries before panic:", entries.len());
            for line in entries {
                eprintln!("  {line}");
            }
        }
        previous(info);
    }));
}

#[cfg(test)]
mod tests {
    use super::*;
    use slog::{info, o, Logger};

    #[test]
    fn ring_keeps_only_the_tail() {
        let ring = RingDrain::new(3);
        let log = Logger::root(ring.clone().fuse(), o!());
        for i in 0..10 {
            info!(log, "entry {}", i);
        }
        let entries = ring.dump();
        assert_eq!(entries.len(), 3);
        assert!(entries[2].contains("entry 9"));
        assert!(entries[0].contains("entry 7"));
    }

    #[test]
    fn ring_records_structured_keys() {
        let ring = RingDrain::new(4);
        let log = Logger::root(ring.clone().fuse(), o!("task" => "sync"));
        info!(log, "hello"; "dataset" => "zones/x");
        let entries = ring.dump();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].contains("dataset=zones/x"));
        assert!(entries[0].contains("task=sync"));
    }
}
