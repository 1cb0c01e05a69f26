// SPDX-License-Identifier: MIT

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use drainpool::pool::{RecordHandler, WorkerContext};

/// Remembers every record together with the worker that handled it.
#[derive(Debug)]
pub struct RecordingHandler<R> {
    seen: Arc<Mutex<Vec<(usize, R)>>>,
}

impl<R> Clone for RecordingHandler<R> {
    fn clone(&self) -> Self {
        Self {
            seen: self.seen.clone(),
        }
    }
}

impl<R> Default for RecordingHandler<R> {
    fn default() -> Self {
        Self {
            seen: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl<R: Clone> RecordingHandler<R> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<R> {
        self.seen
            .lock()
            .unwrap()
            .iter()
            .map(|(_, record)| record.clone())
            .collect()
    }

    pub fn workers(&self) -> Vec<usize> {
        self.seen.lock().unwrap().iter().map(|(id, _)| *id).collect()
    }
}

impl<R: Send + 'static> RecordHandler<R> for RecordingHandler<R> {
    fn desc(&self) -> &str {
        "recording handler"
    }

    fn handle(&self, ctx: &WorkerContext, record: R) -> anyhow::Result<()> {
        self.seen.lock().unwrap().push((ctx.worker_id(), record));
        Ok(())
    }
}

/// Holds every record until the gate is opened. Never looks at the stop
/// token, so a closed gate stands in for a handler stuck in a loop.
#[derive(Debug, Clone, Default)]
pub struct GatedHandler {
    gate: Arc<(Mutex<bool>, Condvar)>,
    started: Arc<AtomicUsize>,
    finished: Arc<AtomicUsize>,
}

impl GatedHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(&self) {
        let (open, changed) = &*self.gate;
        *open.lock().unwrap() = true;
        changed.notify_all();
    }

    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    pub fn finished(&self) -> usize {
        self.finished.load(Ordering::SeqCst)
    }

    /// Waits until at least `count` records entered the handler.
    pub fn wait_started(&self, count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.started() < count {
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        true
    }
}

impl<R: Send + 'static> RecordHandler<R> for GatedHandler {
    fn desc(&self) -> &str {
        "gated handler"
    }

    fn handle(&self, _ctx: &WorkerContext, _record: R) -> anyhow::Result<()> {
        self.started.fetch_add(1, Ordering::SeqCst);
        let (open, changed) = &*self.gate;
        let mut is_open = open.lock().unwrap();
        while !*is_open {
            is_open = changed.wait(is_open).unwrap();
        }
        self.finished.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
