// SPDX-License-Identifier: MIT

use std::fmt;

use async_channel::{Receiver, Sender, TryRecvError, TrySendError};
use futures::future::{self, Either};
use log::warn;

/// Fixed half of every sentinel. The other half is random per queue.
const SENTINEL_TAG: u64 = 0x6472_6169_6e5f_656f;

/// Control record telling exactly one worker to stop.
///
/// Only the queue that generated a sentinel recognises it, so a sentinel
/// can never be mistaken for (or forged by) a real record.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Sentinel {
    tag: u64,
    nonce: u64,
}

impl Sentinel {
    fn generate() -> Self {
        Self {
            tag: SENTINEL_TAG,
            nonce: rand::random(),
        }
    }
}

impl fmt::Debug for Sentinel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Sentinel({:016x}:{:016x})", self.tag, self.nonce)
    }
}

enum Envelope<R> {
    Record(R),
    Sentinel(Sentinel),
}

/// What a worker gets back from the queue.
#[derive(Debug, PartialEq, Eq)]
pub enum Next<R> {
    Record(R),
    /// This queue's own sentinel.
    Sentinel,
    /// Something was dequeued that is neither a record nor our sentinel.
    /// Treated as a transient no-op.
    Spurious,
    /// The stop token fired or the queue was torn down.
    Stopped,
}

/// Unbounded FIFO queue shared by the producers and every worker of a pool.
///
/// Besides the record channel the queue owns a stop channel that never
/// carries data. Closing it is the cancellation token: every blocked
/// [`WorkQueue::get`] wakes up with [`Next::Stopped`].
pub struct WorkQueue<R> {
    tx: Sender<Envelope<R>>,
    rx: Receiver<Envelope<R>>,
    stop_tx: Sender<()>,
    stop_rx: Receiver<()>,
    sentinel: Sentinel,
}

impl<R> Clone for WorkQueue<R> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            rx: self.rx.clone(),
            stop_tx: self.stop_tx.clone(),
            stop_rx: self.stop_rx.clone(),
            sentinel: self.sentinel,
        }
    }
}

impl<R> fmt::Debug for WorkQueue<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkQueue")
            .field("len", &self.rx.len())
            .field("stopped", &self.is_stopped())
            .field("sentinel", &self.sentinel)
            .finish()
    }
}

impl<R> Default for WorkQueue<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R> WorkQueue<R> {
    pub fn new() -> Self {
        let (tx, rx) = async_channel::unbounded();
        let (stop_tx, stop_rx) = async_channel::bounded(1);
        Self {
            tx,
            rx,
            stop_tx,
            stop_rx,
            sentinel: Sentinel::generate(),
        }
    }

    /// Appends a record. Never blocks; the record is handed back if the
    /// queue has been torn down.
    pub fn put(&self, record: R) -> Result<(), R> {
        match self.tx.try_send(Envelope::Record(record)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Closed(Envelope::Record(record)))
            | Err(TrySendError::Full(Envelope::Record(record))) => Err(record),
            Err(_) => unreachable!("a record envelope comes back as a record envelope"),
        }
    }

    /// Appends `count` copies of this queue's sentinel.
    pub fn put_sentinels(&self, count: usize) -> usize {
        (0..count)
            .take_while(|_| self.tx.try_send(Envelope::Sentinel(self.sentinel)).is_ok())
            .count()
    }

    /// Blocks until a record, a sentinel or the stop token is available.
    ///
    /// The stop token takes precedence when both are ready.
    pub fn get(&self) -> Next<R> {
        if self.is_stopped() {
            return Next::Stopped;
        }

        let received = futures::executor::block_on(async {
            match future::select(Box::pin(self.stop_rx.recv()), Box::pin(self.rx.recv())).await {
                Either::Left(_) => None,
                Either::Right((envelope, _)) => envelope.ok(),
            }
        });

        match received {
            Some(envelope) => self.classify(envelope),
            None => Next::Stopped,
        }
    }

    /// Non-blocking variant of [`WorkQueue::get`]. `None` means empty.
    pub fn try_get(&self) -> Option<Next<R>> {
        if self.is_stopped() {
            return Some(Next::Stopped);
        }
        match self.rx.try_recv() {
            Ok(envelope) => Some(self.classify(envelope)),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Closed) => Some(Next::Stopped),
        }
    }

    fn classify(&self, envelope: Envelope<R>) -> Next<R> {
        match envelope {
            Envelope::Record(record) => Next::Record(record),
            Envelope::Sentinel(sentinel) if sentinel == self.sentinel => Next::Sentinel,
            Envelope::Sentinel(sentinel) => {
                warn!("Ignoring foreign {:?}", sentinel);
                Next::Spurious
            }
        }
    }

    /// Best-effort: only advisory while producers or consumers are active.
    /// Counts queued sentinels too.
    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    /// Fires the stop token. Idempotent.
    pub fn stop(&self) {
        self.stop_tx.close();
    }

    pub fn is_stopped(&self) -> bool {
        self.stop_rx.is_closed()
    }

    pub(crate) fn stop_token(&self) -> Receiver<()> {
        self.stop_rx.clone()
    }

    /// Tears the queue down and hands back the real records still in it.
    pub fn discard_remaining(&self) -> Vec<R> {
        self.stop();
        self.tx.close();
        let mut discarded = Vec::new();
        while let Ok(envelope) = self.rx.try_recv() {
            if let Envelope::Record(record) = envelope {
                discarded.push(record);
            }
        }
        discarded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::{Duration, Instant};

    #[test]
    fn single_producer_order_is_preserved() {
        let queue = WorkQueue::new();
        for i in 0..100 {
            queue.put(i).unwrap();
        }
        let received: Vec<i32> = (0..100)
            .map(|_| match queue.get() {
                Next::Record(r) => r,
                other => panic!("unexpected {:?}", other),
            })
            .collect();
        assert_eq!(received, (0..100).collect::<Vec<_>>());
        assert!(queue.is_empty());
    }

    #[test]
    fn sentinels_follow_earlier_records() {
        let queue = WorkQueue::new();
        queue.put("a").unwrap();
        assert_eq!(queue.put_sentinels(2), 2);
        queue.put("b").unwrap();

        assert_eq!(queue.get(), Next::Record("a"));
        assert_eq!(queue.get(), Next::Sentinel);
        assert_eq!(queue.get(), Next::Sentinel);
        assert_eq!(queue.get(), Next::Record("b"));
    }

    #[test]
    fn sentinels_of_another_queue_are_not_recognised() {
        let ours = WorkQueue::<u8>::new();
        let theirs = WorkQueue::<u8>::new();
        assert_ne!(ours.sentinel, theirs.sentinel);

        assert_eq!(ours.classify(Envelope::Sentinel(theirs.sentinel)), Next::Spurious);
        assert_eq!(ours.classify(Envelope::Sentinel(ours.sentinel)), Next::Sentinel);
    }

    #[test]
    fn stop_wakes_a_blocked_get() {
        let queue = WorkQueue::<u32>::new();
        let q = queue.clone();
        let started = Instant::now();
        let waiter = thread::spawn(move || q.get());

        thread::sleep(Duration::from_millis(50));
        queue.stop();

        assert_eq!(waiter.join().unwrap(), Next::Stopped);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn stop_takes_precedence_over_pending_records() {
        let queue = WorkQueue::new();
        queue.put(1).unwrap();
        queue.stop();
        assert_eq!(queue.get(), Next::Stopped);
        assert_eq!(queue.try_get(), Some(Next::Stopped));
    }

    #[test]
    fn try_get_on_empty_queue_is_none() {
        let queue = WorkQueue::<()>::new();
        assert_eq!(queue.try_get(), None);
    }

    #[test]
    fn discard_returns_only_records() {
        let queue = WorkQueue::new();
        queue.put(1).unwrap();
        queue.put(2).unwrap();
        queue.put_sentinels(3);
        assert_eq!(queue.len(), 5);

        assert_eq!(queue.discard_remaining(), vec![1, 2]);
        assert!(queue.is_empty());
        assert_eq!(queue.put(3), Err(3));
    }
}
