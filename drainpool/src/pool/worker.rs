// SPDX-License-Identifier: MIT

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;

use log::{debug, error, info, trace, warn};

use crate::pool::consumer_pool::{PoolShared, PoolState};
use crate::pool::handler::{WorkerContext, WorkerRole};
use crate::pool::queue::Next;

/// Lifecycle of a single worker as seen by its pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Spawned, loop not entered yet.
    Starting,
    Running,
    /// Drainer only: sentinel received, emptying the queue.
    Terminating,
    Stopped,
    /// Still running when the pool stopped waiting for it.
    Abandoned,
}

impl WorkerState {
    pub fn is_live(&self) -> bool {
        !matches!(self, WorkerState::Stopped)
    }
}

/// Marks the worker stopped however the loop is left.
struct StoppedGuard<'a, R: Send + 'static> {
    shared: &'a PoolShared<R>,
    worker_id: usize,
}

impl<R: Send + 'static> Drop for StoppedGuard<'_, R> {
    fn drop(&mut self) {
        self.shared
            .set_worker_state(self.worker_id, WorkerState::Stopped);
    }
}

/// Entry point of every worker thread.
pub(crate) fn run<R: Send + 'static>(shared: Arc<PoolShared<R>>, ctx: WorkerContext) {
    let _stopped = StoppedGuard {
        shared: &shared,
        worker_id: ctx.worker_id(),
    };

    // A pool only runs one lifecycle. A worker started after it ended has
    // nothing to do.
    if shared.state() == PoolState::Terminated {
        debug!("{ctx}: pool already terminated, not entering the loop");
        return;
    }

    shared.set_worker_state(ctx.worker_id(), WorkerState::Running);
    info!("Starting {ctx} ({:?})", ctx.role());
    let reason = consume(&shared, &ctx);
    info!("{ctx} stopped: {reason}");
}

fn consume<R: Send + 'static>(shared: &PoolShared<R>, ctx: &WorkerContext) -> &'static str {
    loop {
        match shared.queue.get() {
            Next::Record(record) => dispatch(shared, ctx, record),
            Next::Spurious => continue,
            Next::Sentinel => match ctx.role() {
                WorkerRole::Standard => return "received sentinel",
                WorkerRole::Drainer => {
                    shared.set_worker_state(ctx.worker_id(), WorkerState::Terminating);
                    let drained = drain(shared, ctx);
                    debug!("{ctx} drained {drained} record(s) after its sentinel");
                    return "queue drained";
                }
            },
            Next::Stopped => return "stop requested",
        }
    }
}

/// Gives in-flight producers a moment, then consumes until the queue is
/// empty. Sentinels meant for other workers are swallowed here; the pool
/// fires the stop token once the drainer is done so nobody waits on them.
fn drain<R: Send + 'static>(shared: &PoolShared<R>, ctx: &WorkerContext) -> usize {
    thread::sleep(shared.drain_grace);

    let mut drained = 0;
    while let Some(next) = shared.queue.try_get() {
        match next {
            Next::Record(record) => {
                dispatch(shared, ctx, record);
                drained += 1;
            }
            Next::Sentinel | Next::Spurious => continue,
            Next::Stopped => {
                warn!("{ctx}: stopped while draining");
                break;
            }
        }
    }
    drained
}

fn dispatch<R: Send + 'static>(shared: &PoolShared<R>, ctx: &WorkerContext, record: R) {
    trace!("{ctx}: dispatching record to {}", shared.handler.desc());

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| shared.handler.handle(ctx, record)));
    shared.processed.fetch_add(1, Ordering::Relaxed);

    match outcome {
        Ok(Ok(())) => {}
        Ok(Err(err)) => warn!("{ctx}: {} failed: {err:#}", shared.handler.desc()),
        Err(payload) => error!(
            "{ctx}: {} panicked: {}",
            shared.handler.desc(),
            panic_message(payload.as_ref())
        ),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
