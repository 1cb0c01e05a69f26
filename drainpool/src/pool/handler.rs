// SPDX-License-Identifier: MIT

use std::fmt;

use async_channel::Receiver;

/// Tells a worker what it should do once its sentinel arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkerRole {
    /// Stops as soon as it receives its sentinel.
    Standard,
    /// Keeps consuming after its sentinel until the queue reports empty.
    Drainer,
}

/// Per-worker view handed to a [`RecordHandler`] with every record.
#[derive(Clone)]
pub struct WorkerContext {
    pool: String,
    worker_id: usize,
    role: WorkerRole,
    stop: Receiver<()>,
}

impl WorkerContext {
    pub(crate) fn new(pool: &str, worker_id: usize, role: WorkerRole, stop: Receiver<()>) -> Self {
        Self {
            pool: pool.to_string(),
            worker_id,
            role,
            stop,
        }
    }

    pub fn pool(&self) -> &str {
        &self.pool
    }

    pub fn worker_id(&self) -> usize {
        self.worker_id
    }

    pub fn role(&self) -> WorkerRole {
        self.role
    }

    /// True once the pool gave up waiting on its workers. Long-running
    /// handlers can poll this to bail out early.
    pub fn stop_requested(&self) -> bool {
        self.stop.is_closed()
    }
}

impl fmt::Debug for WorkerContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerContext")
            .field("pool", &self.pool)
            .field("worker_id", &self.worker_id)
            .field("role", &self.role)
            .finish()
    }
}

impl fmt::Display for WorkerContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/worker-{}", self.pool, self.worker_id)
    }
}

/// The one hook a specialization implements.
///
/// Called once per real record, never with a sentinel. A single worker calls
/// it sequentially; different workers call it concurrently.
pub trait RecordHandler<R>: Send + Sync + 'static {
    /// Free-form description, used for logging
    fn desc(&self) -> &str {
        "record handler"
    }

    /// Errors are logged by the worker and the record is dropped. Nothing is
    /// retried.
    fn handle(&self, ctx: &WorkerContext, record: R) -> anyhow::Result<()>;

    /// Receives every record a forced shutdown threw away, on the thread
    /// that ran the shutdown. Dropped by default.
    fn discarded(&self, _record: R) {}
}

/// Wraps a closure as a [`RecordHandler`].
pub struct ClosureHandler<F> {
    desc: String,
    f: F,
}

impl<F> ClosureHandler<F> {
    pub fn new(desc: impl Into<String>, f: F) -> Self {
        Self {
            desc: desc.into(),
            f,
        }
    }
}

impl<R, F> RecordHandler<R> for ClosureHandler<F>
where
    F: Fn(&WorkerContext, R) -> anyhow::Result<()> + Send + Sync + 'static,
{
    fn desc(&self) -> &str {
        &self.desc
    }

    fn handle(&self, ctx: &WorkerContext, record: R) -> anyhow::Result<()> {
        (self.f)(ctx, record)
    }
}
