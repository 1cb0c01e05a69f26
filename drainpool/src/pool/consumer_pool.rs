// SPDX-License-Identifier: MIT

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};

use crate::error::{PoolError, Result};
use crate::global_config::{PoolConfig, ShutdownMode};
use crate::pool::handler::{RecordHandler, WorkerContext, WorkerRole};
use crate::pool::queue::WorkQueue;
use crate::pool::worker::{self, WorkerState};
use crate::shared_state::lock;

/// How long shutdown keeps waiting after the stop token fired, so that idle
/// workers it just woke are not counted as abandoned.
const STOP_RELEASE: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolState {
    Running,
    ShuttingDown,
    Terminated,
}

/// Outcome of [`ConsumerPool::shutdown`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// At least one worker was still running when the timeout expired.
    pub forced: bool,
    pub drainer_exited: bool,
    /// Workers the pool stopped waiting for.
    pub abandoned: usize,
    /// Real records thrown away because nobody consumed them in time.
    pub discarded: usize,
    pub elapsed: Duration,
}

/// State every worker of one pool sees.
pub(crate) struct PoolShared<R> {
    pub(crate) name: String,
    pub(crate) queue: WorkQueue<R>,
    pub(crate) handler: Arc<dyn RecordHandler<R>>,
    pub(crate) drain_grace: Duration,
    pub(crate) processed: AtomicU64,
    state: RwLock<PoolState>,
    workers: Mutex<Vec<WorkerState>>,
    workers_changed: Condvar,
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

impl<R> PoolShared<R> {
    pub(crate) fn new(
        config: &PoolConfig,
        queue: WorkQueue<R>,
        handler: Arc<dyn RecordHandler<R>>,
    ) -> Self {
        Self {
            name: config.name.clone(),
            queue,
            handler,
            drain_grace: config.drain_grace,
            processed: AtomicU64::new(0),
            state: RwLock::new(PoolState::Running),
            workers: Mutex::new(vec![WorkerState::Starting; config.workers]),
            workers_changed: Condvar::new(),
        }
    }

    pub(crate) fn state(&self) -> PoolState {
        *read(&self.state)
    }

    pub(crate) fn set_state(&self, state: PoolState) {
        *write(&self.state) = state;
    }

    pub(crate) fn set_worker_state(&self, worker_id: usize, new_state: WorkerState) {
        let mut workers = lock(&self.workers);
        if let Some(state) = workers.get_mut(worker_id) {
            *state = new_state;
        }
        self.workers_changed.notify_all();
    }

    pub(crate) fn worker_states(&self) -> Vec<WorkerState> {
        lock(&self.workers).clone()
    }

    /// Waits until `done` holds for the worker table or the deadline passes.
    /// `None` waits forever.
    fn wait_for_workers<F>(&self, deadline: Option<Instant>, done: F) -> bool
    where
        F: Fn(&[WorkerState]) -> bool,
    {
        let mut workers = lock(&self.workers);
        loop {
            if done(workers.as_slice()) {
                return true;
            }
            match deadline {
                None => {
                    workers = self
                        .workers_changed
                        .wait(workers)
                        .unwrap_or_else(PoisonError::into_inner);
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    let (guard, _) = self
                        .workers_changed
                        .wait_timeout(workers, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner);
                    workers = guard;
                }
            }
        }
    }

    /// Marks every live worker as abandoned and returns their ids.
    fn abandon_live_workers(&self) -> Vec<usize> {
        let mut workers = lock(&self.workers);
        let mut abandoned = Vec::new();
        for (worker_id, state) in workers.iter_mut().enumerate() {
            match state {
                WorkerState::Stopped => {}
                WorkerState::Starting => *state = WorkerState::Stopped,
                _ => {
                    *state = WorkerState::Abandoned;
                    abandoned.push(worker_id);
                }
            }
        }
        abandoned
    }
}

/// A fixed pool of worker threads draining one shared [`WorkQueue`].
///
/// The last spawned worker is the drainer. Shutdown pushes one sentinel per
/// worker through the same queue as the real records, waits (bounded) for the
/// workers to finish, and detaches whoever is still busy.
pub struct ConsumerPool<R: Send + 'static> {
    shared: Arc<PoolShared<R>>,
    handles: Mutex<Vec<Option<JoinHandle<()>>>>,
    config: PoolConfig,
}

impl<R: Send + 'static> ConsumerPool<R> {
    /// Spawns `config.workers` workers that feed every record to `handler`.
    pub fn initialize<H>(config: PoolConfig, handler: H) -> Result<Self>
    where
        H: RecordHandler<R>,
    {
        Self::with_shared_handler(config, Arc::new(handler))
    }

    /// Like [`ConsumerPool::initialize`] for a handler that is also used
    /// outside the pool.
    pub fn with_shared_handler(
        config: PoolConfig,
        handler: Arc<dyn RecordHandler<R>>,
    ) -> Result<Self> {
        let worker_count = config.workers;
        if worker_count == 0 {
            return Err(PoolError::InvalidWorkerCount(worker_count));
        }

        let shared = Arc::new(PoolShared::new(&config, WorkQueue::new(), handler));

        let mut handles = Vec::with_capacity(worker_count);
        for worker_id in 0..worker_count {
            let role = if worker_id + 1 == worker_count {
                WorkerRole::Drainer
            } else {
                WorkerRole::Standard
            };
            let ctx = WorkerContext::new(&config.name, worker_id, role, shared.queue.stop_token());
            let worker_shared = shared.clone();

            let spawned = thread::Builder::new()
                .name(format!("{}-worker-{}", config.name, worker_id))
                .spawn(move || worker::run(worker_shared, ctx));

            match spawned {
                Ok(handle) => handles.push(Some(handle)),
                Err(err) => {
                    error!("Pool {}: failed to spawn worker {worker_id}: {err}", config.name);
                    shared.set_state(PoolState::Terminated);
                    shared.queue.stop();
                    shared.abandon_live_workers();
                    return Err(PoolError::Spawn(err));
                }
            }
        }

        info!(
            "Pool {} started {} worker(s) for {}",
            config.name,
            worker_count,
            shared.handler.desc()
        );

        Ok(Self {
            shared,
            handles: Mutex::new(handles),
            config,
        })
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn worker_count(&self) -> usize {
        self.config.workers
    }

    pub fn state(&self) -> PoolState {
        self.shared.state()
    }

    pub fn worker_states(&self) -> Vec<WorkerState> {
        self.shared.worker_states()
    }

    pub fn live_workers(&self) -> usize {
        self.worker_states().iter().filter(|s| s.is_live()).count()
    }

    /// Queue length, sentinels included. Advisory only.
    pub fn pending(&self) -> usize {
        self.shared.queue.len()
    }

    /// Records handed to the handler so far, whatever their outcome.
    pub fn processed(&self) -> u64 {
        self.shared.processed.load(Ordering::Relaxed)
    }

    /// Enqueues a record, handing it back if the pool is no longer running.
    pub fn try_submit(&self, record: R) -> std::result::Result<(), R> {
        // Holding the read lock keeps shutdown from slipping its sentinels
        // in between the state check and the put.
        let state = read(&self.shared.state);
        if *state != PoolState::Running {
            return Err(record);
        }
        self.shared.queue.put(record)
    }

    pub fn submit(&self, record: R) -> Result<()> {
        self.try_submit(record)
            .map_err(|_| PoolError::PoolClosed(self.name().to_string()))
    }

    /// Shuts down with the configured timeout.
    pub fn shutdown_with_config(&self) -> Result<ShutdownReport> {
        self.shutdown(self.config.shutdown_timeout)
    }

    /// Graceful, then forced, termination.
    ///
    /// New records are refused, one sentinel per worker is queued, and the
    /// caller waits up to `timeout` for the drainer and then the rest of the
    /// workers. Whoever is still running afterwards is detached and will not
    /// pick up another record. `None` waits for as long as it takes.
    ///
    /// A second call is a no-op returning an empty report.
    ///
    /// Records that never reached a worker are handed to
    /// [`RecordHandler::discarded`] before this returns.
    pub fn shutdown(&self, timeout: Option<Duration>) -> Result<ShutdownReport> {
        let started = Instant::now();
        // Nothing may be logged while the state lock is held: when this pool
        // is the log sink, logging submits to it and takes the same lock.
        let sentinels = {
            let mut state = write(&self.shared.state);
            if *state != PoolState::Running {
                Err(*state)
            } else {
                *state = PoolState::ShuttingDown;
                Ok(self.shared.queue.put_sentinels(self.config.workers))
            }
        };
        let sentinels = match sentinels {
            Ok(sentinels) => sentinels,
            Err(state) => {
                debug!("Pool {} is already {:?}", self.name(), state);
                return Ok(ShutdownReport::default());
            }
        };
        info!(
            "Shutting down pool {}: {} sentinel(s) queued behind {} record(s)",
            self.name(),
            sentinels,
            self.pending().saturating_sub(sentinels)
        );

        let deadline = timeout.map(|timeout| started + timeout);
        let drainer = self.config.workers - 1;
        let drainer_exited = self
            .shared
            .wait_for_workers(deadline, |workers| !workers[drainer].is_live());

        // Standard workers whose sentinel went to the drainer are still
        // blocked in get(). The stop token releases them.
        self.shared.queue.stop();
        let release = Instant::now() + STOP_RELEASE;
        self.shared.wait_for_workers(deadline.map(|d| d.max(release)), |workers| {
            workers.iter().all(|w| !w.is_live())
        });

        let abandoned = self.shared.abandon_live_workers();
        self.reap(&abandoned);
        let leftovers = self.shared.queue.discard_remaining();
        let discarded = leftovers.len();
        self.shared.set_state(PoolState::Terminated);
        self.hand_back(leftovers);

        let report = ShutdownReport {
            forced: !abandoned.is_empty(),
            drainer_exited,
            abandoned: abandoned.len(),
            discarded,
            elapsed: started.elapsed(),
        };

        if report.forced {
            warn!(
                "Pool {}: worker(s) {:?} still busy after {:?}, forcibly detached",
                self.name(),
                abandoned,
                timeout.unwrap_or_default()
            );
        }
        if discarded > 0 {
            warn!(
                "Pool {}: work discarded on forced shutdown ({} record(s))",
                self.name(),
                discarded
            );
            if self.config.shutdown_mode == ShutdownMode::DrainOrFail {
                return Err(PoolError::WorkDiscarded {
                    count: discarded,
                    waited: report.elapsed,
                });
            }
        }

        info!("Pool {} shut down in {:?}", self.name(), report.elapsed);
        Ok(report)
    }

    fn hand_back(&self, leftovers: Vec<R>) {
        for record in leftovers {
            let handler = &self.shared.handler;
            if panic::catch_unwind(AssertUnwindSafe(|| handler.discarded(record))).is_err() {
                error!("Pool {}: {} panicked on a discarded record", self.name(), handler.desc());
            }
        }
    }

    /// Joins finished workers and detaches abandoned ones.
    fn reap(&self, abandoned: &[usize]) {
        let handles = std::mem::take(&mut *lock(&self.handles));
        for (worker_id, handle) in handles.into_iter().enumerate() {
            let Some(handle) = handle else { continue };
            if abandoned.contains(&worker_id) {
                debug!("Pool {}: detaching worker {worker_id}", self.name());
                drop(handle);
            } else if handle.join().is_err() {
                error!("Pool {}: worker {worker_id} panicked", self.name());
            }
        }
    }
}

impl<R: Send + 'static> Drop for ConsumerPool<R> {
    fn drop(&mut self) {
        if self.state() != PoolState::Running {
            return;
        }
        if let Err(err) = self.shutdown_with_config() {
            warn!("Pool {}: shutdown on drop: {err}", self.name());
        }
    }
}

impl<R: Send + 'static> std::fmt::Debug for ConsumerPool<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsumerPool")
            .field("name", &self.name())
            .field("state", &self.state())
            .field("workers", &self.worker_states())
            .field("queue", &self.shared.queue)
            .finish()
    }
}
