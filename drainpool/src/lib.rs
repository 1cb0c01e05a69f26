// SPDX-License-Identifier: MIT
// drainpool: multi-worker queue consumption
//
// - A fixed pool of worker threads drains one shared FIFO queue.
// - Shutdown sends one sentinel per worker through that queue and gives up on
//   stragglers after a timeout.
// - The log sink and the download manager are both built on top of it.

pub mod download;
pub mod error;
pub mod global_config;
pub mod logging;
pub mod pool;
pub mod shared_state;
pub mod task_state;

pub use error::{PoolError, Result};
pub use global_config::{LogConfig, PoolConfig, ShutdownMode};
pub use pool::{
    ClosureHandler, ConsumerPool, PoolState, RecordHandler, ShutdownReport, WorkerContext,
    WorkerRole, WorkerState,
};
pub use shared_state::{acquire, lookup, SharedCell};
pub use task_state::{Admission, TaskState, TaskStateTracker};
