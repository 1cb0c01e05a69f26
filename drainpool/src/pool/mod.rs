// SPDX-License-Identifier: MIT
//! # Design: Multi-Worker Queue Consumer
//!
//! ## Overview
//! A fixed number of worker threads drain one shared, unbounded FIFO queue.
//!
//! - Producers never block: `submit` appends to the queue and returns.
//! - Every worker blocks on the same queue and feeds each record to the
//!   pool's `RecordHandler`.
//! - The last spawned worker is the drainer. On its sentinel it waits a grace
//!   period and keeps consuming until the queue is empty.
//! - Shutdown queues one sentinel per worker, in the same ordering domain as
//!   the real records, then waits up to a timeout.
//! - A stop token (a data-less channel that is closed, never written) wakes
//!   anybody still blocked once the pool stops waiting. Workers that are stuck
//!   inside the handler are detached; they never take another record.
//!
//! ```text
//!         +-----------+   +-----------+
//!         | producer  |   | producer  |
//!         +-----+-----+   +-----+-----+
//!               |  submit()     |
//!               v               v
//!         +-----+---------------+-----------------+
//!         | WorkQueue  r1 r2 r3 ... S S S         |
//!         +----+-------------+--------------+-----+
//!              |             |              |
//!         +----v----+   +----v----+   +-----v-----+
//!         | worker0 |   | worker1 |   | worker2   |
//!         | standard|   | standard|   | drainer   |
//!         +---------+   +---------+   +-----------+
//! ```

pub mod consumer_pool;
pub mod handler;
pub mod queue;
pub mod worker;

pub use consumer_pool::{ConsumerPool, PoolState, ShutdownReport};
pub use handler::{ClosureHandler, RecordHandler, WorkerContext, WorkerRole};
pub use queue::{Next, Sentinel, WorkQueue};
pub use worker::WorkerState;
