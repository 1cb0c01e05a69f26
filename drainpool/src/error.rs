// SPDX-License-Identifier: MIT

use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// The one-time initializer of a shared state failed. The state stays
    /// uninitialized and a later acquire may retry.
    #[error("initialization of {owner} failed: {source}")]
    InitializationFailed {
        owner: &'static str,
        #[source]
        source: anyhow::Error,
    },

    #[error("pool {0} no longer accepts records")]
    PoolClosed(String),

    #[error("pool {0} is not running")]
    NotRunning(String),

    #[error("a pool needs at least one worker, got {0}")]
    InvalidWorkerCount(usize),

    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),

    /// Raised by a drain-or-fail shutdown when records were left behind.
    #[error("{count} record(s) discarded after waiting {waited:?} for the workers")]
    WorkDiscarded { count: usize, waited: Duration },

    #[error("task {key}: cannot move from {from} to {to}")]
    InvalidTransition {
        key: String,
        from: &'static str,
        to: &'static str,
    },
}

pub type Result<T, E = PoolError> = std::result::Result<T, E>;
