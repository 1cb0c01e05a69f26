// SPDX-License-Identifier: MIT

//! Queue-backed `log` backend.
//!
//! The process-wide [`LogSink`] is a one-worker [`crate::pool::ConsumerPool`]
//! whose handler renders and writes lines. [`QueueLogger`] is the `log::Log`
//! front end: it captures each record on the calling thread and hands it to
//! the sink.

pub mod format;
pub mod sink;

use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use log::{Log, Metadata, Record};

pub use format::{LogFormat, LogLine, DEFAULT_FORMAT};
pub use sink::LogSink;

use crate::error::{PoolError, Result};
use crate::global_config::LogConfig;
use crate::pool::ShutdownReport;
use crate::shared_state;

/// Forwards `log` records to the process-wide [`LogSink`].
#[derive(Debug, Default, Clone, Copy)]
pub struct QueueLogger;

static LOGGER: QueueLogger = QueueLogger;
static INSTALLED: AtomicBool = AtomicBool::new(false);

impl Log for QueueLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        shared_state::lookup::<LogSink>().is_some_and(|sink| sink.enabled(metadata))
    }

    fn log(&self, record: &Record<'_>) {
        if let Some(sink) = shared_state::lookup::<LogSink>() {
            sink.log(record);
        }
    }

    fn flush(&self) {
        if let Some(sink) = shared_state::lookup::<LogSink>() {
            sink.flush();
        }
    }
}

/// Creates the process-wide sink writing to stderr and installs
/// [`QueueLogger`] as the `log` backend.
pub fn init(config: &LogConfig) -> anyhow::Result<Arc<LogSink>> {
    init_with_writer(config, Box::new(io::stderr()))
}

/// Like [`init`] with a caller-supplied writer. Once a sink exists, later
/// calls return it and ignore their arguments.
pub fn init_with_writer(
    config: &LogConfig,
    out: Box<dyn Write + Send>,
) -> anyhow::Result<Arc<LogSink>> {
    let sink = shared_state::acquire(|| Ok(LogSink::new(config, out)?))?;

    if !INSTALLED.swap(true, Ordering::AcqRel) {
        if let Err(err) = log::set_logger(&LOGGER) {
            INSTALLED.store(false, Ordering::Release);
            bail!("cannot install the queue logger: {err}");
        }
    }
    log::set_max_level(sink.max_level());
    Ok(sink)
}

pub fn sink() -> Option<Arc<LogSink>> {
    shared_state::lookup::<LogSink>()
}

fn running_sink() -> Result<Arc<LogSink>> {
    sink().ok_or_else(|| PoolError::NotRunning("log sink".to_string()))
}

/// Swaps the filter directives of the running sink.
pub fn set_filter(directives: &str) -> Result<()> {
    let sink = running_sink()?;
    sink.set_filter(directives);
    log::set_max_level(sink.max_level());
    Ok(())
}

pub fn set_format(template: &str) -> Result<()> {
    running_sink()?.set_format(template);
    Ok(())
}

/// Drains and stops the sink. Records logged afterwards are written
/// synchronously.
pub fn shutdown(timeout: Option<Duration>) -> Result<ShutdownReport> {
    match sink() {
        Some(sink) => sink.shutdown(timeout),
        None => Ok(ShutdownReport::default()),
    }
}
