// SPDX-License-Identifier: MIT

use std::io::{self, Write};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::thread;
use std::time::Duration;

use env_filter::{Builder as FilterBuilder, Filter};
use log::{LevelFilter, Metadata, Record};

use crate::error::Result;
use crate::global_config::LogConfig;
use crate::logging::format::{LogFormat, LogLine};
use crate::pool::{ConsumerPool, RecordHandler, ShutdownReport, WorkerContext};
use crate::shared_state::lock;

fn parse_filter(directives: &str) -> Filter {
    FilterBuilder::new().parse(directives).build()
}

/// Renders lines and writes them out. Shared between the sink's workers and
/// callers that have to write synchronously.
struct LineWriter {
    out: Mutex<Box<dyn Write + Send>>,
    format: RwLock<LogFormat>,
}

impl LineWriter {
    fn write_line(&self, line: &LogLine) -> io::Result<()> {
        let rendered = self
            .format
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .render(line);
        let mut out = lock(&self.out);
        writeln!(out, "{rendered}")?;
        out.flush()
    }
}

impl RecordHandler<LogLine> for LineWriter {
    fn desc(&self) -> &str {
        "log writer"
    }

    fn handle(&self, _ctx: &WorkerContext, line: LogLine) -> anyhow::Result<()> {
        self.write_line(&line)?;
        Ok(())
    }
}

/// Log lines are queued by the emitting thread and written by the sink's
/// worker, so a slow writer never stalls the caller.
pub struct LogSink {
    pool: ConsumerPool<LogLine>,
    writer: Arc<LineWriter>,
    filter: RwLock<Filter>,
    worker_prefix: String,
}

impl LogSink {
    pub fn new(config: &LogConfig, out: Box<dyn Write + Send>) -> Result<Self> {
        let writer = Arc::new(LineWriter {
            out: Mutex::new(out),
            format: RwLock::new(LogFormat::new(&config.format)),
        });
        let pool = ConsumerPool::<LogLine>::with_shared_handler(config.pool.clone(), writer.clone())?;
        Ok(Self {
            worker_prefix: format!("{}-worker-", pool.name()),
            pool,
            writer,
            filter: RwLock::new(parse_filter(&config.filter)),
        })
    }

    pub fn stderr(config: &LogConfig) -> Result<Self> {
        Self::new(config, Box::new(io::stderr()))
    }

    pub fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        self.filter
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .enabled(metadata)
    }

    /// Most verbose level any directive lets through.
    pub fn max_level(&self) -> LevelFilter {
        self.filter
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .filter()
    }

    /// Filters, captures and queues a record.
    pub fn log(&self, record: &Record<'_>) {
        let matches = self
            .filter
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .matches(record);
        if matches {
            self.submit(LogLine::capture(record));
        }
    }

    /// Queues a line. Lines coming from the sink's own workers, or arriving
    /// after shutdown, are written right away.
    pub fn submit(&self, line: LogLine) {
        if self.on_own_worker() {
            self.write_now(&line);
            return;
        }
        if let Err(line) = self.pool.try_submit(line) {
            self.write_now(&line);
        }
    }

    fn on_own_worker(&self) -> bool {
        thread::current()
            .name()
            .is_some_and(|name| name.starts_with(&self.worker_prefix))
    }

    fn write_now(&self, line: &LogLine) {
        // Nowhere left to report a failing log writer.
        let _ = self.writer.write_line(line);
    }

    pub fn set_format(&self, template: &str) {
        *self
            .writer
            .format
            .write()
            .unwrap_or_else(PoisonError::into_inner) = LogFormat::new(template);
    }

    pub fn format(&self) -> LogFormat {
        self.writer
            .format
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replaces the filter with env_logger style directives.
    pub fn set_filter(&self, directives: &str) {
        *self.filter.write().unwrap_or_else(PoisonError::into_inner) = parse_filter(directives);
    }

    pub fn flush(&self) {
        let _ = lock(&self.writer.out).flush();
    }

    pub fn pool(&self) -> &ConsumerPool<LogLine> {
        &self.pool
    }

    /// Writes out whatever is queued, then stops the workers.
    pub fn shutdown(&self, timeout: Option<Duration>) -> Result<ShutdownReport> {
        let report = self.pool.shutdown(timeout);
        self.flush();
        report
    }
}

impl std::fmt::Debug for LogSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogSink")
            .field("pool", &self.pool)
            .field("format", &self.format().template())
            .finish()
    }
}
