// SPDX-License-Identifier: MIT

// The queue logger is process-global, so everything that installs it lives in
// this one test binary and in one test.

use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use drainpool::global_config::{LogConfig, PoolConfig};
use drainpool::logging;
use drainpool::{ClosureHandler, ConsumerPool, ShutdownReport, WorkerContext};
use drainpool_tests::buffer::SharedBuffer;

#[test]
fn queue_logger_collects_lines_from_every_thread() {
    let buffer = SharedBuffer::new();
    let config = LogConfig {
        pool: PoolConfig::new("log-sink").with_workers(1),
        // The sink's own worker logs too; those lines must not loop back
        // through the queue.
        filter: "trace".to_string(),
        format: "[{pid}] [{level}] [{target}] {message}".to_string(),
    };
    logging::init_with_writer(&config, Box::new(buffer.clone())).unwrap();

    let emitters: Vec<_> = (0..4)
        .map(|t| {
            thread::spawn(move || {
                for i in 0..25 {
                    log::info!(target: "emitter", "thread {t} line {i}");
                }
            })
        })
        .collect();
    for emitter in emitters {
        emitter.join().unwrap();
    }

    // A pool whose handler logs from its own workers.
    let pool = ConsumerPool::initialize(
        PoolConfig::new("chatty").with_workers(2),
        ClosureHandler::new("chatty", |ctx: &WorkerContext, n: u32| {
            log::debug!(target: "chatty", "{ctx} got {n}");
            Ok(())
        }),
    )
    .unwrap();
    for n in 0..10 {
        pool.submit(n).unwrap();
    }
    pool.shutdown(Some(Duration::from_secs(5))).unwrap();

    logging::shutdown(Some(Duration::from_secs(5))).unwrap();
    let lines = buffer.lines();

    let emitted = lines.iter().filter(|l| l.contains("[emitter]")).count();
    assert_eq!(emitted, 100);
    let chatty = lines.iter().filter(|l| l.contains("[chatty]")).count();
    assert_eq!(chatty, 10);

    let pid = format!("[{}]", std::process::id());
    assert!(lines.iter().all(|l| l.starts_with(&pid)));
    assert!(lines
        .iter()
        .any(|l| l.contains("Starting log-sink/worker-0") || l.contains("log-sink/worker-0 stopped")));

    // After shutdown lines are still written, just synchronously.
    log::warn!(target: "late", "written directly");
    assert!(buffer.lines().iter().any(|l| l.ends_with("written directly")));

    // A second shutdown is a no-op and still returns, although the pool logs
    // about it through the very sink it is shutting down.
    let (done_tx, done_rx) = mpsc::channel();
    thread::spawn(move || {
        let _ = done_tx.send(logging::shutdown(Some(Duration::from_secs(5))));
    });
    let second = done_rx
        .recv_timeout(Duration::from_secs(10))
        .expect("second logging::shutdown did not return")
        .unwrap();
    assert_eq!(second, ShutdownReport::default());
    assert!(buffer
        .lines()
        .iter()
        .any(|l| l.contains("Pool log-sink is already Terminated")));
}
