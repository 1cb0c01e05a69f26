// SPDX-License-Identifier: MIT

use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use drainpool::download::{DownloadPool, Downloaded, Target};
use drainpool::{ConsumerPool, PoolConfig, PoolState, ShutdownMode, TaskState, WorkerRole};
use drainpool_tests::fetchers::SlowFetcher;
use drainpool_tests::handlers::{GatedHandler, RecordingHandler};
use drainpool_tests::init_test_logging;

fn config(name: &str, workers: usize) -> PoolConfig {
    PoolConfig::new(name)
        .with_workers(workers)
        .with_drain_grace(Duration::from_millis(20))
}

#[test]
fn scenario_a_every_record_is_handled_exactly_once() {
    init_test_logging();
    let handler = RecordingHandler::<u32>::new();
    let pool = ConsumerPool::initialize(config("scenario-a", 3), handler.clone()).unwrap();

    for record in 0..10 {
        pool.submit(record).unwrap();
    }
    let report = pool.shutdown(Some(Duration::from_secs(5))).unwrap();

    let mut records = handler.records();
    records.sort_unstable();
    assert_eq!(records, (0..10).collect::<Vec<_>>());
    assert_eq!(pool.pending(), 0);
    assert!(report.drainer_exited);
    assert!(!report.forced);
    assert_eq!(report.discarded, 0);
    assert_eq!(pool.live_workers(), 0);
    assert_eq!(pool.state(), PoolState::Terminated);
}

#[test]
fn scenario_b_blocking_fetch_waits_for_the_download() {
    init_test_logging();
    let fetcher = SlowFetcher::new(Duration::from_millis(100)).with_body("X", "payload of X");
    let pool = DownloadPool::new(config("scenario-b", 2), fetcher).unwrap();

    let started = Instant::now();
    let handle = pool.download_async("X", Target::Memory, false).unwrap();
    let result = pool.fetch_result(&handle, true, true);

    assert!(started.elapsed() >= Duration::from_millis(100));
    assert_eq!(result, Some(Downloaded::Memory(b"payload of X".to_vec())));
    assert_eq!(pool.get_state("X"), None);
    pool.shutdown(Some(Duration::from_secs(5))).unwrap();
}

#[test]
fn scenario_c_zero_timeout_detaches_a_stuck_worker() {
    init_test_logging();
    let handler = GatedHandler::new();
    let pool = ConsumerPool::<u32>::initialize(config("scenario-c", 2), handler.clone()).unwrap();

    pool.submit(0).unwrap();
    pool.submit(1).unwrap();
    assert!(handler.wait_started(2, Duration::from_secs(5)));
    for record in 2..7 {
        pool.submit(record).unwrap();
    }

    let started = Instant::now();
    let report = pool.shutdown(Some(Duration::ZERO)).unwrap();
    let overhead = started.elapsed();

    assert!(overhead < Duration::from_secs(1), "shutdown took {overhead:?}");
    assert!(report.forced);
    assert!(!report.drainer_exited);
    assert_eq!(report.abandoned, 2);
    assert_eq!(report.discarded, 5);
    assert!(pool.live_workers() <= 2);
    assert_eq!(pool.state(), PoolState::Terminated);

    // Once released, the detached workers take nothing else.
    handler.open();
    thread::sleep(Duration::from_millis(100));
    assert_eq!(handler.started(), 2);
    assert_eq!(handler.finished(), 2);
}

#[test]
fn drain_or_fail_reports_lost_records_as_an_error() {
    init_test_logging();
    let handler = GatedHandler::new();
    let pool = ConsumerPool::<u32>::initialize(
        config("drain-or-fail", 1).with_shutdown_mode(ShutdownMode::DrainOrFail),
        handler.clone(),
    )
    .unwrap();

    pool.submit(0).unwrap();
    assert!(handler.wait_started(1, Duration::from_secs(5)));
    pool.submit(1).unwrap();

    let err = pool.shutdown(Some(Duration::from_millis(20))).unwrap_err();
    assert!(matches!(
        err,
        drainpool::PoolError::WorkDiscarded { count: 1, .. }
    ));
    handler.open();
}

#[test]
fn concurrent_producers_lose_nothing() {
    init_test_logging();
    let handler = RecordingHandler::<(usize, usize)>::new();
    let pool = Arc::new(ConsumerPool::initialize(config("producers", 4), handler.clone()).unwrap());

    let producers: Vec<_> = (0..4)
        .map(|producer| {
            let pool = pool.clone();
            thread::spawn(move || {
                for seq in 0..250 {
                    pool.submit((producer, seq)).unwrap();
                }
            })
        })
        .collect();
    for producer in producers {
        producer.join().unwrap();
    }
    let report = pool.shutdown(None).unwrap();

    let records = handler.records();
    assert_eq!(records.len(), 1000);
    assert_eq!(records.iter().collect::<HashSet<_>>().len(), 1000);
    assert_eq!(report.discarded, 0);
    assert!(handler.workers().iter().all(|worker| *worker < 4));
}

#[test]
fn single_consumer_sees_each_producer_in_order() {
    init_test_logging();
    let handler = RecordingHandler::<(usize, usize)>::new();
    let pool = Arc::new(ConsumerPool::initialize(config("ordering", 1), handler.clone()).unwrap());

    let producers: Vec<_> = (0..3)
        .map(|producer| {
            let pool = pool.clone();
            thread::spawn(move || {
                for seq in 0..100 {
                    pool.submit((producer, seq)).unwrap();
                }
            })
        })
        .collect();
    for producer in producers {
        producer.join().unwrap();
    }
    pool.shutdown(Some(Duration::from_secs(5))).unwrap();

    let records = handler.records();
    for producer in 0..3 {
        let seqs: Vec<usize> = records
            .iter()
            .filter(|(p, _)| *p == producer)
            .map(|(_, seq)| *seq)
            .collect();
        assert_eq!(seqs, (0..100).collect::<Vec<_>>());
    }
}

#[test]
fn shutdown_while_producers_are_still_submitting() {
    init_test_logging();
    let handler = RecordingHandler::<usize>::new();
    let pool = Arc::new(ConsumerPool::initialize(config("racing", 3), handler.clone()).unwrap());

    let p = pool.clone();
    let producer = thread::spawn(move || {
        let mut accepted = 0;
        for seq in 0.. {
            if p.submit(seq).is_err() {
                break;
            }
            accepted += 1;
        }
        accepted
    });

    thread::sleep(Duration::from_millis(20));
    let report = pool.shutdown(Some(Duration::from_secs(5))).unwrap();
    let accepted = producer.join().unwrap();

    // Whatever was accepted before the sentinels went in was handled.
    assert_eq!(handler.records().len() + report.discarded, accepted);
    assert_eq!(report.discarded, 0);
}

#[test]
fn download_pool_is_a_process_wide_singleton() {
    init_test_logging();
    let fetcher = SlowFetcher::new(Duration::ZERO).with_body("shared", "one");
    let calls = fetcher.calls();

    let first = DownloadPool::shared(config("shared-download", 2), fetcher.clone()).unwrap();
    let second = DownloadPool::shared(config("ignored", 8), fetcher).unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(second.pool().worker_count(), 2);

    let handle = first.download_blocking("shared", Target::Memory, false).unwrap();
    assert_eq!(
        second.wait(&handle, Some(Duration::from_secs(5))),
        Some(TaskState::Done(Downloaded::Memory(b"one".to_vec())))
    );
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let missing = second.download_blocking("missing", Target::Memory, false).unwrap();
    assert!(matches!(
        first.get_state(missing.url()),
        Some(TaskState::Failed(err)) if err.contains("404")
    ));
}

#[test]
fn handler_sees_its_role() {
    init_test_logging();
    let roles = Arc::new(std::sync::Mutex::new(HashSet::new()));
    let r = roles.clone();
    let pool = ConsumerPool::initialize(
        config("roles", 2),
        drainpool::ClosureHandler::new("roles", move |ctx: &drainpool::WorkerContext, _: u8| {
            r.lock().unwrap().insert((ctx.worker_id(), ctx.role()));
            thread::sleep(Duration::from_millis(20));
            Ok(())
        }),
    )
    .unwrap();

    for _ in 0..10 {
        pool.submit(0).unwrap();
    }
    pool.shutdown(Some(Duration::from_secs(5))).unwrap();

    for (worker_id, role) in roles.lock().unwrap().iter() {
        match worker_id {
            1 => assert_eq!(*role, WorkerRole::Drainer),
            _ => assert_eq!(*role, WorkerRole::Standard),
        }
    }
}
