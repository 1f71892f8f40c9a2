//! Thread-pool behavior of the event loop engine.

mod common;

use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::mpsc;
use std::time::Duration;

use common::{TestHandler, test_config};
use h1loop::config::Config;
use h1loop::server::engine::EventLoopEngine;

const WAIT: Duration = Duration::from_secs(5);

fn engine(workers: usize) -> EventLoopEngine {
    let cfg = Config {
        worker_threads: workers,
        idle_timeout_ms: 60_000,
        ..test_config()
    };
    EventLoopEngine::start(&cfg, Arc::new(TestHandler)).unwrap()
}

fn counts(engine: &EventLoopEngine) -> Vec<usize> {
    (0..engine.thread_count())
        .map(|index| {
            let (tx, rx) = mpsc::channel();
            engine
                .post_async(index, move |ctx| {
                    let _ = tx.send(ctx.connection_count());
                })
                .unwrap();
            rx.recv_timeout(WAIT).unwrap()
        })
        .collect()
}

#[test]
fn test_post_async_runs_on_the_requested_thread() {
    let engine = engine(3);
    assert_eq!(engine.thread_count(), 3);

    for index in [2, 0, 1] {
        let (tx, rx) = mpsc::channel();
        engine
            .post_async(index, move |ctx| {
                let name = std::thread::current().name().map(str::to_string);
                let _ = tx.send((ctx.index(), name));
            })
            .unwrap();

        let (ran_on, name) = rx.recv_timeout(WAIT).unwrap();
        assert_eq!(ran_on, index);
        assert_eq!(name, Some(format!("h1loop-worker-{index}")));
    }
}

#[test]
fn test_post_async_rejects_unknown_worker() {
    let engine = engine(2);

    assert!(engine.post_async(2, |_| {}).is_err());
}

#[test]
fn test_zero_workers_is_rejected() {
    let cfg = Config {
        worker_threads: 0,
        ..test_config()
    };

    assert!(EventLoopEngine::start(&cfg, Arc::new(TestHandler)).is_err());
}

#[test]
fn test_zero_durations_are_rejected() {
    let zero_tick = Config {
        tick_interval_ms: 0,
        ..test_config()
    };
    let zero_idle = Config {
        idle_timeout_ms: 0,
        ..test_config()
    };

    assert!(EventLoopEngine::start(&zero_tick, Arc::new(TestHandler)).is_err());
    assert!(EventLoopEngine::start(&zero_idle, Arc::new(TestHandler)).is_err());
}

#[test]
fn test_dispatch_is_round_robin() {
    let engine = engine(3);
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let mut clients = Vec::new();
    let mut assigned = Vec::new();
    for _ in 0..4 {
        clients.push(TcpStream::connect(addr).unwrap());
        let (accepted, _) = listener.accept().unwrap();
        assigned.push(engine.dispatch(accepted).unwrap());
    }

    assert_eq!(assigned, vec![0, 1, 2, 0]);
    // Accepts are queued ahead of the count probe on each worker.
    assert_eq!(counts(&engine), vec![2, 1, 1]);
}

#[test]
fn test_connections_stay_idle_armed_on_their_worker() {
    let engine = engine(2);
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let _client = TcpStream::connect(addr).unwrap();
    let (accepted, _) = listener.accept().unwrap();
    let index = engine.dispatch(accepted).unwrap();

    let (tx, rx) = mpsc::channel();
    engine
        .post_async(index, move |ctx| {
            let _ = tx.send(ctx.armed_count());
        })
        .unwrap();

    assert_eq!(rx.recv_timeout(WAIT).unwrap(), 1);
}

#[test]
fn test_post_async_fails_after_shutdown() {
    let engine = engine(2);
    engine.shutdown();
    // A second call has nothing left to join.
    engine.shutdown();

    assert!(engine.post_async(0, |_| {}).is_err());
}
