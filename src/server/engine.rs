//! Fixed pool of event-loop threads.
//!
//! The engine owns its threads explicitly; there is no global loop registry.
//! Accepted sockets are dealt round-robin and stay on their thread for life.
//! [`EventLoopEngine::post_async`] is the only way to run code on a given
//! worker's thread.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};

use anyhow::{Context, anyhow};
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::config::Config;
use crate::http::connection::ConnectionOptions;
use crate::http::handler::RequestHandler;
use crate::server::worker::{Worker, WorkerContext, WorkerMessage};

struct WorkerHandle {
    tx: mpsc::UnboundedSender<WorkerMessage>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

pub struct EventLoopEngine {
    workers: Vec<WorkerHandle>,
    next: AtomicUsize,
}

impl EventLoopEngine {
    /// Spin up `cfg.worker_threads` threads, each with its own loop and its
    /// own timeout tick.
    pub fn start<H: RequestHandler>(cfg: &Config, handler: Arc<H>) -> anyhow::Result<Self> {
        cfg.validate()?;

        let options = ConnectionOptions::from(cfg);
        let idle_timeout = cfg.idle_timeout();
        let tick_interval = cfg.tick_interval();
        let mut workers = Vec::with_capacity(cfg.worker_threads);

        for worker_id in 0..cfg.worker_threads {
            let (tx, rx) = mpsc::unbounded_channel();
            let handler = Arc::clone(&handler);

            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .with_context(|| format!("failed to build runtime for worker {worker_id}"))?;

            let thread = thread::Builder::new()
                .name(format!("h1loop-worker-{worker_id}"))
                .spawn(move || {
                    let worker = Worker::new(worker_id, handler, options, idle_timeout, tick_interval);
                    let local = tokio::task::LocalSet::new();
                    local.block_on(&runtime, worker.run(rx));
                })
                .with_context(|| format!("failed to spawn worker thread {worker_id}"))?;

            workers.push(WorkerHandle {
                tx,
                thread: Mutex::new(Some(thread)),
            });
        }

        info!(
            workers = cfg.worker_threads,
            idle_timeout_ms = cfg.idle_timeout_ms,
            tick_interval_ms = cfg.tick_interval_ms,
            "event loop engine started"
        );

        Ok(Self {
            workers,
            next: AtomicUsize::new(0),
        })
    }

    pub fn thread_count(&self) -> usize {
        self.workers.len()
    }

    /// Hand an accepted socket to the next worker. Returns the worker index.
    pub fn dispatch(&self, stream: std::net::TcpStream) -> anyhow::Result<usize> {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.workers.len();
        self.workers[index]
            .tx
            .send(WorkerMessage::Accept(stream))
            .map_err(|_| anyhow!("worker {index} is not running"))?;
        Ok(index)
    }

    /// Run `callback` on worker `index`'s thread, after every message
    /// already queued for it.
    pub fn post_async<F>(&self, index: usize, callback: F) -> anyhow::Result<()>
    where
        F: FnOnce(&WorkerContext) + Send + 'static,
    {
        let worker = self
            .workers
            .get(index)
            .ok_or_else(|| anyhow!("no worker with index {index}"))?;

        worker
            .tx
            .send(WorkerMessage::Post(Box::new(callback)))
            .map_err(|_| anyhow!("worker {index} is not running"))
    }

    /// Stop every loop and join its thread. Safe to call more than once.
    pub fn shutdown(&self) {
        for (worker_id, worker) in self.workers.iter().enumerate() {
            // A worker that already exited has dropped its receiver.
            let _ = worker.tx.send(WorkerMessage::Shutdown);

            let thread = match worker.thread.lock() {
                Ok(mut guard) => guard.take(),
                Err(poisoned) => poisoned.into_inner().take(),
            };
            let Some(thread) = thread else {
                continue;
            };

            match thread.join() {
                Ok(()) => debug!(worker_id, "worker thread exited cleanly"),
                Err(e) => error!(worker_id, error = ?e, "worker thread panicked"),
            }
        }
    }
}

impl Drop for EventLoopEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}
