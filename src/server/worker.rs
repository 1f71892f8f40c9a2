//! One event loop per OS thread.
//!
//! A worker runs a current-thread tokio runtime with a `LocalSet`. Every
//! connection it accepts is spawned as a local task and never leaves the
//! thread, so connection state, frames and the timeout manager are shared
//! through `Rc`/`RefCell` rather than locks.

use std::cell::Cell;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::http::connection::{Connection, ConnectionId, ConnectionOptions};
use crate::http::handler::RequestHandler;
use crate::io::socket::TcpSocket;
use crate::server::timeout::{self, ConnectionTimeoutManager, SharedTimeouts, TimeoutEntry};

/// A callback marshalled onto a specific worker thread.
pub type WorkerTask = Box<dyn FnOnce(&WorkerContext) + Send + 'static>;

/// Messages delivered to a worker's loop, processed in arrival order.
pub enum WorkerMessage {
    Accept(std::net::TcpStream),
    Post(WorkerTask),
    Shutdown,
}

/// The view of a worker handed to [`post_async`] callbacks.
///
/// [`post_async`]: crate::server::engine::EventLoopEngine::post_async
pub struct WorkerContext {
    index: usize,
    timeouts: SharedTimeouts,
    live: Rc<Cell<usize>>,
}

impl WorkerContext {
    pub fn index(&self) -> usize {
        self.index
    }

    /// Connections currently owned by this worker.
    pub fn connection_count(&self) -> usize {
        self.live.get()
    }

    /// Connections whose idle deadline is currently enforced.
    pub fn armed_count(&self) -> usize {
        self.timeouts.borrow().armed_count()
    }

    pub fn timeouts(&self) -> &SharedTimeouts {
        &self.timeouts
    }
}

pub struct Worker<H> {
    index: usize,
    handler: Arc<H>,
    options: ConnectionOptions,
    idle_timeout: Duration,
    tick_interval: Duration,
}

impl<H: RequestHandler> Worker<H> {
    pub fn new(
        index: usize,
        handler: Arc<H>,
        options: ConnectionOptions,
        idle_timeout: Duration,
        tick_interval: Duration,
    ) -> Self {
        Self {
            index,
            handler,
            options,
            idle_timeout,
            tick_interval,
        }
    }

    /// Serve messages until `Shutdown` arrives or every sender is gone.
    ///
    /// Must run inside a `LocalSet`.
    pub async fn run(self, mut rx: mpsc::UnboundedReceiver<WorkerMessage>) {
        let ctx = WorkerContext {
            index: self.index,
            timeouts: ConnectionTimeoutManager::shared(self.idle_timeout),
            live: Rc::new(Cell::new(0)),
        };

        let ticker = tokio::task::spawn_local(timeout::drive_ticks(
            ctx.timeouts.clone(),
            self.tick_interval,
            self.index,
        ));
        info!(worker_id = self.index, "worker started");

        while let Some(msg) = rx.recv().await {
            match msg {
                WorkerMessage::Accept(stream) => self.accept(&ctx, stream),
                WorkerMessage::Post(task) => task(&ctx),
                WorkerMessage::Shutdown => break,
            }
        }

        ticker.abort();
        info!(
            worker_id = self.index,
            open_connections = ctx.live.get(),
            "worker stopped"
        );
    }

    fn accept(&self, ctx: &WorkerContext, stream: std::net::TcpStream) {
        if let Err(e) = stream.set_nonblocking(true) {
            warn!(worker_id = self.index, error = %e, "failed to set socket non-blocking");
            return;
        }
        let stream = match TcpStream::from_std(stream) {
            Ok(stream) => stream,
            Err(e) => {
                warn!(worker_id = self.index, error = %e, "failed to register socket");
                return;
            }
        };

        let id = ConnectionId::next();
        let timeout = TimeoutEntry::register(id, &ctx.timeouts);
        let mut conn = Connection::new(id, TcpSocket::new(stream), timeout, self.options);

        let handler = self.handler.clone();
        let live = ctx.live.clone();
        let worker_id = self.index;
        live.set(live.get() + 1);

        tokio::task::spawn_local(async move {
            let reason = conn.run(&*handler).await;
            live.set(live.get().saturating_sub(1));
            debug!(worker_id, conn = %id, reason = ?reason, "connection finished");
        });
    }
}
