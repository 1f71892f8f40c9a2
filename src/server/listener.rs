use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{info, trace, warn};

use crate::config::Config;
use crate::http::handler::RequestHandler;
use crate::server::engine::EventLoopEngine;

/// Accept loop feeding an [`EventLoopEngine`].
///
/// Accepting happens on the caller's runtime; each socket is then handed
/// to a worker thread and never touched here again.
pub struct Listener {
    inner: TcpListener,
    engine: Arc<EventLoopEngine>,
}

impl Listener {
    pub async fn bind<H: RequestHandler>(cfg: &Config, handler: Arc<H>) -> anyhow::Result<Self> {
        let inner = TcpListener::bind(&cfg.listen_addr).await?;
        let engine = EventLoopEngine::start(cfg, handler)?;
        info!("Listening on {}", inner.local_addr()?);

        Ok(Self {
            inner,
            engine: Arc::new(engine),
        })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.inner.local_addr()?)
    }

    pub fn engine(&self) -> Arc<EventLoopEngine> {
        Arc::clone(&self.engine)
    }

    pub async fn run(self) -> anyhow::Result<()> {
        loop {
            let (socket, peer) = match self.inner.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    continue;
                }
            };

            let stream = match socket.into_std() {
                Ok(stream) => stream,
                Err(e) => {
                    warn!(%peer, error = %e, "failed to detach accepted socket");
                    continue;
                }
            };
            let worker_id = self.engine.dispatch(stream)?;
            trace!(%peer, worker_id, "accepted connection");
        }
    }
}

pub async fn run<H: RequestHandler>(cfg: &Config, handler: Arc<H>) -> anyhow::Result<()> {
    Listener::bind(cfg, handler).await?.run().await
}
