use std::sync::Arc;

use h1loop::config::Config;
use h1loop::http::exchange::Exchange;
use h1loop::http::handler::RequestHandler;
use h1loop::http::headers::Headers;
use h1loop::http::response::{Response, StatusCode};
use h1loop::io::AsyncSocketIo;
use h1loop::server;
use tracing_subscriber::EnvFilter;

/// Demo routes: `/` greets, `/echo` streams the request body back chunked,
/// `/upgrade` switches to a raw echo protocol.
struct DemoHandler;

impl RequestHandler for DemoHandler {
    async fn handle<S: AsyncSocketIo>(&self, exchange: &mut Exchange<'_, S>) -> anyhow::Result<()> {
        let path = exchange.request().path.clone();

        match path.as_str() {
            "/" => exchange.send(Response::ok("Hello from h1loop\n")).await?,
            "/echo" => {
                let headers: Headers = [("Content-Type", "application/octet-stream")].into_iter().collect();
                exchange.start_response(StatusCode::Ok, headers).await?;
                while let Some(data) = exchange.read_body_chunk().await? {
                    exchange.write(&data).await?;
                }
                exchange.finish().await?;
            }
            "/upgrade" if exchange.request().wants_upgrade() => {
                let headers: Headers = [("Upgrade", "echo")].into_iter().collect();
                let mut raw = exchange.upgrade(headers).await?;
                while let Some(data) = raw.read().await? {
                    raw.write_all(&data).await?;
                }
            }
            _ => exchange.send(Response::not_found()).await?,
        }

        Ok(())
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_level(true)
        .init();

    let cfg = Config::load()?;

    tokio::select! {
        res = server::listener::run(&cfg, Arc::new(DemoHandler)) => {
            res?;
        }

        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutdown signal received");
        }
    }

    Ok(())
}
