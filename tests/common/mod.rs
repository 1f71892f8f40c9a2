#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::io;
use std::net::SocketAddr;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, BytesMut};
use h1loop::config::Config;
use h1loop::http::chunked::ChunkedDecoder;
use h1loop::http::connection::{Connection, ConnectionId, ConnectionOptions};
use h1loop::http::exchange::Exchange;
use h1loop::http::frame::BodyProgress;
use h1loop::http::handler::RequestHandler;
use h1loop::http::headers::Headers;
use h1loop::http::response::{Response, ResponseBuilder, StatusCode};
use h1loop::io::{AsyncSocketIo, CloseMode, ReadCompletion};
use h1loop::server::engine::EventLoopEngine;
use h1loop::server::listener::Listener;
use h1loop::server::timeout::{ConnectionTimeoutManager, SharedTimeouts, TimeoutEntry};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

pub const IDLE_MS: u64 = 300;
pub const TICK_MS: u64 = 25;

/// Short durations so idle-timeout tests finish quickly.
pub fn test_config() -> Config {
    Config {
        listen_addr: "127.0.0.1:0".to_string(),
        worker_threads: 2,
        idle_timeout_ms: IDLE_MS,
        tick_interval_ms: TICK_MS,
        ..Config::default()
    }
}

/// Long enough to sit well past the idle deadline plus a few ticks.
pub fn past_idle() -> Duration {
    Duration::from_millis(IDLE_MS * 2 + TICK_MS * 4)
}

/// Comfortably inside the idle window.
pub fn within_idle() -> Duration {
    Duration::from_millis(IDLE_MS / 2)
}

// ---------------------------------------------------------------------------
// Scripted socket
// ---------------------------------------------------------------------------

pub enum ScriptEvent {
    Data(Vec<u8>),
    Empty,
    Disconnect,
}

/// In-memory socket whose read completions are fed by a [`ScriptHandle`].
/// Reads pend until the script supplies the next event.
pub struct ScriptedSocket {
    events: mpsc::UnboundedReceiver<ScriptEvent>,
    written: Rc<RefCell<Vec<u8>>>,
    closed: Rc<Cell<Option<CloseMode>>>,
}

#[derive(Clone)]
pub struct ScriptHandle {
    tx: mpsc::UnboundedSender<ScriptEvent>,
    written: Rc<RefCell<Vec<u8>>>,
    closed: Rc<Cell<Option<CloseMode>>>,
}

pub fn scripted_socket() -> (ScriptedSocket, ScriptHandle) {
    let (tx, events) = mpsc::unbounded_channel();
    let written = Rc::new(RefCell::new(Vec::new()));
    let closed = Rc::new(Cell::new(None));

    (
        ScriptedSocket {
            events,
            written: written.clone(),
            closed: closed.clone(),
        },
        ScriptHandle { tx, written, closed },
    )
}

impl ScriptHandle {
    pub fn send(&self, data: &[u8]) {
        assert!(!data.is_empty(), "use empty() for zero-length completions");
        let _ = self.tx.send(ScriptEvent::Data(data.to_vec()));
    }

    pub fn empty(&self) {
        let _ = self.tx.send(ScriptEvent::Empty);
    }

    pub fn disconnect(&self) {
        let _ = self.tx.send(ScriptEvent::Disconnect);
    }

    pub fn written(&self) -> Vec<u8> {
        self.written.borrow().clone()
    }

    pub fn written_str(&self) -> String {
        String::from_utf8_lossy(&self.written.borrow()).into_owned()
    }

    pub fn close_mode(&self) -> Option<CloseMode> {
        self.closed.get()
    }

    /// Wait until `needle` shows up in the written bytes.
    pub async fn wait_for_output(&self, needle: &str) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !self.written_str().contains(needle) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("expected output never written");
    }
}

impl AsyncSocketIo for ScriptedSocket {
    async fn read(&mut self, buf: &mut BytesMut) -> io::Result<ReadCompletion> {
        match self.events.recv().await {
            Some(ScriptEvent::Data(data)) => {
                buf.extend_from_slice(&data);
                Ok(ReadCompletion::Data(data.len()))
            }
            Some(ScriptEvent::Empty) => Ok(ReadCompletion::Empty),
            Some(ScriptEvent::Disconnect) | None => Ok(ReadCompletion::Disconnected),
        }
    }

    async fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.written.borrow_mut().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn close(&mut self, mode: CloseMode) {
        if self.closed.get().is_none() {
            self.closed.set(Some(mode));
        }
    }
}

/// A connection over a scripted socket, registered with `manager`.
pub fn scripted_connection(
    manager: &SharedTimeouts,
) -> (Connection<ScriptedSocket>, ScriptHandle, ConnectionId) {
    let (socket, handle) = scripted_socket();
    let id = ConnectionId::next();
    let timeout = TimeoutEntry::register(id, manager);
    let options = ConnectionOptions {
        server_header: false,
        ..ConnectionOptions::default()
    };
    (Connection::new(id, socket, timeout, options), handle, id)
}

pub fn manager(idle: Duration) -> SharedTimeouts {
    ConnectionTimeoutManager::shared(idle)
}

// ---------------------------------------------------------------------------
// Handler
// ---------------------------------------------------------------------------

/// Routes used across the integration tests:
/// - `/echo`: reads the whole body, answers it with Content-Length
/// - `/stream?n=N&gap=MS`: N chunks `chunk-i\n`, MS apart
/// - `/upgrade`: 101 then raw echo until the peer disconnects
/// - `/fail`: returns an error before responding
/// - `/fail-late`: starts a streamed response, then errors
/// - `/short`: declares Content-Length 10 but writes 3 bytes
/// - `/silent`: returns without responding
/// - `/switch`: sends a bare 101 as a whole response, then lingers
/// - anything else: 200 with the path as body
pub struct TestHandler;

fn query_param(path: &str, key: &str) -> Option<u64> {
    let (_, query) = path.split_once('?')?;
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(k, _)| *k == key)
        .and_then(|(_, v)| v.parse().ok())
}

impl RequestHandler for TestHandler {
    async fn handle<S: AsyncSocketIo>(&self, exchange: &mut Exchange<'_, S>) -> anyhow::Result<()> {
        let path = exchange.request().path.clone();
        let route = path.split('?').next().unwrap_or("");

        match route {
            "/echo" => {
                let body = exchange.read_body_to_end().await?;
                exchange.send(Response::ok(body)).await?;
            }
            "/stream" => {
                let n = query_param(&path, "n").unwrap_or(3);
                let gap = Duration::from_millis(query_param(&path, "gap").unwrap_or(0));

                exchange.start_response(StatusCode::Ok, Headers::new()).await?;
                for i in 0..n {
                    if i > 0 {
                        tokio::time::sleep(gap).await;
                    }
                    exchange.write(format!("chunk-{i}\n").as_bytes()).await?;
                }
                exchange.finish().await?;
            }
            "/upgrade" => {
                let headers: Headers = [("Upgrade", "echo")].into_iter().collect();
                let mut raw = exchange.upgrade(headers).await?;
                while let Some(data) = raw.read().await? {
                    raw.write_all(&data).await?;
                }
            }
            "/fail" => anyhow::bail!("handler failed"),
            "/fail-late" => {
                exchange.start_response(StatusCode::Ok, Headers::new()).await?;
                exchange.write(b"partial").await?;
                anyhow::bail!("handler failed mid-stream");
            }
            "/short" => {
                let headers: Headers = [("Content-Length", "10")].into_iter().collect();
                exchange.start_response(StatusCode::Ok, headers).await?;
                exchange.write(b"abc").await?;
            }
            "/silent" => {}
            "/switch" => {
                exchange.send(ResponseBuilder::new(StatusCode::SwitchingProtocols).build()).await?;
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
            _ => exchange.send(Response::ok(path)).await?,
        }

        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Real TCP
// ---------------------------------------------------------------------------

pub struct TestServer {
    pub addr: SocketAddr,
    pub engine: Arc<EventLoopEngine>,
}

pub async fn spawn_server(cfg: Config) -> TestServer {
    let listener = Listener::bind(&cfg, Arc::new(TestHandler)).await.unwrap();
    let addr = listener.local_addr().unwrap();
    let engine = listener.engine();
    tokio::spawn(listener.run());
    TestServer { addr, engine }
}

/// Live connection counts per worker, read on each worker's own thread.
pub async fn connection_counts(engine: &EventLoopEngine) -> Vec<usize> {
    let mut counts = Vec::new();
    for index in 0..engine.thread_count() {
        let (tx, rx) = tokio::sync::oneshot::channel();
        engine
            .post_async(index, move |ctx| {
                let _ = tx.send(ctx.connection_count());
            })
            .unwrap();
        counts.push(rx.await.unwrap());
    }
    counts
}

#[derive(Debug)]
pub struct RawResponse {
    pub status: u16,
    pub headers: Headers,
    pub body: Vec<u8>,
    /// Payload sizes of the chunks as they were decoded, for chunked bodies.
    pub chunks: Vec<usize>,
}

async fn fill(stream: &mut TcpStream, buf: &mut BytesMut) -> anyhow::Result<()> {
    buf.reserve(4096);
    let n = stream.read_buf(buf).await?;
    if n == 0 {
        anyhow::bail!("connection closed by server");
    }
    Ok(())
}

/// Read the status line and headers only. For responses whose body is not
/// HTTP-framed, such as 101.
pub async fn read_head(stream: &mut TcpStream, buf: &mut BytesMut) -> anyhow::Result<(u16, Headers)> {
    let head_end = loop {
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos;
        }
        fill(stream, buf).await?;
    };

    let head = String::from_utf8(buf.split_to(head_end).to_vec())?;
    buf.advance(4);

    let mut lines = head.split("\r\n");
    let status_line = lines.next().unwrap_or("");
    let status = status_line
        .split(' ')
        .nth(1)
        .ok_or_else(|| anyhow::anyhow!("bad status line: {status_line}"))?
        .parse()?;

    let headers = lines
        .filter_map(|line| line.split_once(':'))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect();

    Ok((status, headers))
}

pub async fn read_response(stream: &mut TcpStream, buf: &mut BytesMut) -> anyhow::Result<RawResponse> {
    let (status, headers) = read_head(stream, buf).await?;
    let mut body = Vec::new();
    let mut chunks = Vec::new();

    if headers.has_token("Transfer-Encoding", "chunked") {
        let mut decoder = ChunkedDecoder::new();
        loop {
            match decoder.decode(buf)? {
                BodyProgress::Data(data) => {
                    chunks.push(data.len());
                    body.extend_from_slice(&data);
                }
                BodyProgress::NeedMore => fill(stream, buf).await?,
                BodyProgress::End => break,
            }
        }
    } else if let Some(len) = headers.get("Content-Length") {
        let len: usize = len.parse()?;
        while buf.len() < len {
            fill(stream, buf).await?;
        }
        body = buf.split_to(len).to_vec();
    }

    Ok(RawResponse {
        status,
        headers,
        body,
        chunks,
    })
}

pub async fn get(stream: &mut TcpStream, buf: &mut BytesMut, path: &str) -> anyhow::Result<RawResponse> {
    stream
        .write_all(format!("GET {path} HTTP/1.1\r\nHost: test\r\n\r\n").as_bytes())
        .await?;
    read_response(stream, buf).await
}

/// Whether the server reset the connection: the next write or read fails
/// with a transport-level error. A clean end-of-stream does not count.
pub async fn connection_was_reset(stream: &mut TcpStream) -> bool {
    fn is_reset(e: &io::Error) -> bool {
        matches!(
            e.kind(),
            io::ErrorKind::ConnectionReset | io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionAborted
        )
    }

    if let Err(e) = stream.write_all(b"GET / HTTP/1.1\r\nHost: test\r\n\r\n").await {
        return is_reset(&e);
    }

    let mut scratch = [0u8; 256];
    match tokio::time::timeout(Duration::from_secs(2), stream.read(&mut scratch)).await {
        Ok(Err(e)) => is_reset(&e),
        Ok(Ok(_)) | Err(_) => false,
    }
}
