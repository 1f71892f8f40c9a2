//! One accepted socket bound to one [`Frame`] and one timeout entry.
//!
//! The connection owns all buffering. Every socket read or write passes
//! through [`Connection::on_read_completed`] or
//! [`Connection::on_write_completed`], which is where idle-timeout activity
//! is reported. Each await on the socket also listens for the abort signal
//! from the worker's timeout manager.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::{Bytes, BytesMut};
use tracing::{debug, trace, warn};

use crate::config::Config;
use crate::error::{ConnectionError, EndReason, ProtocolError};
use crate::http::exchange::Exchange;
use crate::http::frame::{BodyProgress, CycleOutcome, Frame, FrameOptions, SERVER_NAME};
use crate::http::handler::RequestHandler;
use crate::http::headers::Headers;
use crate::http::request::Request;
use crate::http::response::{Response, StatusCode};
use crate::http::writer;
use crate::io::buffer::{self, OutputBuffer};
use crate::io::socket::{AsyncSocketIo, CloseMode, ReadCompletion};
use crate::server::timeout::{TimeoutEntry, TimeoutMode};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique connection identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ConnectionOptions {
    pub read_buffer_size: usize,
    pub max_header_size: usize,
    pub server_header: bool,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            read_buffer_size: buffer::DEFAULT_READ_SIZE,
            max_header_size: 64 * 1024,
            server_header: true,
        }
    }
}

impl From<&Config> for ConnectionOptions {
    fn from(cfg: &Config) -> Self {
        Self {
            read_buffer_size: cfg.read_buffer_size,
            max_header_size: cfg.max_header_size,
            server_header: cfg.server_header,
        }
    }
}

pub struct Connection<S: AsyncSocketIo> {
    id: ConnectionId,
    socket: S,
    input: BytesMut,
    output: OutputBuffer,
    frame: Frame,
    timeout: TimeoutEntry,
    options: ConnectionOptions,
    started: bool,
    end_reason: Option<EndReason>,
}

impl<S: AsyncSocketIo> Connection<S> {
    /// `timeout` must already be registered, which arms the pre-request
    /// idle window.
    pub fn new(id: ConnectionId, socket: S, timeout: TimeoutEntry, options: ConnectionOptions) -> Self {
        let frame = Frame::new(FrameOptions {
            max_header_size: options.max_header_size,
            server_header: options.server_header,
        });

        Self {
            id,
            socket,
            input: BytesMut::with_capacity(options.read_buffer_size),
            output: OutputBuffer::with_capacity(options.read_buffer_size),
            frame,
            timeout,
            options,
            started: false,
            end_reason: None,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.socket.peer_addr()
    }

    pub fn frame(&self) -> &Frame {
        &self.frame
    }

    pub fn timeout_mode(&self) -> Option<TimeoutMode> {
        self.timeout.mode()
    }

    pub fn is_ended(&self) -> bool {
        self.end_reason.is_some()
    }

    pub fn end_reason(&self) -> Option<EndReason> {
        self.end_reason
    }

    /// Bytes received but not yet consumed by the frame.
    pub fn buffered_input(&self) -> usize {
        self.input.len()
    }

    /// Begin the read loop. The first read is issued by the next call to
    /// [`read_once`](Self::read_once) or [`run`](Self::run).
    pub fn start(&mut self) {
        if self.started {
            return;
        }
        self.started = true;
        buffer::reserve_for_read(&mut self.input, self.options.read_buffer_size);

        match self.socket.peer_addr() {
            Some(peer) => debug!(conn = %self.id, %peer, "connection opened"),
            None => debug!(conn = %self.id, "connection opened"),
        }
    }

    /// Account for a read completion. Data has already been appended to the
    /// input buffer by the socket.
    ///
    /// `Empty` is a no-progress event and leaves the connection open; only
    /// `Disconnected` ends it.
    pub fn on_read_completed(&mut self, completion: ReadCompletion) -> Result<usize, ConnectionError> {
        if self.is_ended() {
            return Err(ConnectionError::Closed);
        }

        match completion {
            ReadCompletion::Data(n) => {
                if !self.frame.is_upgraded() {
                    self.timeout.activity();
                }
                trace!(conn = %self.id, bytes = n, "read completed");
                Ok(n)
            }
            ReadCompletion::Empty => {
                trace!(conn = %self.id, "zero-length read completion");
                Ok(0)
            }
            ReadCompletion::Disconnected => Err(ConnectionError::Disconnected),
        }
    }

    /// Account for `n` bytes accepted by the socket.
    pub fn on_write_completed(&mut self, n: usize) -> Result<(), ConnectionError> {
        if self.is_ended() {
            return Err(ConnectionError::Closed);
        }
        if n == 0 && !self.output.is_empty() {
            return Err(io::Error::new(io::ErrorKind::WriteZero, "connection closed while writing").into());
        }

        self.output.advance(n);
        if n > 0 && !self.frame.is_upgraded() {
            self.timeout.activity();
        }
        Ok(())
    }

    /// Move to `Closed`, releasing the socket, buffers and timeout entry.
    ///
    /// Idempotent: the first reason wins.
    pub fn end(&mut self, reason: EndReason) {
        if self.end_reason.is_some() {
            return;
        }
        self.end_reason = Some(reason);

        let mode = if reason.is_abortive() {
            CloseMode::Abort
        } else {
            CloseMode::Graceful
        };
        self.socket.close(mode);

        self.input = BytesMut::new();
        self.output.clear();
        self.frame.close();
        self.timeout.release();

        debug!(
            conn = %self.id,
            reason = ?reason,
            written = self.output.total_written(),
            "connection closed"
        );
    }

    /// Issue one socket read and account for its completion.
    ///
    /// Fails with [`ConnectionError::Timeout`] if the timeout manager aborts
    /// the connection while the read is pending.
    pub async fn read_once(&mut self) -> Result<ReadCompletion, ConnectionError> {
        if self.is_ended() {
            return Err(ConnectionError::Closed);
        }
        buffer::reserve_for_read(&mut self.input, self.options.read_buffer_size);

        let completion = tokio::select! {
            biased;
            _ = self.timeout.aborted() => return Err(ConnectionError::Timeout),
            res = self.socket.read(&mut self.input) => res?,
        };

        self.on_read_completed(completion)?;
        Ok(completion)
    }

    /// Read until at least one byte arrives. Zero-length completions issue
    /// another read.
    async fn fill_input(&mut self) -> Result<usize, ConnectionError> {
        loop {
            if let ReadCompletion::Data(n) = self.read_once().await? {
                return Ok(n);
            }
        }
    }

    /// Write out everything queued in the output buffer.
    pub(crate) async fn flush(&mut self) -> Result<(), ConnectionError> {
        while !self.output.is_empty() {
            if self.is_ended() {
                return Err(ConnectionError::Closed);
            }

            let n = tokio::select! {
                biased;
                _ = self.timeout.aborted() => return Err(ConnectionError::Timeout),
                res = self.socket.write(self.output.chunk()) => res?,
            };
            self.on_write_completed(n)?;
        }
        Ok(())
    }

    /// Drive request/response cycles until the connection ends.
    pub async fn run<H: RequestHandler>(&mut self, handler: &H) -> EndReason {
        self.start();

        loop {
            match self.serve_cycle(handler).await {
                Ok(CycleOutcome::KeepAlive) => {}
                Ok(CycleOutcome::Close | CycleOutcome::Upgraded) => self.end(EndReason::GracefulAppEnd),
                Err(e) => self.fail(e).await,
            }

            if let Some(reason) = self.end_reason {
                return reason;
            }
        }
    }

    async fn serve_cycle<H: RequestHandler>(&mut self, handler: &H) -> Result<CycleOutcome, ConnectionError> {
        let request = self.read_head().await?;
        debug!(
            conn = %self.id,
            method = ?request.method,
            path = %request.path,
            version = request.version.as_str(),
            "request"
        );

        let mut exchange = Exchange::new(self, request);
        let result = handler.handle(&mut exchange).await;
        exchange.complete(result).await
    }

    async fn read_head(&mut self) -> Result<Request, ConnectionError> {
        loop {
            if let Some(request) = self.frame.parse_head(&mut self.input)? {
                // Pipelined heads arrive with the previous cycle's bytes.
                self.timeout.activity();
                return Ok(request);
            }
            self.fill_input().await?;
        }
    }

    async fn fail(&mut self, err: ConnectionError) {
        let reason = err.end_reason();

        match &err {
            ConnectionError::Protocol(e) => {
                warn!(conn = %self.id, error = %e, "protocol error");
                if matches!(e, ProtocolError::Parse(_)) && !self.frame.response_started() {
                    self.send_bad_request().await;
                }
            }
            ConnectionError::Transport(e) => debug!(conn = %self.id, error = %e, "transport error"),
            ConnectionError::Timeout => debug!(conn = %self.id, "idle timeout expired"),
            ConnectionError::Disconnected => trace!(conn = %self.id, "peer disconnected"),
            ConnectionError::Closed => {}
        }

        self.end(reason);
    }

    /// Best-effort 400 for a request that could not be framed. The frame is
    /// bypassed since it never reached a state that can respond.
    async fn send_bad_request(&mut self) {
        let mut response = Response::bad_request();
        if self.options.server_header {
            response.headers.insert("Server", SERVER_NAME);
        }

        self.output.clear();
        writer::write_head(response.status, &response.headers, self.output.buf_mut());
        self.output.push(&response.body);

        if let Err(e) = self.flush().await {
            trace!(conn = %self.id, error = %e, "failed to send 400");
        }
    }

    pub(crate) async fn read_body_chunk(&mut self) -> Result<Option<Bytes>, ConnectionError> {
        loop {
            match self.frame.read_body(&mut self.input)? {
                BodyProgress::Data(data) => return Ok(Some(data)),
                BodyProgress::End => return Ok(None),
                BodyProgress::NeedMore => {
                    self.fill_input().await?;
                }
            }
        }
    }

    pub(crate) async fn drain_request_body(&mut self) -> Result<(), ConnectionError> {
        let mut drained = 0usize;
        while let Some(data) = self.read_body_chunk().await? {
            drained += data.len();
        }
        trace!(conn = %self.id, bytes = drained, "drained unread request body");
        Ok(())
    }

    /// Frame a response head. A 101 leaves the timeout permanently
    /// disabled, whichever path sent it.
    fn begin_response(&mut self, status: StatusCode, headers: &mut Headers) -> Result<(), ConnectionError> {
        self.frame.begin_response(status, headers, self.output.buf_mut())?;
        if self.frame.is_upgraded() {
            self.timeout.upgraded();
        }
        Ok(())
    }

    pub(crate) async fn start_response(&mut self, status: StatusCode, mut headers: Headers) -> Result<(), ConnectionError> {
        self.begin_response(status, &mut headers)?;
        self.flush().await
    }

    pub(crate) async fn write_body(&mut self, data: &[u8]) -> Result<(), ConnectionError> {
        self.frame.write_body(data, self.output.buf_mut())?;
        self.flush().await
    }

    pub(crate) async fn finish_body(&mut self) -> Result<(), ConnectionError> {
        self.frame.finish_body(self.output.buf_mut())?;
        self.flush().await
    }

    /// Queue a complete response and write it out.
    pub(crate) async fn send_response(&mut self, response: Response) -> Result<(), ConnectionError> {
        let mut headers = response.headers;
        self.begin_response(response.status, &mut headers)?;
        if !self.frame.is_upgraded() {
            self.frame.write_body(&response.body, self.output.buf_mut())?;
            self.frame.finish_body(self.output.buf_mut())?;
        }
        self.flush().await
    }

    pub(crate) fn frame_mut(&mut self) -> &mut Frame {
        &mut self.frame
    }

    pub(crate) fn cycle_complete(&mut self) {
        self.timeout.cycle_complete();
    }

    /// Raw bytes after an upgrade: leftover input first, then the socket.
    pub(crate) async fn read_raw(&mut self) -> Result<Bytes, ConnectionError> {
        if self.input.is_empty() {
            self.fill_input().await?;
        }
        Ok(self.input.split().freeze())
    }

    pub(crate) async fn write_raw(&mut self, data: &[u8]) -> Result<(), ConnectionError> {
        self.output.push(data);
        self.flush().await
    }
}
