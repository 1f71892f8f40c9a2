//! Per-connection HTTP/1.1 protocol state machine.
//!
//! A [`Frame`] owns no I/O. The connection feeds it the input buffer and an
//! output buffer; the frame parses heads, meters body bytes according to
//! the negotiated framing, and frames response bytes on the way out.
//!
//! ```text
//! AwaitingRequestLine -> ReadingHeaders -> ReadingBody | ReadyForApplication
//!     -> WritingResponse -> AwaitingRequestLine (keep-alive)
//!                         | Upgraded
//!                         | Closed
//! ```

use bytes::{Buf, Bytes, BytesMut};

use crate::error::ProtocolError;
use crate::http::chunked::{self, ChunkedDecoder};
use crate::http::headers::Headers;
use crate::http::parser::{self, ParseError};
use crate::http::request::{Method, Request, Version};
use crate::http::response::StatusCode;
use crate::http::writer;

/// Value of the `Server` header when it is enabled.
pub const SERVER_NAME: &str = "h1loop";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameState {
    AwaitingRequestLine,
    ReadingHeaders,
    ReadingBody,
    ReadyForApplication,
    WritingResponse,
    Upgraded,
    Closed,
}

impl FrameState {
    fn name(&self) -> &'static str {
        match self {
            FrameState::AwaitingRequestLine => "AwaitingRequestLine",
            FrameState::ReadingHeaders => "ReadingHeaders",
            FrameState::ReadingBody => "ReadingBody",
            FrameState::ReadyForApplication => "ReadyForApplication",
            FrameState::WritingResponse => "WritingResponse",
            FrameState::Upgraded => "Upgraded",
            FrameState::Closed => "Closed",
        }
    }
}

/// How a message body is delimited on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    None,
    ContentLength(u64),
    Chunked,
    /// HTTP/1.0 response without a length; the body ends when the
    /// connection closes.
    CloseDelimited,
}

/// Result of asking the frame for more request body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BodyProgress {
    Data(Bytes),
    /// The buffer does not hold the next piece yet; read the socket.
    NeedMore,
    End,
}

/// What the connection does once a request/response cycle is done.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    KeepAlive,
    Close,
    Upgraded,
}

#[derive(Debug, Clone, Copy)]
pub struct FrameOptions {
    pub max_header_size: usize,
    pub server_header: bool,
}

impl Default for FrameOptions {
    fn default() -> Self {
        Self {
            max_header_size: 64 * 1024,
            server_header: true,
        }
    }
}

#[derive(Debug)]
pub struct Frame {
    options: FrameOptions,
    state: FrameState,
    version: Version,
    keep_alive: bool,
    head_request: bool,
    upgrade_requested: bool,
    /// Offset up to which the buffered head has been searched for its end.
    head_scanned: usize,

    request_framing: BodyFraming,
    body_remaining: u64,
    body_complete: bool,
    chunked: ChunkedDecoder,

    response_framing: BodyFraming,
    response_remaining: u64,
    response_started: bool,
    response_finished: bool,
}

impl Frame {
    pub fn new(options: FrameOptions) -> Self {
        Self {
            options,
            state: FrameState::AwaitingRequestLine,
            version: Version::Http11,
            keep_alive: true,
            head_request: false,
            upgrade_requested: false,
            head_scanned: 0,
            request_framing: BodyFraming::None,
            body_remaining: 0,
            body_complete: true,
            chunked: ChunkedDecoder::new(),
            response_framing: BodyFraming::None,
            response_remaining: 0,
            response_started: false,
            response_finished: false,
        }
    }

    pub fn state(&self) -> FrameState {
        self.state
    }

    pub fn request_framing(&self) -> BodyFraming {
        self.request_framing
    }

    pub fn response_framing(&self) -> BodyFraming {
        self.response_framing
    }

    /// Request body bytes still expected under Content-Length framing.
    pub fn body_remaining(&self) -> u64 {
        self.body_remaining
    }

    pub fn body_complete(&self) -> bool {
        self.body_complete
    }

    pub fn response_started(&self) -> bool {
        self.response_started
    }

    pub fn response_finished(&self) -> bool {
        self.response_finished
    }

    pub fn is_upgraded(&self) -> bool {
        self.state == FrameState::Upgraded
    }

    /// Whether the head of a request has not been fully read yet.
    pub fn awaiting_head(&self) -> bool {
        matches!(
            self.state,
            FrameState::AwaitingRequestLine | FrameState::ReadingHeaders
        )
    }

    /// Whether unread request body must be drained before the connection
    /// can serve the next request.
    pub fn needs_drain(&self) -> bool {
        self.keep_alive && !self.body_complete && !self.is_upgraded()
    }

    fn invalid(&self, operation: &'static str) -> ProtocolError {
        ProtocolError::InvalidState {
            operation,
            state: self.state.name(),
        }
    }

    /// Try to parse a request head from the front of `input`.
    ///
    /// Returns `Ok(None)` when more bytes are needed. On success the head is
    /// consumed and the frame moves to `ReadingBody` or
    /// `ReadyForApplication`.
    pub fn parse_head(&mut self, input: &mut BytesMut) -> Result<Option<Request>, ProtocolError> {
        match self.state {
            FrameState::AwaitingRequestLine => {
                // Tolerate empty lines between pipelined requests, even when
                // a CRLF is split across reads.
                loop {
                    if input.starts_with(b"\r\n") {
                        input.advance(2);
                    } else if input.starts_with(b"\n") {
                        input.advance(1);
                    } else {
                        break;
                    }
                }
                if input.is_empty() || &input[..] == b"\r" {
                    return Ok(None);
                }
                self.state = FrameState::ReadingHeaders;
                self.head_scanned = 0;
            }
            FrameState::ReadingHeaders => {}
            _ => return Err(self.invalid("parse_head")),
        }

        let max_head = self.options.max_header_size;
        let (request, consumed) = match parser::parse_http_request_from(input, max_head, self.head_scanned) {
            Ok(parsed) => parsed,
            Err(ParseError::Incomplete) => {
                // The blank line may straddle the next read.
                self.head_scanned = input.len().saturating_sub(3);
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };
        let framing = parser::body_framing(&request)?;
        input.advance(consumed);
        self.head_scanned = 0;

        self.version = request.version;
        self.keep_alive = request.keep_alive();
        self.head_request = request.method == Method::HEAD;
        self.upgrade_requested = request.wants_upgrade();
        self.request_framing = framing;
        self.chunked = ChunkedDecoder::new();

        (self.body_remaining, self.body_complete) = match framing {
            BodyFraming::ContentLength(n) => (n, n == 0),
            BodyFraming::Chunked => (0, false),
            BodyFraming::None | BodyFraming::CloseDelimited => (0, true),
        };

        self.state = if self.body_complete {
            FrameState::ReadyForApplication
        } else {
            FrameState::ReadingBody
        };

        Ok(Some(request))
    }

    /// Take the next piece of request body out of `input`.
    ///
    /// Never consumes more than the declared framing permits; bytes past the
    /// end of the body stay in `input` for the next request.
    pub fn read_body(&mut self, input: &mut BytesMut) -> Result<BodyProgress, ProtocolError> {
        match self.state {
            FrameState::ReadingBody
            | FrameState::ReadyForApplication
            | FrameState::WritingResponse => {}
            _ => return Err(self.invalid("read_body")),
        }

        if self.body_complete {
            return Ok(BodyProgress::End);
        }

        let progress = match self.request_framing {
            BodyFraming::ContentLength(_) => {
                if input.is_empty() {
                    return Ok(BodyProgress::NeedMore);
                }
                let take = self.body_remaining.min(input.len() as u64) as usize;
                self.body_remaining -= take as u64;
                BodyProgress::Data(input.split_to(take).freeze())
            }
            BodyFraming::Chunked => self.chunked.decode(input)?,
            BodyFraming::None | BodyFraming::CloseDelimited => BodyProgress::End,
        };

        let finished = match self.request_framing {
            BodyFraming::ContentLength(_) => self.body_remaining == 0,
            BodyFraming::Chunked => self.chunked.is_done(),
            _ => true,
        };
        if finished {
            self.body_complete = true;
            if self.state == FrameState::ReadingBody {
                self.state = FrameState::ReadyForApplication;
            }
        }

        Ok(progress)
    }

    /// Decide response framing, finalize headers and serialize the head
    /// into `out`.
    ///
    /// A 101 moves the frame to `Upgraded`; every other status moves it to
    /// `WritingResponse`.
    pub fn begin_response(
        &mut self,
        status: StatusCode,
        headers: &mut Headers,
        out: &mut BytesMut,
    ) -> Result<(), ProtocolError> {
        match self.state {
            FrameState::ReadingBody | FrameState::ReadyForApplication => {}
            FrameState::WritingResponse | FrameState::Upgraded => {
                return Err(ProtocolError::ResponseAlreadyStarted);
            }
            _ => return Err(self.invalid("begin_response")),
        }

        if self.options.server_header && !headers.contains("Server") {
            headers.insert("Server", SERVER_NAME);
        }

        if status == StatusCode::SwitchingProtocols {
            if !self.upgrade_requested {
                return Err(ProtocolError::UpgradeNotRequested);
            }
            if !headers.has_token("Connection", "upgrade") {
                headers.insert("Connection", "Upgrade");
            }

            writer::write_head(status, headers, out);
            self.response_framing = BodyFraming::None;
            self.response_started = true;
            self.response_finished = true;
            self.state = FrameState::Upgraded;
            return Ok(());
        }

        if headers.has_token("Connection", "close") {
            self.keep_alive = false;
        }

        let framing = if self.head_request || !status.permits_body() {
            headers.remove("Transfer-Encoding");
            BodyFraming::None
        } else if let Some(value) = headers.get("Content-Length") {
            let len = value
                .trim()
                .parse::<u64>()
                .map_err(|_| ProtocolError::InvalidResponseHeader { name: "Content-Length" })?;
            headers.remove("Transfer-Encoding");
            BodyFraming::ContentLength(len)
        } else if self.version == Version::Http11 {
            headers.insert("Transfer-Encoding", "chunked");
            BodyFraming::Chunked
        } else {
            headers.remove("Transfer-Encoding");
            self.keep_alive = false;
            BodyFraming::CloseDelimited
        };

        if !self.keep_alive {
            if !headers.has_token("Connection", "close") {
                headers.insert("Connection", "close");
            }
        } else if self.version == Version::Http10 && !headers.has_token("Connection", "keep-alive") {
            headers.insert("Connection", "keep-alive");
        }

        writer::write_head(status, headers, out);

        self.response_framing = framing;
        self.response_remaining = match framing {
            BodyFraming::ContentLength(n) => n,
            _ => 0,
        };
        self.response_started = true;
        self.response_finished = false;
        self.state = FrameState::WritingResponse;
        Ok(())
    }

    /// Frame `data` as response body according to the response framing.
    ///
    /// Empty writes are no-ops, so a chunked body never contains a
    /// zero-size chunk before its terminator.
    pub fn write_body(&mut self, data: &[u8], out: &mut BytesMut) -> Result<(), ProtocolError> {
        if self.state != FrameState::WritingResponse || self.response_finished {
            return Err(self.invalid("write_body"));
        }
        if data.is_empty() {
            return Ok(());
        }

        match self.response_framing {
            BodyFraming::ContentLength(declared) => {
                let len = data.len() as u64;
                if len > self.response_remaining {
                    return Err(ProtocolError::ResponseOverrun { declared });
                }
                self.response_remaining -= len;
                out.extend_from_slice(data);
            }
            BodyFraming::Chunked => chunked::encode_chunk(data, out),
            BodyFraming::CloseDelimited => out.extend_from_slice(data),
            BodyFraming::None => {
                // HEAD responses describe a body without sending it.
                if !self.head_request {
                    return Err(ProtocolError::ResponseOverrun { declared: 0 });
                }
            }
        }

        Ok(())
    }

    /// End the response body: emit the terminating chunk, or check that a
    /// Content-Length body was fully written.
    pub fn finish_body(&mut self, out: &mut BytesMut) -> Result<(), ProtocolError> {
        if self.state != FrameState::WritingResponse {
            return Err(self.invalid("finish_body"));
        }
        if self.response_finished {
            return Ok(());
        }

        match self.response_framing {
            BodyFraming::Chunked => chunked::encode_last_chunk(out),
            BodyFraming::ContentLength(_) if self.response_remaining > 0 => {
                return Err(ProtocolError::ResponseUnderrun {
                    missing: self.response_remaining,
                });
            }
            _ => {}
        }

        self.response_finished = true;
        Ok(())
    }

    /// Close out the request/response cycle.
    ///
    /// On keep-alive the frame is reset to `AwaitingRequestLine` for the
    /// next request.
    pub fn complete_cycle(&mut self) -> Result<CycleOutcome, ProtocolError> {
        match self.state {
            FrameState::Upgraded => return Ok(CycleOutcome::Upgraded),
            FrameState::WritingResponse if self.response_finished => {}
            _ => return Err(self.invalid("complete_cycle")),
        }

        if self.keep_alive
            && self.body_complete
            && self.response_framing != BodyFraming::CloseDelimited
        {
            self.reset();
            Ok(CycleOutcome::KeepAlive)
        } else {
            self.state = FrameState::Closed;
            Ok(CycleOutcome::Close)
        }
    }

    pub fn close(&mut self) {
        self.state = FrameState::Closed;
    }

    fn reset(&mut self) {
        *self = Frame::new(self.options);
    }
}
