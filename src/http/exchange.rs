//! The request/response capabilities handed to a [`RequestHandler`].
//!
//! [`RequestHandler`]: crate::http::handler::RequestHandler

use std::net::SocketAddr;

use bytes::Bytes;
use tracing::{error, info, warn};

use crate::error::{ConnectionError, EndReason};
use crate::http::connection::{Connection, ConnectionId};
use crate::http::frame::CycleOutcome;
use crate::http::headers::Headers;
use crate::http::request::Request;
use crate::http::response::{Response, ResponseBuilder, StatusCode};
use crate::io::socket::AsyncSocketIo;

/// One request/response cycle on a connection.
///
/// The request head is parsed; its body is pulled with
/// [`read_body_chunk`](Self::read_body_chunk). A response is sent whole with
/// [`send`](Self::send) or streamed with
/// [`start_response`](Self::start_response), [`write`](Self::write) and
/// [`finish`](Self::finish).
pub struct Exchange<'c, S: AsyncSocketIo> {
    conn: &'c mut Connection<S>,
    request: Request,
}

impl<'c, S: AsyncSocketIo> Exchange<'c, S> {
    pub(crate) fn new(conn: &'c mut Connection<S>, request: Request) -> Self {
        Self { conn, request }
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.conn.id()
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.conn.peer_addr()
    }

    /// Next piece of the request body, `None` once it is complete.
    pub async fn read_body_chunk(&mut self) -> Result<Option<Bytes>, ConnectionError> {
        self.conn.read_body_chunk().await
    }

    pub async fn read_body_to_end(&mut self) -> Result<Vec<u8>, ConnectionError> {
        let mut body = Vec::new();
        while let Some(data) = self.conn.read_body_chunk().await? {
            body.extend_from_slice(&data);
        }
        Ok(body)
    }

    /// Send a complete response.
    pub async fn send(&mut self, response: Response) -> Result<(), ConnectionError> {
        self.conn.send_response(response).await
    }

    /// Send the status line and headers of a streamed response.
    ///
    /// Without a `Content-Length` header the body is chunked on HTTP/1.1
    /// and close-delimited on HTTP/1.0.
    pub async fn start_response(&mut self, status: StatusCode, headers: Headers) -> Result<(), ConnectionError> {
        self.conn.start_response(status, headers).await
    }

    /// Write one piece of the response body.
    pub async fn write(&mut self, data: &[u8]) -> Result<(), ConnectionError> {
        self.conn.write_body(data).await
    }

    /// End the streamed response body.
    pub async fn finish(&mut self) -> Result<(), ConnectionError> {
        self.conn.finish_body().await
    }

    /// Answer `101 Switching Protocols` and take over the raw connection.
    ///
    /// From here on bytes pass through unframed and the idle timeout no
    /// longer applies.
    pub async fn upgrade(&mut self, headers: Headers) -> Result<Upgraded<'_, S>, ConnectionError> {
        self.conn.start_response(StatusCode::SwitchingProtocols, headers).await?;
        info!(
            conn = %self.conn.id(),
            protocol = self.request.header("Upgrade").unwrap_or(""),
            "connection upgraded"
        );

        Ok(Upgraded { conn: &mut *self.conn })
    }

    /// Close out the cycle once the handler has returned.
    pub(crate) async fn complete(self, result: anyhow::Result<()>) -> Result<CycleOutcome, ConnectionError> {
        let conn = self.conn;

        if let Err(e) = result {
            let e = match e.downcast::<ConnectionError>() {
                Ok(conn_err) => return Err(conn_err),
                Err(e) => e,
            };
            error!(conn = %conn.id(), error = %e, "request handler failed");

            if conn.frame().response_started() {
                conn.end(EndReason::ApplicationError);
                return Ok(CycleOutcome::Close);
            }

            let response = ResponseBuilder::new(StatusCode::InternalServerError)
                .header("Connection", "close")
                .body(b"500 Internal Server Error".to_vec())
                .build();
            conn.send_response(response).await?;
            return Ok(conn.frame_mut().complete_cycle()?);
        }

        if conn.is_ended() {
            return Ok(CycleOutcome::Close);
        }
        if conn.frame().is_upgraded() {
            return Ok(CycleOutcome::Upgraded);
        }

        if !conn.frame().response_started() {
            warn!(conn = %conn.id(), path = %self.request.path, "handler returned without responding");
            conn.send_response(Response::internal_error()).await?;
        } else if !conn.frame().response_finished() {
            conn.finish_body().await?;
        }

        if conn.frame().needs_drain() {
            conn.drain_request_body().await?;
        }

        let outcome = conn.frame_mut().complete_cycle()?;
        if outcome == CycleOutcome::KeepAlive {
            conn.cycle_complete();
        }
        Ok(outcome)
    }
}

/// A connection after `101 Switching Protocols`.
pub struct Upgraded<'a, S: AsyncSocketIo> {
    conn: &'a mut Connection<S>,
}

impl<S: AsyncSocketIo> Upgraded<'_, S> {
    pub fn connection_id(&self) -> ConnectionId {
        self.conn.id()
    }

    /// Next bytes from the peer, `None` once it disconnects.
    pub async fn read(&mut self) -> Result<Option<Bytes>, ConnectionError> {
        match self.conn.read_raw().await {
            Ok(data) => Ok(Some(data)),
            Err(ConnectionError::Disconnected) => {
                self.conn.end(EndReason::SocketDisconnect);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    pub async fn write_all(&mut self, data: &[u8]) -> Result<(), ConnectionError> {
        self.conn.write_raw(data).await
    }
}
