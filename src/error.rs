//! Error taxonomy for the connection core.
//!
//! Framing problems are [`ProtocolError`]s, socket failures are transport
//! errors, and idle expiry is [`ConnectionError::Timeout`]. Every error that
//! ends a connection is mapped onto an [`EndReason`] so the close path can
//! pick the right shutdown mode and log line.

use std::io;

use thiserror::Error;

use crate::http::parser::ParseError;

/// Why a connection reached its `Closed` state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    /// The transport reported an explicit disconnect.
    SocketDisconnect,
    /// Malformed framing or a body over/under-run.
    ProtocolError,
    /// The underlying socket failed.
    TransportError,
    /// The idle deadline passed with no forward progress.
    Timeout,
    /// The request handler failed after its response had started.
    ApplicationError,
    /// Orderly close: `Connection: close`, end of an upgraded session.
    GracefulAppEnd,
}

impl EndReason {
    /// Whether the socket should be reset instead of shut down cleanly.
    ///
    /// An aborted connection is observed by the peer as a transport-level
    /// failure on its next read or write.
    pub fn is_abortive(&self) -> bool {
        matches!(
            self,
            EndReason::Timeout | EndReason::TransportError | EndReason::ApplicationError
        )
    }
}

/// Violations of HTTP/1.1 framing, on either direction of the connection.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed request: {0}")]
    Parse(#[from] ParseError),

    #[error("response body exceeds declared content-length of {declared} bytes")]
    ResponseOverrun { declared: u64 },

    #[error("response body ended {missing} bytes short of declared content-length")]
    ResponseUnderrun { missing: u64 },

    #[error("invalid response header {name}")]
    InvalidResponseHeader { name: &'static str },

    #[error("101 Switching Protocols sent for a request that did not ask to upgrade")]
    UpgradeNotRequested,

    #[error("response already started")]
    ResponseAlreadyStarted,

    #[error("{operation} not allowed in frame state {state}")]
    InvalidState {
        operation: &'static str,
        state: &'static str,
    },
}

/// Errors surfaced by connection I/O and the exchange handed to handlers.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("idle timeout expired")]
    Timeout,

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("transport error: {0}")]
    Transport(#[from] io::Error),

    #[error("peer disconnected")]
    Disconnected,

    #[error("connection already closed")]
    Closed,
}

impl ConnectionError {
    pub fn end_reason(&self) -> EndReason {
        match self {
            ConnectionError::Timeout => EndReason::Timeout,
            ConnectionError::Protocol(_) => EndReason::ProtocolError,
            ConnectionError::Transport(_) => EndReason::TransportError,
            ConnectionError::Disconnected => EndReason::SocketDisconnect,
            ConnectionError::Closed => EndReason::GracefulAppEnd,
        }
    }
}

impl From<ParseError> for ConnectionError {
    fn from(e: ParseError) -> Self {
        ConnectionError::Protocol(ProtocolError::Parse(e))
    }
}
