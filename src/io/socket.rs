//! Non-blocking socket abstraction.
//!
//! Every operation completes on the thread that owns the socket. Reads are
//! reported as a [`ReadCompletion`] so that a zero-length notification is a
//! different value from the transport's explicit disconnect signal.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// Outcome of a single read against the socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadCompletion {
    /// `n` bytes (n > 0) were appended to the caller's buffer.
    Data(usize),
    /// The read completed without delivering bytes. Not end-of-stream.
    Empty,
    /// The transport reported that the peer is gone.
    Disconnected,
}

/// How a socket is released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseMode {
    /// Normal shutdown; queued bytes are still delivered.
    Graceful,
    /// Reset the connection; the peer's next I/O fails.
    Abort,
}

/// Socket primitive consumed by [`Connection`](crate::http::connection::Connection).
#[allow(async_fn_in_trait)]
pub trait AsyncSocketIo {
    /// Read into the spare capacity of `buf`, appending what arrived.
    async fn read(&mut self, buf: &mut BytesMut) -> io::Result<ReadCompletion>;

    /// Write a prefix of `buf`, returning how many bytes were accepted.
    async fn write(&mut self, buf: &[u8]) -> io::Result<usize>;

    /// Release the socket. Calling it more than once is a no-op.
    fn close(&mut self, mode: CloseMode);

    fn peer_addr(&self) -> Option<SocketAddr> {
        None
    }
}

/// [`AsyncSocketIo`] over a tokio `TcpStream`.
///
/// A kernel read of zero bytes into a buffer with spare capacity is the
/// TCP end-of-stream signal, so it is reported as
/// [`ReadCompletion::Disconnected`].
#[derive(Debug)]
pub struct TcpSocket {
    stream: Option<TcpStream>,
    peer: Option<SocketAddr>,
}

impl TcpSocket {
    pub fn new(stream: TcpStream) -> Self {
        let peer = stream.peer_addr().ok();
        if let Err(e) = stream.set_nodelay(true) {
            tracing::trace!(error = %e, "failed to set TCP_NODELAY");
        }
        Self {
            stream: Some(stream),
            peer,
        }
    }

    fn stream(&mut self) -> io::Result<&mut TcpStream> {
        self.stream
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "socket closed"))
    }
}

impl AsyncSocketIo for TcpSocket {
    async fn read(&mut self, buf: &mut BytesMut) -> io::Result<ReadCompletion> {
        let stream = self.stream()?;
        if buf.capacity() == buf.len() {
            buf.reserve(super::buffer::DEFAULT_READ_SIZE);
        }

        match stream.read_buf(buf).await? {
            0 => Ok(ReadCompletion::Disconnected),
            n => Ok(ReadCompletion::Data(n)),
        }
    }

    async fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let stream = self.stream()?;
        let n = stream.write(buf).await?;

        if n == 0 && !buf.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                "connection closed while writing",
            ));
        }

        Ok(n)
    }

    fn close(&mut self, mode: CloseMode) {
        let Some(stream) = self.stream.take() else {
            return;
        };

        if mode == CloseMode::Abort {
            // Zero linger turns the close into an RST.
            #[allow(deprecated)]
            let linger = stream.set_linger(Some(Duration::ZERO));
            if let Err(e) = linger {
                tracing::trace!(error = %e, "failed to set SO_LINGER before abort");
            }
        }

        drop(stream);
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }
}
