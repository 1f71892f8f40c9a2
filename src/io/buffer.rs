use bytes::{Buf, BytesMut};

/// Default number of bytes reserved for each socket read.
pub const DEFAULT_READ_SIZE: usize = 4096;

/// Make sure `input` can take at least `read_size` more bytes without
/// reallocating mid-read.
///
/// Reads into a buffer with no spare capacity complete with zero bytes,
/// which a transport adapter could not tell apart from end-of-stream.
pub fn reserve_for_read(input: &mut BytesMut, read_size: usize) {
    if input.capacity() - input.len() < read_size {
        input.reserve(read_size);
    }
}

/// Bytes queued for the socket but not yet acknowledged by a write
/// completion.
#[derive(Debug, Default)]
pub struct OutputBuffer {
    buf: BytesMut,
    total_written: u64,
}

impl OutputBuffer {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_READ_SIZE)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
            total_written: 0,
        }
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Direct access for encoders that frame bytes in place.
    pub fn buf_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    /// The unwritten bytes, oldest first.
    pub fn chunk(&self) -> &[u8] {
        &self.buf
    }

    /// Drop `n` bytes that the socket accepted.
    pub fn advance(&mut self, n: usize) {
        let n = n.min(self.buf.len());
        self.buf.advance(n);
        self.total_written += n as u64;
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Bytes acknowledged by write completions over the buffer's lifetime.
    pub fn total_written(&self) -> u64 {
        self.total_written
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }
}
