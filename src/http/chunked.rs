//! Chunked transfer-encoding (RFC 7230 §4.1).
//!
//! The decoder is incremental: it hands out payload bytes as soon as they
//! arrive and never consumes input past the blank line that ends the
//! trailer section, so pipelined requests stay in the buffer.

use bytes::{Buf, BytesMut};

use crate::http::frame::BodyProgress;
use crate::http::parser::ParseError;

const MAX_CHUNK_LINE_LEN: usize = 1024;
const MAX_TRAILERS_SIZE: usize = 8 * 1024;

/// Wrap `data` as one chunk: `<hex-size>\r\n<data>\r\n`.
///
/// Empty input emits nothing; a zero-size chunk would terminate the body.
pub fn encode_chunk(data: &[u8], out: &mut BytesMut) {
    if data.is_empty() {
        return;
    }

    let size_line = format!("{:X}\r\n", data.len());
    out.reserve(size_line.len() + data.len() + 2);
    out.extend_from_slice(size_line.as_bytes());
    out.extend_from_slice(data);
    out.extend_from_slice(b"\r\n");
}

/// The terminating zero-size chunk with an empty trailer section.
pub fn encode_last_chunk(out: &mut BytesMut) {
    out.extend_from_slice(b"0\r\n\r\n");
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkPhase {
    SizeLine,
    Data { remaining: u64 },
    DataCrlf,
    Trailers,
    Done,
}

#[derive(Debug)]
pub struct ChunkedDecoder {
    phase: ChunkPhase,
    trailer_bytes: usize,
}

impl ChunkedDecoder {
    pub fn new() -> Self {
        Self {
            phase: ChunkPhase::SizeLine,
            trailer_bytes: 0,
        }
    }

    /// Whether the terminating chunk and trailers have been consumed.
    pub fn is_done(&self) -> bool {
        self.phase == ChunkPhase::Done
    }

    /// Consume as much of `src` as the current phase allows.
    ///
    /// Yields at most one chunk's worth of payload per call.
    pub fn decode(&mut self, src: &mut BytesMut) -> Result<BodyProgress, ParseError> {
        loop {
            match self.phase {
                ChunkPhase::SizeLine => {
                    let Some(line) = split_line(src, MAX_CHUNK_LINE_LEN, ParseError::InvalidChunkSize)? else {
                        return Ok(BodyProgress::NeedMore);
                    };
                    let size = parse_chunk_size(&line)?;
                    tracing::trace!(size, "chunk size line");

                    self.phase = if size == 0 {
                        ChunkPhase::Trailers
                    } else {
                        ChunkPhase::Data { remaining: size }
                    };
                }

                ChunkPhase::Data { remaining } => {
                    if src.is_empty() {
                        return Ok(BodyProgress::NeedMore);
                    }

                    let take = remaining.min(src.len() as u64) as usize;
                    let data = src.split_to(take).freeze();
                    let left = remaining - take as u64;

                    self.phase = if left == 0 {
                        ChunkPhase::DataCrlf
                    } else {
                        ChunkPhase::Data { remaining: left }
                    };
                    return Ok(BodyProgress::Data(data));
                }

                ChunkPhase::DataCrlf => {
                    if src.len() < 2 {
                        return Ok(BodyProgress::NeedMore);
                    }
                    if &src[..2] != b"\r\n" {
                        return Err(ParseError::InvalidChunkTerminator);
                    }
                    src.advance(2);
                    self.phase = ChunkPhase::SizeLine;
                }

                ChunkPhase::Trailers => {
                    let budget = MAX_TRAILERS_SIZE.saturating_sub(self.trailer_bytes);
                    let Some(line) = split_line(src, budget, ParseError::InvalidTrailer)? else {
                        return Ok(BodyProgress::NeedMore);
                    };

                    if line.is_empty() {
                        self.phase = ChunkPhase::Done;
                        return Ok(BodyProgress::End);
                    }

                    self.trailer_bytes += line.len() + 2;
                    if !line.contains(&b':') {
                        return Err(ParseError::InvalidTrailer);
                    }
                }

                ChunkPhase::Done => return Ok(BodyProgress::End),
            }
        }
    }
}

impl Default for ChunkedDecoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Split one CRLF-terminated line off `src`, without the CRLF.
fn split_line(
    src: &mut BytesMut,
    max_len: usize,
    too_long: ParseError,
) -> Result<Option<BytesMut>, ParseError> {
    let Some(line_end) = src.windows(2).position(|w| w == b"\r\n") else {
        if src.len() > max_len {
            return Err(too_long);
        }
        return Ok(None);
    };

    if line_end > max_len {
        return Err(too_long);
    }

    let line = src.split_to(line_end);
    src.advance(2);
    Ok(Some(line))
}

fn parse_chunk_size(line: &[u8]) -> Result<u64, ParseError> {
    let line = std::str::from_utf8(line).map_err(|_| ParseError::InvalidChunkSize)?;
    // Chunk extensions are accepted and ignored.
    let size = line.split(';').next().unwrap_or("").trim();
    if size.is_empty() {
        return Err(ParseError::InvalidChunkSize);
    }
    u64::from_str_radix(size, 16).map_err(|_| ParseError::InvalidChunkSize)
}
