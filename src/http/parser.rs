use thiserror::Error;

use crate::http::frame::BodyFraming;
use crate::http::headers::Headers;
use crate::http::request::{Method, Request, Version};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("invalid request line")]
    InvalidRequest,
    #[error("unknown method")]
    InvalidMethod,
    #[error("unsupported HTTP version")]
    UnsupportedVersion,
    #[error("invalid header line")]
    InvalidHeader,
    #[error("invalid content-length")]
    InvalidContentLength,
    #[error("unsupported transfer-encoding")]
    UnsupportedTransferEncoding,
    #[error("request head exceeds {limit} bytes")]
    HeadersTooLarge { limit: usize },
    #[error("invalid chunk size line")]
    InvalidChunkSize,
    #[error("chunk data not followed by CRLF")]
    InvalidChunkTerminator,
    #[error("invalid trailer line")]
    InvalidTrailer,
    #[error("incomplete request")]
    Incomplete,
}

/// Parse a request line and header block from the front of `buf`.
///
/// Returns the request and the number of bytes the head occupied, including
/// the blank line. Body bytes are left alone; framing is decided by
/// [`body_framing`].
pub fn parse_http_request(buf: &[u8], max_head_size: usize) -> Result<(Request, usize), ParseError> {
    parse_http_request_from(buf, max_head_size, 0)
}

/// Like [`parse_http_request`], resuming the search for the blank line at
/// `scan_from`. Bytes before it must already be known not to start one.
pub fn parse_http_request_from(
    buf: &[u8],
    max_head_size: usize,
    scan_from: usize,
) -> Result<(Request, usize), ParseError> {
    // Look for header/body separator
    let Some(headers_end) = find_headers_end(buf, scan_from) else {
        if buf.len() > max_head_size {
            return Err(ParseError::HeadersTooLarge { limit: max_head_size });
        }
        return Err(ParseError::Incomplete);
    };

    if headers_end + 4 > max_head_size {
        return Err(ParseError::HeadersTooLarge { limit: max_head_size });
    }

    let headers_str = std::str::from_utf8(&buf[..headers_end])
        .map_err(|_| ParseError::InvalidRequest)?;

    let mut lines = headers_str.split("\r\n");

    // Request line
    let request_line = lines.next().ok_or(ParseError::InvalidRequest)?;
    let mut parts = request_line.split_ascii_whitespace();

    let method_str = parts.next().ok_or(ParseError::InvalidRequest)?;
    let path = parts.next().ok_or(ParseError::InvalidRequest)?;
    let version = parts.next().ok_or(ParseError::InvalidRequest)?;
    if parts.next().is_some() {
        return Err(ParseError::InvalidRequest);
    }

    let method = Method::from_str(method_str).ok_or(ParseError::InvalidMethod)?;
    let version = Version::parse(version).ok_or(ParseError::UnsupportedVersion)?;

    // Headers
    let mut headers = Headers::new();

    for line in lines {
        let (key, value) = line
            .split_once(':')
            .ok_or(ParseError::InvalidHeader)?;

        // No whitespace between field-name and colon (RFC 7230 §3.2.4).
        if key.is_empty() || key.trim() != key {
            return Err(ParseError::InvalidHeader);
        }

        headers.append(key, value.trim());
    }

    let request = Request {
        method,
        path: path.to_string(),
        version,
        headers,
    };

    Ok((request, headers_end + 4))
}

/// Decide how the request body is delimited.
///
/// A chunked `Transfer-Encoding` wins over `Content-Length`. Any other
/// transfer-coding cannot be delimited and is rejected, as is chunked on
/// HTTP/1.0. Repeated `Content-Length` values must agree.
pub fn body_framing(request: &Request) -> Result<BodyFraming, ParseError> {
    if request.headers.contains("Transfer-Encoding") {
        if request.version == Version::Http10 || !request.is_chunked() {
            return Err(ParseError::UnsupportedTransferEncoding);
        }
        return Ok(BodyFraming::Chunked);
    }

    let mut length = None;
    for value in request.headers.get_all("Content-Length") {
        let parsed = value
            .trim()
            .parse::<u64>()
            .map_err(|_| ParseError::InvalidContentLength)?;

        if length.is_some_and(|prev| prev != parsed) {
            return Err(ParseError::InvalidContentLength);
        }
        length = Some(parsed);
    }

    Ok(match length {
        Some(n) => BodyFraming::ContentLength(n),
        None => BodyFraming::None,
    })
}

fn find_headers_end(buf: &[u8], from: usize) -> Option<usize> {
    let from = from.min(buf.len());
    buf[from..]
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|pos| pos + from)
}
