// Copyright 2022 Ryan Seipp
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! HTTP/1.x request-line, header, and body parsing.
//!
//! Parsing is zero-copy: the request line and headers borrow directly from
//! the connection's receive buffer. Because a connection's buffer may only
//! hold part of a request, [`parse_request`] is resumable in the sense that
//! it never mutates input and is cheap to re-run from the start of the
//! buffer each time more bytes arrive — it returns [`ParseOutcome::Incomplete`]
//! rather than erroring when the header block hasn't terminated yet. Only
//! the chunked body decoder carries state across calls, since a chunk
//! boundary is a genuine mid-stream position that cannot be re-derived by
//! rescanning from the top.

use super::tokens::is_request_target_token;
use super::ParseError;
use crate::parser::raw_request::RawRequest;
use crate::parser::{Header, Method, Version};

/// Maximum header fields accepted per request; guards against an
/// unbounded `Vec` growth from a malicious client sending endless headers.
pub const MAX_HEADERS: usize = 128;

/// The parsed request line and header block, borrowed from the buffer
/// that was parsed.
#[derive(Debug)]
pub struct ParsedRequest<'buf> {
    /// Request method.
    pub method: Method,
    /// Request target, exactly as received.
    pub target: &'buf str,
    /// HTTP version on the request line.
    pub version: Version,
    /// Header fields in receive order.
    pub headers: Vec<Header<'buf>>,
    /// Number of bytes of `buf` consumed by the request line and headers,
    /// i.e. the offset of the first body byte (if any).
    pub consumed: usize,
}

/// Result of attempting to parse a request line and header block.
#[derive(Debug)]
pub enum ParseOutcome<'buf> {
    /// The header block terminated and was fully parsed.
    Complete(ParsedRequest<'buf>),
    /// `buf` does not yet contain a full header block; call again once
    /// more bytes have been read into the buffer.
    Incomplete,
}

/// How a request or response body is framed, decided from its headers
/// per [RFC 9112 Section 6.3](https://www.rfc-editor.org/rfc/rfc9112#section-6.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyMode {
    /// No body: no `Content-Length`, no `Transfer-Encoding: chunked`.
    None,
    /// Exactly this many bytes follow, per `Content-Length`.
    Fixed(usize),
    /// Body is chunk-encoded.
    Chunked,
}

/// Parses a request line and header block from the start of `buf`.
///
/// Returns [`ParseOutcome::Incomplete`] if the terminating blank line
/// hasn't been seen yet — the caller should read more bytes and retry
/// from the same offset. Never holds state between calls; re-parsing a
/// growing buffer from scratch is the cost of the zero-copy/resumable
/// design.
pub fn parse_request(buf: &[u8]) -> Result<ParseOutcome<'_>, ParseError> {
    if find_header_block_end(buf).is_none() {
        return Ok(ParseOutcome::Incomplete);
    }

    let mut req = RawRequest::new(buf);
    let method = parse_method(&mut req)?;
    let target = parse_target(&mut req)?;
    let version = parse_version(&mut req)?;
    discard_newline(&mut req)?;
    let headers = parse_headers(&mut req)?;

    Ok(ParseOutcome::Complete(ParsedRequest {
        method,
        target,
        version,
        headers,
        consumed: req.pos(),
    }))
}

/// Scans for the blank line (`"\r\n\r\n"`) ending the header block,
/// returning its end offset if present.
fn find_header_block_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

fn parse_method(buf: &mut RawRequest<'_>) -> Result<Method, ParseError> {
    let start = buf.pos();
    loop {
        match buf.peek() {
            Some(b' ') => break,
            Some(b) if b.is_ascii_uppercase() => {
                buf.advance(1);
            }
            _ => return Err(ParseError::Method),
        }
    }
    let end = buf.pos();
    let method_bytes = sub_slice(buf, start, end);
    buf.advance(1); // consume the space

    match method_bytes {
        b"GET" => Ok(Method::Get),
        b"HEAD" => Ok(Method::Head),
        b"POST" => Ok(Method::Post),
        b"PUT" => Ok(Method::Put),
        b"DELETE" => Ok(Method::Delete),
        b"CONNECT" => Ok(Method::Connect),
        b"OPTIONS" => Ok(Method::Options),
        b"TRACE" => Ok(Method::Trace),
        _ => Err(ParseError::Method),
    }
}

fn parse_target<'b>(buf: &mut RawRequest<'b>) -> Result<&'b str, ParseError> {
    let start = buf.pos();
    loop {
        match buf.peek() {
            Some(b' ') => break,
            Some(b) if is_request_target_token(b) => {
                buf.advance(1);
            }
            _ => return Err(ParseError::Target),
        }
    }
    let end = buf.pos();
    if end == start {
        return Err(ParseError::Target);
    }
    let bytes = sub_slice(buf, start, end);
    buf.advance(1); // consume the space
    std::str::from_utf8(bytes).map_err(|_| ParseError::Target)
}

fn parse_version(buf: &mut RawRequest<'_>) -> Result<Version, ParseError> {
    let start = buf.pos();
    buf.advance(8); // "HTTP/1.x" is exactly 8 bytes
    let bytes = sub_slice(buf, start, buf.pos());
    match bytes {
        b"HTTP/1.0" => Ok(Version::H1_0),
        b"HTTP/1.1" => Ok(Version::H1_1),
        _ => Err(ParseError::Version),
    }
}

fn discard_newline(buf: &mut RawRequest<'_>) -> Result<(), ParseError> {
    if buf.peek() == Some(b'\r') {
        buf.advance(1);
        if buf.peek() == Some(b'\n') {
            buf.advance(1);
            return Ok(());
        }
    }
    Err(ParseError::NewLine)
}

fn parse_headers<'b>(buf: &mut RawRequest<'b>) -> Result<Vec<Header<'b>>, ParseError> {
    let mut headers = Vec::new();

    loop {
        if buf.peek() == Some(b'\r') {
            discard_newline(buf)?;
            return Ok(headers);
        }

        if headers.len() >= MAX_HEADERS {
            return Err(ParseError::HeaderName);
        }

        let name_start = buf.pos();
        loop {
            match buf.peek() {
                Some(b':') => break,
                Some(b) if super::tokens::is_header_name_token(b) => buf.advance(1),
                _ => return Err(ParseError::HeaderName),
            }
        }
        let name = sub_slice(buf, name_start, buf.pos());
        buf.advance(1); // consume ':'

        while matches!(buf.peek(), Some(b' ') | Some(b'\t')) {
            buf.advance(1);
        }

        let value_start = buf.pos();
        loop {
            match buf.peek() {
                Some(b'\r') => break,
                Some(b) if super::tokens::is_header_value_token(b) => buf.advance(1),
                _ => return Err(ParseError::HeaderValue),
            }
        }
        let mut value_end = buf.pos();
        while value_end > value_start && matches!(buf_byte_at(buf, value_end - 1), b' ' | b'\t') {
            value_end -= 1;
        }
        let value = sub_slice(buf, value_start, value_end);
        discard_newline(buf)?;

        headers.push(Header { name, value });
    }
}

/// Returns the byte at absolute offset `idx` of the buffer underlying `buf`.
fn buf_byte_at(buf: &RawRequest<'_>, idx: usize) -> u8 {
    sub_slice(buf, idx, idx + 1)[0]
}

/// Borrows `[start, end)` of the original buffer that `buf` was built
/// from. Valid because `RawRequest` never shrinks from the front during
/// our traversal (we only use `peek`/`advance`, never `slice_skip`).
fn sub_slice<'b>(buf: &RawRequest<'b>, start: usize, end: usize) -> &'b [u8] {
    &buf.full_slice()[start..end]
}

/// Determines how the body (if any) is framed, from the already-parsed
/// header block. Rejects a request carrying both `Content-Length` and
/// `Transfer-Encoding: chunked`, which RFC 9112 6.1 calls a smuggling risk.
pub fn body_mode(headers: &[Header<'_>]) -> Result<BodyMode, ParseError> {
    let mut content_length: Option<usize> = None;
    let mut chunked = false;

    for header in headers {
        if header.name_eq_ignore_ascii_case("transfer-encoding") {
            if let Some(value) = header.value_str() {
                if value.trim().eq_ignore_ascii_case("chunked") {
                    chunked = true;
                }
            }
        } else if header.name_eq_ignore_ascii_case("content-length") {
            let value = header.value_str().ok_or(ParseError::HeaderValue)?;
            let parsed: usize = value.trim().parse().map_err(|_| ParseError::HeaderValue)?;
            if content_length.is_some_and(|existing| existing != parsed) {
                return Err(ParseError::HeaderValue);
            }
            content_length = Some(parsed);
        }
    }

    if chunked && content_length.is_some() {
        return Err(ParseError::HeaderValue);
    }

    Ok(match (chunked, content_length) {
        (true, _) => BodyMode::Chunked,
        (false, Some(len)) => BodyMode::Fixed(len),
        (false, None) => BodyMode::None,
    })
}

/// Whether the connection should close after this message, per
/// [RFC 9112 Section 9.3](https://www.rfc-editor.org/rfc/rfc9112#section-9.3):
/// HTTP/1.0 defaults to close unless `Connection: keep-alive` is present;
/// HTTP/1.1 defaults to keep-alive unless `Connection: close` is present.
pub fn wants_close(version: Version, headers: &[Header<'_>]) -> bool {
    let connection = headers
        .iter()
        .find(|h| h.name_eq_ignore_ascii_case("connection"))
        .and_then(|h| h.value_str());

    match connection {
        Some(v) if v.eq_ignore_ascii_case("close") => true,
        Some(v) if v.eq_ignore_ascii_case("keep-alive") => false,
        _ => version == Version::H1_0,
    }
}

/// One chunk yielded by [`ChunkedDecoder`].
#[derive(Debug)]
pub enum ChunkOutcome<'buf> {
    /// A full chunk's data, plus the number of input bytes it consumed.
    Data(&'buf [u8], usize),
    /// The terminating zero-length chunk and trailer were consumed; the
    /// body is complete. Carries the number of input bytes consumed.
    Done(usize),
    /// Not enough bytes buffered yet to make progress.
    Incomplete,
}

/// Incremental `Transfer-Encoding: chunked` decoder.
///
/// Unlike [`parse_request`], this carries real state across calls: a
/// chunk boundary found on one call is a fact about the stream position,
/// not something that can be cheaply rediscovered by rescanning from the
/// top once the buffer has been compacted past it.
#[derive(Debug, Default)]
pub struct ChunkedDecoder {
    finished: bool,
}

impl ChunkedDecoder {
    /// Creates a decoder positioned at the start of a chunked body.
    pub fn new() -> Self {
        Self { finished: false }
    }

    /// Whether the terminating chunk has already been seen.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Attempts to decode the next chunk from the front of `buf`.
    pub fn decode<'b>(&mut self, buf: &'b [u8]) -> Result<ChunkOutcome<'b>, ParseError> {
        if self.finished {
            return Ok(ChunkOutcome::Done(0));
        }

        let Some(size_line_end) = buf.windows(2).position(|w| w == b"\r\n") else {
            return Ok(ChunkOutcome::Incomplete);
        };
        let size_line = &buf[..size_line_end];
        let size_str = size_line
            .split(|&b| b == b';')
            .next()
            .unwrap_or(size_line);
        let size_str =
            std::str::from_utf8(size_str).map_err(|_| ParseError::HeaderValue)?;
        let size = usize::from_str_radix(size_str.trim(), 16).map_err(|_| ParseError::HeaderValue)?;

        let data_start = size_line_end + 2;
        if size == 0 {
            // terminating chunk: the size line's own CRLF plus optional
            // trailers plus a blank line form the same "\r\n\r\n"-terminated
            // shape as a header block, so scan from the size line's CRLF
            // rather than past it.
            let Some(end) = find_header_block_end(&buf[size_line_end..]) else {
                return Ok(ChunkOutcome::Incomplete);
            };
            self.finished = true;
            return Ok(ChunkOutcome::Done(size_line_end + end));
        }

        let data_end = data_start + size;
        let trailer_end = data_end + 2; // trailing CRLF after chunk data
        if buf.len() < trailer_end {
            return Ok(ChunkOutcome::Incomplete);
        }
        if &buf[data_end..trailer_end] != b"\r\n" {
            return Err(ParseError::HeaderValue);
        }

        Ok(ChunkOutcome::Data(&buf[data_start..data_end], trailer_end))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_simple_get_with_no_headers() {
        let outcome = parse_request(b"GET / HTTP/1.1\r\n\r\n").unwrap();
        let ParseOutcome::Complete(req) = outcome else {
            panic!("expected Complete");
        };
        assert_eq!(Method::Get, req.method);
        assert_eq!("/", req.target);
        assert_eq!(Version::H1_1, req.version);
        assert!(req.headers.is_empty());
        assert_eq!(18, req.consumed);
    }

    #[test]
    fn parses_headers_and_trims_leading_whitespace() {
        let buf = b"GET /a HTTP/1.1\r\nHost: example.com\r\nX-Empty:  \r\n\r\n";
        let ParseOutcome::Complete(req) = parse_request(buf).unwrap() else {
            panic!("expected Complete");
        };
        assert_eq!(2, req.headers.len());
        assert!(req.headers[0].name_eq_ignore_ascii_case("host"));
        assert_eq!(Some("example.com"), req.headers[0].value_str());
        assert_eq!(Some(""), req.headers[1].value_str());
    }

    #[test]
    fn incomplete_when_header_block_not_terminated() {
        let buf = b"GET / HTTP/1.1\r\nHost: example.com\r\n";
        assert!(matches!(
            parse_request(buf).unwrap(),
            ParseOutcome::Incomplete
        ));
    }

    #[test]
    fn rejects_lowercase_method() {
        assert!(matches!(
            parse_request(b"get / HTTP/1.1\r\n\r\n"),
            Err(ParseError::Method)
        ));
    }

    #[test]
    fn body_mode_prefers_chunked_and_rejects_both() {
        let headers = vec![
            Header {
                name: b"Transfer-Encoding",
                value: b"chunked",
            },
            Header {
                name: b"Content-Length",
                value: b"10",
            },
        ];
        assert!(body_mode(&headers).is_err());
    }

    #[test]
    fn body_mode_reads_fixed_length() {
        let headers = vec![Header {
            name: b"Content-Length",
            value: b"42",
        }];
        assert_eq!(BodyMode::Fixed(42), body_mode(&headers).unwrap());
    }

    #[test]
    fn wants_close_defaults_by_version() {
        assert!(wants_close(Version::H1_0, &[]));
        assert!(!wants_close(Version::H1_1, &[]));
        let close_header = [Header {
            name: b"Connection",
            value: b"close",
        }];
        assert!(wants_close(Version::H1_1, &close_header));
    }

    #[test]
    fn chunked_decoder_yields_data_then_done() {
        let mut decoder = ChunkedDecoder::new();
        let body = b"4\r\nWiki\r\n0\r\n\r\n";
        let ChunkOutcome::Data(data, consumed) = decoder.decode(body).unwrap() else {
            panic!("expected Data");
        };
        assert_eq!(b"Wiki", data);
        assert!(!decoder.is_finished());

        let rest = &body[consumed..];
        let ChunkOutcome::Done(_) = decoder.decode(rest).unwrap() else {
            panic!("expected Done");
        };
        assert!(decoder.is_finished());
    }

    #[test]
    fn chunked_decoder_reports_incomplete_mid_chunk() {
        let mut decoder = ChunkedDecoder::new();
        assert!(matches!(
            decoder.decode(b"4\r\nWi").unwrap(),
            ChunkOutcome::Incomplete
        ));
    }
}
