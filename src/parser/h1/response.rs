//! Response model and serializer
//!
//! Unlike requests, responses are constructed by the framework (by a
//! dispatch handler) rather than parsed, so there's no borrowed zero-copy
//! representation to maintain — headers and body are owned.

use std::io::{self, Write};

use crate::parser::{status::Status, Version};

/// A response to be serialized onto a connection's write side.
#[derive(Debug)]
pub struct Response {
    version: Version,
    status: Status,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl Response {
    /// Starts a response with the given status, HTTP/1.1, no headers or
    /// body.
    pub fn new(status: Status) -> Self {
        Self {
            version: Version::H1_1,
            status,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    /// Overrides the response's HTTP version (default HTTP/1.1).
    pub fn with_version(mut self, version: Version) -> Self {
        self.version = version;
        self
    }

    /// Appends a header field. Does not deduplicate; callers that need
    /// to replace a header must do so themselves.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Sets the response body. `Content-Length` is computed automatically
    /// at serialization time and must not be set via [`header`](Self::header).
    pub fn body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// Whether the response's status line plus headers plus a blank line
    /// plus body would together signal the peer to close the connection.
    pub fn wants_close(&self) -> bool {
        self.headers
            .iter()
            .any(|(name, value)| name.eq_ignore_ascii_case("connection") && value.eq_ignore_ascii_case("close"))
    }

    /// Writes the status line, headers, an auto-computed `Content-Length`,
    /// a blank line, and the body to `out`.
    pub fn write_to(&self, out: &mut impl Write) -> io::Result<()> {
        write!(
            out,
            "{} {} {}\r\n",
            self.version,
            self.status,
            self.status.reason_phrase()
        )?;
        for (name, value) in &self.headers {
            write!(out, "{name}: {value}\r\n")?;
        }
        write!(out, "Content-Length: {}\r\n\r\n", self.body.len())?;
        out.write_all(&self.body)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn serializes_status_line_headers_and_body() {
        let response = Response::new(Status::r#Ok)
            .header("X-Test", "1")
            .body(b"hello".to_vec());

        let mut out = Vec::new();
        response.write_to(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();

        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("X-Test: 1\r\n"));
        assert!(text.contains("Content-Length: 5\r\n\r\nhello"));
    }

    #[test]
    fn wants_close_reads_connection_header() {
        let response = Response::new(Status::r#Ok).header("Connection", "close");
        assert!(response.wants_close());
    }
}
