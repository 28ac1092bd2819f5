//! Incremental HTTP/1.x Request Parser
//!
//! Requests arrive in arbitrary chunks. The parser accumulates them and
//! produces a [`Request`] only once the header block and exactly
//! `Content-Length` body bytes are available.
//!
//! ## States
//!
//! ```text
//!   ┌───────────┐  terminator found  ┌────────────┐  body complete  ┌──────────┐
//!   │ AwaitHead │ ─────────────────> │ AwaitBody  │ ──────────────> │ Request  │
//!   └───────────┘                    └────────────┘                 └──────────┘
//!         ▲                                                               │
//!         └──────────────── leftover bytes stay buffered ─────────────────┘
//! ```
//!
//! The free functions follow the same contract as the rest of the crate's
//! codecs:
//! - `Ok(Some((value, consumed)))` - a complete value, `consumed` bytes used
//! - `Ok(None)` - need more data
//! - `Err(ParseError)` - the input can never become valid

use super::request::Request;
use super::response::StatusCode;
use super::types::{Headers, Method, Version};
use bytes::{Buf, BytesMut};
use thiserror::Error;

/// Errors that can occur while parsing a request.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// The request line is not exactly `METHOD URI VERSION`
    #[error("malformed request line: {0:?}")]
    MalformedRequestLine(String),

    /// A header line has no `name:value` shape
    #[error("malformed header: {0:?}")]
    MalformedHeader(String),

    #[error("unknown method: {0}")]
    UnknownMethod(String),

    #[error("unsupported version: {0}")]
    UnsupportedVersion(String),

    #[error("invalid content-length: {0:?}")]
    InvalidContentLength(String),

    /// The header block is not valid UTF-8
    #[error("invalid UTF-8: {0}")]
    InvalidUtf8(String),

    #[error("body too large: {size} bytes (max: {max})")]
    BodyTooLarge { size: usize, max: usize },
}

impl ParseError {
    /// The status code the client is told about.
    pub fn status(&self) -> StatusCode {
        match self {
            ParseError::UnsupportedVersion(_) => StatusCode::VersionNotSupported,
            ParseError::BodyTooLarge { .. } => StatusCode::PayloadTooLarge,
            _ => StatusCode::BadRequest,
        }
    }
}

pub type ParseResult<T> = Result<T, ParseError>;

/// Largest body accepted through `Content-Length` (16 MB).
pub const MAX_BODY_SIZE: usize = 16 * 1024 * 1024;

/// Header block terminators and the line ending each implies, in the
/// order they are searched for.
const TERMINATORS: [(&[u8], &str); 3] = [
    (b"\r\n\r\n", "\r\n"),
    (b"\n\n", "\n"),
    (b"\r\r", "\r"),
];

/// Everything before the body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: Method,
    pub uri: String,
    pub version: Version,
    pub headers: Headers,
    pub content_length: usize,
}

impl RequestHead {
    fn into_request(self, body: bytes::Bytes) -> Request {
        Request {
            method: self.method,
            uri: self.uri,
            version: self.version,
            headers: self.headers,
            body,
        }
    }
}

/// Locates the end of the header block.
///
/// Each terminator is searched over the whole buffer before trying the next
/// one, so a later `\r\n\r\n` wins over an earlier `\n\n`.
/// Returns the offset of the terminator, its length and the line ending
/// the head is split on.
fn find_terminator(buf: &[u8]) -> Option<(usize, usize, &'static str)> {
    TERMINATORS.iter().find_map(|&(t, eol)| {
        buf.windows(t.len())
            .position(|w| w == t)
            .map(|pos| (pos, t.len(), eol))
    })
}

/// Parses a request head.
///
/// Blank lines before the request line are skipped and counted as consumed.
pub fn parse_head(buf: &[u8]) -> ParseResult<Option<(RequestHead, usize)>> {
    let skipped = buf
        .iter()
        .take_while(|&&b| b == b'\r' || b == b'\n')
        .count();
    let buf = &buf[skipped..];

    let Some((end, term_len, eol)) = find_terminator(buf) else {
        return Ok(None);
    };

    let text =
        std::str::from_utf8(&buf[..end]).map_err(|e| ParseError::InvalidUtf8(e.to_string()))?;
    let mut lines = text.split(eol).filter(|l| !l.is_empty());

    let request_line = lines.next().unwrap_or("");
    let parts: Vec<&str> = request_line.split(' ').collect();
    let [method, uri, version] = parts[..] else {
        return Err(ParseError::MalformedRequestLine(request_line.to_string()));
    };
    if uri.is_empty() {
        return Err(ParseError::MalformedRequestLine(request_line.to_string()));
    }
    let method = Method::parse(method).ok_or_else(|| ParseError::UnknownMethod(method.to_string()))?;
    let version =
        Version::parse(version).ok_or_else(|| ParseError::UnsupportedVersion(version.to_string()))?;

    let mut headers = Headers::new();
    for line in lines {
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| ParseError::MalformedHeader(line.to_string()))?;
        let name = name.trim();
        if name.is_empty() {
            return Err(ParseError::MalformedHeader(line.to_string()));
        }
        // Repeated request headers collapse to the last value.
        headers.set(name.to_ascii_lowercase(), value.trim());
    }

    let content_length = match headers.get("content-length") {
        Some(v) => v
            .parse::<usize>()
            .map_err(|_| ParseError::InvalidContentLength(v.to_string()))?,
        None => 0,
    };
    if content_length > MAX_BODY_SIZE {
        return Err(ParseError::BodyTooLarge {
            size: content_length,
            max: MAX_BODY_SIZE,
        });
    }

    let head = RequestHead {
        method,
        uri: uri.to_string(),
        version,
        headers,
        content_length,
    };
    Ok(Some((head, skipped + end + term_len)))
}

/// Parses one complete request, body included.
pub fn parse_request(buf: &[u8]) -> ParseResult<Option<(Request, usize)>> {
    let Some((head, head_len)) = parse_head(buf)? else {
        return Ok(None);
    };
    let total = head_len + head.content_length;
    if buf.len() < total {
        return Ok(None);
    }
    let body = bytes::Bytes::copy_from_slice(&buf[head_len..total]);
    Ok(Some((head.into_request(body), total)))
}

/// Accumulates request bytes across reads.
///
/// # Example
///
/// ```
/// # use sockmux::http::RequestParser;
/// let mut parser = RequestParser::new();
/// parser.push(b"GET /index.html HTTP/1.1\r\nHo");
/// assert!(parser.next_request().unwrap().is_none());
/// parser.push(b"st: example.com\r\n\r\n");
/// let request = parser.next_request().unwrap().unwrap();
/// assert_eq!(request.path(), "/index.html");
/// ```
#[derive(Debug, Default)]
pub struct RequestParser {
    buf: BytesMut,
    /// Head of a request whose body is still arriving
    head: Option<RequestHead>,
}

impl RequestParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends received bytes.
    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Returns the next complete request, if the buffered bytes hold one.
    ///
    /// Bytes after the request stay buffered for the next call. On error
    /// the parser is reset and everything buffered is dropped.
    pub fn next_request(&mut self) -> ParseResult<Option<Request>> {
        let head = match self.head.take() {
            Some(head) => head,
            None => match parse_head(&self.buf) {
                Ok(Some((head, consumed))) => {
                    self.buf.advance(consumed);
                    head
                }
                Ok(None) => return Ok(None),
                Err(e) => {
                    self.reset();
                    return Err(e);
                }
            },
        };

        if self.buf.len() < head.content_length {
            self.head = Some(head);
            return Ok(None);
        }
        let body = self.buf.split_to(head.content_length).freeze();
        Ok(Some(head.into_request(body)))
    }

    /// True when a head has been parsed and its body is incomplete.
    pub fn awaiting_body(&self) -> bool {
        self.head.is_some()
    }

    /// Bytes held that have not become part of a request.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Takes every unconsumed byte, leaving the parser empty.
    pub fn take_remaining(&mut self) -> BytesMut {
        self.head = None;
        self.buf.split()
    }

    pub fn reset(&mut self) {
        self.head = None;
        self.buf.clear();
    }
}
