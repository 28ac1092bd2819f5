use super::request::Request;
use super::types::{Headers, Version, CRLF};
use bytes::{BufMut, Bytes, BytesMut};

/// HTTP status codes the server produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusCode {
    SwitchingProtocols,
    Ok,
    BadRequest,
    PayloadTooLarge,
    UpgradeRequired,
    InternalServerError,
    VersionNotSupported,
}

impl StatusCode {
    pub fn as_u16(&self) -> u16 {
        match self {
            StatusCode::SwitchingProtocols => 101,
            StatusCode::Ok => 200,
            StatusCode::BadRequest => 400,
            StatusCode::PayloadTooLarge => 413,
            StatusCode::UpgradeRequired => 426,
            StatusCode::InternalServerError => 500,
            StatusCode::VersionNotSupported => 505,
        }
    }

    /// False for statuses that never carry a body, and so no `Content-Length`.
    pub fn allows_body(&self) -> bool {
        !matches!(self, StatusCode::SwitchingProtocols)
    }

    /// The standard reason phrase.
    pub fn reason_phrase(&self) -> &'static str {
        match self {
            StatusCode::SwitchingProtocols => "Switching Protocols",
            StatusCode::Ok => "OK",
            StatusCode::BadRequest => "Bad Request",
            StatusCode::PayloadTooLarge => "Payload Too Large",
            StatusCode::UpgradeRequired => "Upgrade Required",
            StatusCode::InternalServerError => "Internal Server Error",
            StatusCode::VersionNotSupported => "HTTP Version Not Supported",
        }
    }
}

/// An HTTP response under construction.
///
/// `Content-Length` is always computed from the body when serializing; any
/// value set by hand is ignored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub version: Version,
    pub status: StatusCode,
    /// Reason phrase override; the status code's standard phrase when None
    pub reason: Option<String>,
    pub headers: Headers,
    pub body: Bytes,
}

impl Response {
    pub fn new(version: Version, status: StatusCode) -> Self {
        Self {
            version,
            status,
            reason: None,
            headers: Headers::new(),
            body: Bytes::new(),
        }
    }

    /// A `200 OK` in the version the request was made with.
    pub fn for_request(request: &Request) -> Self {
        Self::new(request.version, StatusCode::Ok)
    }

    pub fn with_status(mut self, status: StatusCode) -> Self {
        self.status = status;
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Sets a header, replacing earlier values.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.set(name, value);
        self
    }

    /// Adds a header line, keeping earlier values of the same name.
    pub fn append_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.append(name, value);
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Writes the `Connection` header needed to make `keep_alive` explicit.
    ///
    /// Nothing is written when the version's default already matches.
    pub fn set_keep_alive(&mut self, keep_alive: bool) {
        self.headers.remove("connection");
        match (self.version, keep_alive) {
            (Version::Http11, false) => self.headers.set("Connection", "close"),
            (Version::Http09 | Version::Http10, true) => {
                self.headers.set("Connection", "keep-alive")
            }
            _ => {}
        }
    }

    /// Serializes the status line, headers and body into `buf`.
    ///
    /// ```text
    /// HTTP/1.1 200 OK\r\n
    /// Content-Type: text/plain\r\n
    /// Content-Length: 5\r\n
    /// \r\n
    /// hello
    /// ```
    pub fn write_to(&self, buf: &mut BytesMut) {
        let reason = self
            .reason
            .as_deref()
            .unwrap_or_else(|| self.status.reason_phrase());
        buf.reserve(64 + self.body.len());

        buf.put_slice(self.version.to_string().as_bytes());
        buf.put_u8(b' ');
        buf.put_slice(self.status.as_u16().to_string().as_bytes());
        buf.put_u8(b' ');
        buf.put_slice(reason.as_bytes());
        buf.put_slice(CRLF);

        for (name, value) in self.headers.iter() {
            if name.eq_ignore_ascii_case("content-length") {
                continue;
            }
            buf.put_slice(name.as_bytes());
            buf.put_slice(b": ");
            buf.put_slice(value.as_bytes());
            buf.put_slice(CRLF);
        }
        if self.status.allows_body() {
            buf.put_slice(b"Content-Length: ");
            buf.put_slice(self.body.len().to_string().as_bytes());
            buf.put_slice(CRLF);
        }
        buf.put_slice(CRLF);
        if self.status.allows_body() {
            buf.put_slice(&self.body);
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.write_to(&mut buf);
        buf.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serialize_basic() {
        let resp = Response::new(Version::Http11, StatusCode::Ok)
            .with_header("Content-Type", "text/plain")
            .with_body("hello");
        assert_eq!(
            &resp.to_bytes()[..],
            b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 5\r\n\r\nhello"
        );
    }

    #[test]
    fn test_content_length_is_computed() {
        let resp = Response::new(Version::Http10, StatusCode::BadRequest)
            .with_header("Content-Length", "999")
            .with_body("gone");
        let text = String::from_utf8(resp.to_bytes().to_vec()).unwrap();
        assert!(text.starts_with("HTTP/1.0 400 Bad Request\r\n"));
        assert!(text.contains("Content-Length: 4\r\n"));
        assert!(!text.contains("999"));
    }

    #[test]
    fn test_repeated_headers_written_in_order() {
        let resp = Response::new(Version::Http11, StatusCode::Ok)
            .append_header("Set-Cookie", "a=1")
            .append_header("Set-Cookie", "b=2");
        let text = String::from_utf8(resp.to_bytes().to_vec()).unwrap();
        let a = text.find("Set-Cookie: a=1\r\n").unwrap();
        let b = text.find("Set-Cookie: b=2\r\n").unwrap();
        assert!(a < b);
    }

    #[test]
    fn test_no_content_length_without_body() {
        let resp = Response::new(Version::Http11, StatusCode::SwitchingProtocols)
            .with_header("Upgrade", "websocket");
        assert_eq!(
            &resp.to_bytes()[..],
            b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\n\r\n"
        );
    }

    #[test]
    fn test_reason_override() {
        let resp = Response::new(Version::Http11, StatusCode::Ok).with_reason("Fine");
        assert!(resp.to_bytes().starts_with(b"HTTP/1.1 200 Fine\r\n"));
    }

    #[test]
    fn test_keep_alive_header_only_when_overriding_default() {
        let mut resp = Response::new(Version::Http11, StatusCode::Ok);
        resp.set_keep_alive(true);
        assert!(resp.headers.get("connection").is_none());
        resp.set_keep_alive(false);
        assert_eq!(resp.headers.get("connection"), Some("close"));

        let mut resp = Response::new(Version::Http10, StatusCode::Ok);
        resp.set_keep_alive(false);
        assert!(resp.headers.get("connection").is_none());
        resp.set_keep_alive(true);
        assert_eq!(resp.headers.get("connection"), Some("keep-alive"));
    }

    #[test]
    fn test_status_codes() {
        let table = [
            (StatusCode::SwitchingProtocols, 101, "Switching Protocols", false),
            (StatusCode::Ok, 200, "OK", true),
            (StatusCode::BadRequest, 400, "Bad Request", true),
            (StatusCode::PayloadTooLarge, 413, "Payload Too Large", true),
            (StatusCode::UpgradeRequired, 426, "Upgrade Required", true),
            (StatusCode::InternalServerError, 500, "Internal Server Error", true),
            (StatusCode::VersionNotSupported, 505, "HTTP Version Not Supported", true),
        ];
        for (status, code, reason, body) in table {
            assert_eq!(status.as_u16(), code);
            assert_eq!(status.reason_phrase(), reason);
            assert_eq!(status.allows_body(), body, "{:?}", status);
        }
    }
}
