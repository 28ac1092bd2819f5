use super::parser::{ParseError, ParseResult, RequestParser};
use super::request::Request;
use super::response::Response;
use super::types::Version;
use crate::handler::{Outbox, ProtocolHandler};
use bytes::{Bytes, BytesMut};
use std::sync::Arc;
use tracing::{debug, warn};

/// Turns a complete request into a response.
///
/// Shared by every connection of a worker, hence `Sync`.
pub trait RequestHandler: Send + Sync {
    fn handle(&self, request: &Request) -> Response;
}

impl<F> RequestHandler for F
where
    F: Fn(&Request) -> Response + Send + Sync,
{
    fn handle(&self, request: &Request) -> Response {
        self(request)
    }
}

/// Answers every request with the same plain-text body.
#[derive(Debug, Clone)]
pub struct TextResponder {
    body: Bytes,
}

impl TextResponder {
    pub fn new(body: impl Into<Bytes>) -> Self {
        Self { body: body.into() }
    }
}

impl Default for TextResponder {
    fn default() -> Self {
        Self::new("Hello, world!\n")
    }
}

impl RequestHandler for TextResponder {
    fn handle(&self, request: &Request) -> Response {
        Response::for_request(request)
            .with_header("Content-Type", "text/plain; charset=utf-8")
            .with_body(self.body.clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Waiting for (the rest of) a request
    Reading,
    /// A response is queued; decides what happens once it is flushed
    Responding { keep_alive: bool },
}

/// HTTP/1.x protocol handler.
///
/// One request is in flight at a time. Bytes that arrive while a response
/// is being flushed stay in the parser and are picked up afterwards, which
/// is all pipelining needs.
pub struct HttpHandler {
    parser: RequestParser,
    responder: Arc<dyn RequestHandler>,
    state: State,
}

impl HttpHandler {
    pub fn new(responder: Arc<dyn RequestHandler>) -> Self {
        Self {
            parser: RequestParser::new(),
            responder,
            state: State::Reading,
        }
    }

    /// Buffers received bytes without parsing them.
    pub fn feed(&mut self, data: &[u8]) {
        self.parser.push(data);
    }

    /// The next complete request, or None while a response is pending.
    pub fn next_request(&mut self) -> ParseResult<Option<Request>> {
        match self.state {
            State::Reading => self.parser.next_request(),
            State::Responding { .. } => Ok(None),
        }
    }

    /// Runs the responder and queues its answer.
    pub fn dispatch(&mut self, request: Request, out: &mut Outbox<'_>) {
        let response = self.responder.handle(&request);
        debug!(
            method = %request.method,
            path = request.path(),
            status = response.status.as_u16(),
            "HTTP request served"
        );
        self.respond(response, request.keep_alive(), out);
    }

    /// Queues a response. The connection closes after it unless `keep_alive`.
    pub fn respond(&mut self, mut response: Response, keep_alive: bool, out: &mut Outbox<'_>) {
        response.set_keep_alive(keep_alive);
        let mut buf = BytesMut::new();
        response.write_to(&mut buf);
        out.append(&buf);
        self.state = State::Responding { keep_alive };
    }

    /// Answers a parse failure and schedules the close.
    pub fn reject(&mut self, err: &ParseError, out: &mut Outbox<'_>) {
        warn!(error = %err, "Rejecting HTTP request");
        self.parser.reset();
        let response = Response::new(Version::Http11, err.status())
            .with_header("Content-Type", "text/plain; charset=utf-8")
            .with_body(format!("{}\n", err));
        self.respond(response, false, out);
    }

    /// Marks the pending response as flushed.
    ///
    /// Returns its keep-alive decision, or None if nothing was pending.
    pub fn complete_response(&mut self) -> Option<bool> {
        match std::mem::replace(&mut self.state, State::Reading) {
            State::Responding { keep_alive } => Some(keep_alive),
            State::Reading => None,
        }
    }

    /// Takes the bytes received after the last request.
    pub fn take_remaining(&mut self) -> BytesMut {
        self.parser.take_remaining()
    }

    /// Serves the next buffered request, if one is complete.
    fn pump(&mut self, out: &mut Outbox<'_>) {
        match self.next_request() {
            Ok(Some(request)) => self.dispatch(request, out),
            Ok(None) => {}
            Err(e) => self.reject(&e, out),
        }
    }
}

impl ProtocolHandler for HttpHandler {
    fn read(&mut self, data: &[u8], out: &mut Outbox<'_>) -> bool {
        self.feed(data);
        self.pump(out);
        true
    }

    fn write(&mut self, out: &mut Outbox<'_>) -> bool {
        match self.complete_response() {
            Some(false) => false,
            Some(true) => {
                self.pump(out);
                true
            }
            None => true,
        }
    }

    fn close(&mut self) {
        self.parser.reset();
    }

    fn buffered(&self) -> usize {
        self.parser.buffered()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::StatusCode;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn handler() -> HttpHandler {
        HttpHandler::new(Arc::new(TextResponder::new("hi")))
    }

    fn read(h: &mut HttpHandler, data: &[u8], buf: &mut BytesMut) -> bool {
        h.read(data, &mut Outbox::new(buf))
    }

    fn write(h: &mut HttpHandler, buf: &mut BytesMut) -> bool {
        h.write(&mut Outbox::new(buf))
    }

    fn text(buf: &BytesMut) -> String {
        String::from_utf8(buf.to_vec()).unwrap()
    }

    #[test]
    fn test_http10_request_closes_after_response() {
        let mut h = handler();
        let mut buf = BytesMut::new();
        assert!(read(&mut h, b"GET / HTTP/1.0\r\n\r\n", &mut buf));
        let resp = text(&buf);
        assert!(resp.starts_with("HTTP/1.0 200 OK\r\n"));
        assert!(resp.contains("Content-Length: 2\r\n"));
        assert!(resp.ends_with("\r\n\r\nhi"));
        assert!(!resp.contains("Connection:"));

        buf.clear();
        assert!(!write(&mut h, &mut buf));
    }

    #[test]
    fn test_http11_keeps_connection_open() {
        let mut h = handler();
        let mut buf = BytesMut::new();
        read(&mut h, b"GET / HTTP/1.1\r\nHost: x\r\n\r\n", &mut buf);
        assert!(text(&buf).starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(!text(&buf).contains("Connection:"));
        buf.clear();
        assert!(write(&mut h, &mut buf));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_connection_header_written_when_overriding_default() {
        let mut h = handler();
        let mut buf = BytesMut::new();
        read(&mut h, b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n", &mut buf);
        assert!(text(&buf).contains("Connection: close\r\n"));
        assert!(!write(&mut h, &mut BytesMut::new()));

        let mut h = handler();
        let mut buf = BytesMut::new();
        read(&mut h, b"GET / HTTP/1.0\r\nConnection: Keep-Alive\r\n\r\n", &mut buf);
        assert!(text(&buf).contains("Connection: keep-alive\r\n"));
        assert!(write(&mut h, &mut BytesMut::new()));
    }

    #[test]
    fn test_post_three_bytes_at_a_time_dispatched_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let responder = move |req: &Request| {
            seen.fetch_add(1, Ordering::SeqCst);
            assert_eq!(&req.body[..], b"data");
            Response::for_request(req).with_body(req.body.clone())
        };
        let mut h = HttpHandler::new(Arc::new(responder));
        let mut buf = BytesMut::new();
        let raw = b"POST / HTTP/1.0\r\nContent-Length: 4\r\n\r\ndata";
        for chunk in raw.chunks(3) {
            assert!(read(&mut h, chunk, &mut buf));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(text(&buf).ends_with("\r\n\r\ndata"));
        assert!(!write(&mut h, &mut BytesMut::new()));
    }

    #[test]
    fn test_pipelined_requests_served_in_order() {
        let responder = |req: &Request| Response::for_request(req).with_body(req.path().to_string());
        let mut h = HttpHandler::new(Arc::new(responder));
        let mut buf = BytesMut::new();
        read(
            &mut h,
            b"GET /one HTTP/1.1\r\n\r\nGET /two HTTP/1.1\r\nConnection: close\r\n\r\n",
            &mut buf,
        );
        assert!(text(&buf).ends_with("/one"));
        assert!(h.buffered() > 0);

        buf.clear();
        assert!(write(&mut h, &mut buf));
        assert!(text(&buf).ends_with("/two"));
        assert!(text(&buf).contains("Connection: close"));

        buf.clear();
        assert!(!write(&mut h, &mut buf));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_bytes_during_response_wait() {
        let mut h = handler();
        let mut buf = BytesMut::new();
        read(&mut h, b"GET /a HTTP/1.1\r\n\r\n", &mut buf);
        let first = buf.len();
        read(&mut h, b"GET /b HTTP/1.1\r\n\r\n", &mut buf);
        assert_eq!(buf.len(), first);
        buf.clear();
        write(&mut h, &mut buf);
        assert!(text(&buf).starts_with("HTTP/1.1 200 OK"));
    }

    #[test]
    fn test_malformed_request_gets_400_and_close() {
        let mut h = handler();
        let mut buf = BytesMut::new();
        assert!(read(&mut h, b"GARBAGE\r\n\r\n", &mut buf));
        let resp = text(&buf);
        assert!(resp.starts_with("HTTP/1.1 400 Bad Request\r\n"));
        assert!(resp.contains("Connection: close\r\n"));
        assert_eq!(h.buffered(), 0);
        assert!(!write(&mut h, &mut BytesMut::new()));
    }

    #[test]
    fn test_unsupported_version_gets_505() {
        let mut h = handler();
        let mut buf = BytesMut::new();
        read(&mut h, b"GET / HTTP/3.0\r\n\r\n", &mut buf);
        assert!(text(&buf).starts_with("HTTP/1.1 505 HTTP Version Not Supported\r\n"));
    }

    #[test]
    fn test_server_error_keeps_normal_keep_alive() {
        let responder =
            |req: &Request| Response::for_request(req).with_status(StatusCode::InternalServerError);
        let mut h = HttpHandler::new(Arc::new(responder));
        let mut buf = BytesMut::new();
        read(&mut h, b"GET / HTTP/1.1\r\n\r\n", &mut buf);
        assert!(text(&buf).starts_with("HTTP/1.1 500 Internal Server Error\r\n"));
        assert!(write(&mut h, &mut BytesMut::new()));
    }

    #[test]
    fn test_partial_request_reports_buffered() {
        let mut h = handler();
        let mut buf = BytesMut::new();
        read(&mut h, b"GET / HTTP/1.1\r\nHost:", &mut buf);
        assert!(buf.is_empty());
        assert_eq!(h.buffered(), 21);
    }
}
