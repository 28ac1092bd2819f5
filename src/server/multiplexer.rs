use super::connection::{Connection, ConnectionError, ServerStats};
use super::hooks::{LoopHooks, StandaloneHooks};
use crate::config::ServerConfig;
use crate::handler::{ConnectionContext, HandlerFactory};
use mio::event::Event;
use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token};
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

/// Token of the listening socket; connections count up from 1.
const LISTENER: Token = Token(0);

/// Readiness events handled per poll.
const EVENTS_CAPACITY: usize = 1024;

/// Errors that stop the event loop.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("failed to create poller: {0}")]
    Poller(#[source] io::Error),

    #[error("poll failed: {0}")]
    Poll(#[source] io::Error),

    #[error("failed to register listening socket: {0}")]
    Register(#[source] io::Error),

    /// The listening socket reported an error condition
    #[error("listening socket is broken")]
    ListenerBroken,
}

/// Readiness of one connection, copied out of the event list.
#[derive(Debug, Clone, Copy)]
struct Readiness {
    token: Token,
    readable: bool,
    writable: bool,
    error: bool,
}

impl From<&Event> for Readiness {
    fn from(event: &Event) -> Self {
        Self {
            token: event.token(),
            readable: event.is_readable() || event.is_read_closed(),
            writable: event.is_writable() || event.is_write_closed(),
            error: event.is_error(),
        }
    }
}

/// The connection multiplexer.
///
/// Owns the listening socket and every accepted connection, and drives them
/// all from one thread with a single readiness poll.
pub struct Server<H: LoopHooks = StandaloneHooks> {
    poll: Poll,
    events: Events,
    listener: TcpListener,
    listener_registered: bool,
    connections: HashMap<Token, Connection>,
    next_token: usize,
    factory: HandlerFactory,
    hooks: H,
    config: ServerConfig,
    stop: Arc<AtomicBool>,
    stats: Arc<ServerStats>,
    scratch: Vec<u8>,
}

impl Server<StandaloneHooks> {
    /// A server accepting on its own, numbering connections from 1.
    pub fn new(
        listener: TcpListener,
        factory: HandlerFactory,
        config: ServerConfig,
    ) -> Result<Self, ServerError> {
        Self::with_hooks(listener, factory, config, StandaloneHooks::default())
    }
}

impl<H: LoopHooks> Server<H> {
    pub fn with_hooks(
        listener: TcpListener,
        factory: HandlerFactory,
        config: ServerConfig,
        hooks: H,
    ) -> Result<Self, ServerError> {
        let poll = Poll::new().map_err(ServerError::Poller)?;
        let scratch = vec![0u8; config.read_chunk.max(1)];
        Ok(Self {
            poll,
            events: Events::with_capacity(EVENTS_CAPACITY),
            listener,
            listener_registered: false,
            connections: HashMap::new(),
            next_token: 1,
            factory,
            hooks,
            config,
            stop: Arc::new(AtomicBool::new(false)),
            stats: Arc::new(ServerStats::new()),
            scratch,
        })
    }

    /// Flag that ends [`run`](Self::run) once raised.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    /// Replaces the stop flag, e.g. with one wired to signal handlers.
    pub fn with_stop_flag(mut self, stop: Arc<AtomicBool>) -> Self {
        self.stop = stop;
        self
    }

    pub fn stats(&self) -> Arc<ServerStats> {
        Arc::clone(&self.stats)
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn open_connections(&self) -> usize {
        self.connections.len()
    }

    pub fn hooks(&self) -> &H {
        &self.hooks
    }

    pub fn hooks_mut(&mut self) -> &mut H {
        &mut self.hooks
    }

    /// Runs until the stop flag is raised or the listener breaks.
    pub fn run(mut self) -> Result<(), ServerError> {
        let addr = self
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_default();
        info!(addr = %addr, worker = ?self.hooks.worker(), "Event loop started");

        let mut result = Ok(());
        while !self.stop.load(Ordering::Acquire) {
            if let Err(e) = self.poll_once(self.config.poll_timeout) {
                error!(worker = ?self.hooks.worker(), error = %e, "Event loop failed");
                result = Err(e);
                break;
            }
            let open = self.connections.len();
            self.hooks.tick(open);
        }

        let open = self.connections.len();
        self.hooks.shutdown(open);
        self.close_all();
        info!(worker = ?self.hooks.worker(), "Event loop stopped");
        result
    }

    /// One iteration: poll, then flush writers, accept and read.
    ///
    /// Returns the number of readiness events handled.
    pub fn poll_once(&mut self, timeout: Duration) -> Result<usize, ServerError> {
        let gated_in = self.hooks.try_enter_accept();
        if let Err(e) = self.update_listener(gated_in) {
            if gated_in {
                self.hooks.leave_accept();
            }
            return Err(e);
        }

        if let Err(e) = self.poll.poll(&mut self.events, Some(timeout)) {
            if gated_in {
                self.hooks.leave_accept();
            }
            if e.kind() == io::ErrorKind::Interrupted {
                return Ok(0);
            }
            return Err(ServerError::Poll(e));
        }

        let mut listener_ready = false;
        let mut listener_broken = false;
        let mut ready = Vec::with_capacity(self.events.iter().count());
        for event in self.events.iter() {
            if event.token() == LISTENER {
                listener_ready = true;
                listener_broken |= event.is_error();
            } else {
                ready.push(Readiness::from(event));
            }
        }

        if listener_broken {
            if gated_in {
                self.hooks.leave_accept();
            }
            return Err(ServerError::ListenerBroken);
        }

        for r in ready.iter().filter(|r| r.writable && !r.error) {
            self.send(r.token);
        }

        if gated_in {
            if listener_ready {
                self.accept();
            }
            self.hooks.leave_accept();
        }

        for r in &ready {
            if r.error {
                debug!(token = r.token.0, "Connection error event");
                self.close(r.token);
            } else if r.readable {
                self.recv(r.token);
            }
        }

        Ok(ready.len() + usize::from(listener_ready))
    }

    /// Watches the listener only while the accept gate is held.
    ///
    /// Registering again re-arms the edge-triggered registration, so
    /// connections left pending from the last iteration are reported again.
    fn update_listener(&mut self, watch: bool) -> Result<(), ServerError> {
        let registry = self.poll.registry();
        match (watch, self.listener_registered) {
            (true, false) => {
                registry
                    .register(&mut self.listener, LISTENER, Interest::READABLE)
                    .map_err(ServerError::Register)?;
                self.listener_registered = true;
            }
            (true, true) => {
                registry
                    .reregister(&mut self.listener, LISTENER, Interest::READABLE)
                    .map_err(ServerError::Register)?;
            }
            (false, true) => {
                registry
                    .deregister(&mut self.listener)
                    .map_err(ServerError::Register)?;
                self.listener_registered = false;
            }
            (false, false) => {}
        }
        Ok(())
    }

    /// Accepts one pending connection, if any.
    pub fn accept(&mut self) {
        let (stream, peer) = match self.listener.accept() {
            Ok(pair) => pair,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
            Err(e) => {
                warn!(error = %e, "Failed to accept connection");
                return;
            }
        };

        let ctx = ConnectionContext {
            id: self.hooks.next_connection_id(),
            peer,
            worker: self.hooks.worker(),
        };
        let handler = match (self.factory)(&ctx) {
            Ok(handler) => handler,
            Err(e) => {
                warn!(conn = ctx.id, peer = %peer, error = %e, "Handler refused connection");
                return;
            }
        };

        let token = Token(self.next_token);
        self.next_token += 1;

        let mut conn = Connection::new(stream, ctx, handler);
        if !conn.on_open() {
            debug!(conn = conn.ctx.id, peer = %peer, "Handler closed connection on open");
            conn.handler.close();
            return;
        }

        let interest = conn.interest();
        if let Err(e) = self
            .poll
            .registry()
            .register(&mut conn.stream, token, interest)
        {
            warn!(conn = conn.ctx.id, peer = %peer, error = %e, "Failed to register connection");
            conn.handler.close();
            return;
        }

        self.stats.connection_opened();
        debug!(conn = conn.ctx.id, peer = %peer, worker = ?conn.ctx.worker, "Connection opened");
        self.connections.insert(token, conn);
    }

    /// Reads everything available and hands it to the handler.
    fn recv(&mut self, token: Token) {
        let Some(conn) = self.connections.get_mut(&token) else {
            return;
        };
        if conn.closing {
            return;
        }
        let outcome = match conn.read_available(&mut self.scratch, self.config.max_buffer) {
            Ok(outcome) => outcome,
            Err(ConnectionError::BufferFull { size, max }) => {
                warn!(conn = conn.ctx.id, peer = %conn.ctx.peer, size, max, "Buffer size limit exceeded");
                self.stats.connection_overflowed();
                self.close(token);
                return;
            }
            Err(e) => {
                debug!(conn = conn.ctx.id, peer = %conn.ctx.peer, error = %e, "Read failed");
                self.close(token);
                return;
            }
        };

        if !outcome.data.is_empty() {
            trace!(conn = conn.ctx.id, bytes = outcome.data.len(), "Read data");
            self.stats.bytes_read(outcome.data.len());
            if !conn.on_read(&outcome.data) {
                self.close(token);
                return;
            }
        }
        if outcome.eof {
            debug!(conn = conn.ctx.id, peer = %conn.ctx.peer, "Peer closed connection");
            if conn.write_buf.is_empty() {
                self.close(token);
            } else {
                conn.closing = true;
                self.send(token);
            }
            return;
        }

        if !conn.write_buf.is_empty() {
            self.send(token);
        } else {
            self.rearm(token);
        }
    }

    /// Flushes pending output; once drained, asks the handler what next.
    fn send(&mut self, token: Token) {
        let Some(conn) = self.connections.get_mut(&token) else {
            return;
        };
        match conn.flush() {
            Ok(n) => {
                if n > 0 {
                    trace!(conn = conn.ctx.id, bytes = n, "Sent data");
                    self.stats.bytes_written(n);
                }
            }
            Err(e) => {
                debug!(conn = conn.ctx.id, peer = %conn.ctx.peer, error = %e, "Write failed");
                self.close(token);
                return;
            }
        }

        if conn.write_buf.is_empty() && conn.closing {
            self.close(token);
            return;
        }
        if conn.write_buf.is_empty() && !conn.on_write() {
            self.close(token);
            return;
        }
        self.rearm(token);
    }

    /// Re-registers a connection for the interest its buffer calls for.
    fn rearm(&mut self, token: Token) {
        let Some(conn) = self.connections.get_mut(&token) else {
            return;
        };
        let interest = conn.interest();
        if let Err(e) = self
            .poll
            .registry()
            .reregister(&mut conn.stream, token, interest)
        {
            warn!(conn = conn.ctx.id, error = %e, "Failed to re-register connection");
            self.close(token);
        }
    }

    /// Discards a connection. Unknown tokens are ignored.
    pub fn close(&mut self, token: Token) {
        let Some(mut conn) = self.connections.remove(&token) else {
            return;
        };
        let _ = self.poll.registry().deregister(&mut conn.stream);
        conn.handler.close();
        self.stats.connection_closed();
        debug!(conn = conn.ctx.id, peer = %conn.ctx.peer, "Connection closed");
    }

    fn close_all(&mut self) {
        let tokens: Vec<Token> = self.connections.keys().copied().collect();
        for token in tokens {
            self.close(token);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{HandlerKind, Outbox, ProtocolHandler};
    use crate::http::TextResponder;
    use std::io::{Read, Write};
    use std::net::{Shutdown, TcpStream};
    use std::thread;
    use std::time::Instant;

    fn bind() -> TcpListener {
        TcpListener::bind("127.0.0.1:0".parse().unwrap()).unwrap()
    }

    fn factory(kind: HandlerKind) -> HandlerFactory {
        kind.factory(Arc::new(TextResponder::new("hello")))
    }

    fn fast_config() -> ServerConfig {
        ServerConfig {
            poll_timeout: Duration::from_millis(20),
            ..ServerConfig::default()
        }
    }

    /// Runs a server on a thread; returns its address, stop flag and stats.
    fn spawn(
        kind: HandlerKind,
        config: ServerConfig,
    ) -> (SocketAddr, Arc<AtomicBool>, Arc<ServerStats>, thread::JoinHandle<()>) {
        let server = Server::new(bind(), factory(kind), config).unwrap();
        let addr = server.local_addr().unwrap();
        let stop = server.stop_handle();
        let stats = server.stats();
        let handle = thread::spawn(move || server.run().unwrap());
        (addr, stop, stats, handle)
    }

    fn connect(addr: SocketAddr) -> TcpStream {
        let stream = TcpStream::connect(addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        stream
    }

    fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        false
    }

    #[test]
    fn test_http10_request_closes_after_response() {
        let (addr, stop, _stats, handle) = spawn(HandlerKind::Http, fast_config());

        let mut client = connect(addr);
        client.write_all(b"GET / HTTP/1.0\r\n\r\n").unwrap();
        let mut response = String::new();
        client.read_to_string(&mut response).unwrap();
        assert!(response.starts_with("HTTP/1.0 200 OK\r\n"));
        assert!(response.contains("Content-Length: 5\r\n"));
        assert!(response.ends_with("\r\n\r\nhello"));

        stop.store(true, Ordering::Release);
        handle.join().unwrap();
    }

    #[test]
    fn test_keep_alive_pipelining() {
        let (addr, stop, _stats, handle) = spawn(HandlerKind::Http, fast_config());

        let mut client = connect(addr);
        client
            .write_all(b"GET /a HTTP/1.1\r\n\r\nGET /b HTTP/1.1\r\nConnection: close\r\n\r\n")
            .unwrap();
        let mut response = String::new();
        client.read_to_string(&mut response).unwrap();
        assert_eq!(response.matches("HTTP/1.1 200 OK\r\n").count(), 2);
        assert_eq!(response.matches("Connection: close\r\n").count(), 1);

        stop.store(true, Ordering::Release);
        handle.join().unwrap();
    }

    #[test]
    fn test_websocket_upgrade_and_echo() {
        use crate::websocket::{pack, unpack, Frame, Opcode};
        use bytes::BytesMut;

        let (addr, stop, _stats, handle) = spawn(HandlerKind::Websocket, fast_config());

        let mut client = connect(addr);
        client
            .write_all(
                b"GET /chat HTTP/1.1\r\nHost: localhost\r\nUpgrade: websocket\r\n\
                  Connection: Upgrade\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
                  Sec-WebSocket-Version: 13\r\n\r\n",
            )
            .unwrap();

        let mut received = BytesMut::new();
        let mut chunk = [0u8; 1024];
        let head_end = loop {
            let n = client.read(&mut chunk).unwrap();
            assert!(n > 0, "server closed during handshake");
            received.extend_from_slice(&chunk[..n]);
            if let Some(pos) = received.windows(4).position(|w| w == b"\r\n\r\n") {
                break pos + 4;
            }
        };
        let head = String::from_utf8(received[..head_end].to_vec()).unwrap();
        assert!(head.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
        assert!(head.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));
        let _ = received.split_to(head_end);

        client
            .write_all(&pack(&Frame::text("ping me").with_mask([1, 2, 3, 4])))
            .unwrap();
        let frame = loop {
            if let Some(frame) = unpack(&mut received).unwrap() {
                break frame;
            }
            let n = client.read(&mut chunk).unwrap();
            assert!(n > 0, "server closed before echoing");
            received.extend_from_slice(&chunk[..n]);
        };
        assert_eq!(frame.opcode, Opcode::Text);
        assert!(frame.mask.is_none());
        assert_eq!(&frame.payload[..], b"ping me");

        client
            .write_all(&pack(&Frame::close(Some(1000), "").with_mask([9, 9, 9, 9])))
            .unwrap();
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).unwrap();
        received.extend_from_slice(&rest);
        let close = unpack(&mut received).unwrap().unwrap();
        assert_eq!(close.opcode, Opcode::Close);
        assert_eq!(close.close_code(), Some(1000));

        stop.store(true, Ordering::Release);
        handle.join().unwrap();
    }

    #[test]
    fn test_echo_many_clients() {
        let (addr, stop, stats, handle) = spawn(HandlerKind::Echo, fast_config());

        let clients: Vec<_> = (0..16)
            .map(|i| {
                thread::spawn(move || {
                    let mut client = connect(addr);
                    let msg = format!("client {} says hi", i);
                    client.write_all(msg.as_bytes()).unwrap();
                    let mut buf = vec![0u8; msg.len()];
                    client.read_exact(&mut buf).unwrap();
                    assert_eq!(buf, msg.as_bytes());
                })
            })
            .collect();
        for c in clients {
            c.join().unwrap();
        }

        assert!(wait_for(|| stats.active_connections.load(Ordering::Relaxed) == 0));
        assert_eq!(stats.connections_accepted.load(Ordering::Relaxed), 16);

        stop.store(true, Ordering::Release);
        handle.join().unwrap();
    }

    #[test]
    fn test_echo_half_close_flushes_then_closes() {
        let (addr, stop, _stats, handle) = spawn(HandlerKind::Echo, fast_config());

        let mut client = connect(addr);
        client.write_all(b"bye").unwrap();
        let mut buf = [0u8; 3];
        client.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"bye");
        client.shutdown(Shutdown::Write).unwrap();
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).unwrap();
        assert!(rest.is_empty());

        stop.store(true, Ordering::Release);
        handle.join().unwrap();
    }

    #[test]
    fn test_request_then_half_close_still_answered() {
        let (addr, stop, _stats, handle) = spawn(HandlerKind::Http, fast_config());

        let mut client = connect(addr);
        client.write_all(b"GET / HTTP/1.0\r\n\r\n").unwrap();
        client.shutdown(Shutdown::Write).unwrap();
        let mut response = String::new();
        client.read_to_string(&mut response).unwrap();
        assert!(response.starts_with("HTTP/1.0 200 OK\r\n"));
        assert!(response.ends_with("\r\n\r\nhello"));

        stop.store(true, Ordering::Release);
        handle.join().unwrap();
    }

    #[test]
    fn test_echo_data_then_eof_echoed_before_close() {
        let (addr, stop, stats, handle) = spawn(HandlerKind::Echo, fast_config());

        let mut client = connect(addr);
        client.write_all(b"abc").unwrap();
        client.shutdown(Shutdown::Write).unwrap();
        let mut got = Vec::new();
        client.read_to_end(&mut got).unwrap();
        assert_eq!(got, b"abc");
        assert!(wait_for(|| stats.active_connections.load(Ordering::Relaxed) == 0));

        stop.store(true, Ordering::Release);
        handle.join().unwrap();
    }

    #[test]
    fn test_daytime_greets_and_closes() {
        let (addr, stop, _stats, handle) = spawn(HandlerKind::Daytime, fast_config());

        let mut client = connect(addr);
        let mut text = String::new();
        client.read_to_string(&mut text).unwrap();
        assert!(text.ends_with("\r\n"));

        stop.store(true, Ordering::Release);
        handle.join().unwrap();
    }

    #[test]
    fn test_null_closes_immediately() {
        let (addr, stop, stats, handle) = spawn(HandlerKind::Null, fast_config());

        let mut client = connect(addr);
        let mut buf = Vec::new();
        client.read_to_end(&mut buf).unwrap();
        assert!(buf.is_empty());
        assert_eq!(stats.connections_accepted.load(Ordering::Relaxed), 0);

        stop.store(true, Ordering::Release);
        handle.join().unwrap();
    }

    #[test]
    fn test_backpressure_closes_flooding_peer() {
        let config = ServerConfig {
            max_buffer: 1024,
            ..fast_config()
        };
        let (addr, stop, stats, handle) = spawn(HandlerKind::Http, config);

        let mut client = connect(addr);
        // A request line that never ends.
        let flood = vec![b'A'; 64 * 1024];
        let _ = client.write_all(&flood);
        let mut buf = Vec::new();
        let _ = client.read_to_end(&mut buf);
        assert!(buf.is_empty());

        assert!(wait_for(|| stats.connections_overflowed.load(Ordering::Relaxed) == 1));
        assert!(wait_for(|| stats.active_connections.load(Ordering::Relaxed) == 0));

        stop.store(true, Ordering::Release);
        handle.join().unwrap();
    }

    #[test]
    fn test_large_response_survives_partial_writes() {
        let body = "x".repeat(4 * 1024 * 1024);
        let responder = TextResponder::new(body.clone());
        let server = Server::new(
            bind(),
            HandlerKind::Http.factory(Arc::new(responder)),
            fast_config(),
        )
        .unwrap();
        let addr = server.local_addr().unwrap();
        let stop = server.stop_handle();
        let handle = thread::spawn(move || server.run().unwrap());

        let mut client = connect(addr);
        client.write_all(b"GET / HTTP/1.0\r\n\r\n").unwrap();
        let mut response = Vec::new();
        client.read_to_end(&mut response).unwrap();
        assert!(response.ends_with(body.as_bytes()));

        stop.store(true, Ordering::Release);
        handle.join().unwrap();
    }

    struct Gate {
        open: bool,
        next: u64,
        entered: usize,
        left: usize,
    }

    impl LoopHooks for Gate {
        fn try_enter_accept(&mut self) -> bool {
            if self.open {
                self.entered += 1;
            }
            self.open
        }

        fn leave_accept(&mut self) {
            self.left += 1;
        }

        fn next_connection_id(&mut self) -> u64 {
            self.next += 10;
            self.next
        }

        fn worker(&self) -> Option<u32> {
            Some(3)
        }
    }

    #[test]
    fn test_closed_gate_never_accepts() {
        let hooks = Gate {
            open: false,
            next: 0,
            entered: 0,
            left: 0,
        };
        let mut server =
            Server::with_hooks(bind(), factory(HandlerKind::Echo), fast_config(), hooks).unwrap();
        let _client = TcpStream::connect(server.local_addr().unwrap()).unwrap();

        for _ in 0..5 {
            server.poll_once(Duration::from_millis(10)).unwrap();
        }
        assert_eq!(server.open_connections(), 0);
        assert_eq!(server.hooks().left, 0);

        server.hooks_mut().open = true;
        assert!(wait_for(|| {
            server.poll_once(Duration::from_millis(10)).unwrap();
            server.open_connections() == 1
        }));
        assert_eq!(server.hooks().entered, server.hooks().left);
    }

    struct Recorder;

    impl ProtocolHandler for Recorder {
        fn read(&mut self, _data: &[u8], _out: &mut Outbox<'_>) -> bool {
            true
        }
        fn write(&mut self, _out: &mut Outbox<'_>) -> bool {
            true
        }
        fn close(&mut self) {}
    }

    #[test]
    fn test_connection_ids_come_from_hooks() {
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let record = Arc::clone(&seen);
        let factory: HandlerFactory = Box::new(move |ctx| {
            record.lock().unwrap().push(ctx.clone());
            Ok(Box::new(Recorder) as Box<dyn ProtocolHandler>)
        });
        let hooks = Gate {
            open: true,
            next: 0,
            entered: 0,
            left: 0,
        };
        let mut server = Server::with_hooks(bind(), factory, fast_config(), hooks).unwrap();
        let addr = server.local_addr().unwrap();
        let _a = TcpStream::connect(addr).unwrap();
        let _b = TcpStream::connect(addr).unwrap();

        assert!(wait_for(|| {
            server.poll_once(Duration::from_millis(10)).unwrap();
            server.open_connections() == 2
        }));
        let seen = seen.lock().unwrap();
        assert_eq!(seen.iter().map(|c| c.id).collect::<Vec<_>>(), vec![10, 20]);
        assert!(seen.iter().all(|c| c.worker == Some(3)));
    }

    #[test]
    fn test_refused_connection_closed_and_loop_continues() {
        use crate::handler::{EchoHandler, HandlerError};
        use std::sync::atomic::AtomicUsize;

        let calls = AtomicUsize::new(0);
        let factory: HandlerFactory = Box::new(move |ctx| {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(HandlerError::Refused {
                    id: ctx.id,
                    reason: "first connection".to_string(),
                });
            }
            Ok(Box::new(EchoHandler) as Box<dyn ProtocolHandler>)
        });
        let server = Server::new(bind(), factory, fast_config()).unwrap();
        let addr = server.local_addr().unwrap();
        let stop = server.stop_handle();
        let stats = server.stats();
        let handle = thread::spawn(move || server.run().unwrap());

        let mut refused = connect(addr);
        let mut buf = Vec::new();
        refused.read_to_end(&mut buf).unwrap();
        assert!(buf.is_empty());
        assert_eq!(stats.connections_accepted.load(Ordering::Relaxed), 0);

        let mut client = connect(addr);
        client.write_all(b"ping").unwrap();
        let mut echoed = [0u8; 4];
        client.read_exact(&mut echoed).unwrap();
        assert_eq!(&echoed, b"ping");
        assert_eq!(stats.connections_accepted.load(Ordering::Relaxed), 1);

        stop.store(true, Ordering::Release);
        handle.join().unwrap();
    }

    #[test]
    fn test_close_unknown_token_is_noop() {
        let mut server = Server::new(bind(), factory(HandlerKind::Echo), fast_config()).unwrap();
        server.close(Token(42));
        server.close(Token(42));
        assert_eq!(server.open_connections(), 0);
    }
}
