//! Protocol Handler Contract
//!
//! Every protocol served by the multiplexer implements [`ProtocolHandler`].
//! The multiplexer owns the socket and both buffers; a handler only ever sees
//! the bytes that were just received and an [`Outbox`] it can append to.
//!
//! ## Lifecycle
//!
//! ```text
//!   accept()
//!      │
//!      ▼
//!   factory(ctx) ──Err──> connection closed immediately
//!      │
//!      ▼
//!   open(out)            (greeting protocols write here)
//!      │
//!      ▼
//!   ┌──────────────────────────────────────────────┐
//!   │ read(bytes, out)  ── false ──> close()       │
//!   │      │                                       │
//!   │      ▼ (out non-empty)                       │
//!   │ flush to socket                              │
//!   │      │                                       │
//!   │      ▼ (write buffer empty)                  │
//!   │ write(out)        ── false ──> close()       │
//!   └──────────────────────────────────────────────┘
//! ```
//!
//! Handlers are resolved once at startup from a [`HandlerKind`] into a
//! [`HandlerFactory`]; nothing is looked up by name while serving.

pub mod basic;

use crate::http::{HttpHandler, RequestHandler};
use crate::websocket::{EchoMessages, WebsocketHandler};
use bytes::BytesMut;
use std::net::SocketAddr;
use std::sync::Arc;

pub use basic::{DaytimeHandler, EchoHandler, NullHandler, TimeHandler};

/// Identity of one accepted connection, handed to the factory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionContext {
    /// Connection number (process-local, or the shared serial in forking mode)
    pub id: u64,
    /// Remote address of the peer
    pub peer: SocketAddr,
    /// Worker that accepted the connection (None when not forking)
    pub worker: Option<u32>,
}

/// Append-only view of a connection's write buffer.
///
/// The multiplexer owns the buffer; handlers queue output through this type
/// and never hold on to it between callbacks.
#[derive(Debug)]
pub struct Outbox<'a> {
    buf: &'a mut BytesMut,
}

impl<'a> Outbox<'a> {
    pub fn new(buf: &'a mut BytesMut) -> Self {
        Self { buf }
    }

    /// Queues bytes to be written after everything already pending.
    pub fn append(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Number of bytes waiting to be flushed.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

/// The state machine every protocol must satisfy.
///
/// Return values of `open`, `read` and `write` tell the multiplexer whether
/// to keep servicing the connection (`true`) or to close it (`false`).
pub trait ProtocolHandler: Send {
    /// Called once right after the connection is accepted.
    fn open(&mut self, _out: &mut Outbox<'_>) -> bool {
        true
    }

    /// Bytes just received, in order, each byte exactly once.
    fn read(&mut self, data: &[u8], out: &mut Outbox<'_>) -> bool;

    /// The write buffer has been completely flushed.
    fn write(&mut self, out: &mut Outbox<'_>) -> bool;

    /// The connection is being discarded, for any reason.
    fn close(&mut self);

    /// Bytes received but not yet consumed by the protocol.
    ///
    /// Counted against the multiplexer's per-connection buffer cap.
    fn buffered(&self) -> usize {
        0
    }
}

/// Errors a factory may report while building a handler.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("handler refused connection {id}: {reason}")]
    Refused { id: u64, reason: String },
}

/// Builds one handler per accepted connection.
pub type HandlerFactory =
    Box<dyn Fn(&ConnectionContext) -> Result<Box<dyn ProtocolHandler>, HandlerError> + Send>;

/// The protocols this crate ships, selectable from the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum HandlerKind {
    /// HTTP/0.9 - HTTP/1.1
    Http,
    /// HTTP with RFC 6455 upgrade, echoing messages
    Websocket,
    /// RFC 862
    Echo,
    /// RFC 867
    Daytime,
    /// RFC 868
    Time,
    /// Close every connection straight away
    Null,
}

impl HandlerKind {
    /// Resolves this kind into a factory.
    ///
    /// `responder` answers HTTP requests for the `Http` and `Websocket` kinds
    /// and is ignored by the others.
    pub fn factory(self, responder: Arc<dyn RequestHandler>) -> HandlerFactory {
        match self {
            HandlerKind::Http => Box::new(move |_ctx| {
                Ok(Box::new(HttpHandler::new(Arc::clone(&responder))) as Box<dyn ProtocolHandler>)
            }),
            HandlerKind::Websocket => Box::new(move |_ctx| {
                Ok(Box::new(WebsocketHandler::new(
                    HttpHandler::new(Arc::clone(&responder)),
                    Box::new(EchoMessages),
                )) as Box<dyn ProtocolHandler>)
            }),
            HandlerKind::Echo => Box::new(|_ctx| Ok(Box::new(EchoHandler) as Box<dyn ProtocolHandler>)),
            HandlerKind::Daytime => {
                Box::new(|_ctx| Ok(Box::new(DaytimeHandler) as Box<dyn ProtocolHandler>))
            }
            HandlerKind::Time => Box::new(|_ctx| Ok(Box::new(TimeHandler) as Box<dyn ProtocolHandler>)),
            HandlerKind::Null => Box::new(|_ctx| Ok(Box::new(NullHandler) as Box<dyn ProtocolHandler>)),
        }
    }
}
