//! Per-connection state owned by the multiplexer.
//!
//! ## Buffer Management
//!
//! Reads are collected chunk by chunk into a fresh `BytesMut` and handed to
//! the handler once per readiness event. Output lives in `write_buf`; a
//! partial write only advances past the bytes the socket took, nothing is
//! copied again.

use crate::handler::{ConnectionContext, Outbox, ProtocolHandler};
use bytes::{Buf, BytesMut};
use mio::net::TcpStream;
use mio::Interest;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicU64, Ordering};

/// Statistics for connection handling
#[derive(Debug, Default)]
pub struct ServerStats {
    /// Total number of connections accepted
    pub connections_accepted: AtomicU64,
    /// Currently open connections
    pub active_connections: AtomicU64,
    /// Connections closed for exceeding the buffer cap
    pub connections_overflowed: AtomicU64,
    /// Total bytes read
    pub bytes_read: AtomicU64,
    /// Total bytes written
    pub bytes_written: AtomicU64,
}

impl ServerStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connection_opened(&self) {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn connection_overflowed(&self) {
        self.connections_overflowed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bytes_read(&self, count: usize) {
        self.bytes_read.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn bytes_written(&self, count: usize) {
        self.bytes_written.fetch_add(count as u64, Ordering::Relaxed);
    }
}

/// Reasons a connection is torn down.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    /// I/O error (network issue)
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Received plus unparsed bytes went over the cap
    #[error("buffer size limit exceeded: {size} bytes (max: {max})")]
    BufferFull { size: usize, max: usize },
}

/// What one round of reading produced.
#[derive(Debug, Default)]
pub(crate) struct ReadOutcome {
    pub data: BytesMut,
    /// The peer shut down its side
    pub eof: bool,
}

/// One accepted connection.
pub(crate) struct Connection {
    pub stream: TcpStream,
    pub ctx: ConnectionContext,
    pub handler: Box<dyn ProtocolHandler>,
    /// Output not yet taken by the socket
    pub write_buf: BytesMut,
    /// Peer sent EOF; close once `write_buf` drains
    pub closing: bool,
}

impl Connection {
    pub fn new(stream: TcpStream, ctx: ConnectionContext, handler: Box<dyn ProtocolHandler>) -> Self {
        Self {
            stream,
            ctx,
            handler,
            write_buf: BytesMut::new(),
            closing: false,
        }
    }

    /// Readable while idle, writable while output is pending.
    pub fn interest(&self) -> Interest {
        if self.write_buf.is_empty() {
            Interest::READABLE
        } else {
            Interest::WRITABLE
        }
    }

    /// Reads until the socket would block or the peer closes.
    ///
    /// Fails with `BufferFull` as soon as the bytes read plus those the
    /// handler still holds exceed `max_buffer`.
    pub fn read_available(
        &mut self,
        scratch: &mut [u8],
        max_buffer: usize,
    ) -> Result<ReadOutcome, ConnectionError> {
        let mut outcome = ReadOutcome::default();
        loop {
            match self.stream.read(scratch) {
                Ok(0) => {
                    outcome.eof = true;
                    break;
                }
                Ok(n) => {
                    outcome.data.extend_from_slice(&scratch[..n]);
                    let size = outcome.data.len() + self.handler.buffered();
                    if size > max_buffer {
                        return Err(ConnectionError::BufferFull {
                            size,
                            max: max_buffer,
                        });
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(outcome)
    }

    /// Writes as much pending output as the socket takes.
    ///
    /// Returns the number of bytes written.
    pub fn flush(&mut self) -> Result<usize, ConnectionError> {
        let mut written = 0;
        while !self.write_buf.is_empty() {
            match self.stream.write(&self.write_buf) {
                Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero).into()),
                Ok(n) => {
                    self.write_buf.advance(n);
                    written += n;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(written)
    }

    pub fn on_open(&mut self) -> bool {
        self.handler.open(&mut Outbox::new(&mut self.write_buf))
    }

    pub fn on_read(&mut self, data: &[u8]) -> bool {
        self.handler.read(data, &mut Outbox::new(&mut self.write_buf))
    }

    pub fn on_write(&mut self) -> bool {
        self.handler.write(&mut Outbox::new(&mut self.write_buf))
    }
}
