//! Connection Multiplexer
//!
//! One thread, one `mio::Poll`, many connections. The loop owns the listening
//! socket, every accepted stream and every write buffer; protocol handlers
//! only see bytes in and an [`Outbox`](crate::handler::Outbox) out.
//!
//! ## Event Loop
//!
//! ```text
//!            ┌─────────────────────────────┐
//!            │ hooks.try_enter_accept()    │
//!            └──────────────┬──────────────┘
//!                 granted?  │
//!          ┌── yes ─────────┴──────── no ──┐
//!          ▼                               ▼
//!   watch listener                  ignore listener
//!          └───────────────┬───────────────┘
//!                          ▼
//!                  poll(timeout)
//!                          │
//!      ┌───────────────────┼─────────────────────┐
//!      ▼                   ▼                     ▼
//!  writable conns     listener ready        readable conns
//!  flush, then        accept one,           read until
//!  handler.write()    leave_accept()        WouldBlock, then
//!                                           handler.read()
//! ```
//!
//! ## Connection States
//!
//! A connection is watched for READABLE while its write buffer is empty and
//! for WRITABLE while output is pending; nothing else decides its state.
//! Registrations are edge-triggered, so every read drains the socket and
//! every touched connection is re-registered.
//!
//! ## Backpressure
//!
//! Bytes just read plus what the handler still holds unparsed may not exceed
//! [`ServerConfig::max_buffer`](crate::config::ServerConfig). A peer going
//! over is disconnected; nobody else is affected.

pub mod connection;
pub mod hooks;
pub mod multiplexer;

pub use connection::{ConnectionError, ServerStats};
pub use hooks::{LoopHooks, StandaloneHooks};
pub use multiplexer::{Server, ServerError};
