//! WebSocket Protocol (RFC 6455)
//!
//! A connection starts as plain HTTP. When an upgrade request completes the
//! handshake, the same connection switches to frame decoding:
//!
//! ```text
//!   HTTP request ──upgrade?──no──> HttpHandler (normal response)
//!                     │
//!                    yes
//!                     ▼
//!               101 Switching Protocols
//!                     │
//!                     ▼
//!   bytes ──> unpack() ──> Frame ──┬─ ping  ──> pong
//!                                  ├─ close ──> close, then disconnect
//!                                  └─ data  ──> reassemble ──> MessageHandler
//!                                                                   │
//!                        pack() <── Message (unmasked frames) <─────┘
//! ```

pub mod frame;
pub mod handler;
pub mod handshake;

pub use frame::{apply_mask, pack, unpack, Frame, FrameError, Opcode};
pub use handler::{EchoMessages, Message, MessageHandler, MessageKind, WebsocketHandler};
pub use handshake::{compute_accept_key, HandshakeError};
