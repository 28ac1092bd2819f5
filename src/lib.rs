//! # sockmux - A Multiplexed, Pre-forking Socket Server
//!
//! sockmux serves many concurrent TCP connections from one thread per
//! process, and optionally forks several such processes over one listening
//! socket. Protocols plug in through a small handler contract.
//!
//! ## Features
//!
//! - **Readiness-based I/O**: One `mio` poll drives every connection of a worker
//! - **Pre-forking**: N workers share the listener without accept races
//! - **Backpressure**: Peers that pile up unparsed input are disconnected
//! - **Protocols**: HTTP/0.9 - 1.1, WebSocket (RFC 6455), Echo, Daytime, Time
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                               sockmux                                   │
//! │                                                                         │
//! │  ┌──────────────┐   fork × N   ┌──────────────────────────────────────┐ │
//! │  │ ForkingServer│─────────────>│ worker: Server (mio event loop)      │ │
//! │  │ (supervisor) │<─heartbeats──│   ┌─────────┐   ┌──────────────────┐ │ │
//! │  └──────┬───────┘              │   │ accept  │──>│ ProtocolHandler  │ │ │
//! │         │                      │   │ (gated) │   │ http / websocket │ │ │
//! │         ▼                      │   └─────────┘   │ echo / daytime.. │ │ │
//! │  ┌──────────────────────────┐  │                 └──────────────────┘ │ │
//! │  │ ipc: Lock, KeyValueStore,│<─┤  accept lock, connection serial      │ │
//! │  │      MessageQueue        │  └──────────────────────────────────────┘ │
//! │  └──────────────────────────┘                                           │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! use sockmux::config::ServerConfig;
//! use sockmux::handler::HandlerKind;
//! use sockmux::http::TextResponder;
//! use sockmux::server::Server;
//! use std::sync::Arc;
//!
//! let listener = mio::net::TcpListener::bind("127.0.0.1:8080".parse()?)?;
//! let factory = HandlerKind::Http.factory(Arc::new(TextResponder::default()));
//! let server = Server::new(listener, factory, ServerConfig::default())?;
//! server.run()?;
//! ```
//!
//! ## Module Overview
//!
//! - [`server`]: The event loop and per-connection buffers
//! - [`handler`]: The handler contract and the small line protocols
//! - [`http`]: Incremental HTTP/1.x parser and request/response types
//! - [`websocket`]: RFC 6455 frame codec, handshake and message handler
//! - [`ipc`]: Lock, counter store and message queue (SysV and in-memory)
//! - [`supervisor`]: Forking, accept gating and worker liveness
//! - [`config`]: Command line and runtime settings
//!
//! ## Design Highlights
//!
//! ### Handlers Never Own the Socket
//!
//! The loop owns each connection's write buffer. Handlers append through an
//! [`Outbox`](handler::Outbox) and answer every callback with "keep going"
//! or "close".
//!
//! ### One Acceptor at a Time
//!
//! Workers only watch the listening socket while holding a shared lock, so a
//! new connection wakes exactly one process.

pub mod config;
pub mod handler;
pub mod http;
pub mod ipc;
pub mod server;
pub mod supervisor;
pub mod websocket;

// Re-export commonly used types for convenience
pub use config::{Cli, ServerConfig, SupervisorConfig};
pub use handler::{ConnectionContext, HandlerFactory, HandlerKind, Outbox, ProtocolHandler};
pub use server::{Server, ServerError, ServerStats};
pub use supervisor::{ForkingServer, SupervisorError};

/// The default port sockmux listens on
pub const DEFAULT_PORT: u16 = 8080;

/// Version of sockmux
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
