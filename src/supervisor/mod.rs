//! Pre-forking Supervisor
//!
//! Several worker processes serve one listening socket. Each runs an
//! ordinary [`Server`](crate::server::Server); the only thing they share is
//! a set of coordination primitives from [`ipc`](crate::ipc).
//!
//! ## Process Layout
//!
//! ```text
//!                       ┌──────────────────────┐
//!                       │        parent        │
//!                       │  tokio current-thread│
//!                       │  ticks + signals     │
//!                       └──────────┬───────────┘
//!                      fork() × N  │  ▲ heartbeats (MessageQueue)
//!          ┌───────────────────────┼──┴────────────────────┐
//!          ▼                       ▼                       ▼
//!   ┌─────────────┐         ┌─────────────┐         ┌─────────────┐
//!   │  worker 0   │         │  worker 1   │   ...   │  worker N-1 │
//!   │  mio loop   │         │  mio loop   │         │  mio loop   │
//!   └──────┬──────┘         └──────┬──────┘         └──────┬──────┘
//!          └──────── accept Lock + serial (KeyValueStore) ──┘
//! ```
//!
//! ## Accept Gating
//!
//! Only the worker holding the [`Lock`](crate::ipc::Lock) watches the
//! listening socket during a poll, so a pending connection wakes exactly one
//! process. While holding it, the worker takes the next connection number
//! from the shared serial.
//!
//! ## Liveness
//!
//! Workers report `{worker, timestamp, open connections}` every heartbeat
//! interval and a sentinel without timestamp when they stop. The parent
//! marks silent workers dead and reaps exited children; it does not restart
//! them.

pub mod forking;
pub mod heartbeat;
pub mod registry;

use crate::ipc::IpcError;
use std::io;

pub use forking::{ForkingServer, Supervisor, WorkerHooks, SERIAL_KEY};
pub use heartbeat::{Heartbeat, HeartbeatError};
pub use registry::{WorkerRegistry, WorkerState, WorkerStatus};

/// Errors that end supervision.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("coordination failed: {0}")]
    Ipc(#[from] IpcError),

    #[error("fork failed: {0}")]
    Fork(#[source] io::Error),

    #[error("failed to start supervisor runtime: {0}")]
    Runtime(#[source] io::Error),

    #[error("failed to wait for shutdown signal: {0}")]
    Signal(#[source] io::Error),
}
