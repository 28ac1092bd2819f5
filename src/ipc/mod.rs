//! Coordination Primitives
//!
//! Worker processes share nothing but these three objects:
//!
//! ```text
//!   ┌──────────┐   ┌──────────┐   ┌──────────┐
//!   │ worker 1 │   │ worker 2 │   │ worker N │
//!   └────┬─────┘   └────┬─────┘   └────┬─────┘
//!        │              │              │
//!        ├──── Lock ────┼──────────────┤   who may accept() next
//!        ├── KeyValue ──┼──────────────┤   next connection serial
//!        └── Queue ─────┴──────────────┘──> parent: heartbeats
//! ```
//!
//! Two backends implement the traits:
//! - [`sysv`]: System V semaphores, shared memory and message queues, which
//!   survive `fork()` and work across processes (Linux only)
//! - [`memory`]: process-local, for single-process mode and tests
//!
//! Dropping a handle only releases local resources. Removing the OS object
//! takes an explicit `destroy(self)`, which only the creating process calls.

pub mod memory;
#[cfg(target_os = "linux")]
pub mod sysv;

use bytes::Bytes;
use std::io;
use thiserror::Error;

pub use memory::{MemoryLock, MemoryQueue, MemoryStore};
#[cfg(target_os = "linux")]
pub use sysv::{SysvLock, SysvQueue, SysvStore};

/// Longest key a [`KeyValueStore`] accepts, in bytes.
pub const MAX_KEY_LEN: usize = 56;

/// Largest message a [`MessageQueue`] carries, in bytes.
pub const MAX_MESSAGE_SIZE: usize = 256;

/// Errors from the coordination primitives.
#[derive(Debug, Error)]
pub enum IpcError {
    /// A system call failed
    #[error("{call} failed: {source}")]
    Os {
        call: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("key too long: {len} bytes (max: {max})")]
    KeyTooLong { len: usize, max: usize },

    #[error("message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },

    /// The queue cannot take another message right now
    #[error("message queue full")]
    QueueFull,

    #[error("store full, cannot insert {0:?}")]
    StoreFull(String),

    /// A thread panicked while holding a process-local lock
    #[error("primitive poisoned by a panicked thread")]
    Poisoned,
}

impl IpcError {
    /// Captures `errno` for a failed call.
    pub fn os(call: &'static str) -> Self {
        IpcError::Os {
            call,
            source: io::Error::last_os_error(),
        }
    }

    /// The OS error code, if this came from a system call.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            IpcError::Os { source, .. } => source.raw_os_error(),
            _ => None,
        }
    }
}

pub type IpcResult<T> = Result<T, IpcError>;

/// How an IPC object is named.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IpcKey {
    /// A fresh anonymous object, reachable by children forked afterwards
    #[default]
    Private,
    /// A well-known key other processes can open
    Fixed(i32),
}

pub(crate) fn check_key(key: &str) -> IpcResult<()> {
    if key.len() > MAX_KEY_LEN {
        return Err(IpcError::KeyTooLong {
            len: key.len(),
            max: MAX_KEY_LEN,
        });
    }
    Ok(())
}

pub(crate) fn check_message(message: &[u8]) -> IpcResult<()> {
    if message.len() > MAX_MESSAGE_SIZE {
        return Err(IpcError::MessageTooLarge {
            size: message.len(),
            max: MAX_MESSAGE_SIZE,
        });
    }
    Ok(())
}

/// A binary mutual-exclusion lock.
///
/// Each handle remembers whether it holds the lock, so releasing from a
/// handle that never acquired is a no-op.
pub trait Lock: Send + Sync {
    /// Blocks until the lock is held.
    fn acquire(&self) -> IpcResult<()>;

    /// Takes the lock if it is free. Never blocks.
    fn try_acquire(&self) -> IpcResult<bool>;

    /// Releases the lock. Returns false if this handle did not hold it.
    fn release(&self) -> IpcResult<bool>;

    /// Whether this handle currently holds the lock.
    fn is_held(&self) -> bool;

    /// Removes the underlying object for every process.
    fn destroy(self) -> IpcResult<()>
    where
        Self: Sized;
}

/// A small map of `i64` counters shared between processes.
///
/// Every operation is atomic on its own.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> IpcResult<Option<i64>>;

    fn set(&self, key: &str, value: i64) -> IpcResult<()>;

    /// Returns true if the key existed.
    fn delete(&self, key: &str) -> IpcResult<bool>;

    /// Adds `by` to the value (missing keys start at 0) and returns the result.
    fn increment(&self, key: &str, by: i64) -> IpcResult<i64>;

    fn destroy(self) -> IpcResult<()>
    where
        Self: Sized;
}

/// A FIFO of small byte messages; each message is received once.
pub trait MessageQueue: Send + Sync {
    fn send(&self, message: &[u8]) -> IpcResult<()>;

    /// The oldest message, or None if the queue is empty. Never blocks.
    fn receive(&self) -> IpcResult<Option<Bytes>>;

    fn destroy(self) -> IpcResult<()>
    where
        Self: Sized;
}
