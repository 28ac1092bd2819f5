//! Process-local primitives.
//!
//! Clones share state, so threads can stand in for worker processes.

use super::{check_key, check_message, IpcError, IpcResult, KeyValueStore, Lock, MessageQueue};
use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

/// A lock shared by every clone of the handle.
#[derive(Debug, Default)]
pub struct MemoryLock {
    locked: Arc<AtomicBool>,
    held: AtomicBool,
}

impl MemoryLock {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Clone for MemoryLock {
    /// A new handle on the same lock; it does not inherit the holder state.
    fn clone(&self) -> Self {
        Self {
            locked: Arc::clone(&self.locked),
            held: AtomicBool::new(false),
        }
    }
}

impl Lock for MemoryLock {
    fn acquire(&self) -> IpcResult<()> {
        while !self.try_acquire()? {
            thread::sleep(Duration::from_micros(50));
        }
        Ok(())
    }

    fn try_acquire(&self) -> IpcResult<bool> {
        if self.held.load(Ordering::Acquire) {
            return Ok(true);
        }
        let won = self
            .locked
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if won {
            self.held.store(true, Ordering::Release);
        }
        Ok(won)
    }

    fn release(&self) -> IpcResult<bool> {
        if !self.held.swap(false, Ordering::AcqRel) {
            return Ok(false);
        }
        self.locked.store(false, Ordering::Release);
        Ok(true)
    }

    fn is_held(&self) -> bool {
        self.held.load(Ordering::Acquire)
    }

    fn destroy(self) -> IpcResult<()> {
        Ok(())
    }
}

/// A counter map behind a mutex.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    data: Arc<Mutex<HashMap<String, i64>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with<T>(&self, f: impl FnOnce(&mut HashMap<String, i64>) -> T) -> IpcResult<T> {
        let mut data = self.data.lock().map_err(|_| IpcError::Poisoned)?;
        Ok(f(&mut data))
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> IpcResult<Option<i64>> {
        check_key(key)?;
        self.with(|data| data.get(key).copied())
    }

    fn set(&self, key: &str, value: i64) -> IpcResult<()> {
        check_key(key)?;
        self.with(|data| {
            data.insert(key.to_string(), value);
        })
    }

    fn delete(&self, key: &str) -> IpcResult<bool> {
        check_key(key)?;
        self.with(|data| data.remove(key).is_some())
    }

    fn increment(&self, key: &str, by: i64) -> IpcResult<i64> {
        check_key(key)?;
        self.with(|data| {
            let value = data.entry(key.to_string()).or_insert(0);
            *value = value.wrapping_add(by);
            *value
        })
    }

    fn destroy(self) -> IpcResult<()> {
        self.with(|data| data.clear())
    }
}

/// A FIFO behind a mutex.
#[derive(Debug, Clone, Default)]
pub struct MemoryQueue {
    messages: Arc<Mutex<VecDeque<Bytes>>>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.messages.lock().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl MessageQueue for MemoryQueue {
    fn send(&self, message: &[u8]) -> IpcResult<()> {
        check_message(message)?;
        let mut messages = self.messages.lock().map_err(|_| IpcError::Poisoned)?;
        messages.push_back(Bytes::copy_from_slice(message));
        Ok(())
    }

    fn receive(&self) -> IpcResult<Option<Bytes>> {
        let mut messages = self.messages.lock().map_err(|_| IpcError::Poisoned)?;
        Ok(messages.pop_front())
    }

    fn destroy(self) -> IpcResult<()> {
        let mut messages = self.messages.lock().map_err(|_| IpcError::Poisoned)?;
        messages.clear();
        Ok(())
    }
}
