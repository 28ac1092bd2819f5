//! System V IPC backend.
//!
//! Objects created before `fork()` are shared with every child: the ids are
//! plain integers and shared memory stays attached in the child.
//!
//! ## Store Layout
//!
//! ```text
//!   shm segment: [Slot; SLOT_COUNT]
//!   ┌────────────────────┬─────┬──────┬─────────┬───────────┐
//!   │ key: [u8; 56]      │ len │ used │ padding │ value i64 │  72 bytes
//!   └────────────────────┴─────┴──────┴─────────┴───────────┘
//!   guarded by its own semaphore
//! ```

use super::{
    check_key, check_message, IpcError, IpcKey, IpcResult, KeyValueStore, Lock, MessageQueue,
    MAX_KEY_LEN, MAX_MESSAGE_SIZE,
};
use bytes::Bytes;
use std::io;
use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};

/// Number of keys the shared store can hold.
pub const SLOT_COUNT: usize = 64;

const PERMISSIONS: libc::c_int = 0o600;

fn raw_key(key: IpcKey) -> libc::key_t {
    match key {
        IpcKey::Private => libc::IPC_PRIVATE,
        IpcKey::Fixed(k) => k as libc::key_t,
    }
}

/// A single SysV semaphore used as a binary lock.
#[derive(Debug, Clone, Copy)]
struct Semaphore {
    id: libc::c_int,
}

impl Semaphore {
    /// Creates the semaphore set to 1, "free", or opens an existing one
    /// without touching its value.
    fn create(key: IpcKey) -> IpcResult<Self> {
        let raw = raw_key(key);
        // SAFETY: plain syscall, no pointers involved.
        let id = unsafe { libc::semget(raw, 1, libc::IPC_CREAT | libc::IPC_EXCL | PERMISSIONS) };
        if id < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EEXIST) {
                return Err(IpcError::Os {
                    call: "semget",
                    source: err,
                });
            }
            // SAFETY: plain syscall, no pointers involved.
            let id = unsafe { libc::semget(raw, 1, PERMISSIONS) };
            if id < 0 {
                return Err(IpcError::os("semget"));
            }
            return Ok(Self { id });
        }
        // SAFETY: SETVAL takes the value as the variadic int argument.
        if unsafe { libc::semctl(id, 0, libc::SETVAL, 1 as libc::c_int) } < 0 {
            return Err(IpcError::os("semctl(SETVAL)"));
        }
        Ok(Self { id })
    }

    /// Applies `delta` to the semaphore.
    ///
    /// `SEM_UNDO` makes the kernel revert the change if the process dies,
    /// so a crashed holder cannot keep the lock. Returns false when
    /// `nowait` is set and the operation would block.
    fn op(&self, delta: i16, nowait: bool) -> IpcResult<bool> {
        let mut flags = libc::SEM_UNDO as libc::c_short;
        if nowait {
            flags |= libc::IPC_NOWAIT as libc::c_short;
        }
        let mut buf = libc::sembuf {
            sem_num: 0,
            sem_op: delta,
            sem_flg: flags,
        };
        loop {
            // SAFETY: `buf` is a valid sembuf for the duration of the call.
            if unsafe { libc::semop(self.id, &mut buf, 1) } == 0 {
                return Ok(true);
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(libc::EAGAIN) if nowait => return Ok(false),
                _ => {
                    return Err(IpcError::Os {
                        call: "semop",
                        source: err,
                    })
                }
            }
        }
    }

    fn remove(&self) -> IpcResult<()> {
        // SAFETY: plain syscall, no pointers involved.
        if unsafe { libc::semctl(self.id, 0, libc::IPC_RMID) } < 0 {
            return Err(IpcError::os("semctl(IPC_RMID)"));
        }
        Ok(())
    }
}

/// Cross-process lock on one SysV semaphore.
#[derive(Debug)]
pub struct SysvLock {
    sem: Semaphore,
    held: AtomicBool,
}

impl SysvLock {
    pub fn create(key: IpcKey) -> IpcResult<Self> {
        Ok(Self {
            sem: Semaphore::create(key)?,
            held: AtomicBool::new(false),
        })
    }
}

impl Clone for SysvLock {
    fn clone(&self) -> Self {
        Self {
            sem: self.sem,
            held: AtomicBool::new(false),
        }
    }
}

impl Lock for SysvLock {
    fn acquire(&self) -> IpcResult<()> {
        if self.is_held() {
            return Ok(());
        }
        self.sem.op(-1, false)?;
        self.held.store(true, Ordering::Release);
        Ok(())
    }

    fn try_acquire(&self) -> IpcResult<bool> {
        if self.is_held() {
            return Ok(true);
        }
        let won = self.sem.op(-1, true)?;
        if won {
            self.held.store(true, Ordering::Release);
        }
        Ok(won)
    }

    fn release(&self) -> IpcResult<bool> {
        if !self.held.swap(false, Ordering::AcqRel) {
            return Ok(false);
        }
        self.sem.op(1, false)?;
        Ok(true)
    }

    fn is_held(&self) -> bool {
        self.held.load(Ordering::Acquire)
    }

    fn destroy(self) -> IpcResult<()> {
        self.sem.remove()
    }
}

#[repr(C)]
#[derive(Clone, Copy)]
struct Slot {
    key: [u8; MAX_KEY_LEN],
    len: u8,
    used: u8,
    _pad: [u8; 6],
    value: i64,
}

impl Slot {
    fn matches(&self, key: &[u8]) -> bool {
        self.used != 0 && &self.key[..self.len as usize] == key
    }
}

/// Holds the store's guard semaphore until dropped.
struct Guard<'a>(&'a Semaphore);

impl Drop for Guard<'_> {
    fn drop(&mut self) {
        let _ = self.0.op(1, false);
    }
}

/// Counter table in a SysV shared memory segment.
#[derive(Debug)]
pub struct SysvStore {
    shm_id: libc::c_int,
    slots: *mut Slot,
    guard: Semaphore,
}

// SAFETY: the segment is only touched while holding `guard`, which
// serializes access across threads and processes alike.
unsafe impl Send for SysvStore {}
unsafe impl Sync for SysvStore {}

impl SysvStore {
    pub fn create(key: IpcKey) -> IpcResult<Self> {
        let size = SLOT_COUNT * mem::size_of::<Slot>();
        // SAFETY: plain syscall, no pointers involved.
        let shm_id = unsafe { libc::shmget(raw_key(key), size, libc::IPC_CREAT | PERMISSIONS) };
        if shm_id < 0 {
            return Err(IpcError::os("shmget"));
        }
        // SAFETY: attaching at a kernel-chosen address.
        let addr = unsafe { libc::shmat(shm_id, ptr::null(), 0) };
        if addr as isize == -1 {
            return Err(IpcError::os("shmat"));
        }
        // The guard semaphore shares the key space; keep private keys private.
        let guard = match Semaphore::create(match key {
            IpcKey::Private => IpcKey::Private,
            IpcKey::Fixed(k) => IpcKey::Fixed(k.wrapping_add(1)),
        }) {
            Ok(guard) => guard,
            Err(e) => {
                // SAFETY: `addr` was returned by shmat above.
                unsafe { libc::shmdt(addr) };
                return Err(e);
            }
        };
        Ok(Self {
            shm_id,
            slots: addr.cast::<Slot>(),
            guard,
        })
    }

    fn lock(&self) -> IpcResult<Guard<'_>> {
        self.guard.op(-1, false)?;
        Ok(Guard(&self.guard))
    }

    /// Runs `f` over the slot table while holding the guard.
    fn with_slots<T>(&self, f: impl FnOnce(&mut [Slot]) -> IpcResult<T>) -> IpcResult<T> {
        let _guard = self.lock()?;
        // SAFETY: the segment holds SLOT_COUNT slots and stays attached for
        // the lifetime of `self`; the guard excludes every other accessor.
        let slots = unsafe { std::slice::from_raw_parts_mut(self.slots, SLOT_COUNT) };
        f(slots)
    }
}

impl KeyValueStore for SysvStore {
    fn get(&self, key: &str) -> IpcResult<Option<i64>> {
        check_key(key)?;
        self.with_slots(|slots| {
            Ok(slots
                .iter()
                .find(|s| s.matches(key.as_bytes()))
                .map(|s| s.value))
        })
    }

    fn set(&self, key: &str, value: i64) -> IpcResult<()> {
        check_key(key)?;
        self.with_slots(|slots| {
            let slot = find_or_insert(slots, key)?;
            slot.value = value;
            Ok(())
        })
    }

    fn delete(&self, key: &str) -> IpcResult<bool> {
        check_key(key)?;
        self.with_slots(|slots| {
            match slots.iter_mut().find(|s| s.matches(key.as_bytes())) {
                Some(slot) => {
                    slot.used = 0;
                    Ok(true)
                }
                None => Ok(false),
            }
        })
    }

    fn increment(&self, key: &str, by: i64) -> IpcResult<i64> {
        check_key(key)?;
        self.with_slots(|slots| {
            let slot = find_or_insert(slots, key)?;
            slot.value = slot.value.wrapping_add(by);
            Ok(slot.value)
        })
    }

    fn destroy(self) -> IpcResult<()> {
        // SAFETY: plain syscall; the segment is freed after the last detach.
        if unsafe { libc::shmctl(self.shm_id, libc::IPC_RMID, ptr::null_mut()) } < 0 {
            return Err(IpcError::os("shmctl(IPC_RMID)"));
        }
        self.guard.remove()
    }
}

impl Drop for SysvStore {
    fn drop(&mut self) {
        // SAFETY: `slots` is the address returned by shmat in `create`.
        unsafe { libc::shmdt(self.slots.cast::<libc::c_void>()) };
    }
}

/// Finds the slot for `key`, claiming a free one with value 0 if absent.
fn find_or_insert<'a>(slots: &'a mut [Slot], key: &str) -> IpcResult<&'a mut Slot> {
    let bytes = key.as_bytes();
    let index = match slots.iter().position(|s| s.matches(bytes)) {
        Some(i) => i,
        None => {
            let i = slots
                .iter()
                .position(|s| s.used == 0)
                .ok_or_else(|| IpcError::StoreFull(key.to_string()))?;
            let slot = &mut slots[i];
            slot.key = [0; MAX_KEY_LEN];
            slot.key[..bytes.len()].copy_from_slice(bytes);
            slot.len = bytes.len() as u8;
            slot.used = 1;
            slot.value = 0;
            i
        }
    };
    Ok(&mut slots[index])
}

#[repr(C)]
struct RawMessage {
    mtype: libc::c_long,
    mtext: [u8; MAX_MESSAGE_SIZE],
}

/// Cross-process FIFO on a SysV message queue.
#[derive(Debug, Clone, Copy)]
pub struct SysvQueue {
    id: libc::c_int,
}

impl SysvQueue {
    pub fn create(key: IpcKey) -> IpcResult<Self> {
        // SAFETY: plain syscall, no pointers involved.
        let id = unsafe { libc::msgget(raw_key(key), libc::IPC_CREAT | PERMISSIONS) };
        if id < 0 {
            return Err(IpcError::os("msgget"));
        }
        Ok(Self { id })
    }
}

impl MessageQueue for SysvQueue {
    fn send(&self, message: &[u8]) -> IpcResult<()> {
        check_message(message)?;
        let mut raw = RawMessage {
            mtype: 1,
            mtext: [0; MAX_MESSAGE_SIZE],
        };
        raw.mtext[..message.len()].copy_from_slice(message);
        loop {
            // SAFETY: `raw` outlives the call and holds `message.len()` text bytes.
            let rc = unsafe {
                libc::msgsnd(
                    self.id,
                    (&raw as *const RawMessage).cast::<libc::c_void>(),
                    message.len(),
                    libc::IPC_NOWAIT,
                )
            };
            if rc == 0 {
                return Ok(());
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(libc::EAGAIN) => return Err(IpcError::QueueFull),
                _ => {
                    return Err(IpcError::Os {
                        call: "msgsnd",
                        source: err,
                    })
                }
            }
        }
    }

    fn receive(&self) -> IpcResult<Option<Bytes>> {
        let mut raw = RawMessage {
            mtype: 0,
            mtext: [0; MAX_MESSAGE_SIZE],
        };
        loop {
            // SAFETY: `raw` has room for MAX_MESSAGE_SIZE text bytes.
            let n = unsafe {
                libc::msgrcv(
                    self.id,
                    (&mut raw as *mut RawMessage).cast::<libc::c_void>(),
                    MAX_MESSAGE_SIZE,
                    0,
                    libc::IPC_NOWAIT,
                )
            };
            if n >= 0 {
                return Ok(Some(Bytes::copy_from_slice(&raw.mtext[..n as usize])));
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(libc::ENOMSG) => return Ok(None),
                _ => {
                    return Err(IpcError::Os {
                        call: "msgrcv",
                        source: err,
                    })
                }
            }
        }
    }

    fn destroy(self) -> IpcResult<()> {
        // SAFETY: plain syscall; IPC_RMID ignores the buffer argument.
        if unsafe { libc::msgctl(self.id, libc::IPC_RMID, ptr::null_mut()) } < 0 {
            return Err(IpcError::os("msgctl(IPC_RMID)"));
        }
        Ok(())
    }
}
