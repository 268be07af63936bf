//! Native substrates.
//!
//! A [`Substrate`] supplies one capability set: a raw non-recursive lock, a
//! condition variable over that lock, a once cell, a thread-local key, and
//! thread spawn/join/detach/sleep/yield. The public wrappers in
//! [`crate::mutex`], [`crate::cond`], [`crate::once`], [`crate::tss`] and
//! [`crate::thread`] layer ownership, recursion and status mapping on top.
//!
//! Two implementations exist:
//! - [`posix::Posix`] (Unix): `pthread_*` through `libc`.
//! - [`portable::Portable`] (everywhere): `std::thread` + `parking_lot`.
//!
//! [`Active`] names the one selected at compile time.

#![allow(unsafe_code)]

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use parking_lot::Mutex;

use crate::config;
use crate::error::{Fault, Result};
use crate::thread::ThreadId;
use crate::time::Timespec;

pub mod portable;
#[cfg(unix)]
pub mod posix;
pub(crate) mod start;

pub use start::StartRecord;

#[cfg(all(unix, not(feature = "portable-substrate")))]
pub type Active = posix::Posix;
#[cfg(any(not(unix), feature = "portable-substrate"))]
pub type Active = portable::Portable;

/// Non-recursive, ownerless lock.
///
/// Ownership and recursion are tracked by [`crate::mutex::Mutex`]; a raw
/// lock only knows locked/unlocked.
pub trait RawLock: Send + Sync + Sized {
    fn new() -> Result<Self>;

    fn lock(&self) -> Result<()>;

    /// `Ok(true)` if acquired, `Ok(false)` if held elsewhere.
    fn try_lock(&self) -> Result<bool>;

    /// Acquire before the absolute `deadline`; `Ok(false)` on timeout.
    ///
    /// The default polls [`RawLock::try_lock`] with bounded sleeps of the
    /// configured interval, never sleeping past the deadline.
    fn lock_until(&self, deadline: Timespec) -> Result<bool> {
        let interval = config::timed_poll_interval();
        loop {
            if self.try_lock()? {
                return Ok(true);
            }
            let left = deadline.remaining();
            if left.is_zero() {
                return Ok(false);
            }
            std::thread::sleep(left.min(interval));
        }
    }

    /// # Safety
    ///
    /// The calling thread must hold the lock.
    unsafe fn unlock(&self) -> Result<()>;
}

/// Condition variable bound to one raw lock type.
pub trait RawCondvar<L: RawLock>: Send + Sync + Sized {
    fn new() -> Result<Self>;

    /// Atomically release `lock`, wait, and reacquire it.
    ///
    /// # Safety
    ///
    /// The calling thread must hold `lock`.
    unsafe fn wait(&self, lock: &L) -> Result<()>;

    /// As [`RawCondvar::wait`], bounded by `deadline`. `Ok(false)` on timeout;
    /// the lock is reacquired either way.
    ///
    /// # Safety
    ///
    /// The calling thread must hold `lock`.
    unsafe fn wait_until(&self, lock: &L, deadline: Timespec) -> Result<bool>;

    fn signal(&self) -> Result<()>;

    fn broadcast(&self) -> Result<()>;
}

/// Exactly-once cell.
pub trait RawOnce: Send + Sync + Sized {
    const INIT: Self;

    /// Run `init` if this is the first call; otherwise wait until the first
    /// call has finished. A panic in `init` still completes the cell and is
    /// resumed in the winning caller.
    fn call_once(&self, init: &mut dyn FnMut());
}

/// Process-wide thread-local key holding one `usize` per thread.
pub trait RawKey: Copy + Send + Sync + 'static {
    fn create(dtor: Option<fn(usize)>) -> Result<Self>;

    /// Value for the calling thread; `0` when unset or the key is deleted.
    fn get(self) -> usize;

    fn set(self, value: usize) -> Result<()>;

    fn delete(self) -> Result<()>;
}

/// One native threading substrate.
pub trait Substrate: Sized + 'static {
    /// Stable name used in logs and reports.
    const NAME: &'static str;

    type Lock: RawLock;
    type Condvar: RawCondvar<Self::Lock>;
    type Once: RawOnce;
    type Key: RawKey;

    /// Start a thread running `record` and register it for join/detach.
    /// Returns once the new thread has taken the record.
    fn spawn(record: StartRecord) -> Result<()>;

    fn join(id: ThreadId) -> Result<i32>;

    fn detach(id: ThreadId) -> Result<()>;

    fn sleep(duration: Duration, remaining: Option<&mut Duration>) -> Result<()>;

    fn yield_now();

    /// Run this substrate's thread-local destructors for the exiting thread.
    fn run_exit_destructors();
}

/// Shared state between a spawned thread and its join-table entry.
#[derive(Debug, Default)]
pub(crate) struct Packet {
    outcome: Mutex<Option<Outcome>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Outcome {
    Exited(i32),
    Panicked,
}

impl Packet {
    pub(crate) fn finish(&self, outcome: Outcome) {
        *self.outcome.lock() = Some(outcome);
    }

    /// Exit code once the thread has terminated.
    pub(crate) fn exit_code(&self) -> Result<i32> {
        match *self.outcome.lock() {
            Some(Outcome::Exited(code)) => Ok(code),
            Some(Outcome::Panicked) => Err(Fault::Panicked.into()),
            None => Err(Fault::StartLost.into()),
        }
    }
}

pub(crate) struct Joinable<H> {
    pub native: H,
    pub packet: Arc<Packet>,
}

/// Threads that can still be joined or detached, keyed by identity.
///
/// Join and detach both remove the entry, so a second consumption of the
/// same handle finds nothing and reports `NotJoinable`.
pub(crate) struct JoinTable<H> {
    entries: OnceLock<Mutex<HashMap<ThreadId, Joinable<H>>>>,
}

impl<H> JoinTable<H> {
    pub(crate) const fn new() -> Self {
        Self {
            entries: OnceLock::new(),
        }
    }

    fn map(&self) -> &Mutex<HashMap<ThreadId, Joinable<H>>> {
        self.entries.get_or_init(|| Mutex::new(HashMap::new()))
    }

    pub(crate) fn insert(&self, id: ThreadId, native: H, packet: Arc<Packet>) {
        self.map().lock().insert(id, Joinable { native, packet });
    }

    pub(crate) fn take(&self, id: ThreadId) -> Result<Joinable<H>> {
        self.map()
            .lock()
            .remove(&id)
            .ok_or_else(|| Fault::NotJoinable.into())
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, id: ThreadId) -> bool {
        self.map().lock().contains_key(&id)
    }
}
