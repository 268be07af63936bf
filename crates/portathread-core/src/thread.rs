//! Thread lifecycle: create, equal, current, sleep, yield, exit, detach,
//! join.
//!
//! A [`Thread`] is a copyable identity. Join/detach capability lives in the
//! substrate's join table, so a handle can be consumed exactly once; the
//! second consumption reports `Error(NotJoinable)`.
//!
//! Identities come from a process-wide counter and are never reused.
//! Threads not created through this layer get one lazily on first use.

use std::cell::Cell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::error::{Fault, Result};
use crate::sys::start::ExitRequest;
use crate::sys::{Active, StartRecord, Substrate};

/// Process-unique thread identity. Never zero, never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(u64);

impl ThreadId {
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ThreadId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "thread#{}", self.0)
    }
}

static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static SELF_ID: Cell<u64> = const { Cell::new(0) };
}

pub(crate) fn fresh_id() -> ThreadId {
    ThreadId(NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed))
}

/// Identity of the calling thread, assigned on first use.
pub(crate) fn current_id() -> ThreadId {
    SELF_ID.with(|slot| {
        let existing = slot.get();
        if existing != 0 {
            return ThreadId(existing);
        }
        let id = fresh_id();
        slot.set(id.0);
        id
    })
}

/// Bind the calling thread to the identity its creator allocated.
pub(crate) fn adopt_id(id: ThreadId) {
    SELF_ID.with(|slot| slot.set(id.0));
}

/// Handle naming one thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Thread {
    id: ThreadId,
}

impl Thread {
    #[must_use]
    pub const fn id(&self) -> ThreadId {
        self.id
    }
}

/// Start a thread running `start` on the active substrate.
///
/// Returns once the new thread holds its start record. Fails with `NoMem`
/// when no execution context can be allocated.
pub fn create<F>(start: F) -> Result<Thread>
where
    F: FnOnce() -> i32 + Send + 'static,
{
    create_on::<Active, F>(start)
}

/// [`create`] on an explicit substrate.
pub fn create_on<S, F>(start: F) -> Result<Thread>
where
    S: Substrate,
    F: FnOnce() -> i32 + Send + 'static,
{
    let id = fresh_id();
    S::spawn(StartRecord::new(id, Box::new(start)))?;
    Ok(Thread { id })
}

/// Start a thread calling `start(arg)`.
pub fn create_raw(start: fn(usize) -> i32, arg: usize) -> Result<Thread> {
    create(move || start(arg))
}

#[must_use]
pub fn equal(a: Thread, b: Thread) -> bool {
    a.id == b.id
}

/// Handle for the calling thread.
#[must_use]
pub fn current() -> Thread {
    Thread { id: current_id() }
}

/// Sleep at least `duration`.
///
/// On early wakeup returns `Error(Interrupted)` and stores the unslept
/// remainder in `remaining`; on completion stores zero.
pub fn sleep(duration: Duration, remaining: Option<&mut Duration>) -> Result<()> {
    Active::sleep(duration, remaining)
}

pub fn yield_now() {
    Active::yield_now();
}

/// Terminate the calling thread with `code` as its result.
///
/// Unwinds to the thread trampoline without invoking the panic hook; the
/// trampoline runs thread-local destructors and records `code` for `join`.
/// On a thread not created by this crate the unwind ends that thread like an
/// uncaught panic.
pub fn exit(code: i32) -> ! {
    std::panic::resume_unwind(Box::new(ExitRequest(code)))
}

/// Release `thread`'s resources on termination; it can no longer be joined.
pub fn detach(thread: Thread) -> Result<()> {
    detach_on::<Active>(thread)
}

pub fn detach_on<S: Substrate>(thread: Thread) -> Result<()> {
    S::detach(thread.id)
}

/// Wait for `thread` to terminate and return its exit code.
pub fn join(thread: Thread) -> Result<i32> {
    join_on::<Active>(thread)
}

pub fn join_on<S: Substrate>(thread: Thread) -> Result<i32> {
    if thread.id == current_id() {
        return Err(Fault::Deadlock.into());
    }
    S::join(thread.id)
}
