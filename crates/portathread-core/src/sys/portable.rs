//! Portable substrate: `std::thread` for execution contexts, `parking_lot`
//! for locks and waiting, `thread_local!` for per-thread key values.
//!
//! ## Thread-local keys
//!
//! - **Key registry**: a fixed array of [`KEYS_MAX`] slots behind a
//!   `parking_lot::Mutex`, each tracking in-use state, destructor and a
//!   generation counter. The counter is bumped on create and delete, so it
//!   is odd while the key is live and stale handles are detected.
//! - **Live generations**: a parallel array of atomics mirrors each slot's
//!   generation so `get`/`set` validate a key without taking the lock.
//! - **Per-thread values**: a `thread_local!` vector of `(generation, value)`
//!   pairs indexed by key id. A value whose generation no longer matches the
//!   key reads as zero.
//! - **Teardown**: the thread trampoline runs up to `DESTRUCTOR_ITERATIONS`
//!   passes, each clearing every value before invoking destructors outside
//!   the borrow. Threads not started by this crate get one pass from the
//!   thread-local's own destructor.

#![allow(unsafe_code)]

use std::cell::RefCell;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::lock_api::{RawMutex as _, RawMutexTimed as _};
use parking_lot::{Condvar, Mutex, const_mutex};

use super::start::{self, Pickup, StartRecord};
use super::{JoinTable, RawCondvar, RawKey, RawLock, RawOnce, Substrate};
use crate::config;
use crate::error::{Fault, Result, ThreadError};
use crate::thread::ThreadId;
use crate::time::Timespec;
use crate::tss::DESTRUCTOR_ITERATIONS;

/// Maximum number of thread-local keys.
pub const KEYS_MAX: usize = 1024;

/// The `std` + `parking_lot` substrate.
#[derive(Debug, Clone, Copy, Default)]
pub struct Portable;

static THREADS: JoinTable<JoinHandle<()>> = JoinTable::new();

fn spawn_error(err: &io::Error) -> ThreadError {
    match err.kind() {
        io::ErrorKind::OutOfMemory | io::ErrorKind::WouldBlock => ThreadError::NoMem,
        _ => Fault::Os(err.raw_os_error().unwrap_or(0)).into(),
    }
}

/// Start a thread running `entry` and hand it `record`.
fn launch(record: StartRecord, entry: fn(Pickup)) -> Result<()> {
    let (handoff, pickup) = start::handshake();
    let id = record.id();
    let handle = std::thread::Builder::new()
        .stack_size(config::stack_size())
        .spawn(move || entry(pickup))
        .map_err(|err| spawn_error(&err))?;
    THREADS.insert(id, handle, record.packet());
    if handoff.deliver(record).is_err() {
        if let Ok(lost) = THREADS.take(id) {
            let _ = lost.native.join();
        }
        return Err(Fault::StartLost.into());
    }
    Ok(())
}

impl Substrate for Portable {
    const NAME: &'static str = "portable";

    type Lock = PortableLock;
    type Condvar = PortableCondvar;
    type Once = PortableOnce;
    type Key = PortableKey;

    fn spawn(record: StartRecord) -> Result<()> {
        launch(record, Pickup::run::<Portable>)
    }

    fn join(id: ThreadId) -> Result<i32> {
        let entry = THREADS.take(id)?;
        entry.native.join().map_err(|_| Fault::Panicked)?;
        entry.packet.exit_code()
    }

    fn detach(id: ThreadId) -> Result<()> {
        THREADS.take(id).map(drop)
    }

    fn sleep(duration: Duration, remaining: Option<&mut Duration>) -> Result<()> {
        std::thread::sleep(duration);
        if let Some(remaining) = remaining {
            *remaining = Duration::ZERO;
        }
        Ok(())
    }

    fn yield_now() {
        std::thread::yield_now();
    }

    fn run_exit_destructors() {
        run_key_destructors();
    }
}

// ---------------------------------------------------------------------------
// Lock
// ---------------------------------------------------------------------------

/// `parking_lot::RawMutex`.
pub struct PortableLock(parking_lot::RawMutex);

impl RawLock for PortableLock {
    fn new() -> Result<Self> {
        Ok(Self(<parking_lot::RawMutex as parking_lot::lock_api::RawMutex>::INIT))
    }

    fn lock(&self) -> Result<()> {
        self.0.lock();
        Ok(())
    }

    fn try_lock(&self) -> Result<bool> {
        Ok(self.0.try_lock())
    }

    fn lock_until(&self, deadline: Timespec) -> Result<bool> {
        match deadline.to_instant() {
            Some(at) => Ok(self.0.try_lock_until(at)),
            None => {
                self.0.lock();
                Ok(true)
            }
        }
    }

    unsafe fn unlock(&self) -> Result<()> {
        // SAFETY: caller holds the lock.
        unsafe { self.0.unlock() };
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Condition variable
// ---------------------------------------------------------------------------

/// Counting condition variable over a [`PortableLock`].
///
/// A waiter registers under the internal state lock before releasing the
/// user lock, so no signal can fall between the two. Each signal grants one
/// wakeup to a waiter that arrived before it (tracked by generation), so a
/// late arrival cannot steal a wakeup from an earlier waiter.
#[derive(Default)]
pub struct PortableCondvar {
    state: Mutex<CondState>,
    cv: Condvar,
}

#[derive(Default)]
struct CondState {
    waiters: usize,
    pending: usize,
    generation: u64,
}

impl CondState {
    fn can_wake(&self, entered_at: u64) -> bool {
        self.pending > 0 && self.generation != entered_at
    }
}

impl PortableCondvar {
    /// Wait until signalled or `deadline` passes. Returns whether a wakeup
    /// was consumed. The user lock is reacquired in both cases.
    unsafe fn wait_inner(&self, lock: &PortableLock, deadline: Option<Timespec>) -> Result<bool> {
        let at = match deadline {
            Some(deadline) => deadline.to_instant(),
            None => None,
        };
        let mut st = self.state.lock();
        let entered_at = st.generation;
        st.waiters += 1;
        // SAFETY: caller holds `lock`.
        if let Err(err) = unsafe { lock.unlock() } {
            st.waiters -= 1;
            return Err(err);
        }
        let mut woke = true;
        while !st.can_wake(entered_at) {
            match (deadline, at) {
                (Some(_), Some(at)) => {
                    if self.cv.wait_until(&mut st, at).timed_out() {
                        woke = st.can_wake(entered_at);
                        break;
                    }
                }
                (Some(_), None) | (None, _) => self.cv.wait(&mut st),
            }
        }
        if woke {
            st.pending -= 1;
        }
        st.waiters -= 1;
        drop(st);
        lock.lock()?;
        Ok(woke)
    }
}

impl RawCondvar<PortableLock> for PortableCondvar {
    fn new() -> Result<Self> {
        Ok(Self::default())
    }

    unsafe fn wait(&self, lock: &PortableLock) -> Result<()> {
        // SAFETY: forwarded caller contract.
        unsafe { self.wait_inner(lock, None) }.map(drop)
    }

    unsafe fn wait_until(&self, lock: &PortableLock, deadline: Timespec) -> Result<bool> {
        // SAFETY: forwarded caller contract.
        unsafe { self.wait_inner(lock, Some(deadline)) }
    }

    fn signal(&self) -> Result<()> {
        let mut st = self.state.lock();
        if st.waiters > st.pending {
            st.pending += 1;
            st.generation = st.generation.wrapping_add(1);
            drop(st);
            self.cv.notify_all();
        }
        Ok(())
    }

    fn broadcast(&self) -> Result<()> {
        let mut st = self.state.lock();
        if st.waiters > st.pending {
            st.pending = st.waiters;
            st.generation = st.generation.wrapping_add(1);
            drop(st);
            self.cv.notify_all();
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Once
// ---------------------------------------------------------------------------

const ONCE_READY: u8 = 0;
const ONCE_DONE: u8 = 1;

/// Binary once word plus a completion gate for losing racers.
pub struct PortableOnce {
    state: AtomicU8,
    finished: AtomicBool,
    gate: Mutex<bool>,
    cv: Condvar,
}

impl RawOnce for PortableOnce {
    const INIT: Self = Self {
        state: AtomicU8::new(ONCE_READY),
        finished: AtomicBool::new(false),
        gate: const_mutex(false),
        cv: Condvar::new(),
    };

    fn call_once(&self, init: &mut dyn FnMut()) {
        if self.finished.load(Ordering::Acquire) {
            return;
        }
        if self.state.swap(ONCE_DONE, Ordering::AcqRel) == ONCE_READY {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| init()));
            {
                let mut done = self.gate.lock();
                *done = true;
                self.finished.store(true, Ordering::Release);
            }
            self.cv.notify_all();
            if let Err(payload) = result {
                std::panic::resume_unwind(payload);
            }
            return;
        }
        let mut done = self.gate.lock();
        while !*done {
            self.cv.wait(&mut done);
        }
    }
}

// ---------------------------------------------------------------------------
// Thread-local keys
// ---------------------------------------------------------------------------

/// Key into the portable registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortableKey {
    id: u32,
    seq: u32,
}

#[derive(Clone, Copy)]
struct KeySlot {
    in_use: bool,
    destructor: Option<fn(usize)>,
    seq: u32,
}

const EMPTY_SLOT: KeySlot = KeySlot {
    in_use: false,
    destructor: None,
    seq: 0,
};

struct KeyRegistry {
    slots: [KeySlot; KEYS_MAX],
}

static REGISTRY: Mutex<KeyRegistry> = const_mutex(KeyRegistry {
    slots: [EMPTY_SLOT; KEYS_MAX],
});

static LIVE_SEQ: [AtomicU32; KEYS_MAX] = [const { AtomicU32::new(0) }; KEYS_MAX];

/// Serializes unit tests that create registry keys, so the exhaustion test
/// cannot starve the others.
#[cfg(test)]
pub(crate) static KEY_TEST_LOCK: Mutex<()> = const_mutex(());

impl PortableKey {
    fn is_live(self) -> bool {
        LIVE_SEQ[self.id as usize].load(Ordering::Acquire) == self.seq
    }
}

#[derive(Default)]
struct ThreadValues {
    /// `(generation, value)` per key id.
    entries: Vec<(u32, usize)>,
}

impl ThreadValues {
    fn get(&self, key: PortableKey) -> usize {
        match self.entries.get(key.id as usize) {
            Some(&(seq, value)) if seq == key.seq => value,
            _ => 0,
        }
    }

    fn set(&mut self, key: PortableKey, value: usize) {
        let idx = key.id as usize;
        if idx >= self.entries.len() {
            if value == 0 {
                return;
            }
            self.entries.resize(idx + 1, (0, 0));
        }
        self.entries[idx] = (key.seq, value);
    }

    /// Clear every value; return `(destructor, value)` for live keys that
    /// have a destructor.
    fn drain(&mut self) -> Vec<(fn(usize), usize)> {
        if self.entries.iter().all(|&(_, value)| value == 0) {
            return Vec::new();
        }
        let registry = REGISTRY.lock();
        let mut pending = Vec::new();
        for (idx, entry) in self.entries.iter_mut().enumerate() {
            let (seq, value) = std::mem::take(entry);
            if value == 0 {
                continue;
            }
            let slot = registry.slots[idx];
            if slot.in_use && slot.seq == seq {
                if let Some(dtor) = slot.destructor {
                    pending.push((dtor, value));
                }
            }
        }
        pending
    }
}

impl Drop for ThreadValues {
    fn drop(&mut self) {
        for (dtor, value) in self.drain() {
            dtor(value);
        }
    }
}

thread_local! {
    static VALUES: RefCell<ThreadValues> = RefCell::new(ThreadValues::default());
}

/// Destructor passes for the calling thread.
pub(crate) fn run_key_destructors() {
    for _ in 0..DESTRUCTOR_ITERATIONS {
        let pending = VALUES
            .try_with(|values| {
                values
                    .try_borrow_mut()
                    .map(|mut values| values.drain())
                    .unwrap_or_default()
            })
            .unwrap_or_default();
        if pending.is_empty() {
            break;
        }
        for (dtor, value) in pending {
            dtor(value);
        }
    }
    // Values stored by the final pass are dropped without another call.
    let _ = VALUES.try_with(|values| {
        if let Ok(mut values) = values.try_borrow_mut() {
            values.entries.clear();
        }
    });
}

impl RawKey for PortableKey {
    fn create(dtor: Option<fn(usize)>) -> Result<Self> {
        let mut registry = REGISTRY.lock();
        let (id, slot) = registry
            .slots
            .iter_mut()
            .enumerate()
            .find(|(_, slot)| !slot.in_use)
            .ok_or(Fault::KeysExhausted)?;
        slot.in_use = true;
        slot.destructor = dtor;
        slot.seq = slot.seq.wrapping_add(1);
        LIVE_SEQ[id].store(slot.seq, Ordering::Release);
        Ok(Self {
            id: id as u32,
            seq: slot.seq,
        })
    }

    fn get(self) -> usize {
        if !self.is_live() {
            return 0;
        }
        VALUES
            .try_with(|values| values.try_borrow().map_or(0, |values| values.get(self)))
            .unwrap_or(0)
    }

    fn set(self, value: usize) -> Result<()> {
        if !self.is_live() {
            return Err(Fault::InvalidKey.into());
        }
        VALUES
            .try_with(|values| {
                values
                    .try_borrow_mut()
                    .map(|mut values| values.set(self, value))
                    .map_err(|_| ThreadError::from(Fault::TornDown))
            })
            .map_err(|_| ThreadError::from(Fault::TornDown))?
    }

    fn delete(self) -> Result<()> {
        let mut registry = REGISTRY.lock();
        let slot = &mut registry.slots[self.id as usize];
        if !slot.in_use || slot.seq != self.seq {
            return Err(Fault::InvalidKey.into());
        }
        slot.in_use = false;
        slot.destructor = None;
        slot.seq = slot.seq.wrapping_add(1);
        LIVE_SEQ[self.id as usize].store(slot.seq, Ordering::Release);
        Ok(())
    }
}
