//! Mutexes: plain, recursive, timed.
//!
//! Each flavor sits on the substrate's raw non-recursive lock. Owner and
//! depth are tracked here, next to the lock, so recursion, owner-only
//! unlock and relock detection behave the same on every substrate:
//!
//! - relock of a non-recursive mutex by its owner is `Error(Deadlock)`;
//! - `try_lock` by the owner of a non-recursive mutex is `Busy`;
//! - unlock by a thread that does not hold the mutex is `Error(NotOwner)`.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::error::{Fault, Result, Status, ThreadError};
use crate::sys::{Active, RawLock, Substrate};
use crate::thread::{self, ThreadId};
use crate::time::Timespec;

// ---------------------------------------------------------------------------
// Flavors
// ---------------------------------------------------------------------------

/// Mutex flavor bitset. `PLAIN` is the empty set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MutexKind(u8);

impl MutexKind {
    pub const PLAIN: Self = Self(0);
    pub const RECURSIVE: Self = Self(1);
    pub const TIMED: Self = Self(2);

    const ALL_BITS: u8 = Self::RECURSIVE.0 | Self::TIMED.0;

    /// Parse raw flavor bits; unknown bits are rejected.
    #[must_use]
    pub const fn from_bits(bits: i32) -> Option<Self> {
        if bits < 0 || bits > Self::ALL_BITS as i32 {
            None
        } else {
            Some(Self(bits as u8))
        }
    }

    #[must_use]
    pub const fn bits(self) -> i32 {
        self.0 as i32
    }

    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    #[must_use]
    pub const fn is_recursive(self) -> bool {
        self.0 & Self::RECURSIVE.0 != 0
    }

    #[must_use]
    pub const fn is_timed(self) -> bool {
        self.0 & Self::TIMED.0 != 0
    }
}

impl std::ops::BitOr for MutexKind {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

// ---------------------------------------------------------------------------
// Ownership
// ---------------------------------------------------------------------------

/// Owner identity and reentry depth. `owner == 0` means unheld.
///
/// Only the holder writes these fields, and only while it holds the raw
/// lock; a thread reading its own id back can only have written it itself,
/// so relaxed ordering suffices.
#[derive(Debug, Default)]
pub(crate) struct Ownership {
    owner: AtomicU64,
    depth: AtomicU32,
}

impl Ownership {
    pub(crate) fn is_held_by(&self, me: ThreadId) -> bool {
        self.owner.load(Ordering::Relaxed) == me.as_u64()
    }

    fn is_held(&self) -> bool {
        self.owner.load(Ordering::Relaxed) != 0
    }

    fn claim(&self, me: ThreadId) {
        self.owner.store(me.as_u64(), Ordering::Relaxed);
        self.depth.store(1, Ordering::Relaxed);
    }

    fn reenter(&self) -> Result<()> {
        let depth = self.depth.load(Ordering::Relaxed);
        let next = depth.checked_add(1).ok_or(Fault::DepthOverflow)?;
        self.depth.store(next, Ordering::Relaxed);
        Ok(())
    }

    /// Drop one level; `true` when the raw lock must be released.
    fn release(&self) -> bool {
        let depth = self.depth.load(Ordering::Relaxed).saturating_sub(1);
        self.depth.store(depth, Ordering::Relaxed);
        if depth == 0 {
            self.owner.store(0, Ordering::Relaxed);
            true
        } else {
            false
        }
    }

    /// Give up ownership entirely, returning the depth to restore later.
    pub(crate) fn suspend(&self) -> u32 {
        let depth = self.depth.swap(0, Ordering::Relaxed);
        self.owner.store(0, Ordering::Relaxed);
        depth
    }

    pub(crate) fn restore(&self, me: ThreadId, depth: u32) {
        self.owner.store(me.as_u64(), Ordering::Relaxed);
        self.depth.store(depth, Ordering::Relaxed);
    }

    fn depth(&self) -> u32 {
        self.depth.load(Ordering::Relaxed)
    }
}

// ---------------------------------------------------------------------------
// Mutex
// ---------------------------------------------------------------------------

/// Mutual-exclusion lock of a fixed [`MutexKind`].
pub struct Mutex<S: Substrate = Active> {
    pub(crate) raw: S::Lock,
    pub(crate) ownership: Ownership,
    kind: MutexKind,
}

impl Mutex {
    /// Create an unlocked mutex of `kind` on the active substrate.
    pub fn new(kind: MutexKind) -> Result<Self> {
        Self::new_in(kind)
    }
}

impl<S: Substrate> Mutex<S> {
    /// Create an unlocked mutex of `kind` on substrate `S`.
    pub fn new_in(kind: MutexKind) -> Result<Self> {
        Ok(Self {
            raw: S::Lock::new()?,
            ownership: Ownership::default(),
            kind,
        })
    }

    #[must_use]
    pub fn kind(&self) -> MutexKind {
        self.kind
    }

    /// Whether the calling thread holds this mutex.
    #[must_use]
    pub fn is_held_by_current(&self) -> bool {
        self.ownership.is_held_by(thread::current_id())
    }

    /// Reentry depth of the calling thread; `0` if it does not hold the mutex.
    #[must_use]
    pub fn depth(&self) -> u32 {
        if self.is_held_by_current() {
            self.ownership.depth()
        } else {
            0
        }
    }

    fn relock(&self) -> Result<()> {
        if self.kind.is_recursive() {
            self.ownership.reenter()
        } else {
            Err(Fault::Deadlock.into())
        }
    }

    /// Block until the mutex is acquired.
    pub fn lock(&self) -> Result<()> {
        let me = thread::current_id();
        if self.ownership.is_held_by(me) {
            return self.relock();
        }
        self.raw.lock()?;
        self.ownership.claim(me);
        Ok(())
    }

    /// Acquire without blocking; `Busy` if held elsewhere, or by the caller
    /// on a non-recursive mutex.
    pub fn try_lock(&self) -> Result<()> {
        let me = thread::current_id();
        if self.ownership.is_held_by(me) {
            return if self.kind.is_recursive() {
                self.ownership.reenter()
            } else {
                Err(ThreadError::Busy)
            };
        }
        if !self.raw.try_lock()? {
            return Err(ThreadError::Busy);
        }
        self.ownership.claim(me);
        Ok(())
    }

    /// Acquire before the absolute realtime `deadline`.
    pub fn timed_lock(&self, deadline: Timespec) -> Result<()> {
        if !self.kind.is_timed() {
            return Err(Fault::NotTimed.into());
        }
        deadline.validate()?;
        let me = thread::current_id();
        if self.ownership.is_held_by(me) {
            return self.relock();
        }
        if !self.raw.lock_until(deadline)? {
            return Err(ThreadError::TimedOut);
        }
        self.ownership.claim(me);
        Ok(())
    }

    /// Release one level of ownership.
    #[allow(unsafe_code)]
    pub fn unlock(&self) -> Result<()> {
        let me = thread::current_id();
        if !self.ownership.is_held_by(me) {
            return Err(Fault::NotOwner.into());
        }
        if self.ownership.release() {
            // SAFETY: the caller owned the mutex at depth one, so it holds
            // the raw lock.
            if let Err(err) = unsafe { self.raw.unlock() } {
                // Still raw-locked; the caller keeps ownership.
                self.ownership.restore(me, 1);
                return Err(err);
            }
        }
        Ok(())
    }

    /// Release the mutex's resources. A mutex still held is freed as well.
    pub fn destroy(self) {
        drop(self);
    }
}

impl<S: Substrate> std::fmt::Debug for Mutex<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mutex")
            .field("substrate", &S::NAME)
            .field("kind", &self.kind)
            .field("held", &self.ownership.is_held())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Transition contract
// ---------------------------------------------------------------------------

/// Abstract state of a live mutex, from the caller's point of view.
///
/// A `Mutex` exists only between `new` and `destroy`, so there is no
/// uninitialized or destroyed state to describe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutexContractState {
    Unlocked,
    /// Held by the calling thread.
    LockedBySelf,
    /// Held by a different thread.
    LockedByOther,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutexContractOp {
    Lock,
    TryLock,
    TimedLock,
    Unlock,
}

/// Deterministic result of one contract operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MutexContractOutcome {
    /// Next abstract state.
    pub next: MutexContractState,
    /// Status the operation reports once it completes.
    pub status: Status,
    /// Whether the operation waits on progress by another thread.
    pub blocks: bool,
}

const fn outcome(next: MutexContractState, status: Status, blocks: bool) -> MutexContractOutcome {
    MutexContractOutcome {
        next,
        status,
        blocks,
    }
}

/// Transition contract for every flavor.
///
/// `LockedBySelf` is depth one: unlocking it yields `Unlocked` even for a
/// recursive mutex. A timed lock against `LockedByOther` is described for a
/// holder that never releases, hence `TimedOut`.
#[must_use]
pub const fn mutex_contract_transition(
    kind: MutexKind,
    state: MutexContractState,
    op: MutexContractOp,
) -> MutexContractOutcome {
    use MutexContractOp as Op;
    use MutexContractState as St;

    if matches!(op, Op::TimedLock) && !kind.is_timed() {
        return outcome(state, Status::Error, false);
    }

    match state {
        St::Unlocked => match op {
            Op::Lock | Op::TryLock | Op::TimedLock => {
                outcome(St::LockedBySelf, Status::Success, false)
            }
            Op::Unlock => outcome(St::Unlocked, Status::Error, false),
        },
        St::LockedByOther => match op {
            Op::TryLock => outcome(St::LockedByOther, Status::Busy, false),
            Op::Lock => outcome(St::LockedByOther, Status::Success, true),
            Op::TimedLock => outcome(St::LockedByOther, Status::TimedOut, true),
            Op::Unlock => outcome(St::LockedByOther, Status::Error, false),
        },
        St::LockedBySelf => match op {
            Op::Unlock => outcome(St::Unlocked, Status::Success, false),
            Op::TryLock => {
                if kind.is_recursive() {
                    outcome(St::LockedBySelf, Status::Success, false)
                } else {
                    outcome(St::LockedBySelf, Status::Busy, false)
                }
            }
            Op::Lock | Op::TimedLock => {
                if kind.is_recursive() {
                    outcome(St::LockedBySelf, Status::Success, false)
                } else {
                    outcome(St::LockedBySelf, Status::Error, false)
                }
            }
        },
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
