//! POSIX substrate: `pthread_*` through `libc`.
//!
//! Raw locks are `PTHREAD_MUTEX_NORMAL` mutexes; recursion and ownership
//! checks happen above this layer so both substrates report the same
//! errors. `pthread_mutex_timedlock` is used where the platform has it and
//! the polling default elsewhere.
//!
//! Thread-local values are boxed `(destructor, value)` slots stored in a
//! `pthread_key_t`; the key's C destructor frees the slot and calls the
//! user destructor, so the platform drives the repeated destructor passes.

#![allow(unsafe_code)]

use std::cell::{Cell, UnsafeCell};
use std::collections::BTreeMap;
use std::ffi::c_void;
use std::mem;
use std::panic::{AssertUnwindSafe, catch_unwind, resume_unwind};
use std::ptr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use parking_lot::{RwLock, const_rwlock};

use super::start::{self, Pickup, StartRecord};
use super::{JoinTable, RawCondvar, RawKey, RawLock, RawOnce, Substrate, portable};
use crate::config;
use crate::error::{Fault, Result, ThreadError};
use crate::thread::ThreadId;
use crate::time::Timespec;

/// The `pthread` substrate.
#[derive(Debug, Clone, Copy, Default)]
pub struct Posix;

/// Map a nonzero pthread return code.
fn from_errno(rc: libc::c_int) -> ThreadError {
    match rc {
        libc::ETIMEDOUT => ThreadError::TimedOut,
        libc::EBUSY => ThreadError::Busy,
        libc::ENOMEM => ThreadError::NoMem,
        libc::EPERM => Fault::NotOwner.into(),
        libc::EDEADLK => Fault::Deadlock.into(),
        other => Fault::Os(other).into(),
    }
}

fn check(rc: libc::c_int) -> Result<()> {
    if rc == 0 { Ok(()) } else { Err(from_errno(rc)) }
}

fn last_errno() -> libc::c_int {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

fn to_libc_timespec(ts: Timespec) -> libc::timespec {
    // SAFETY: timespec is plain data; zero is a valid value.
    let mut out: libc::timespec = unsafe { mem::zeroed() };
    out.tv_sec = libc::time_t::try_from(ts.tv_sec).unwrap_or(libc::time_t::MAX);
    out.tv_nsec = ts.tv_nsec as libc::c_long;
    out
}

fn duration_to_libc(d: Duration) -> libc::timespec {
    // SAFETY: timespec is plain data; zero is a valid value.
    let mut out: libc::timespec = unsafe { mem::zeroed() };
    out.tv_sec = libc::time_t::try_from(d.as_secs()).unwrap_or(libc::time_t::MAX);
    out.tv_nsec = d.subsec_nanos() as libc::c_long;
    out
}

// ---------------------------------------------------------------------------
// Threads
// ---------------------------------------------------------------------------

struct NativeThread(libc::pthread_t);

// SAFETY: a pthread_t is an identifier usable from any thread.
unsafe impl Send for NativeThread {}

static THREADS: JoinTable<NativeThread> = JoinTable::new();

/// What the new thread runs first, boxed across `pthread_create`.
struct Launch {
    entry: fn(Pickup),
    pickup: Pickup,
}

extern "C" fn thread_start(arg: *mut c_void) -> *mut c_void {
    // SAFETY: `arg` is the `Box<Launch>` leaked by `start_native`, passed
    // exactly once.
    let launch = *unsafe { Box::from_raw(arg.cast::<Launch>()) };
    (launch.entry)(launch.pickup);
    ptr::null_mut()
}

fn stack_size() -> usize {
    // SAFETY: sysconf has no preconditions.
    let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    let page = if page > 0 { page as usize } else { 4096 };
    config::stack_size()
        .max(libc::PTHREAD_STACK_MIN)
        .div_ceil(page)
        .saturating_mul(page)
}

fn create_error(rc: libc::c_int) -> ThreadError {
    match rc {
        libc::EAGAIN | libc::ENOMEM => ThreadError::NoMem,
        other => Fault::Os(other).into(),
    }
}

fn start_native(entry: fn(Pickup), pickup: Pickup) -> Result<libc::pthread_t> {
    let arg = Box::into_raw(Box::new(Launch { entry, pickup }));
    // SAFETY: attr is initialised before use and destroyed exactly once.
    let mut attr: libc::pthread_attr_t = unsafe { mem::zeroed() };
    let mut rc = unsafe { libc::pthread_attr_init(&mut attr) };
    if rc != 0 {
        // SAFETY: `arg` was never handed to a thread.
        drop(unsafe { Box::from_raw(arg) });
        return Err(create_error(rc));
    }
    // SAFETY: pthread_t is plain data; zero is a valid placeholder.
    let mut native: libc::pthread_t = unsafe { mem::zeroed() };
    unsafe {
        rc = libc::pthread_attr_setstacksize(&mut attr, stack_size());
        if rc == 0 {
            rc = libc::pthread_create(&mut native, &attr, thread_start, arg.cast());
        }
        libc::pthread_attr_destroy(&mut attr);
    }
    if rc != 0 {
        // SAFETY: creation failed, so the thread never took `arg`.
        drop(unsafe { Box::from_raw(arg) });
        return Err(create_error(rc));
    }
    Ok(native)
}

/// Start a thread running `entry` and hand it `record`.
fn launch(record: StartRecord, entry: fn(Pickup)) -> Result<()> {
    let (handoff, pickup) = start::handshake();
    let id = record.id();
    let native = start_native(entry, pickup)?;
    THREADS.insert(id, NativeThread(native), record.packet());
    if handoff.deliver(record).is_err() {
        if let Ok(lost) = THREADS.take(id) {
            // SAFETY: joinable thread created above, joined once.
            unsafe { libc::pthread_join(lost.native.0, ptr::null_mut()) };
        }
        return Err(Fault::StartLost.into());
    }
    Ok(())
}

impl Substrate for Posix {
    const NAME: &'static str = "posix";

    type Lock = PosixLock;
    type Condvar = PosixCondvar;
    type Once = PosixOnce;
    type Key = PosixKey;

    fn spawn(record: StartRecord) -> Result<()> {
        launch(record, Pickup::run::<Posix>)
    }

    fn join(id: ThreadId) -> Result<i32> {
        let entry = THREADS.take(id)?;
        // SAFETY: the entry was removed from the table, so this is the only join.
        check(unsafe { libc::pthread_join(entry.native.0, ptr::null_mut()) })?;
        entry.packet.exit_code()
    }

    fn detach(id: ThreadId) -> Result<()> {
        let entry = THREADS.take(id)?;
        // SAFETY: as for join; the handle is consumed here.
        check(unsafe { libc::pthread_detach(entry.native.0) })
    }

    fn sleep(duration: Duration, remaining: Option<&mut Duration>) -> Result<()> {
        let request = duration_to_libc(duration);
        // SAFETY: timespec is plain data.
        let mut left: libc::timespec = unsafe { mem::zeroed() };
        // SAFETY: both pointers reference live stack values.
        let rc = unsafe { libc::nanosleep(&request, &mut left) };
        if rc == 0 {
            if let Some(remaining) = remaining {
                *remaining = Duration::ZERO;
            }
            return Ok(());
        }
        match last_errno() {
            libc::EINTR => {
                if let Some(remaining) = remaining {
                    *remaining = Duration::new(
                        u64::try_from(left.tv_sec).unwrap_or(0),
                        u32::try_from(left.tv_nsec).unwrap_or(0),
                    );
                }
                Err(Fault::Interrupted.into())
            }
            errno => Err(Fault::Os(errno).into()),
        }
    }

    fn yield_now() {
        // SAFETY: no preconditions.
        unsafe { libc::sched_yield() };
    }

    fn run_exit_destructors() {
        // pthread runs its own key destructors after the start routine
        // returns; only keys from the portable registry need a pass here.
        portable::run_key_destructors();
    }
}

// ---------------------------------------------------------------------------
// Lock
// ---------------------------------------------------------------------------

/// Boxed `PTHREAD_MUTEX_NORMAL` mutex; pthread objects must not move.
pub struct PosixLock {
    inner: Box<UnsafeCell<libc::pthread_mutex_t>>,
}

// SAFETY: pthread mutexes are designed for cross-thread use.
unsafe impl Send for PosixLock {}
unsafe impl Sync for PosixLock {}

impl PosixLock {
    fn as_ptr(&self) -> *mut libc::pthread_mutex_t {
        self.inner.get()
    }
}

impl RawLock for PosixLock {
    fn new() -> Result<Self> {
        let lock = Self {
            inner: Box::new(UnsafeCell::new(libc::PTHREAD_MUTEX_INITIALIZER)),
        };
        // SAFETY: attr lives on the stack for the duration of init.
        unsafe {
            let mut attr: libc::pthread_mutexattr_t = mem::zeroed();
            check(libc::pthread_mutexattr_init(&mut attr))?;
            let mut rc = libc::pthread_mutexattr_settype(&mut attr, libc::PTHREAD_MUTEX_NORMAL);
            if rc == 0 {
                rc = libc::pthread_mutex_init(lock.as_ptr(), &attr);
            }
            libc::pthread_mutexattr_destroy(&mut attr);
            check(rc)?;
        }
        Ok(lock)
    }

    fn lock(&self) -> Result<()> {
        // SAFETY: initialised in `new`, pinned by the box.
        check(unsafe { libc::pthread_mutex_lock(self.as_ptr()) })
    }

    fn try_lock(&self) -> Result<bool> {
        // SAFETY: as above.
        match unsafe { libc::pthread_mutex_trylock(self.as_ptr()) } {
            0 => Ok(true),
            libc::EBUSY => Ok(false),
            rc => Err(from_errno(rc)),
        }
    }

    #[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
    fn lock_until(&self, deadline: Timespec) -> Result<bool> {
        let abstime = to_libc_timespec(deadline);
        // SAFETY: as above; abstime outlives the call.
        match unsafe { libc::pthread_mutex_timedlock(self.as_ptr(), &abstime) } {
            0 => Ok(true),
            libc::ETIMEDOUT => Ok(false),
            rc => Err(from_errno(rc)),
        }
    }

    unsafe fn unlock(&self) -> Result<()> {
        // SAFETY: caller holds the lock.
        check(unsafe { libc::pthread_mutex_unlock(self.as_ptr()) })
    }
}

impl Drop for PosixLock {
    fn drop(&mut self) {
        // Destroying a locked mutex is undefined on some platforms; a mutex
        // dropped while held is only freed.
        // SAFETY: exclusive access through `&mut self`.
        unsafe {
            if libc::pthread_mutex_trylock(self.as_ptr()) == 0 {
                libc::pthread_mutex_unlock(self.as_ptr());
                libc::pthread_mutex_destroy(self.as_ptr());
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Condition variable
// ---------------------------------------------------------------------------

/// Boxed `pthread_cond_t` on the realtime clock.
pub struct PosixCondvar {
    inner: Box<UnsafeCell<libc::pthread_cond_t>>,
}

// SAFETY: pthread condition variables are designed for cross-thread use.
unsafe impl Send for PosixCondvar {}
unsafe impl Sync for PosixCondvar {}

impl PosixCondvar {
    fn as_ptr(&self) -> *mut libc::pthread_cond_t {
        self.inner.get()
    }
}

impl RawCondvar<PosixLock> for PosixCondvar {
    fn new() -> Result<Self> {
        let cv = Self {
            inner: Box::new(UnsafeCell::new(libc::PTHREAD_COND_INITIALIZER)),
        };
        // SAFETY: fresh, pinned storage; default attributes.
        check(unsafe { libc::pthread_cond_init(cv.as_ptr(), ptr::null()) })?;
        Ok(cv)
    }

    unsafe fn wait(&self, lock: &PosixLock) -> Result<()> {
        // SAFETY: caller holds `lock`.
        check(unsafe { libc::pthread_cond_wait(self.as_ptr(), lock.as_ptr()) })
    }

    unsafe fn wait_until(&self, lock: &PosixLock, deadline: Timespec) -> Result<bool> {
        let abstime = to_libc_timespec(deadline);
        // SAFETY: caller holds `lock`; abstime outlives the call.
        match unsafe { libc::pthread_cond_timedwait(self.as_ptr(), lock.as_ptr(), &abstime) } {
            0 => Ok(true),
            libc::ETIMEDOUT => Ok(false),
            rc => Err(from_errno(rc)),
        }
    }

    fn signal(&self) -> Result<()> {
        // SAFETY: initialised in `new`.
        check(unsafe { libc::pthread_cond_signal(self.as_ptr()) })
    }

    fn broadcast(&self) -> Result<()> {
        // SAFETY: initialised in `new`.
        check(unsafe { libc::pthread_cond_broadcast(self.as_ptr()) })
    }
}

impl Drop for PosixCondvar {
    fn drop(&mut self) {
        // SAFETY: no waiters can exist while we hold `&mut self`.
        unsafe { libc::pthread_cond_destroy(self.as_ptr()) };
    }
}

// ---------------------------------------------------------------------------
// Once
// ---------------------------------------------------------------------------

/// `pthread_once_t`.
pub struct PosixOnce {
    control: UnsafeCell<libc::pthread_once_t>,
}

// SAFETY: pthread_once synchronizes all access to the control word.
unsafe impl Send for PosixOnce {}
unsafe impl Sync for PosixOnce {}

thread_local! {
    // Thin pointer to the `&mut dyn FnMut()` the current `pthread_once`
    // call should run. pthread_once passes no argument to its routine.
    static ONCE_INIT: Cell<usize> = const { Cell::new(0) };
}

extern "C" fn run_once_init() {
    let slot = ONCE_INIT.with(|cell| cell.replace(0));
    if slot != 0 {
        // SAFETY: set by `call_once` on this thread; the referent outlives
        // the enclosing pthread_once call.
        let init = unsafe { &mut *(slot as *mut &mut dyn FnMut()) };
        init();
    }
}

impl RawOnce for PosixOnce {
    const INIT: Self = Self {
        control: UnsafeCell::new(libc::PTHREAD_ONCE_INIT),
    };

    fn call_once(&self, init: &mut dyn FnMut()) {
        let mut panicked = None;
        let mut guarded = || {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(&mut *init)) {
                panicked = Some(payload);
            }
        };
        let mut erased: &mut dyn FnMut() = &mut guarded;
        let thin = ptr::addr_of_mut!(erased) as usize;
        let previous = ONCE_INIT.with(|cell| cell.replace(thin));
        // SAFETY: control is a valid once word; the routine cannot unwind.
        unsafe { libc::pthread_once(self.control.get(), run_once_init) };
        ONCE_INIT.with(|cell| cell.set(previous));
        if let Some(payload) = panicked {
            resume_unwind(payload);
        }
    }
}

// ---------------------------------------------------------------------------
// Thread-local keys
// ---------------------------------------------------------------------------

/// `pthread_key_t` plus the user destructor stored in each slot.
///
/// The platform reissues a deleted key's index, so each handle also carries
/// the generation it was created under; handles whose generation is no
/// longer live are rejected.
#[derive(Debug, Clone, Copy)]
pub struct PosixKey {
    key: libc::pthread_key_t,
    seq: u32,
    dtor: Option<fn(usize)>,
}

/// Generation of every live key, by index.
static LIVE_KEYS: RwLock<BTreeMap<libc::pthread_key_t, u32>> = const_rwlock(BTreeMap::new());

static NEXT_SEQ: AtomicU32 = AtomicU32::new(1);

struct Slot {
    dtor: Option<fn(usize)>,
    value: usize,
}

unsafe extern "C" fn release_slot(ptr: *mut c_void) {
    // SAFETY: every non-null value stored under our keys is a leaked `Box<Slot>`.
    let slot = unsafe { Box::from_raw(ptr.cast::<Slot>()) };
    if slot.value != 0 {
        if let Some(dtor) = slot.dtor {
            dtor(slot.value);
        }
    }
}

impl PosixKey {
    fn is_live(self) -> bool {
        LIVE_KEYS.read().get(&self.key) == Some(&self.seq)
    }

    fn slot(self) -> *mut Slot {
        // SAFETY: getspecific has no preconditions on a created key.
        unsafe { libc::pthread_getspecific(self.key) }.cast::<Slot>()
    }
}

impl RawKey for PosixKey {
    fn create(dtor: Option<fn(usize)>) -> Result<Self> {
        // SAFETY: pthread_key_t is plain data.
        let mut key: libc::pthread_key_t = unsafe { mem::zeroed() };
        // SAFETY: `key` is a valid out-pointer.
        match unsafe { libc::pthread_key_create(&mut key, Some(release_slot)) } {
            0 => {
                let seq = NEXT_SEQ.fetch_add(1, Ordering::Relaxed);
                LIVE_KEYS.write().insert(key, seq);
                Ok(Self { key, seq, dtor })
            }
            libc::EAGAIN => Err(Fault::KeysExhausted.into()),
            rc => Err(from_errno(rc)),
        }
    }

    fn get(self) -> usize {
        if !self.is_live() {
            return 0;
        }
        let slot = self.slot();
        if slot.is_null() {
            0
        } else {
            // SAFETY: non-null values under our keys are live `Slot`s owned
            // by this thread.
            unsafe { (*slot).value }
        }
    }

    fn set(self, value: usize) -> Result<()> {
        if !self.is_live() {
            return Err(Fault::InvalidKey.into());
        }
        let slot = self.slot();
        if !slot.is_null() {
            if value != 0 {
                // SAFETY: live slot owned by this thread.
                unsafe { (*slot).value = value };
                return Ok(());
            }
            // SAFETY: clear the key first so the destructor never sees the
            // freed slot.
            unsafe {
                let rc = libc::pthread_setspecific(self.key, ptr::null());
                drop(Box::from_raw(slot));
                return check(rc);
            }
        }
        if value == 0 {
            return Ok(());
        }
        let fresh = Box::into_raw(Box::new(Slot {
            dtor: self.dtor,
            value,
        }));
        // SAFETY: `fresh` is a leaked box now owned by the key.
        match unsafe { libc::pthread_setspecific(self.key, fresh.cast::<c_void>().cast_const()) } {
            0 => Ok(()),
            rc => {
                // SAFETY: the key rejected it, so we still own `fresh`.
                drop(unsafe { Box::from_raw(fresh) });
                Err(match rc {
                    libc::EINVAL => Fault::InvalidKey.into(),
                    other => from_errno(other),
                })
            }
        }
    }

    fn delete(self) -> Result<()> {
        let mut live = LIVE_KEYS.write();
        if live.get(&self.key) != Some(&self.seq) {
            return Err(Fault::InvalidKey.into());
        }
        live.remove(&self.key);
        // Free the calling thread's slot; other threads' slots are released
        // without destructors, as deletion never runs them.
        let slot = self.slot();
        if !slot.is_null() {
            // SAFETY: live slot owned by this thread, detached from the key
            // before it is freed.
            unsafe {
                libc::pthread_setspecific(self.key, ptr::null());
                drop(Box::from_raw(slot));
            }
        }
        // SAFETY: deleting a key has no memory-safety preconditions.
        match unsafe { libc::pthread_key_delete(self.key) } {
            0 => Ok(()),
            libc::EINVAL => Err(Fault::InvalidKey.into()),
            rc => Err(from_errno(rc)),
        }
    }
}
