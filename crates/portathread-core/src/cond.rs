//! Condition variables.
//!
//! Waiting requires the caller to hold the paired [`Mutex`]. The whole
//! recursive hold is released for the wait and restored, at the same depth,
//! before `wait`/`timed_wait` return on every path, including timeout and
//! substrate errors. Spurious wakeups are permitted; callers re-check their
//! predicate.

use crate::error::{Fault, Result, ThreadError};
use crate::mutex::Mutex;
use crate::sys::{Active, RawCondvar, Substrate};
use crate::thread;
use crate::time::Timespec;

pub struct Condvar<S: Substrate = Active> {
    raw: S::Condvar,
}

impl Condvar {
    pub fn new() -> Result<Self> {
        Self::new_in()
    }
}

impl<S: Substrate> Condvar<S> {
    pub fn new_in() -> Result<Self> {
        Ok(Self {
            raw: S::Condvar::new()?,
        })
    }

    /// Release `mutex`, wait for a signal, reacquire `mutex`.
    #[allow(unsafe_code)]
    pub fn wait(&self, mutex: &Mutex<S>) -> Result<()> {
        let me = thread::current_id();
        if !mutex.ownership.is_held_by(me) {
            return Err(Fault::NotOwner.into());
        }
        let depth = mutex.ownership.suspend();
        // SAFETY: the caller owns `mutex`, so it holds the raw lock.
        let result = unsafe { self.raw.wait(&mutex.raw) };
        mutex.ownership.restore(me, depth);
        result
    }

    /// As [`Condvar::wait`], giving up with `TimedOut` once the absolute
    /// realtime `deadline` passes. The mutex is held again on return.
    #[allow(unsafe_code)]
    pub fn timed_wait(&self, mutex: &Mutex<S>, deadline: Timespec) -> Result<()> {
        deadline.validate()?;
        let me = thread::current_id();
        if !mutex.ownership.is_held_by(me) {
            return Err(Fault::NotOwner.into());
        }
        let depth = mutex.ownership.suspend();
        // SAFETY: the caller owns `mutex`, so it holds the raw lock.
        let result = unsafe { self.raw.wait_until(&mutex.raw, deadline) };
        mutex.ownership.restore(me, depth);
        if result? {
            Ok(())
        } else {
            Err(ThreadError::TimedOut)
        }
    }

    /// Wake at least one waiter, if any.
    pub fn signal(&self) -> Result<()> {
        self.raw.signal()
    }

    /// Wake every waiter.
    pub fn broadcast(&self) -> Result<()> {
        self.raw.broadcast()
    }

    pub fn destroy(self) {
        drop(self);
    }
}

impl<S: Substrate> std::fmt::Debug for Condvar<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Condvar").field("substrate", &S::NAME).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mutex::MutexKind;
    use crate::sys::portable::Portable;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    fn wait_requires_ownership<S: Substrate>() {
        let m = Mutex::<S>::new_in(MutexKind::PLAIN).unwrap();
        let cv = Condvar::<S>::new_in().unwrap();
        assert_eq!(cv.wait(&m), Err(Fault::NotOwner.into()));
        assert_eq!(
            cv.timed_wait(&m, Timespec::after(Duration::from_millis(1))),
            Err(Fault::NotOwner.into())
        );
        m.lock().unwrap();
        assert_eq!(
            cv.timed_wait(&m, Timespec::new(0, -1)),
            Err(Fault::InvalidTime(-1).into())
        );
        m.unlock().unwrap();
    }

    fn timed_wait_times_out_holding_mutex<S: Substrate>() {
        let m = Mutex::<S>::new_in(MutexKind::RECURSIVE).unwrap();
        let cv = Condvar::<S>::new_in().unwrap();
        m.lock().unwrap();
        m.lock().unwrap();
        let wait = Duration::from_millis(30);
        let start = Instant::now();
        assert_eq!(
            cv.timed_wait(&m, Timespec::after(wait)),
            Err(ThreadError::TimedOut)
        );
        assert!(start.elapsed() >= wait - Duration::from_millis(2));
        assert!(m.is_held_by_current());
        assert_eq!(m.depth(), 2);
        m.unlock().unwrap();
        m.unlock().unwrap();
    }

    fn signal_wakes_predicate_waiter<S: Substrate>() {
        let m = Arc::new(Mutex::<S>::new_in(MutexKind::PLAIN).unwrap());
        let cv = Arc::new(Condvar::<S>::new_in().unwrap());
        let ready = Arc::new(AtomicBool::new(false));
        let (m2, cv2, ready2) = (Arc::clone(&m), Arc::clone(&cv), Arc::clone(&ready));
        let waiter = std::thread::spawn(move || {
            m2.lock().unwrap();
            while !ready2.load(Ordering::SeqCst) {
                cv2.wait(&m2).unwrap();
            }
            assert!(m2.is_held_by_current());
            m2.unlock().unwrap();
        });
        std::thread::sleep(Duration::from_millis(10));
        m.lock().unwrap();
        ready.store(true, Ordering::SeqCst);
        cv.signal().unwrap();
        m.unlock().unwrap();
        waiter.join().unwrap();
    }

    fn broadcast_wakes_all<S: Substrate>() {
        let m = Arc::new(Mutex::<S>::new_in(MutexKind::PLAIN).unwrap());
        let cv = Arc::new(Condvar::<S>::new_in().unwrap());
        let go = Arc::new(AtomicBool::new(false));
        let woken = Arc::new(AtomicUsize::new(0));
        let workers: Vec<_> = (0..5)
            .map(|_| {
                let (m, cv, go, woken) = (
                    Arc::clone(&m),
                    Arc::clone(&cv),
                    Arc::clone(&go),
                    Arc::clone(&woken),
                );
                std::thread::spawn(move || {
                    m.lock().unwrap();
                    while !go.load(Ordering::SeqCst) {
                        cv.wait(&m).unwrap();
                    }
                    woken.fetch_add(1, Ordering::SeqCst);
                    m.unlock().unwrap();
                })
            })
            .collect();
        std::thread::sleep(Duration::from_millis(10));
        m.lock().unwrap();
        go.store(true, Ordering::SeqCst);
        cv.broadcast().unwrap();
        m.unlock().unwrap();
        for w in workers {
            w.join().unwrap();
        }
        assert_eq!(woken.load(Ordering::SeqCst), 5);
    }

    macro_rules! cond_suite {
        ($module:ident, $substrate:ty) => {
            mod $module {
                use super::*;

                #[test]
                fn ownership_required() {
                    wait_requires_ownership::<$substrate>();
                }
                #[test]
                fn timeout_restores_depth() {
                    timed_wait_times_out_holding_mutex::<$substrate>();
                }
                #[test]
                fn signal() {
                    signal_wakes_predicate_waiter::<$substrate>();
                }
                #[test]
                fn broadcast() {
                    broadcast_wakes_all::<$substrate>();
                }
            }
        };
    }

    cond_suite!(portable_cond, Portable);
    #[cfg(unix)]
    cond_suite!(posix_cond, crate::sys::posix::Posix);
}
