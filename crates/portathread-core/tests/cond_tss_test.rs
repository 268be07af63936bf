use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use portathread_core::sys::Substrate;
use portathread_core::sys::portable::Portable;
use portathread_core::{
    Condvar, DESTRUCTOR_ITERATIONS, Fault, Mutex, MutexKind, ThreadError, Timespec, TssKey, thread,
};

// ---------------------------------------------------------------------------
// Condition variables
// ---------------------------------------------------------------------------

struct Turn {
    mutex: Mutex,
    cv: Condvar,
    // Guarded by `mutex`; atomics only to share through `Arc`.
    turn: AtomicUsize,
    rounds: AtomicUsize,
}

#[test]
fn ping_pong_alternates_under_one_condvar() {
    const ROUNDS: usize = 200;
    let shared = Arc::new(Turn {
        mutex: Mutex::new(MutexKind::PLAIN).unwrap(),
        cv: Condvar::new().unwrap(),
        turn: AtomicUsize::new(0),
        rounds: AtomicUsize::new(0),
    });
    let players: Vec<_> = (0..2)
        .map(|me| {
            let s = Arc::clone(&shared);
            thread::create(move || {
                for _ in 0..ROUNDS {
                    s.mutex.lock().unwrap();
                    while s.turn.load(Ordering::Relaxed) != me {
                        s.cv.wait(&s.mutex).unwrap();
                    }
                    s.rounds.fetch_add(1, Ordering::Relaxed);
                    s.turn.store(1 - me, Ordering::Relaxed);
                    s.cv.broadcast().unwrap();
                    s.mutex.unlock().unwrap();
                }
                0
            })
            .unwrap()
        })
        .collect();
    for p in players {
        assert_eq!(thread::join(p), Ok(0));
    }
    assert_eq!(shared.rounds.load(Ordering::Relaxed), 2 * ROUNDS);
}

#[test]
fn timed_wait_without_signal_times_out_with_mutex_held() {
    let m = Mutex::new(MutexKind::TIMED).unwrap();
    let cv = Condvar::new().unwrap();
    m.lock().unwrap();
    let start = Instant::now();
    let r = cv.timed_wait(&m, Timespec::after(Duration::from_millis(40)));
    assert_eq!(r, Err(ThreadError::TimedOut));
    assert!(start.elapsed() >= Duration::from_millis(38));
    assert!(m.is_held_by_current());
    m.unlock().unwrap();
    cv.destroy();
    m.destroy();
}

#[test]
fn waiting_without_the_mutex_is_an_error() {
    let m = Mutex::new(MutexKind::PLAIN).unwrap();
    let cv = Condvar::new().unwrap();
    assert_eq!(cv.wait(&m), Err(ThreadError::Error(Fault::NotOwner)));
}

// ---------------------------------------------------------------------------
// Thread-specific storage
// ---------------------------------------------------------------------------

// Key slots are recycled; tests that count destructor calls must not share
// a slot with another test's key.
static KEYS: StdMutex<()> = StdMutex::new(());

static DESTROYED: StdMutex<Vec<usize>> = StdMutex::new(Vec::new());

fn record(value: usize) {
    DESTROYED.lock().unwrap().push(value);
}

#[test]
fn values_are_isolated_and_destructor_runs_once_per_thread() {
    let _keys = KEYS.lock().unwrap_or_else(|e| e.into_inner());
    let key = TssKey::create(Some(record)).unwrap();
    key.set(0xAAAA).unwrap();

    let t = thread::create(move || {
        let inherited = key.get();
        key.set(0xBBBB).unwrap();
        if inherited == 0 && key.get() == 0xBBBB { 5 } else { -1 }
    })
    .unwrap();
    assert_eq!(thread::join(t), Ok(5));

    let destroyed = DESTROYED.lock().unwrap().clone();
    assert_eq!(destroyed.iter().filter(|&&v| v == 0xBBBB).count(), 1);
    assert!(!destroyed.contains(&0xAAAA));
    assert_eq!(key.get(), 0xAAAA);

    key.set(0).unwrap();
    key.delete().unwrap();
}

#[test]
fn null_values_skip_the_destructor() {
    let _keys = KEYS.lock().unwrap_or_else(|e| e.into_inner());
    static CALLS: AtomicUsize = AtomicUsize::new(0);
    fn count(_: usize) {
        CALLS.fetch_add(1, Ordering::SeqCst);
    }
    let key = TssKey::create(Some(count)).unwrap();
    let t = thread::create(move || {
        key.set(1).unwrap();
        key.set(0).unwrap();
        0
    })
    .unwrap();
    thread::join(t).unwrap();
    assert_eq!(CALLS.load(Ordering::SeqCst), 0);
    key.delete().unwrap();
}

#[test]
fn destructor_runs_after_exit() {
    let _keys = KEYS.lock().unwrap_or_else(|e| e.into_inner());
    static SEEN: AtomicUsize = AtomicUsize::new(0);
    fn keep(value: usize) {
        SEEN.store(value, Ordering::SeqCst);
    }
    let key = TssKey::create(Some(keep)).unwrap();
    let t = thread::create(move || {
        key.set(31).unwrap();
        thread::exit(2)
    })
    .unwrap();
    assert_eq!(thread::join(t), Ok(2));
    assert_eq!(SEEN.load(Ordering::SeqCst), 31);
    key.delete().unwrap();
}

#[test]
fn deleted_key_is_rejected() {
    let _keys = KEYS.lock().unwrap_or_else(|e| e.into_inner());
    let key = TssKey::create(None).unwrap();
    key.delete().unwrap();
    assert_eq!(key.get(), 0);
    assert_eq!(key.set(3), Err(ThreadError::Error(Fault::InvalidKey)));
    assert_eq!(key.delete(), Err(ThreadError::Error(Fault::InvalidKey)));
}

static OLD_HANDLE_DROPS: AtomicUsize = AtomicUsize::new(0);

fn count_old_handle_drop(_: usize) {
    OLD_HANDLE_DROPS.fetch_add(1, Ordering::SeqCst);
}

fn recreated_key_ignores_old_handle<S: Substrate>() {
    let _keys = KEYS.lock().unwrap_or_else(|e| e.into_inner());
    let stale = TssKey::<S>::create_in(Some(count_old_handle_drop)).unwrap();
    stale.delete().unwrap();
    let fresh = TssKey::<S>::create_in(None).unwrap();

    assert_eq!(stale.set(5), Err(ThreadError::Error(Fault::InvalidKey)));
    assert_eq!(stale.get(), 0);
    assert_eq!(fresh.get(), 0);
    assert_eq!(stale.delete(), Err(ThreadError::Error(Fault::InvalidKey)));

    let before = OLD_HANDLE_DROPS.load(Ordering::SeqCst);
    let t = thread::create_on::<S, _>(move || {
        let rejected = stale.set(6).is_err();
        fresh.set(8).unwrap();
        if rejected && stale.get() == 0 && fresh.get() == 8 { 0 } else { -1 }
    })
    .unwrap();
    assert_eq!(thread::join_on::<S>(t), Ok(0));
    assert_eq!(OLD_HANDLE_DROPS.load(Ordering::SeqCst), before);
    fresh.delete().unwrap();
}

#[test]
fn recreated_key_ignores_old_handle_portable() {
    recreated_key_ignores_old_handle::<Portable>();
}

#[cfg(unix)]
#[test]
fn recreated_key_ignores_old_handle_posix() {
    recreated_key_ignores_old_handle::<portathread_core::sys::posix::Posix>();
}

#[test]
fn destructor_iterations_is_four() {
    assert_eq!(DESTRUCTOR_ITERATIONS, 4);
}
