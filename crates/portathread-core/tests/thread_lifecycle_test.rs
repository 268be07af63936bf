use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use portathread_core::{Fault, Status, ThreadError, thread};

#[test]
fn join_returns_exit_code_then_rejects_second_join() {
    let t = thread::create(|| thread::exit(77)).unwrap();
    assert_eq!(thread::join(t), Ok(77));
    let again = thread::join(t);
    assert_eq!(again, Err(ThreadError::Error(Fault::NotJoinable)));
    assert_eq!(Status::from(&again), Status::Error);
}

#[test]
fn start_result_is_the_exit_code() {
    for code in [0, 1, -1, i32::MAX, i32::MIN] {
        let t = thread::create(move || code).unwrap();
        assert_eq!(thread::join(t), Ok(code));
    }
}

#[test]
fn exit_from_nested_call_skips_the_rest() {
    #[allow(unreachable_code)]
    fn deep(reached: &AtomicBool) -> i32 {
        thread::exit(9);
        reached.store(true, Ordering::SeqCst);
        0
    }
    let reached = Arc::new(AtomicBool::new(false));
    let r = Arc::clone(&reached);
    let t = thread::create(move || deep(&r) + 100).unwrap();
    assert_eq!(thread::join(t), Ok(9));
    assert!(!reached.load(Ordering::SeqCst));
}

#[test]
fn create_returns_after_child_holds_its_record() {
    // The closure owns a large capture; it must survive the creator's frame.
    let payload: Vec<u64> = (0..4096).collect();
    let expected = payload.iter().sum::<u64>();
    let t = thread::create(move || i32::from(payload.iter().sum::<u64>() == expected)).unwrap();
    assert_eq!(thread::join(t), Ok(1));
}

#[test]
fn identities_are_distinct_and_stable() {
    let main = thread::current();
    assert!(thread::equal(main, thread::current()));
    let seen = Arc::new(AtomicUsize::new(0));
    let seen2 = Arc::clone(&seen);
    let t = thread::create(move || {
        let me = thread::current();
        seen2.store(me.id().as_u64() as usize, Ordering::SeqCst);
        i32::from(thread::equal(me, thread::current()))
    })
    .unwrap();
    assert!(!thread::equal(main, t));
    assert_eq!(thread::join(t), Ok(1));
    assert_eq!(seen.load(Ordering::SeqCst) as u64, t.id().as_u64());
}

#[test]
fn detach_then_join_is_error() {
    let done = Arc::new(AtomicBool::new(false));
    let d = Arc::clone(&done);
    let t = thread::create(move || {
        d.store(true, Ordering::SeqCst);
        0
    })
    .unwrap();
    thread::detach(t).unwrap();
    assert_eq!(thread::detach(t), Err(ThreadError::Error(Fault::NotJoinable)));
    assert_eq!(thread::join(t), Err(ThreadError::Error(Fault::NotJoinable)));
    let start = Instant::now();
    while !done.load(Ordering::SeqCst) && start.elapsed() < Duration::from_secs(5) {
        thread::yield_now();
    }
    assert!(done.load(Ordering::SeqCst));
}

#[test]
fn joining_yourself_is_refused() {
    let t = thread::create(|| {
        let me = thread::current();
        match thread::join(me) {
            Err(ThreadError::Error(Fault::Deadlock)) => 1,
            _ => 0,
        }
    })
    .unwrap();
    assert_eq!(thread::join(t), Ok(1));
}

#[test]
fn panic_in_start_surfaces_as_error() {
    let t = thread::create(|| panic!("start routine failed")).unwrap();
    assert_eq!(thread::join(t), Err(ThreadError::Error(Fault::Panicked)));
}

#[test]
fn sleep_blocks_at_least_the_duration() {
    let mut remaining = Duration::from_secs(3);
    let start = Instant::now();
    thread::sleep(Duration::from_millis(120), Some(&mut remaining)).unwrap();
    assert!(start.elapsed() >= Duration::from_millis(120));
    assert_eq!(remaining, Duration::ZERO);
    thread::sleep(Duration::ZERO, None).unwrap();
}

#[test]
fn raw_entry_point_receives_argument() {
    fn double(arg: usize) -> i32 {
        (arg * 2) as i32
    }
    let t = thread::create_raw(double, 21).unwrap();
    assert_eq!(thread::join(t), Ok(42));
}

#[test]
fn many_threads_join_in_creation_order() {
    let handles: Vec<_> = (0..32)
        .map(|i| thread::create(move || i).unwrap())
        .collect();
    for (i, t) in handles.into_iter().enumerate() {
        assert_eq!(thread::join(t), Ok(i as i32));
    }
}
