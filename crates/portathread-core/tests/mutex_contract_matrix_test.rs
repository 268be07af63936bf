use std::sync::Arc;
use std::sync::mpsc;
use std::time::Duration;

use portathread_core::mutex::{MutexContractOp, MutexContractState, mutex_contract_transition};
use portathread_core::{Mutex, MutexKind, Status, Timespec};

#[derive(Clone, Copy)]
struct Case {
    kind: MutexKind,
    old_state: MutexContractState,
    op: MutexContractOp,
    expected_state: MutexContractState,
    expected_status: Status,
    expected_blocks: bool,
}

fn kind_name(kind: MutexKind) -> &'static str {
    match kind.bits() {
        0 => "PLAIN",
        1 => "RECURSIVE",
        2 => "TIMED",
        3 => "RECURSIVE|TIMED",
        _ => "UNKNOWN",
    }
}

const KINDS: [MutexKind; 4] = [
    MutexKind::PLAIN,
    MutexKind::RECURSIVE,
    MutexKind::TIMED,
    MutexKind::RECURSIVE.union(MutexKind::TIMED),
];

const STATES: [MutexContractState; 3] = [
    MutexContractState::Unlocked,
    MutexContractState::LockedBySelf,
    MutexContractState::LockedByOther,
];

const OPS: [MutexContractOp; 4] = [
    MutexContractOp::Lock,
    MutexContractOp::TryLock,
    MutexContractOp::TimedLock,
    MutexContractOp::Unlock,
];

fn matrix_cases() -> Vec<Case> {
    use MutexContractOp as Op;
    use MutexContractState as St;
    vec![
        Case {
            kind: MutexKind::PLAIN,
            old_state: St::Unlocked,
            op: Op::Lock,
            expected_state: St::LockedBySelf,
            expected_status: Status::Success,
            expected_blocks: false,
        },
        Case {
            kind: MutexKind::PLAIN,
            old_state: St::LockedBySelf,
            op: Op::Lock,
            expected_state: St::LockedBySelf,
            expected_status: Status::Error,
            expected_blocks: false,
        },
        Case {
            kind: MutexKind::RECURSIVE,
            old_state: St::LockedBySelf,
            op: Op::Lock,
            expected_state: St::LockedBySelf,
            expected_status: Status::Success,
            expected_blocks: false,
        },
        Case {
            kind: MutexKind::PLAIN,
            old_state: St::LockedBySelf,
            op: Op::TryLock,
            expected_state: St::LockedBySelf,
            expected_status: Status::Busy,
            expected_blocks: false,
        },
        Case {
            kind: MutexKind::PLAIN,
            old_state: St::LockedByOther,
            op: Op::Lock,
            expected_state: St::LockedByOther,
            expected_status: Status::Success,
            expected_blocks: true,
        },
        Case {
            kind: MutexKind::TIMED,
            old_state: St::LockedByOther,
            op: Op::TimedLock,
            expected_state: St::LockedByOther,
            expected_status: Status::TimedOut,
            expected_blocks: true,
        },
        Case {
            kind: MutexKind::PLAIN,
            old_state: St::Unlocked,
            op: Op::TimedLock,
            expected_state: St::Unlocked,
            expected_status: Status::Error,
            expected_blocks: false,
        },
        Case {
            kind: MutexKind::RECURSIVE,
            old_state: St::LockedByOther,
            op: Op::Unlock,
            expected_state: St::LockedByOther,
            expected_status: Status::Error,
            expected_blocks: false,
        },
        Case {
            kind: MutexKind::RECURSIVE,
            old_state: St::LockedBySelf,
            op: Op::Unlock,
            expected_state: St::Unlocked,
            expected_status: Status::Success,
            expected_blocks: false,
        },
    ]
}

#[test]
fn contract_matrix_matches_expectations() {
    for case in matrix_cases() {
        let out = mutex_contract_transition(case.kind, case.old_state, case.op);
        let label = format!(
            "{} {:?} --{:?}-->",
            kind_name(case.kind),
            case.old_state,
            case.op
        );
        assert_eq!(out.next, case.expected_state, "{label} next");
        assert_eq!(out.status, case.expected_status, "{label} status");
        assert_eq!(out.blocks, case.expected_blocks, "{label} blocks");
    }
}

#[test]
fn contract_never_blocks_on_error() {
    for kind in KINDS {
        for state in STATES {
            for op in OPS {
                let out = mutex_contract_transition(kind, state, op);
                if matches!(out.status, Status::Error | Status::Busy) {
                    assert!(!out.blocks, "{} {state:?} {op:?}", kind_name(kind));
                    assert_eq!(out.next, state, "{} {state:?} {op:?}", kind_name(kind));
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Live mutexes on the active substrate
// ---------------------------------------------------------------------------

struct Holder {
    release: mpsc::Sender<()>,
    handle: std::thread::JoinHandle<()>,
}

fn drive_into(m: &Arc<Mutex>, state: MutexContractState) -> Option<Holder> {
    match state {
        MutexContractState::LockedBySelf => {
            m.lock().unwrap();
            None
        }
        MutexContractState::LockedByOther => {
            let (locked_tx, locked_rx) = mpsc::channel();
            let (release, release_rx) = mpsc::channel::<()>();
            let m2 = Arc::clone(m);
            let handle = std::thread::spawn(move || {
                m2.lock().unwrap();
                locked_tx.send(()).unwrap();
                let _ = release_rx.recv();
                m2.unlock().unwrap();
            });
            locked_rx.recv().unwrap();
            Some(Holder { release, handle })
        }
        MutexContractState::Unlocked => None,
    }
}

fn apply(m: &Mutex, op: MutexContractOp) -> Status {
    let result = match op {
        MutexContractOp::Lock => m.lock(),
        MutexContractOp::TryLock => m.try_lock(),
        MutexContractOp::TimedLock => m.timed_lock(Timespec::after(Duration::from_millis(20))),
        MutexContractOp::Unlock => m.unlock(),
    };
    Status::from(&result)
}

#[test]
fn live_mutexes_follow_the_contract() {
    for kind in KINDS {
        for state in STATES {
            for op in OPS {
                let expected = mutex_contract_transition(kind, state, op);
                if expected.blocks && expected.status == Status::Success {
                    // Would wait for the holder forever.
                    continue;
                }
                let m = Arc::new(Mutex::new(kind).unwrap());
                let holder = drive_into(&m, state);
                let observed = apply(&m, op);
                assert_eq!(
                    observed,
                    expected.status,
                    "{} {state:?} {op:?}",
                    kind_name(kind)
                );
                while m.is_held_by_current() {
                    m.unlock().unwrap();
                }
                if let Some(holder) = holder {
                    holder.release.send(()).unwrap();
                    holder.handle.join().unwrap();
                }
            }
        }
    }
}

#[test]
fn destroy_frees_a_held_mutex() {
    for kind in KINDS {
        let m = Mutex::new(kind).unwrap();
        m.lock().unwrap();
        m.destroy();
    }
}
