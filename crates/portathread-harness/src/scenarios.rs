//! End-to-end scenarios over the active substrate.
//!
//! `once-race` and `sleep` replay the two demo programs that shipped with the
//! library; the rest drive one primitive each through its contract.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex as PlMutex;
use serde::Serialize;
use serde_json::json;

use portathread_core::{
    Condvar, Mutex, MutexKind, OnceFlag, SUBSTRATE, Status, Timespec, TssKey, thread,
};

use crate::HarnessError;
use crate::structured_log::{LogEntry, LogLevel, Outcome};

/// Knobs shared by every scenario.
#[derive(Debug, Clone)]
pub struct ScenarioConfig {
    /// Worker threads for the racing scenarios.
    pub threads: usize,
    /// Per-thread iterations (increments, ping-pong rounds).
    pub iterations: usize,
    pub sleep: Duration,
}

impl Default for ScenarioConfig {
    fn default() -> Self {
        Self {
            threads: 100,
            iterations: 1000,
            sleep: Duration::from_millis(2500),
        }
    }
}

/// Verdict of one scenario run.
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioReport {
    pub name: String,
    pub substrate: String,
    pub outcome: Outcome,
    pub duration_ms: u64,
    /// Status a primitive reported, for scenarios that observe one.
    #[serde(
        serialize_with = "serialize_status",
        skip_serializing_if = "Option::is_none"
    )]
    pub status: Option<Status>,
    /// Exit code of the thread the scenario joined.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    /// Time spent inside the operation under test.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ns: Option<u64>,
    pub details: serde_json::Value,
}

impl ScenarioReport {
    /// The `scenario_result` record for this report. The emitter assigns
    /// the trace id.
    #[must_use]
    pub fn to_log_entry(&self) -> LogEntry {
        let level = match self.outcome {
            Outcome::Pass | Outcome::Skip => LogLevel::Info,
            Outcome::Fail | Outcome::Timeout => LogLevel::Warn,
            Outcome::Error => LogLevel::Error,
        };
        let mut entry = LogEntry::new(String::new(), level, "scenario_result")
            .with_scenario(&self.name)
            .with_substrate(&self.substrate)
            .with_outcome(self.outcome)
            .with_duration_ms(self.duration_ms)
            .with_details(self.details.clone());
        if let Some(status) = self.status {
            entry = entry.with_status(status);
        }
        if let Some(code) = self.exit_code {
            entry = entry.with_exit_code(code);
        }
        if let Some(ns) = self.latency_ns {
            entry = entry.with_latency_ns(ns);
        }
        entry
    }
}

fn serialize_status<S: serde::Serializer>(status: &Option<Status>, out: S) -> Result<S::Ok, S::Error> {
    out.serialize_str(status.map_or("", Status::as_str))
}

/// What a scenario body observed.
#[derive(Default)]
struct Check {
    passed: bool,
    details: serde_json::Value,
    status: Option<Status>,
    exit_code: Option<i32>,
    latency_ns: Option<u64>,
}

type Body = fn(&ScenarioConfig) -> Result<Check, HarnessError>;

/// A named, runnable scenario.
pub struct Scenario {
    pub name: &'static str,
    pub summary: &'static str,
    body: Body,
}

impl Scenario {
    /// Run the scenario. Primitive failures are reported as
    /// [`Outcome::Error`], never propagated.
    #[must_use]
    pub fn run(&self, config: &ScenarioConfig) -> ScenarioReport {
        let start = Instant::now();
        let (outcome, check) = match (self.body)(config) {
            Ok(check) if check.passed => (Outcome::Pass, check),
            Ok(check) => (Outcome::Fail, check),
            Err(err) => (
                Outcome::Error,
                Check {
                    details: json!({ "error": err.to_string() }),
                    ..Check::default()
                },
            ),
        };
        ScenarioReport {
            name: self.name.to_string(),
            substrate: SUBSTRATE.to_string(),
            outcome,
            duration_ms: start.elapsed().as_millis() as u64,
            status: check.status,
            exit_code: check.exit_code,
            latency_ns: check.latency_ns,
            details: check.details,
        }
    }
}

impl std::fmt::Debug for Scenario {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scenario").field("name", &self.name).finish()
    }
}

pub const SCENARIOS: &[Scenario] = &[
    Scenario {
        name: "once-race",
        summary: "threads race one once flag; reset; race again",
        body: once_race,
    },
    Scenario {
        name: "sleep",
        summary: "sleep and report the remaining time",
        body: sleep,
    },
    Scenario {
        name: "mutex-contention",
        summary: "threads increment a shared counter under a plain mutex",
        body: mutex_contention,
    },
    Scenario {
        name: "recursive-mutex",
        summary: "nested locking; other threads stay out until the last unlock",
        body: recursive_mutex,
    },
    Scenario {
        name: "timed-lock",
        summary: "timed lock on a held mutex gives up at its deadline",
        body: timed_lock,
    },
    Scenario {
        name: "cond-pingpong",
        summary: "two threads alternate turns through a condition variable",
        body: cond_pingpong,
    },
    Scenario {
        name: "tss-destructor",
        summary: "thread-local destructor runs once when the worker exits",
        body: tss_destructor,
    },
];

/// Look up a scenario by name.
pub fn find(name: &str) -> Result<&'static Scenario, HarnessError> {
    SCENARIOS
        .iter()
        .find(|s| s.name == name)
        .ok_or_else(|| HarnessError::UnknownScenario(name.to_string()))
}

fn ensure_threads(config: &ScenarioConfig, min: usize) -> Result<usize, HarnessError> {
    if config.threads < min {
        return Err(HarnessError::InvalidArgument(format!(
            "needs at least {min} thread(s), got {}",
            config.threads
        )));
    }
    Ok(config.threads)
}

// ---------------------------------------------------------------------------
// once-race
// ---------------------------------------------------------------------------

fn race_round(flag: &Arc<OnceFlag>, racers: usize) -> Result<(usize, Vec<i32>), HarnessError> {
    let counter = Arc::new(AtomicUsize::new(0));
    let mut handles = Vec::with_capacity(racers);
    for _ in 0..racers {
        let flag = Arc::clone(flag);
        let counter = Arc::clone(&counter);
        handles.push(thread::create(move || {
            flag.call_once(|| {
                counter.fetch_add(1, Ordering::SeqCst);
            });
            counter.load(Ordering::SeqCst) as i32
        })?);
    }
    let mut observed = Vec::with_capacity(racers);
    for t in handles {
        observed.push(thread::join(t)?);
    }
    Ok((counter.load(Ordering::SeqCst), observed))
}

fn once_race(config: &ScenarioConfig) -> Result<Check, HarnessError> {
    let racers = ensure_threads(config, 1)?;
    let mut flag = Arc::new(OnceFlag::new());
    let (first, first_seen) = race_round(&flag, racers)?;

    Arc::get_mut(&mut flag)
        .ok_or_else(|| HarnessError::Invariant("once flag still shared after join".into()))?
        .reset();
    let (second, second_seen) = race_round(&flag, racers)?;

    let all_saw_one = first_seen.iter().chain(&second_seen).all(|&v| v == 1);
    Ok(Check {
        passed: first == 1 && second == 1 && all_saw_one,
        details: json!({
            "racers": racers,
            "first_round_counter": first,
            "second_round_counter": second,
            "every_caller_saw_init": all_saw_one,
        }),
        ..Check::default()
    })
}

// ---------------------------------------------------------------------------
// sleep
// ---------------------------------------------------------------------------

fn sleep(config: &ScenarioConfig) -> Result<Check, HarnessError> {
    let mut remaining = Duration::MAX;
    let start = Instant::now();
    thread::sleep(config.sleep, Some(&mut remaining))?;
    let elapsed = start.elapsed();
    Ok(Check {
        passed: elapsed >= config.sleep && remaining.is_zero(),
        details: json!({
            "requested_ms": config.sleep.as_millis() as u64,
            "elapsed_ms": elapsed.as_millis() as u64,
            "remaining_ns": remaining.as_nanos() as u64,
        }),
        latency_ns: Some(elapsed.as_nanos() as u64),
        ..Check::default()
    })
}

// ---------------------------------------------------------------------------
// mutex-contention
// ---------------------------------------------------------------------------

struct Counter {
    mutex: Mutex,
    // Read and written as two separate steps; only the mutex keeps them whole.
    value: AtomicU64,
}

fn mutex_contention(config: &ScenarioConfig) -> Result<Check, HarnessError> {
    let workers = ensure_threads(config, 1)?;
    let iterations = config.iterations;
    let shared = Arc::new(Counter {
        mutex: Mutex::new(MutexKind::PLAIN)?,
        value: AtomicU64::new(0),
    });
    let mut handles = Vec::with_capacity(workers);
    for _ in 0..workers {
        let shared = Arc::clone(&shared);
        handles.push(thread::create(move || -> i32 {
            for _ in 0..iterations {
                if shared.mutex.lock().is_err() {
                    return 1;
                }
                let v = shared.value.load(Ordering::Relaxed);
                shared.value.store(v + 1, Ordering::Relaxed);
                if shared.mutex.unlock().is_err() {
                    return 1;
                }
            }
            0
        })?);
    }
    let mut failures = 0;
    for t in handles {
        if thread::join(t)? != 0 {
            failures += 1;
        }
    }
    let expected = (workers * iterations) as u64;
    let total = shared.value.load(Ordering::Relaxed);
    Ok(Check {
        passed: failures == 0 && total == expected,
        details: json!({
            "workers": workers,
            "iterations": iterations,
            "expected": expected,
            "observed": total,
            "failed_workers": failures,
        }),
        ..Check::default()
    })
}

// ---------------------------------------------------------------------------
// recursive-mutex
// ---------------------------------------------------------------------------

const RECURSION_DEPTH: u32 = 5;

/// Status of a `try_lock` from a fresh thread; the lock is released if taken.
fn probe(mutex: &Arc<Mutex>) -> Result<Status, HarnessError> {
    let m = Arc::clone(mutex);
    let t = thread::create(move || {
        let status = Status::from(&m.try_lock());
        if status == Status::Success && m.unlock().is_err() {
            return -1;
        }
        status.code()
    })?;
    let code = thread::join(t)?;
    Status::from_code(code)
        .ok_or_else(|| HarnessError::Invariant(format!("probe thread returned {code}")))
}

fn recursive_mutex(_config: &ScenarioConfig) -> Result<Check, HarnessError> {
    let mutex = Arc::new(Mutex::new(MutexKind::RECURSIVE)?);
    for _ in 0..RECURSION_DEPTH {
        mutex.lock()?;
    }
    let reached = mutex.depth();

    let mut probes = Vec::new();
    for _ in 0..RECURSION_DEPTH {
        probes.push(probe(&mutex)?);
        mutex.unlock()?;
    }
    let released = probe(&mutex)?;

    let held_out = probes.iter().all(|&s| s == Status::Busy);
    Ok(Check {
        passed: reached == RECURSION_DEPTH && held_out && released == Status::Success,
        details: json!({
            "depth": reached,
            "probes_while_held": probes.iter().map(|s| s.as_str()).collect::<Vec<_>>(),
            "probe_after_release": released.as_str(),
        }),
        status: Some(released),
        ..Check::default()
    })
}

// ---------------------------------------------------------------------------
// timed-lock
// ---------------------------------------------------------------------------

const TIMED_LOCK_WAIT: Duration = Duration::from_millis(50);

fn timed_lock(_config: &ScenarioConfig) -> Result<Check, HarnessError> {
    let mutex = Arc::new(Mutex::new(MutexKind::TIMED)?);
    mutex.lock()?;

    let waited_ns = Arc::new(AtomicU64::new(0));
    let m = Arc::clone(&mutex);
    let w = Arc::clone(&waited_ns);
    let t = thread::create(move || {
        let start = Instant::now();
        let result = m.timed_lock(Timespec::after(TIMED_LOCK_WAIT));
        w.store(start.elapsed().as_nanos() as u64, Ordering::SeqCst);
        let status = Status::from(&result);
        if status == Status::Success && m.unlock().is_err() {
            return -1;
        }
        status.code()
    })?;
    let code = thread::join(t)?;
    mutex.unlock()?;

    let status = Status::from_code(code);
    let waited_ns = waited_ns.load(Ordering::SeqCst);
    let waited = Duration::from_nanos(waited_ns);
    Ok(Check {
        passed: status == Some(Status::TimedOut) && waited >= TIMED_LOCK_WAIT,
        details: json!({
            "status": status.map_or("invalid", Status::as_str),
            "deadline_ms": TIMED_LOCK_WAIT.as_millis() as u64,
            "waited_ms": waited.as_millis() as u64,
        }),
        status,
        latency_ns: Some(waited_ns),
        ..Check::default()
    })
}

// ---------------------------------------------------------------------------
// cond-pingpong
// ---------------------------------------------------------------------------

struct Table {
    mutex: Mutex,
    cv: Condvar,
    // Guarded by `mutex`.
    turn: AtomicUsize,
    volleys: AtomicUsize,
}

fn player(table: &Table, me: usize, rounds: usize) -> Result<(), HarnessError> {
    for _ in 0..rounds {
        table.mutex.lock()?;
        while table.turn.load(Ordering::Relaxed) != me {
            table.cv.wait(&table.mutex)?;
        }
        table.volleys.fetch_add(1, Ordering::Relaxed);
        table.turn.store(1 - me, Ordering::Relaxed);
        table.cv.signal()?;
        table.mutex.unlock()?;
    }
    Ok(())
}

fn cond_pingpong(config: &ScenarioConfig) -> Result<Check, HarnessError> {
    let rounds = config.iterations;
    let table = Arc::new(Table {
        mutex: Mutex::new(MutexKind::PLAIN)?,
        cv: Condvar::new()?,
        turn: AtomicUsize::new(0),
        volleys: AtomicUsize::new(0),
    });
    let mut handles = Vec::with_capacity(2);
    for me in 0..2 {
        let table = Arc::clone(&table);
        handles.push(thread::create(move || {
            i32::from(player(&table, me, rounds).is_err())
        })?);
    }
    let mut failed = 0;
    for t in handles {
        failed += thread::join(t)?;
    }
    let volleys = table.volleys.load(Ordering::Relaxed);
    Ok(Check {
        passed: failed == 0 && volleys == 2 * rounds,
        details: json!({
            "rounds": rounds,
            "volleys": volleys,
            "failed_players": failed,
        }),
        ..Check::default()
    })
}

// ---------------------------------------------------------------------------
// tss-destructor
// ---------------------------------------------------------------------------

const TSS_EXIT_CODE: i32 = 42;

static NEXT_TOKEN: AtomicUsize = AtomicUsize::new(1);
static DESTROYED: PlMutex<Vec<usize>> = parking_lot::const_mutex(Vec::new());

fn record_destroyed(value: usize) {
    DESTROYED.lock().push(value);
}

fn tss_destructor(_config: &ScenarioConfig) -> Result<Check, HarnessError> {
    // Distinct per run so concurrent runs share the log without confusion.
    let token = NEXT_TOKEN.fetch_add(1, Ordering::Relaxed);
    let key = TssKey::create(Some(record_destroyed))?;
    let t = thread::create(move || {
        if key.set(token).is_err() || key.get() != token {
            return -1;
        }
        thread::exit(TSS_EXIT_CODE)
    })?;
    let exit_code = thread::join(t)?;
    let runs = {
        let mut log = DESTROYED.lock();
        let runs = log.iter().filter(|&&v| v == token).count();
        log.retain(|&v| v != token);
        runs
    };
    let leaked_here = key.get();
    key.delete()?;
    Ok(Check {
        passed: exit_code == TSS_EXIT_CODE && runs == 1 && leaked_here == 0,
        details: json!({
            "exit_code": exit_code,
            "destructor_runs": runs,
            "creator_value": leaked_here,
        }),
        exit_code: Some(exit_code),
        ..Check::default()
    })
}
