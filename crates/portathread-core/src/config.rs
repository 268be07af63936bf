//! Runtime configuration.
//!
//! Two environment variables tune the substrates:
//! - `PORTATHREAD_STACK_SIZE`: stack size in bytes for threads spawned by
//!   `thread::create`. Accepts `k`/`m` suffixes (`512k`, `4m`). Unparsable
//!   values fall back to [`DEFAULT_STACK_SIZE`]; small values are clamped up
//!   to [`MIN_STACK_SIZE`].
//! - `PORTATHREAD_TIMED_POLL_US`: poll interval of the emulated timed lock, in
//!   microseconds, clamped to `[MIN_POLL_US, MAX_POLL_US]`.
//!
//! Each value is read once and cached.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

pub const STACK_SIZE_ENV: &str = "PORTATHREAD_STACK_SIZE";
pub const TIMED_POLL_ENV: &str = "PORTATHREAD_TIMED_POLL_US";

pub const DEFAULT_STACK_SIZE: usize = 2 * 1024 * 1024;
pub const MIN_STACK_SIZE: usize = 64 * 1024;

pub const DEFAULT_POLL_US: usize = 500;
pub const MIN_POLL_US: usize = 50;
pub const MAX_POLL_US: usize = 50_000;

// Atomic cache: 0=unresolved, usize::MAX=resolving, anything else=resolved.
// A non-blocking state machine rather than OnceLock: a racing or reentrant
// reader gets the default instead of waiting on the resolver.
const UNRESOLVED: usize = 0;
const RESOLVING: usize = usize::MAX;

static CACHED_STACK_SIZE: AtomicUsize = AtomicUsize::new(UNRESOLVED);
static CACHED_POLL_US: AtomicUsize = AtomicUsize::new(UNRESOLVED);

/// Parse a byte count with an optional `k`/`m` suffix (case-insensitive).
#[must_use]
pub fn parse_size(raw: &str) -> Option<usize> {
    let trimmed = raw.trim().to_ascii_lowercase();
    let (digits, scale) = if let Some(d) = trimmed.strip_suffix('k') {
        (d, 1024)
    } else if let Some(d) = trimmed.strip_suffix('m') {
        (d, 1024 * 1024)
    } else {
        (trimmed.as_str(), 1)
    };
    digits.trim().parse::<usize>().ok()?.checked_mul(scale)
}

fn stack_size_from_env(raw: Option<&str>) -> usize {
    match raw.and_then(parse_size) {
        Some(0) | None => DEFAULT_STACK_SIZE,
        Some(n) => n.max(MIN_STACK_SIZE),
    }
}

fn poll_us_from_env(raw: Option<&str>) -> usize {
    raw.and_then(|v| v.trim().parse::<usize>().ok())
        .map_or(DEFAULT_POLL_US, |us| us.clamp(MIN_POLL_US, MAX_POLL_US))
}

fn resolve_cached(cache: &AtomicUsize, var: &str, parse: fn(Option<&str>) -> usize) -> usize {
    let cached = cache.load(Ordering::Relaxed);
    if cached != UNRESOLVED && cached != RESOLVING {
        return cached;
    }
    if cached == RESOLVING
        || cache
            .compare_exchange(UNRESOLVED, RESOLVING, Ordering::SeqCst, Ordering::Relaxed)
            .is_err()
    {
        let v = cache.load(Ordering::Relaxed);
        return if v != UNRESOLVED && v != RESOLVING {
            v
        } else {
            parse(None)
        };
    }
    let value = parse(std::env::var(var).ok().as_deref());
    cache.store(value, Ordering::Release);
    value
}

/// Stack size for spawned threads.
#[must_use]
pub fn stack_size() -> usize {
    resolve_cached(&CACHED_STACK_SIZE, STACK_SIZE_ENV, stack_size_from_env)
}

/// Poll interval of the emulated timed lock.
#[must_use]
pub fn timed_poll_interval() -> Duration {
    let us = resolve_cached(&CACHED_POLL_US, TIMED_POLL_ENV, poll_us_from_env);
    Duration::from_micros(us as u64)
}
