//! Absolute deadlines and their conversion to host wait units.
//!
//! Deadlines are realtime (`TIME_UTC`) points since the Unix epoch. The
//! POSIX substrate hands them to `pthread_*_timedwait` unchanged; the
//! portable substrate converts them into an [`Instant`] once, at the start
//! of the wait.

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crate::error::{Fault, Result};

pub const NANOS_PER_SEC: i64 = 1_000_000_000;

/// Represents a timespec value (seconds + nanoseconds).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timespec {
    /// Seconds since the epoch; may be negative.
    pub tv_sec: i64,
    /// Nanoseconds (0 to 999_999_999).
    pub tv_nsec: i64,
}

impl Timespec {
    #[must_use]
    pub const fn new(tv_sec: i64, tv_nsec: i64) -> Self {
        Self { tv_sec, tv_nsec }
    }

    /// Returns `true` if `tv_nsec` lies in `[0, 1_000_000_000)`.
    #[inline]
    #[must_use]
    pub const fn is_normalized(self) -> bool {
        self.tv_nsec >= 0 && self.tv_nsec < NANOS_PER_SEC
    }

    /// `Ok(self)` if normalized, `Error(InvalidTime)` otherwise.
    pub fn validate(self) -> Result<Self> {
        if self.is_normalized() {
            Ok(self)
        } else {
            Err(Fault::InvalidTime(self.tv_nsec).into())
        }
    }

    /// Current realtime clock reading.
    #[must_use]
    pub fn now() -> Self {
        match SystemTime::now().duration_since(UNIX_EPOCH) {
            Ok(since) => Self::from_duration(since),
            Err(before) => {
                let back = before.duration();
                let secs = i64::try_from(back.as_secs()).unwrap_or(i64::MAX);
                let nanos = i64::from(back.subsec_nanos());
                if nanos == 0 {
                    Self::new(-secs, 0)
                } else {
                    Self::new(-secs - 1, NANOS_PER_SEC - nanos)
                }
            }
        }
    }

    /// Deadline `after` from now, saturating at the far future.
    #[must_use]
    pub fn after(after: Duration) -> Self {
        Self::now().saturating_add(after)
    }

    /// Converts a duration since the epoch.
    #[must_use]
    pub fn from_duration(since_epoch: Duration) -> Self {
        Self {
            tv_sec: i64::try_from(since_epoch.as_secs()).unwrap_or(i64::MAX),
            tv_nsec: i64::from(since_epoch.subsec_nanos()),
        }
    }

    #[must_use]
    pub fn saturating_add(self, d: Duration) -> Self {
        let add_secs = i64::try_from(d.as_secs()).unwrap_or(i64::MAX);
        let mut nsec = self.tv_nsec + i64::from(d.subsec_nanos());
        let mut carry = 0;
        if nsec >= NANOS_PER_SEC {
            nsec -= NANOS_PER_SEC;
            carry = 1;
        }
        match self
            .tv_sec
            .checked_add(add_secs)
            .and_then(|s| s.checked_add(carry))
        {
            Some(tv_sec) => Self { tv_sec, tv_nsec: nsec },
            None => Self {
                tv_sec: i64::MAX,
                tv_nsec: NANOS_PER_SEC - 1,
            },
        }
    }

    /// Time left from `now` until this deadline; zero once it has passed.
    ///
    /// Both values must be normalized.
    #[must_use]
    pub fn remaining_from(self, now: Self) -> Duration {
        if self <= now {
            return Duration::ZERO;
        }
        let mut secs = self.tv_sec.wrapping_sub(now.tv_sec) as u64;
        let mut nanos = self.tv_nsec - now.tv_nsec;
        if nanos < 0 {
            nanos += NANOS_PER_SEC;
            secs -= 1;
        }
        Duration::new(secs, nanos as u32)
    }

    /// Time left until this deadline on the realtime clock.
    #[must_use]
    pub fn remaining(self) -> Duration {
        self.remaining_from(Self::now())
    }

    /// Monotonic instant equivalent to this deadline, measured now.
    ///
    /// Deadlines too far away to represent collapse to `None`, meaning
    /// "wait without bound".
    #[must_use]
    pub fn to_instant(self) -> Option<Instant> {
        Instant::now().checked_add(self.remaining())
    }

    /// Whether the deadline lies in the past.
    #[must_use]
    pub fn has_passed(self) -> bool {
        self <= Self::now()
    }
}

impl From<Duration> for Timespec {
    fn from(since_epoch: Duration) -> Self {
        Self::from_duration(since_epoch)
    }
}
