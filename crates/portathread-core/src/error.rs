//! Status taxonomy and error types.
//!
//! Every fallible primitive returns [`Result`]. The error side maps one to
//! one onto the non-success members of the closed [`Status`] enumeration;
//! [`ThreadError::Error`] additionally carries a [`Fault`] naming the misuse
//! or the raw substrate errno.

use thiserror::Error;

/// Closed result taxonomy shared by every primitive.
///
/// The discriminants match the classic `thrd_*` ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    Success,
    TimedOut,
    Busy,
    NoMem,
    Error,
}

impl Status {
    /// Numeric code of this status.
    #[must_use]
    pub const fn code(self) -> i32 {
        match self {
            Self::Success => 0,
            Self::TimedOut => 1,
            Self::Busy => 2,
            Self::NoMem => 3,
            Self::Error => 4,
        }
    }

    /// Inverse of [`Status::code`].
    #[must_use]
    pub const fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(Self::Success),
            1 => Some(Self::TimedOut),
            2 => Some(Self::Busy),
            3 => Some(Self::NoMem),
            4 => Some(Self::Error),
            _ => None,
        }
    }

    /// Stable lowercase name, used in logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::TimedOut => "timedout",
            Self::Busy => "busy",
            Self::NoMem => "nomem",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl<T> From<&Result<T>> for Status {
    fn from(result: &Result<T>) -> Self {
        match result {
            Ok(_) => Self::Success,
            Err(err) => err.status(),
        }
    }
}

/// Detail carried by [`ThreadError::Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum Fault {
    #[error("mutex is not held by the calling thread")]
    NotOwner,
    #[error("operation would deadlock the calling thread")]
    Deadlock,
    #[error("mutex was not created with the timed flavor")]
    NotTimed,
    #[error("timespec nanoseconds out of range: {0}")]
    InvalidTime(i64),
    #[error("recursive lock depth overflow")]
    DepthOverflow,
    #[error("thread handle already joined or detached")]
    NotJoinable,
    #[error("thread terminated before taking its start record")]
    StartLost,
    #[error("thread terminated by panic")]
    Panicked,
    #[error("sleep interrupted")]
    Interrupted,
    #[error("thread-local key is invalid or deleted")]
    InvalidKey,
    #[error("thread-local keys exhausted")]
    KeysExhausted,
    #[error("thread-local storage of the calling thread is being torn down")]
    TornDown,
    #[error("substrate error (errno {0})")]
    Os(i32),
}

/// Error side of every fallible primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum ThreadError {
    #[error("operation timed out")]
    TimedOut,
    #[error("resource busy")]
    Busy,
    #[error("out of memory")]
    NoMem,
    #[error(transparent)]
    Error(#[from] Fault),
}

impl ThreadError {
    /// Status this error collapses to.
    #[must_use]
    pub const fn status(self) -> Status {
        match self {
            Self::TimedOut => Status::TimedOut,
            Self::Busy => Status::Busy,
            Self::NoMem => Status::NoMem,
            Self::Error(_) => Status::Error,
        }
    }

    /// The fault behind an `Error`, if any.
    #[must_use]
    pub const fn fault(self) -> Option<Fault> {
        match self {
            Self::Error(fault) => Some(fault),
            _ => None,
        }
    }
}

pub type Result<T> = core::result::Result<T, ThreadError>;
