//! # portathread-core
//!
//! Uniform threads, mutexes, once flags, condition variables and
//! thread-local keys implemented over two native substrates: POSIX threads
//! through `libc`, and a portable substrate built on `std::thread` and
//! `parking_lot`.
//!
//! The substrate is chosen at compile time (`sys::Active`). Every public
//! primitive behaves identically on both; the recursion, ownership and
//! timeout rules live above the substrate in the generic wrappers.
//!
//! No `unsafe` code is permitted at the crate level; the `sys` modules opt
//! in locally.

#![deny(unsafe_code)]

pub mod config;
pub mod cond;
pub mod error;
pub mod mutex;
pub mod once;
pub mod sys;
pub mod thread;
pub mod time;
pub mod tss;

pub use cond::Condvar;
pub use error::{Fault, Result, Status, ThreadError};
pub use mutex::{Mutex, MutexKind};
pub use once::{OnceFlag, call_once};
pub use thread::{Thread, ThreadId};
pub use time::Timespec;
pub use tss::{DESTRUCTOR_ITERATIONS, TssKey};

/// Name of the substrate this build runs on (`"posix"` or `"portable"`).
pub const SUBSTRATE: &str = <sys::Active as sys::Substrate>::NAME;
