//! Thread-specific storage.
//!
//! A [`TssKey`] maps each thread to one pointer-sized value (`0` = null).
//! When a thread exits, every key with a destructor and a non-null value has
//! the destructor called with that value, on that thread. The value is
//! cleared before the call; destructors that store new values trigger
//! another pass, up to [`DESTRUCTOR_ITERATIONS`].

use crate::error::Result;
use crate::sys::{Active, RawKey, Substrate};

/// Maximum destructor passes on thread exit.
pub const DESTRUCTOR_ITERATIONS: usize = 4;

/// Process-wide thread-local key.
pub struct TssKey<S: Substrate = Active> {
    raw: S::Key,
}

impl<S: Substrate> Clone for TssKey<S> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<S: Substrate> Copy for TssKey<S> {}

impl TssKey {
    /// Create a key on the active substrate.
    pub fn create(dtor: Option<fn(usize)>) -> Result<Self> {
        Self::create_in(dtor)
    }
}

impl<S: Substrate> TssKey<S> {
    pub fn create_in(dtor: Option<fn(usize)>) -> Result<Self> {
        Ok(Self {
            raw: S::Key::create(dtor)?,
        })
    }

    /// The calling thread's value; `0` if unset.
    #[must_use]
    pub fn get(self) -> usize {
        self.raw.get()
    }

    pub fn set(self, value: usize) -> Result<()> {
        self.raw.set(value)
    }

    /// Invalidate the key. Destructors are not run.
    pub fn delete(self) -> Result<()> {
        self.raw.delete()
    }
}

impl<S: Substrate> std::fmt::Debug for TssKey<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TssKey").field("substrate", &S::NAME).finish()
    }
}
