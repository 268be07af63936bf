//! One-time initialization.
//!
//! A single atomic exchange from ready to done selects the one caller that
//! runs the initializer; every other caller waits until it has finished and
//! then observes its effects. A panicking initializer still completes the
//! flag.

use crate::sys::{Active, RawOnce, Substrate};

/// Exactly-once gate. Usable in a `static`.
pub struct OnceFlag<S: Substrate = Active> {
    raw: S::Once,
}

impl OnceFlag {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            raw: <<Active as Substrate>::Once as RawOnce>::INIT,
        }
    }
}

impl Default for OnceFlag {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: Substrate> OnceFlag<S> {
    #[must_use]
    pub const fn new_in() -> Self {
        Self {
            raw: <S::Once as RawOnce>::INIT,
        }
    }

    /// Run `init` if no call on this flag has run yet; otherwise wait for
    /// the call that did.
    pub fn call_once<F: FnOnce()>(&self, init: F) {
        let mut init = Some(init);
        self.raw.call_once(&mut || {
            if let Some(init) = init.take() {
                init();
            }
        });
    }

    /// Return the flag to its fresh state.
    pub fn reset(&mut self) {
        self.raw = <S::Once as RawOnce>::INIT;
    }
}

impl<S: Substrate> std::fmt::Debug for OnceFlag<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OnceFlag").field("substrate", &S::NAME).finish()
    }
}

/// Run `init` exactly once for `flag`.
pub fn call_once(flag: &OnceFlag, init: fn()) {
    flag.call_once(init);
}
